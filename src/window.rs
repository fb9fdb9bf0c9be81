//! Query-window decomposition.
//!
//! Turns a `[start, end)` window into the ordered set of chunk
//! coordinates to fetch, given a table's storage granularity. Monthly
//! and daily tables always carry a one-period lookback: revision rows
//! for in-window entities may be anchored to an effective date in the
//! prior period, so the prior period's file must be inspected too.

use std::fmt;

use time::{Date, Month, PrimitiveDateTime};

use crate::catalog::Granularity;
use crate::timefmt::{datetime_to_micros, FIVE_MINUTES_MICROS};

/// Identifies one source artifact.
///
/// `day` and `bundle` are absent for monthly tables; both are absent,
/// along with a meaningful year/month, for unbounded (static) tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkCoordinate {
    pub table: String,
    pub year: i32,
    pub month: u8,
    pub day: Option<u8>,
    /// Start of the 5-minute bundle, as (hour, minute).
    pub bundle: Option<(u8, u8)>,
}

impl ChunkCoordinate {
    pub fn monthly(table: &str, year: i32, month: u8) -> Self {
        Self {
            table: table.to_string(),
            year,
            month,
            day: None,
            bundle: None,
        }
    }

    pub fn daily(table: &str, year: i32, month: u8, day: u8) -> Self {
        Self {
            table: table.to_string(),
            year,
            month,
            day: Some(day),
            bundle: None,
        }
    }

    pub fn bundle(table: &str, year: i32, month: u8, day: u8, hour: u8, minute: u8) -> Self {
        Self {
            table: table.to_string(),
            year,
            month,
            day: Some(day),
            bundle: Some((hour, minute)),
        }
    }

    pub fn unbounded(table: &str) -> Self {
        Self {
            table: table.to_string(),
            year: 0,
            month: 0,
            day: None,
            bundle: None,
        }
    }

    /// Stable artifact stem used for raw and cache file names.
    pub fn file_stem(&self) -> String {
        self.to_string()
    }

    /// Substitute coordinate fields into a URL template. Recognized
    /// placeholders: {table}, {year}, {month}, {day}, {hour}, {minute}.
    pub fn fill_template(&self, template: &str) -> String {
        let (hour, minute) = self.bundle.unwrap_or((0, 0));
        template
            .replace("{table}", &self.table)
            .replace("{year}", &format!("{:04}", self.year))
            .replace("{month}", &format!("{:02}", self.month))
            .replace("{day}", &format!("{:02}", self.day.unwrap_or(1)))
            .replace("{hour}", &format!("{hour:02}"))
            .replace("{minute}", &format!("{minute:02}"))
    }
}

impl fmt::Display for ChunkCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.month == 0 {
            return write!(f, "{}", self.table);
        }
        write!(f, "{}_{:04}{:02}", self.table, self.year, self.month)?;
        if let Some(day) = self.day {
            write!(f, "{day:02}")?;
        }
        if let Some((hour, minute)) = self.bundle {
            write!(f, "_{hour:02}{minute:02}")?;
        }
        Ok(())
    }
}

/// Decompose `[start, end)` into chunk coordinates for one table.
///
/// Total over any valid start/end; the caller guards `start < end`.
pub fn chunks(
    table: &str,
    start: PrimitiveDateTime,
    end: PrimitiveDateTime,
    granularity: Granularity,
) -> Vec<ChunkCoordinate> {
    match granularity {
        Granularity::Monthly => monthly_chunks(table, start, end),
        Granularity::Daily => daily_chunks(table, start, end),
        Granularity::SubDailyBundle => bundle_chunks(table, start, end),
        Granularity::Unbounded => vec![ChunkCoordinate::unbounded(table)],
    }
}

fn monthly_chunks(table: &str, start: PrimitiveDateTime, end: PrimitiveDateTime) -> Vec<ChunkCoordinate> {
    // One-month lookback. When `start` is the first instant of a month,
    // stepping back from the adjusted boundary lands on the same
    // previous month, so the rule is uniform.
    let (mut year, mut month) = previous_month(start.year(), start.month());
    let last = (end.year(), end.month());

    let mut out = Vec::new();
    loop {
        out.push(ChunkCoordinate::monthly(table, year, month as u8));
        if (year, month) == last {
            break;
        }
        (year, month) = next_month(year, month);
    }
    out
}

fn daily_chunks(table: &str, start: PrimitiveDateTime, end: PrimitiveDateTime) -> Vec<ChunkCoordinate> {
    // One-day lookback, same reasoning as the monthly case. `Date`
    // arithmetic owns the month/year rollover.
    let mut date = start.date().previous_day().unwrap_or_else(|| start.date());
    let last = end.date();

    let mut out = Vec::new();
    while date <= last {
        out.push(ChunkCoordinate::daily(
            table,
            date.year(),
            date.month() as u8,
            date.day(),
        ));
        date = match date.next_day() {
            Some(next) => next,
            None => break,
        };
    }
    out
}

fn bundle_chunks(table: &str, start: PrimitiveDateTime, end: PrimitiveDateTime) -> Vec<ChunkCoordinate> {
    let start_us = datetime_to_micros(start);
    let end_us = datetime_to_micros(end);

    // Days ascend; within a day, hour and minute descend. The reverse
    // order within a day is what downstream consumers were built
    // against, so it is preserved for reproducibility.
    let mut out = Vec::new();
    let mut date = start.date();
    while date <= end.date() {
        for hour in (0..24u8).rev() {
            for slot in (0..12u8).rev() {
                let minute = slot * 5;
                let Ok(bucket_time) = time::Time::from_hms(hour, minute, 0) else {
                    continue;
                };
                let bucket_us = datetime_to_micros(PrimitiveDateTime::new(date, bucket_time));
                if bucket_us + FIVE_MINUTES_MICROS > start_us && bucket_us < end_us {
                    out.push(ChunkCoordinate::bundle(
                        table,
                        date.year(),
                        date.month() as u8,
                        date.day(),
                        hour,
                        minute,
                    ));
                }
            }
        }
        date = match date.next_day() {
            Some(next) => next,
            None => break,
        };
    }
    out
}

fn previous_month(year: i32, month: Month) -> (i32, Month) {
    match month {
        Month::January => (year - 1, Month::December),
        other => (year, other.previous()),
    }
}

fn next_month(year: i32, month: Month) -> (i32, Month) {
    match month {
        Month::December => (year + 1, Month::January),
        other => (year, other.next()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timefmt::{micros_to_datetime, parse_api_time};

    fn dt(text: &str) -> PrimitiveDateTime {
        micros_to_datetime(parse_api_time(text).unwrap()).unwrap()
    }

    fn stems(coords: &[ChunkCoordinate]) -> Vec<String> {
        coords.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_monthly_lookback_mid_month() {
        let coords = chunks(
            "DISPATCHPRICE",
            dt("2024/02/10 12:00:00"),
            dt("2024/03/05 00:00:00"),
            Granularity::Monthly,
        );
        assert_eq!(
            stems(&coords),
            vec![
                "DISPATCHPRICE_202401",
                "DISPATCHPRICE_202402",
                "DISPATCHPRICE_202403",
            ]
        );
    }

    #[test]
    fn test_monthly_lookback_at_month_boundary() {
        let coords = chunks(
            "DISPATCHPRICE",
            dt("2024/02/01 00:00:00"),
            dt("2024/02/15 00:00:00"),
            Granularity::Monthly,
        );
        assert_eq!(
            stems(&coords),
            vec!["DISPATCHPRICE_202401", "DISPATCHPRICE_202402"]
        );
    }

    #[test]
    fn test_monthly_year_rollover_no_month_thirteen() {
        let coords = chunks(
            "DISPATCHPRICE",
            dt("2023/12/15 00:00:00"),
            dt("2024/01/15 00:00:00"),
            Granularity::Monthly,
        );
        assert_eq!(
            stems(&coords),
            vec![
                "DISPATCHPRICE_202311",
                "DISPATCHPRICE_202312",
                "DISPATCHPRICE_202401",
            ]
        );
        assert!(coords.iter().all(|c| (1..=12).contains(&c.month)));
    }

    #[test]
    fn test_daily_rollover_at_month_end() {
        let coords = chunks(
            "BIDDAYOFFER_D",
            dt("2024/03/01 04:00:00"),
            dt("2024/03/02 04:00:00"),
            Granularity::Daily,
        );
        assert_eq!(
            stems(&coords),
            vec![
                "BIDDAYOFFER_D_20240229",
                "BIDDAYOFFER_D_20240301",
                "BIDDAYOFFER_D_20240302",
            ]
        );
    }

    #[test]
    fn test_bundle_reverse_order_within_day() {
        let coords = chunks(
            "FCAS_4_SECOND",
            dt("2024/01/15 01:00:00"),
            dt("2024/01/15 01:15:00"),
            Granularity::SubDailyBundle,
        );
        // Descending within the day, covering every bucket that overlaps
        // [start, end): the 00:55 bucket spills into the window only when
        // start is inside it, which it is not here.
        assert_eq!(
            stems(&coords),
            vec![
                "FCAS_4_SECOND_20240115_0110",
                "FCAS_4_SECOND_20240115_0105",
                "FCAS_4_SECOND_20240115_0100",
            ]
        );
    }

    #[test]
    fn test_bundle_partial_bucket_at_start() {
        let coords = chunks(
            "FCAS_4_SECOND",
            dt("2024/01/15 01:02:00"),
            dt("2024/01/15 01:10:00"),
            Granularity::SubDailyBundle,
        );
        assert_eq!(
            stems(&coords),
            vec!["FCAS_4_SECOND_20240115_0105", "FCAS_4_SECOND_20240115_0100"]
        );
    }

    #[test]
    fn test_unbounded_single_chunk() {
        let coords = chunks(
            "VARIABLES_FCAS_4_SECOND",
            dt("2024/01/01 00:00:00"),
            dt("2024/06/01 00:00:00"),
            Granularity::Unbounded,
        );
        assert_eq!(stems(&coords), vec!["VARIABLES_FCAS_4_SECOND"]);
    }

    #[test]
    fn test_fill_template() {
        let coord = ChunkCoordinate::bundle("FCAS_4_SECOND", 2024, 1, 15, 1, 5);
        let url = coord.fill_template("https://x/{table}/{year}{month}{day}{hour}{minute}.csv");
        assert_eq!(url, "https://x/FCAS_4_SECOND/202401150105.csv");
    }
}
