//! Window filtering.
//!
//! Applies a table's declared boundary convention to a chunk's rows.
//! The conventions are behaviorally load-bearing and observable at the
//! single-row level:
//!
//! - settlement intervals:  `time > start && time <= end`
//! - effective-dated:       `time < end` (left side handled by
//!                          carry-forward reconciliation)
//! - start/end validity:    `START < end && END > start`
//! - sub-daily measurement: `time > start && time <= end`
//!
//! Rows with unparsable time values are never dropped silently: they
//! are counted, logged, and excluded, and filtering proceeds on the
//! remainder.

use log::warn;

use crate::batch::RowBatch;
use crate::catalog::{BoundaryConvention, TableDescriptor};

pub fn filter(batch: &RowBatch, start: i64, end: i64, descriptor: &TableDescriptor) -> RowBatch {
    let Some(time_column) = &descriptor.time_column else {
        return batch.clone();
    };
    let Some(time_idx) = batch.column_index(time_column) else {
        warn!(
            "table {}: time column {time_column} absent from chunk, excluding {} rows",
            descriptor.name,
            batch.num_rows()
        );
        return batch.take_rows(&[]);
    };

    let end_idx = match descriptor.boundary {
        BoundaryConvention::StartEndValidity => {
            match descriptor
                .validity_end_column
                .as_deref()
                .and_then(|name| batch.column_index(name))
            {
                Some(idx) => Some(idx),
                None => {
                    warn!(
                        "table {}: validity end column missing, excluding {} rows",
                        descriptor.name,
                        batch.num_rows()
                    );
                    return batch.take_rows(&[]);
                }
            }
        }
        _ => None,
    };

    let mut unparsable = 0usize;
    let mut keep = Vec::new();
    for row in 0..batch.num_rows() {
        let time = match batch.value(time_idx, row).as_timestamp() {
            Some(t) => t,
            None => {
                unparsable += 1;
                continue;
            }
        };

        let inside = match descriptor.boundary {
            BoundaryConvention::SettlementInterval | BoundaryConvention::SubDailyMeasurement => {
                time > start && time <= end
            }
            BoundaryConvention::EffectiveDated => time < end,
            BoundaryConvention::StartEndValidity => match end_idx {
                Some(idx) => {
                    let end_value = batch.value(idx, row);
                    // A null interval end means the validity is still open.
                    let validity_end = if end_value.is_null() {
                        i64::MAX
                    } else {
                        match end_value.as_timestamp() {
                            Some(t) => t,
                            None => {
                                unparsable += 1;
                                continue;
                            }
                        }
                    };
                    time < end && validity_end > start
                }
                None => false,
            },
        };
        if inside {
            keep.push(row);
        }
    }

    if unparsable > 0 {
        warn!(
            "table {}: excluded {unparsable} rows with unparsable time values",
            descriptor.name
        );
    }
    batch.take_rows(&keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::batch_from_string_rows;
    use crate::catalog::TableCatalog;
    use crate::timefmt::parse_api_time;

    fn settlement_batch() -> RowBatch {
        batch_from_string_rows(
            &["SETTLEMENTDATE".into(), "REGIONID".into(), "RRP".into()],
            &[
                vec!["2024/01/01 00:00:00".into(), "R1".into(), "39".into()],
                vec!["2024/01/01 00:05:00".into(), "R1".into(), "40".into()],
                vec!["2024/01/01 01:00:00".into(), "R1".into(), "41".into()],
                vec!["2024/01/01 01:05:00".into(), "R1".into(), "42".into()],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_settlement_boundaries_exact() {
        let catalog = TableCatalog::builtin();
        let descriptor = catalog.get("DISPATCHPRICE").unwrap();
        let start = parse_api_time("2024/01/01 00:00:00").unwrap();
        let end = parse_api_time("2024/01/01 01:00:00").unwrap();

        let filtered = filter(&settlement_batch(), start, end, descriptor);
        // A row exactly at start is excluded; exactly at end is included.
        let times: Vec<String> = (0..filtered.num_rows())
            .map(|r| filtered.value(0, r).render())
            .collect();
        assert_eq!(times, vec!["2024/01/01 00:05:00", "2024/01/01 01:00:00"]);
    }

    #[test]
    fn test_effective_dated_excludes_row_at_end() {
        let catalog = TableCatalog::builtin();
        let descriptor = catalog.get("GENCONDATA").unwrap();
        let batch = batch_from_string_rows(
            &["GENCONID".into(), "EFFECTIVEDATE".into(), "VERSIONNO".into()],
            &[
                vec!["C1".into(), "2023/06/01 00:00:00".into(), "1".into()],
                vec!["C1".into(), "2024/02/01 00:00:00".into(), "2".into()],
            ],
        )
        .unwrap();

        let start = parse_api_time("2024/01/01 00:00:00").unwrap();
        let end = parse_api_time("2024/02/01 00:00:00").unwrap();
        let filtered = filter(&batch, start, end, descriptor);
        // No left bound; the row exactly at end is excluded.
        assert_eq!(filtered.num_rows(), 1);
        assert_eq!(filtered.value(1, 0).render(), "2023/06/01 00:00:00");
    }

    #[test]
    fn test_validity_interval_overlap() {
        let catalog = TableCatalog::builtin();
        let descriptor = catalog.get("DUDETAILSUMMARY").unwrap();
        let batch = batch_from_string_rows(
            &["DUID".into(), "START_DATE".into(), "END_DATE".into()],
            &[
                // Ends before the window: out.
                vec!["U1".into(), "2023/01/01".into(), "2023/12/01".into()],
                // Overlaps the window start: in.
                vec!["U2".into(), "2023/01/01".into(), "2024/01/10".into()],
                // Starts inside the window: in.
                vec!["U3".into(), "2024/01/15".into(), "2025/01/01".into()],
                // Starts at/after the window end: out.
                vec!["U4".into(), "2024/02/01".into(), "2025/01/01".into()],
                // Open-ended validity: in.
                vec!["U5".into(), "2023/06/01".into(), "".into()],
            ],
        )
        .unwrap();

        let start = parse_api_time("2024/01/01 00:00:00").unwrap();
        let end = parse_api_time("2024/02/01 00:00:00").unwrap();
        let filtered = filter(&batch, start, end, descriptor);
        let ids: Vec<String> = (0..filtered.num_rows())
            .map(|r| filtered.value(0, r).render())
            .collect();
        assert_eq!(ids, vec!["U2", "U3", "U5"]);
    }

    #[test]
    fn test_unparsable_times_are_segregated() {
        let catalog = TableCatalog::builtin();
        let descriptor = catalog.get("DISPATCHPRICE").unwrap();
        let batch = batch_from_string_rows(
            &["SETTLEMENTDATE".into(), "RRP".into()],
            &[
                vec!["not a date".into(), "40".into()],
                vec!["2024/01/01 00:05:00".into(), "41".into()],
            ],
        )
        .unwrap();

        let start = parse_api_time("2024/01/01 00:00:00").unwrap();
        let end = parse_api_time("2024/01/01 01:00:00").unwrap();
        let filtered = filter(&batch, start, end, descriptor);
        assert_eq!(filtered.num_rows(), 1);
        assert_eq!(filtered.value(1, 0).render(), "41");
    }

    #[test]
    fn test_static_table_passes_through() {
        let catalog = TableCatalog::builtin();
        let descriptor = catalog.get("VARIABLES_FCAS_4_SECOND").unwrap();
        let batch = batch_from_string_rows(
            &["VARIABLENUMBER".into(), "VARIABLETYPE".into()],
            &[vec!["1".into(), "MW".into()]],
        )
        .unwrap();
        let filtered = filter(&batch, 0, 1, descriptor);
        assert_eq!(filtered.num_rows(), 1);
    }
}
