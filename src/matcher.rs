//! Cross-source identifier matching.
//!
//! The high-frequency measurement feed keys its series by an opaque
//! numeric element number; the dispatch data keys the same physical
//! units by a human identifier. No mapping is published. This module
//! infers the correspondence by value proximity: an element that tracks
//! a unit's dispatched value with small aggregate error over a shared
//! window is that unit.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::timefmt::truncate_to_interval;

/// One sample from the fine-grained series (many samples per interval).
#[derive(Debug, Clone)]
pub struct FineSample {
    pub element_id: i64,
    pub time: i64,
    pub value: f64,
}

/// One sample from the coarse series (one sample per interval).
#[derive(Debug, Clone)]
pub struct CoarseSample {
    pub unit_id: String,
    pub time: i64,
    pub value: f64,
}

/// An element/unit pairing before assignment.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub element_id: i64,
    pub unit_id: String,
    pub aggregate_error: f64,
    pub coarse_magnitude: f64,
}

/// A resolved pairing. At most one per element id and per unit id.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub element_id: i64,
    pub unit_id: String,
    pub relative_error: f64,
}

/// Coarse series whose summed magnitude is below this is considered
/// idle; matching an idle series against an idle element is noise.
const MIN_COARSE_MAGNITUDE: f64 = 1e-4;

/// Infer the element-to-unit correspondence between two series.
///
/// Fine timestamps are truncated down to the coarse interval start,
/// then every (element, unit) pair sharing an aligned timestamp is a
/// candidate: deliberately a full cross product per timestamp, with the
/// minimum-error row kept per (unit, element, timestamp) before
/// aggregation. Candidates are assigned greedily in ascending aggregate
/// error, producing a mutually exclusive pairing; pairs whose relative
/// error reaches 100% are not credible and are dropped.
///
/// Deterministic: identical input yields identical output, including
/// tie-break order (stable sort, first-appearance candidate order).
pub fn match_sources(
    fine: &[FineSample],
    coarse: &[CoarseSample],
    interval_micros: i64,
) -> Vec<MatchResult> {
    // Coarse samples indexed by interval timestamp.
    let mut coarse_by_time: HashMap<i64, Vec<&CoarseSample>> = HashMap::new();
    for sample in coarse {
        coarse_by_time.entry(sample.time).or_default().push(sample);
    }

    // Best error per (unit, element, timestamp), plus the coarse value
    // observed there. First-appearance order of (element, unit) pairs is
    // recorded so the final sort has a deterministic tie-break.
    type PairKey = (i64, String);
    // BTreeMap so the aggregation pass visits keys in a fixed order;
    // float summation order must not vary between runs.
    let mut best: BTreeMap<(i64, String, i64), (f64, f64)> = BTreeMap::new();
    let mut pair_order: Vec<PairKey> = Vec::new();
    let mut pair_seen: HashSet<PairKey> = HashSet::new();

    for sample in fine {
        let aligned = truncate_to_interval(sample.time, interval_micros);
        let Some(partners) = coarse_by_time.get(&aligned) else {
            continue;
        };
        for partner in partners {
            let error = (sample.value - partner.value).abs();
            let key = (sample.element_id, partner.unit_id.clone(), aligned);
            let entry = best.entry(key).or_insert((f64::INFINITY, partner.value));
            if error < entry.0 {
                entry.0 = error;
            }
            let pair = (sample.element_id, partner.unit_id.clone());
            if pair_seen.insert(pair.clone()) {
                pair_order.push(pair);
            }
        }
    }

    // Aggregate per (element, unit) over all timestamps.
    let mut totals: HashMap<PairKey, (f64, f64)> = HashMap::new();
    for ((element_id, unit_id, _), (error, coarse_value)) in &best {
        let entry = totals
            .entry((*element_id, unit_id.clone()))
            .or_insert((0.0, 0.0));
        entry.0 += error;
        entry.1 += coarse_value;
    }

    let mut candidates: Vec<MatchCandidate> = pair_order
        .into_iter()
        .filter_map(|pair| {
            totals.get(&pair).map(|(error, magnitude)| MatchCandidate {
                element_id: pair.0,
                unit_id: pair.1.clone(),
                aggregate_error: *error,
                coarse_magnitude: *magnitude,
            })
        })
        .collect();
    candidates.sort_by(|a, b| {
        a.aggregate_error
            .partial_cmp(&b.aggregate_error)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // Greedy mutually exclusive assignment: keep the first occurrence of
    // each element id, then among the survivors the first occurrence of
    // each unit id.
    let mut seen_elements: HashSet<i64> = HashSet::new();
    let mut seen_units: HashSet<String> = HashSet::new();
    let mut results = Vec::new();
    let survivors: Vec<MatchCandidate> = candidates
        .into_iter()
        .filter(|c| c.coarse_magnitude.abs() >= MIN_COARSE_MAGNITUDE)
        .filter(|c| seen_elements.insert(c.element_id))
        .collect();
    for candidate in survivors {
        if !seen_units.insert(candidate.unit_id.clone()) {
            continue;
        }
        let relative_error = candidate.aggregate_error / candidate.coarse_magnitude;
        if relative_error.abs() >= 1.0 {
            continue;
        }
        results.push(MatchResult {
            element_id: candidate.element_id,
            unit_id: candidate.unit_id,
            relative_error,
        });
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timefmt::{parse_api_time, FIVE_MINUTES_MICROS};

    fn fine(element_id: i64, time: i64, value: f64) -> FineSample {
        FineSample {
            element_id,
            time,
            value,
        }
    }

    fn coarse(unit_id: &str, time: i64, value: f64) -> CoarseSample {
        CoarseSample {
            unit_id: unit_id.to_string(),
            time,
            value,
        }
    }

    #[test]
    fn test_tracking_element_matches_and_idle_is_rejected() {
        let t0 = parse_api_time("2024/01/01 00:00:00").unwrap();
        let t1 = t0 + FIVE_MINUTES_MICROS;

        // Element 7 tracks unit X with small error; element 9 is flat zero.
        let fine_samples = vec![
            fine(7, t0 + 4_000_000, 99.5),
            fine(7, t0 + 8_000_000, 100.4),
            fine(9, t0 + 4_000_000, 0.0),
            fine(7, t1 + 4_000_000, 120.2),
            fine(9, t1 + 4_000_000, 0.0),
        ];
        let coarse_samples = vec![
            coarse("X", t0, 100.0),
            coarse("X", t1, 120.0),
            coarse("Z", t0, 0.0),
            coarse("Z", t1, 0.0),
        ];

        let results = match_sources(&fine_samples, &coarse_samples, FIVE_MINUTES_MICROS);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].element_id, 7);
        assert_eq!(results[0].unit_id, "X");
        assert!(results[0].relative_error < 1.0);
        assert!(results[0].relative_error >= 0.0);

        // Element 9 appears nowhere: its only non-idle pairing (against X)
        // carries ~100% error, and Z is rejected as zero-magnitude.
        assert!(results.iter().all(|r| r.element_id != 9));
        assert!(results.iter().all(|r| r.unit_id != "Z"));
    }

    #[test]
    fn test_best_per_timestamp_before_aggregation() {
        let t0 = parse_api_time("2024/01/01 00:00:00").unwrap();
        // Two fine samples in the same interval, one close and one far:
        // only the close one may contribute to the aggregate.
        let fine_samples = vec![fine(1, t0 + 4_000_000, 50.0), fine(1, t0 + 8_000_000, 80.0)];
        let coarse_samples = vec![coarse("A", t0, 50.5)];

        let results = match_sources(&fine_samples, &coarse_samples, FIVE_MINUTES_MICROS);
        assert_eq!(results.len(), 1);
        let expected = 0.5 / 50.5;
        assert!((results[0].relative_error - expected).abs() < 1e-9);
    }

    #[test]
    fn test_assignment_is_mutually_exclusive() {
        let t0 = parse_api_time("2024/01/01 00:00:00").unwrap();
        // Both elements track unit A, element 1 more closely; element 2
        // must then fall through to unit B.
        let fine_samples = vec![
            fine(1, t0 + 4_000_000, 100.1),
            fine(2, t0 + 4_000_000, 101.0),
        ];
        let coarse_samples = vec![coarse("A", t0, 100.0), coarse("B", t0, 101.5)];

        let results = match_sources(&fine_samples, &coarse_samples, FIVE_MINUTES_MICROS);
        assert_eq!(results.len(), 2);
        let a = results.iter().find(|r| r.unit_id == "A").unwrap();
        let b = results.iter().find(|r| r.unit_id == "B").unwrap();
        assert_eq!(a.element_id, 1);
        assert_eq!(b.element_id, 2);
    }

    #[test]
    fn test_determinism_on_repeated_input() {
        let t0 = parse_api_time("2024/01/01 00:00:00").unwrap();
        let fine_samples = vec![
            fine(1, t0 + 4_000_000, 10.0),
            fine(2, t0 + 4_000_000, 10.0),
        ];
        let coarse_samples = vec![coarse("A", t0, 10.0), coarse("B", t0, 10.0)];

        let first = match_sources(&fine_samples, &coarse_samples, FIVE_MINUTES_MICROS);
        for _ in 0..10 {
            let again = match_sources(&fine_samples, &coarse_samples, FIVE_MINUTES_MICROS);
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_empty_inputs() {
        assert!(match_sources(&[], &[], FIVE_MINUTES_MICROS).is_empty());
    }
}
