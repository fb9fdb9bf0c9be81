//! Record reconciliation.
//!
//! The provider republishes history: a row can appear once per source
//! file it survives into, with revisions distinguished by a version
//! counter, an intervention flag, or an effective date. Reconciliation
//! collapses the concatenated chunks down to one row per key according
//! to the table's declared policy.

use crate::batch::{GroupIndex, RowBatch};
use crate::catalog::{ReconcilePolicy, TableDescriptor};

/// Apply the table's reconciliation policy to a concatenated batch.
///
/// `query_start` is the left edge of the compile window, consumed by
/// the effective-as-of policy. Empty input yields empty output; there
/// are no failure modes.
pub fn apply(
    policy: ReconcilePolicy,
    batch: &RowBatch,
    descriptor: &TableDescriptor,
    query_start: i64,
) -> RowBatch {
    if batch.is_empty() {
        return batch.clone();
    }
    match policy {
        ReconcilePolicy::None => batch.clone(),
        ReconcilePolicy::LatestVersion => latest_version(batch, descriptor),
        ReconcilePolicy::InterventionPreferred => intervention_preferred(batch, descriptor),
        ReconcilePolicy::EffectiveAsOf => effective_as_of(batch, descriptor, query_start),
    }
}

/// Collapse residual exact duplicates by full primary key, keeping the
/// last occurrence. Composable after any of the policies above.
pub fn dedup_by_primary_key(batch: &RowBatch, descriptor: &TableDescriptor) -> RowBatch {
    let key_cols = column_indices(batch, &descriptor.primary_key);
    if key_cols.is_empty() {
        return batch.clone();
    }
    let mut groups = GroupIndex::new();
    for row in 0..batch.num_rows() {
        groups.offer(batch.row_key(&key_cols, row), row, |_| true);
    }
    take_sorted(batch, groups.into_rows())
}

/// Keep the highest-version row per reconciliation key. Version order is
/// numeric, not lexical; among equal versions the later row wins.
fn latest_version(batch: &RowBatch, descriptor: &TableDescriptor) -> RowBatch {
    let key_cols = column_indices(batch, &descriptor.reconciliation_key());
    let Some(version_idx) = descriptor
        .version_column
        .as_deref()
        .and_then(|name| batch.column_index(name))
    else {
        return batch.clone();
    };

    let version_of = |row: usize| -> f64 {
        batch
            .value(version_idx, row)
            .as_num()
            .unwrap_or(f64::NEG_INFINITY)
    };

    let mut groups = GroupIndex::new();
    for row in 0..batch.num_rows() {
        groups.offer(batch.row_key(&key_cols, row), row, |current| {
            version_of(row) >= version_of(current)
        });
    }
    take_sorted(batch, groups.into_rows())
}

/// Prefer the intervention record when both a primary and an
/// intervention row exist for the same key.
fn intervention_preferred(batch: &RowBatch, descriptor: &TableDescriptor) -> RowBatch {
    let key_cols = column_indices(batch, &descriptor.reconciliation_key());
    let Some(flag_idx) = descriptor
        .intervention_column
        .as_deref()
        .and_then(|name| batch.column_index(name))
    else {
        return batch.clone();
    };

    let flag_of = |row: usize| -> f64 {
        batch.value(flag_idx, row).as_num().unwrap_or(0.0)
    };

    let mut groups = GroupIndex::new();
    for row in 0..batch.num_rows() {
        groups.offer(batch.row_key(&key_cols, row), row, |current| {
            flag_of(row) >= flag_of(current)
        });
    }
    take_sorted(batch, groups.into_rows())
}

/// Reproduce "what was true at the start of the window, plus every
/// subsequent revision": rows effective inside the window all survive;
/// from the rows effective before it, only the single latest-effective
/// row per entity is carried forward.
fn effective_as_of(batch: &RowBatch, descriptor: &TableDescriptor, query_start: i64) -> RowBatch {
    let Some(effective_idx) = descriptor
        .effective_column
        .as_deref()
        .and_then(|name| batch.column_index(name))
    else {
        return batch.clone();
    };
    let entity_cols = column_indices(batch, &descriptor.entity_key());
    let version_idx = descriptor
        .version_column
        .as_deref()
        .and_then(|name| batch.column_index(name));

    let mut after = Vec::new();
    let mut carry = GroupIndex::new();
    for row in 0..batch.num_rows() {
        let Some(effective) = batch.value(effective_idx, row).as_timestamp() else {
            continue;
        };
        if effective >= query_start {
            after.push(row);
            continue;
        }
        let beats = |current: usize| -> bool {
            let current_eff = batch
                .value(effective_idx, current)
                .as_timestamp()
                .unwrap_or(i64::MIN);
            if effective != current_eff {
                return effective > current_eff;
            }
            // Same effective date: fall back to the version counter.
            match version_idx {
                Some(idx) => {
                    let new = batch.value(idx, row).as_num().unwrap_or(f64::NEG_INFINITY);
                    let old = batch
                        .value(idx, current)
                        .as_num()
                        .unwrap_or(f64::NEG_INFINITY);
                    new >= old
                }
                None => true,
            }
        };
        carry.offer(batch.row_key(&entity_cols, row), row, beats);
    }

    let mut rows = carry.into_rows();
    rows.extend(after);
    take_sorted(batch, rows)
}

fn column_indices(batch: &RowBatch, names: &[String]) -> Vec<usize> {
    names
        .iter()
        .filter_map(|name| batch.column_index(name))
        .collect()
}

/// Emit surviving rows in their original order.
fn take_sorted(batch: &RowBatch, mut rows: Vec<usize>) -> RowBatch {
    rows.sort_unstable();
    batch.take_rows(&rows)
}
