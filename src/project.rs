//! Column projection.
//!
//! The provider has added and removed columns across the history of the
//! archive, so a chunk from 2009 and a chunk from 2023 rarely agree on
//! schema. Projection narrows a request to what a chunk actually has:
//! an empty intersection is a hard mismatch, a partial one succeeds
//! with the difference reported for the caller to log.

use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Resolved {
    /// Columns to read, in requested-then-forced order.
    pub columns: Vec<String>,
    /// Requested or forced columns this chunk does not carry.
    pub missing: Vec<String>,
}

/// Resolve `requested` against what a chunk contains.
///
/// `forced` columns (the time column, primary key, and policy
/// discriminators) are always included when present, even if not
/// requested, because filtering and reconciliation need them.
pub fn resolve(
    requested: &[String],
    available: &[String],
    forced: &[String],
    table: &str,
    path: &Path,
) -> Result<Resolved> {
    let present = |name: &String| available.iter().any(|a| a == name);

    let matched: Vec<String> = requested.iter().filter(|c| present(c)).cloned().collect();
    if matched.is_empty() {
        return Err(Error::DataMismatch {
            table: table.to_string(),
            path: path.to_path_buf(),
            requested: requested.to_vec(),
        });
    }

    let mut columns = matched;
    for name in forced {
        if present(name) && !columns.contains(name) {
            columns.push(name.clone());
        }
    }

    let mut missing: Vec<String> = requested
        .iter()
        .filter(|c| !present(c))
        .cloned()
        .collect();
    for name in forced {
        if !present(name) && !missing.contains(name) {
            missing.push(name.clone());
        }
    }

    Ok(Resolved { columns, missing })
}
