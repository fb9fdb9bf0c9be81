//! Table catalog.
//!
//! Every per-table behavior the compiler needs lives on an immutable
//! `TableDescriptor`: storage granularity, primary key, time column,
//! window boundary convention, and reconciliation policy. Descriptors
//! are collected into a `TableCatalog` registry that is injected into
//! the compiler, never read from global state.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the provider shards a table across source files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Granularity {
    /// One file per calendar month.
    Monthly,
    /// One file per calendar day.
    Daily,
    /// One file per 5-minute bundle (high-frequency measurement feeds).
    SubDailyBundle,
    /// A single static file, no time slicing.
    Unbounded,
}

/// Which open/closed predicate the window filter applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BoundaryConvention {
    /// Settlement-interval rows: `time > start && time <= end`.
    SettlementInterval,
    /// Effective-dated master rows: `time < end`, no left bound
    /// (the left side is handled by carry-forward reconciliation).
    EffectiveDated,
    /// Validity-interval rows: `START < end && END > start`.
    StartEndValidity,
    /// Sub-daily measurements: `time > start && time <= end`.
    SubDailyMeasurement,
}

/// De-duplication policy applied after chunk concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReconcilePolicy {
    /// Keep every row as-is.
    None,
    /// Keep the highest version number per reconciliation key.
    LatestVersion,
    /// Prefer the intervention record when one exists for a key.
    InterventionPreferred,
    /// Carry forward the latest pre-window effective-dated row per
    /// entity, plus every revision effective inside the window.
    EffectiveAsOf,
}

/// Immutable description of one provider table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub granularity: Granularity,
    /// Ordered primary key column names.
    pub primary_key: Vec<String>,
    /// Timestamp column the window filter runs on. Static tables
    /// (granularity `Unbounded`) may not have one.
    #[serde(default)]
    pub time_column: Option<String>,
    /// Columns returned when the caller does not select explicitly.
    pub default_columns: Vec<String>,
    pub boundary: BoundaryConvention,
    pub policy: ReconcilePolicy,
    /// Version counter column (LatestVersion, EffectiveAsOf dedup).
    #[serde(default)]
    pub version_column: Option<String>,
    /// Intervention flag column (InterventionPreferred).
    #[serde(default)]
    pub intervention_column: Option<String>,
    /// Effective-date column (EffectiveAsOf).
    #[serde(default)]
    pub effective_column: Option<String>,
    /// Interval-end column for StartEndValidity tables.
    #[serde(default)]
    pub validity_end_column: Option<String>,
    /// Source URL template. Placeholders: {table}, {year}, {month},
    /// {day}, {hour}, {minute}.
    #[serde(default)]
    pub url_template: Option<String>,
}

impl TableDescriptor {
    /// Columns the pipeline itself requires: the time column, the primary
    /// key, and whichever discriminator columns the policy consumes.
    /// Always included in a projection even when not selected.
    pub fn forced_columns(&self) -> Vec<String> {
        let mut forced = Vec::new();
        if let Some(time) = &self.time_column {
            forced.push(time.clone());
        }
        for key in &self.primary_key {
            if !forced.contains(key) {
                forced.push(key.clone());
            }
        }
        for extra in [
            &self.version_column,
            &self.intervention_column,
            &self.effective_column,
            &self.validity_end_column,
        ]
        .into_iter()
        .flatten()
        {
            if !forced.contains(extra) {
                forced.push(extra.clone());
            }
        }
        forced
    }

    /// The primary key minus the revision-discriminating columns. Rows
    /// sharing this key are candidates for merge.
    pub fn reconciliation_key(&self) -> Vec<String> {
        self.primary_key
            .iter()
            .filter(|column| {
                Some(*column) != self.version_column.as_ref()
                    && Some(*column) != self.intervention_column.as_ref()
            })
            .cloned()
            .collect()
    }

    /// The entity identity for effective-dated carry-forward: the primary
    /// key minus both the effective date and the version counter.
    pub fn entity_key(&self) -> Vec<String> {
        self.primary_key
            .iter()
            .filter(|column| {
                Some(*column) != self.version_column.as_ref()
                    && Some(*column) != self.effective_column.as_ref()
            })
            .cloned()
            .collect()
    }
}

/// Registry of table descriptors keyed by table name.
#[derive(Debug, Clone)]
pub struct TableCatalog {
    tables: HashMap<String, TableDescriptor>,
}

impl TableCatalog {
    pub fn new(descriptors: Vec<TableDescriptor>) -> Self {
        let tables = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        Self { tables }
    }

    /// Load a catalog from a JSON array of descriptors.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let descriptors: Vec<TableDescriptor> = serde_json::from_slice(&data)
            .map_err(|err| Error::DataFormat(format!("catalog parse: {err}")))?;
        Ok(Self::new(descriptors))
    }

    pub fn get(&self, name: &str) -> Result<&TableDescriptor> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::UserInput(format!("unknown table '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// The default catalog covering the provider's published tables.
    pub fn builtin() -> Self {
        let monthly_url = "https://archive.example.com/data/{year}/MMSDM_{year}_{month}/\
                           PUBLIC_DVD_{table}_{year}{month}010000.csv.gz";
        let fcas_url = "https://archive.example.com/causer_pays/\
                        FCAS_{year}{month}{day}{hour}{minute}.csv.gz";

        let strs = |names: &[&str]| -> Vec<String> { names.iter().map(|s| s.to_string()).collect() };

        let tables = vec![
            TableDescriptor {
                name: "DISPATCHPRICE".to_string(),
                granularity: Granularity::Monthly,
                primary_key: strs(&["SETTLEMENTDATE", "REGIONID", "INTERVENTION"]),
                time_column: Some("SETTLEMENTDATE".to_string()),
                default_columns: strs(&["SETTLEMENTDATE", "REGIONID", "INTERVENTION", "RRP"]),
                boundary: BoundaryConvention::SettlementInterval,
                policy: ReconcilePolicy::InterventionPreferred,
                version_column: None,
                intervention_column: Some("INTERVENTION".to_string()),
                effective_column: None,
                validity_end_column: None,
                url_template: Some(monthly_url.to_string()),
            },
            TableDescriptor {
                name: "DISPATCHLOAD".to_string(),
                granularity: Granularity::Monthly,
                primary_key: strs(&["SETTLEMENTDATE", "DUID", "INTERVENTION"]),
                time_column: Some("SETTLEMENTDATE".to_string()),
                default_columns: strs(&[
                    "SETTLEMENTDATE",
                    "DUID",
                    "INTERVENTION",
                    "INITIALMW",
                    "TOTALCLEARED",
                ]),
                boundary: BoundaryConvention::SettlementInterval,
                policy: ReconcilePolicy::InterventionPreferred,
                version_column: None,
                intervention_column: Some("INTERVENTION".to_string()),
                effective_column: None,
                validity_end_column: None,
                url_template: Some(monthly_url.to_string()),
            },
            TableDescriptor {
                name: "BIDDAYOFFER_D".to_string(),
                granularity: Granularity::Monthly,
                primary_key: strs(&["SETTLEMENTDATE", "DUID", "BIDTYPE", "VERSIONNO"]),
                time_column: Some("SETTLEMENTDATE".to_string()),
                default_columns: strs(&[
                    "SETTLEMENTDATE",
                    "DUID",
                    "BIDTYPE",
                    "VERSIONNO",
                    "PRICEBAND1",
                ]),
                boundary: BoundaryConvention::SettlementInterval,
                policy: ReconcilePolicy::LatestVersion,
                version_column: Some("VERSIONNO".to_string()),
                intervention_column: None,
                effective_column: None,
                validity_end_column: None,
                url_template: Some(monthly_url.to_string()),
            },
            TableDescriptor {
                name: "GENCONDATA".to_string(),
                granularity: Granularity::Monthly,
                primary_key: strs(&["GENCONID", "EFFECTIVEDATE", "VERSIONNO"]),
                time_column: Some("EFFECTIVEDATE".to_string()),
                default_columns: strs(&[
                    "GENCONID",
                    "EFFECTIVEDATE",
                    "VERSIONNO",
                    "CONSTRAINTVALUE",
                ]),
                boundary: BoundaryConvention::EffectiveDated,
                policy: ReconcilePolicy::EffectiveAsOf,
                version_column: Some("VERSIONNO".to_string()),
                intervention_column: None,
                effective_column: Some("EFFECTIVEDATE".to_string()),
                validity_end_column: None,
                url_template: Some(monthly_url.to_string()),
            },
            TableDescriptor {
                name: "DUDETAILSUMMARY".to_string(),
                granularity: Granularity::Monthly,
                primary_key: strs(&["DUID", "START_DATE"]),
                time_column: Some("START_DATE".to_string()),
                default_columns: strs(&[
                    "DUID",
                    "START_DATE",
                    "END_DATE",
                    "REGIONID",
                    "STATIONID",
                ]),
                boundary: BoundaryConvention::StartEndValidity,
                policy: ReconcilePolicy::None,
                version_column: None,
                intervention_column: None,
                effective_column: None,
                validity_end_column: Some("END_DATE".to_string()),
                url_template: Some(monthly_url.to_string()),
            },
            TableDescriptor {
                name: "FCAS_4_SECOND".to_string(),
                granularity: Granularity::SubDailyBundle,
                primary_key: strs(&["TIMESTAMP", "ELEMENTNUMBER", "VARIABLENUMBER"]),
                time_column: Some("TIMESTAMP".to_string()),
                default_columns: strs(&[
                    "TIMESTAMP",
                    "ELEMENTNUMBER",
                    "VARIABLENUMBER",
                    "VALUE",
                ]),
                boundary: BoundaryConvention::SubDailyMeasurement,
                policy: ReconcilePolicy::None,
                version_column: None,
                intervention_column: None,
                effective_column: None,
                validity_end_column: None,
                url_template: Some(fcas_url.to_string()),
            },
            TableDescriptor {
                name: "VARIABLES_FCAS_4_SECOND".to_string(),
                granularity: Granularity::Unbounded,
                primary_key: strs(&["VARIABLENUMBER"]),
                time_column: None,
                default_columns: strs(&["VARIABLENUMBER", "VARIABLETYPE"]),
                boundary: BoundaryConvention::SettlementInterval,
                policy: ReconcilePolicy::None,
                version_column: None,
                intervention_column: None,
                effective_column: None,
                validity_end_column: None,
                url_template: None,
            },
        ];
        Self::new(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let catalog = TableCatalog::builtin();
        let table = catalog.get("DISPATCHPRICE").unwrap();
        assert_eq!(table.granularity, Granularity::Monthly);
        assert_eq!(table.policy, ReconcilePolicy::InterventionPreferred);
        assert!(catalog.get("NOT_A_TABLE").is_err());
    }

    #[test]
    fn test_reconciliation_key_drops_discriminators() {
        let catalog = TableCatalog::builtin();
        let table = catalog.get("DISPATCHPRICE").unwrap();
        assert_eq!(table.reconciliation_key(), vec!["SETTLEMENTDATE", "REGIONID"]);

        let bids = catalog.get("BIDDAYOFFER_D").unwrap();
        assert_eq!(
            bids.reconciliation_key(),
            vec!["SETTLEMENTDATE", "DUID", "BIDTYPE"]
        );
    }

    #[test]
    fn test_entity_key_drops_effective_date() {
        let catalog = TableCatalog::builtin();
        let table = catalog.get("GENCONDATA").unwrap();
        assert_eq!(table.entity_key(), vec!["GENCONID"]);
    }

    #[test]
    fn test_forced_columns_cover_filter_and_policy_inputs() {
        let catalog = TableCatalog::builtin();
        let table = catalog.get("DUDETAILSUMMARY").unwrap();
        let forced = table.forced_columns();
        assert!(forced.contains(&"START_DATE".to_string()));
        assert!(forced.contains(&"END_DATE".to_string()));
        assert!(forced.contains(&"DUID".to_string()));
    }

    #[test]
    fn test_descriptor_serde_round_trip() {
        let catalog = TableCatalog::builtin();
        let table = catalog.get("GENCONDATA").unwrap();
        let json = serde_json::to_string(table).unwrap();
        let back: TableDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, table.name);
        assert_eq!(back.policy, ReconcilePolicy::EffectiveAsOf);
    }
}
