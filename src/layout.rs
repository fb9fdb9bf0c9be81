//! On-disk cache layout.
//!
//! Maps a chunk coordinate to its raw artifact, cache artifact, and
//! sidecar paths under a single cache root:
//!
//! ```text
//! <root>/raw/<TABLE>/<coordinate>.csv
//! <root>/cache/<TABLE>/<coordinate>.parquet
//! <root>/cache/<TABLE>/<coordinate>.meta.json
//! ```

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::window::ChunkCoordinate;

#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self, table: &str) -> Result<PathBuf> {
        validate_component("table", table)?;
        Ok(self.root.join("raw").join(table))
    }

    pub fn cache_dir(&self, table: &str) -> Result<PathBuf> {
        validate_component("table", table)?;
        Ok(self.root.join("cache").join(table))
    }

    pub fn raw_path(&self, coordinate: &ChunkCoordinate) -> Result<PathBuf> {
        Ok(self
            .raw_dir(&coordinate.table)?
            .join(format!("{}.csv", coordinate.file_stem())))
    }

    pub fn cache_path(&self, coordinate: &ChunkCoordinate) -> Result<PathBuf> {
        Ok(self
            .cache_dir(&coordinate.table)?
            .join(format!("{}.parquet", coordinate.file_stem())))
    }

    pub fn sidecar_path(&self, coordinate: &ChunkCoordinate) -> Result<PathBuf> {
        Ok(self
            .cache_dir(&coordinate.table)?
            .join(format!("{}.meta.json", coordinate.file_stem())))
    }
}

fn validate_component(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidLayout(format!("empty {field}")));
    }
    let ok = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !ok {
        return Err(Error::InvalidLayout(format!("{field} '{value}'")));
    }
    Ok(())
}
