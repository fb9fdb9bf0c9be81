//! Chunk cache.
//!
//! Guarantees an on-disk artifact exists for a chunk before anything
//! reads it. Lifecycle per chunk: `Missing` until the fetcher delivers
//! the raw file, `RawOnly` until conversion, `Cached` once the typed
//! cache artifact is written. A cached artifact is immutable; when it
//! is found corrupt it is deleted and rebuilt, never patched in place.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::batch::RowBatch;
use crate::catalog::TableDescriptor;
use crate::codec::{read_raw_csv, ChunkCodec};
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::layout::CacheLayout;
use crate::window::ChunkCoordinate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Missing,
    RawOnly,
    Cached,
}

#[derive(Debug, Clone)]
pub struct ChunkArtifact {
    pub coordinate: ChunkCoordinate,
    pub raw_path: PathBuf,
    pub cache_path: PathBuf,
    pub state: ChunkState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFormat {
    /// Leave the chunk as the raw CSV and read it directly.
    Raw,
    /// Convert to the typed columnar cache artifact.
    Columnar,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    /// Refetch and reconvert even when artifacts already exist.
    pub rebuild: bool,
    /// Keep the raw artifact after successful conversion.
    pub keep_raw: bool,
    pub format: CacheFormat,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            rebuild: false,
            keep_raw: false,
            format: CacheFormat::Columnar,
        }
    }
}

/// Sidecar written next to each cache artifact.
#[derive(Debug, Serialize, Deserialize)]
struct SidecarMeta {
    table: String,
    coordinate: String,
    raw_hash: String,
    rows: u64,
    converted_at_ns: u64,
}

/// Claim-before-write registry so two workers never write the same
/// cache artifact path concurrently.
struct PathClaims {
    inner: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

impl PathClaims {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    fn claim(&self, path: &Path) -> ClaimGuard<'_> {
        let mut held = self.inner.lock().unwrap();
        while held.contains(path) {
            held = self.released.wait(held).unwrap();
        }
        held.insert(path.to_path_buf());
        ClaimGuard {
            claims: self,
            path: path.to_path_buf(),
        }
    }
}

struct ClaimGuard<'a> {
    claims: &'a PathClaims,
    path: PathBuf,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.claims.inner.lock().unwrap();
        held.remove(&self.path);
        self.claims.released.notify_all();
    }
}

pub struct ChunkCache {
    layout: CacheLayout,
    fetcher: Arc<dyn Fetcher>,
    codec: Arc<dyn ChunkCodec>,
    claims: PathClaims,
}

impl ChunkCache {
    pub fn new(layout: CacheLayout, fetcher: Arc<dyn Fetcher>, codec: Arc<dyn ChunkCodec>) -> Self {
        Self {
            layout,
            fetcher,
            codec,
            claims: PathClaims::new(),
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Ensure an artifact exists for `coordinate`. Idempotent.
    ///
    /// Returns `Ok(None)` when the chunk is unavailable at the source;
    /// that is an expected condition (gaps in the historical archive),
    /// logged and tolerated. Only argument and layout problems, I/O
    /// faults outside the fetch itself, and codec faults are errors.
    pub fn ensure(
        &self,
        coordinate: &ChunkCoordinate,
        descriptor: &TableDescriptor,
        opts: &CacheOptions,
    ) -> Result<Option<ChunkArtifact>> {
        let raw_path = self.layout.raw_path(coordinate)?;
        let cache_path = self.layout.cache_path(coordinate)?;

        if opts.format == CacheFormat::Raw {
            if !raw_path.exists() || opts.rebuild {
                if !self.fetch_raw(coordinate, descriptor, &raw_path) {
                    return Ok(None);
                }
            }
            return Ok(Some(ChunkArtifact {
                coordinate: coordinate.clone(),
                raw_path,
                cache_path,
                state: ChunkState::RawOnly,
            }));
        }

        let _claim = self.claims.claim(&cache_path);

        if cache_path.exists() && !opts.rebuild {
            if self.cache_artifact_is_sound(coordinate, &cache_path, &raw_path) {
                return Ok(Some(ChunkArtifact {
                    coordinate: coordinate.clone(),
                    raw_path,
                    cache_path,
                    state: ChunkState::Cached,
                }));
            }
            warn!("invalidating corrupt cache artifact {}", cache_path.display());
            self.invalidate(coordinate, &cache_path)?;
        }

        if !raw_path.exists() || opts.rebuild {
            if !self.fetch_raw(coordinate, descriptor, &raw_path) {
                return Ok(None);
            }
        }

        match self.convert(coordinate, descriptor, &raw_path, &cache_path, opts) {
            Ok(()) => Ok(Some(ChunkArtifact {
                coordinate: coordinate.clone(),
                raw_path,
                cache_path,
                state: ChunkState::Cached,
            })),
            Err(Error::DataFormat(msg)) => {
                // Fatal for this chunk, but never silently: the window can
                // still compile from its other chunks.
                warn!("chunk {coordinate} dropped, raw layout mismatch: {msg}");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Column names available in an artifact.
    pub fn available_columns(&self, artifact: &ChunkArtifact) -> Result<Vec<String>> {
        match artifact.state {
            ChunkState::Cached => self.codec.columns(&artifact.cache_path),
            ChunkState::RawOnly => {
                let batch = read_raw_csv(&artifact.raw_path, &artifact.coordinate.table)?;
                Ok(batch.column_names())
            }
            ChunkState::Missing => Ok(Vec::new()),
        }
    }

    /// Read an artifact, narrowed to `columns` when given.
    pub fn read(&self, artifact: &ChunkArtifact, columns: Option<&[String]>) -> Result<RowBatch> {
        match artifact.state {
            ChunkState::Cached => self.codec.read(&artifact.cache_path, columns),
            ChunkState::RawOnly => {
                let batch = read_raw_csv(&artifact.raw_path, &artifact.coordinate.table)?;
                Ok(match columns {
                    Some(names) => batch.retain_columns(names),
                    None => batch,
                })
            }
            ChunkState::Missing => Ok(RowBatch::empty()),
        }
    }

    fn fetch_raw(
        &self,
        coordinate: &ChunkCoordinate,
        descriptor: &TableDescriptor,
        raw_path: &Path,
    ) -> bool {
        match self.fetcher.fetch(coordinate, descriptor, raw_path) {
            Ok(()) => true,
            Err(err) => {
                warn!("chunk {coordinate} unavailable: {err}");
                false
            }
        }
    }

    fn convert(
        &self,
        coordinate: &ChunkCoordinate,
        _descriptor: &TableDescriptor,
        raw_path: &Path,
        cache_path: &Path,
        opts: &CacheOptions,
    ) -> Result<()> {
        let batch = read_raw_csv(raw_path, &coordinate.table)?;

        // Never leave a half-written file from a prior crashed run in
        // the read path: drop any existing artifact before rewriting.
        if cache_path.exists() {
            std::fs::remove_file(cache_path)?;
        }
        self.codec.write(&batch, cache_path)?;

        let sidecar = SidecarMeta {
            table: coordinate.table.clone(),
            coordinate: coordinate.to_string(),
            raw_hash: hash_file(raw_path)?,
            rows: batch.num_rows() as u64,
            converted_at_ns: now_ns(),
        };
        let sidecar_path = self.layout.sidecar_path(coordinate)?;
        std::fs::write(
            &sidecar_path,
            serde_json::to_vec_pretty(&sidecar).map_err(|err| Error::Codec(err.to_string()))?,
        )?;

        if !opts.keep_raw {
            let _ = std::fs::remove_file(raw_path);
        }
        Ok(())
    }

    /// A cached artifact is sound when its footer parses and, if the raw
    /// file is still around, the recorded source hash matches it.
    fn cache_artifact_is_sound(
        &self,
        coordinate: &ChunkCoordinate,
        cache_path: &Path,
        raw_path: &Path,
    ) -> bool {
        if self.codec.columns(cache_path).is_err() {
            return false;
        }
        if raw_path.exists() {
            if let Ok(sidecar_path) = self.layout.sidecar_path(coordinate) {
                if let Some(meta) = read_sidecar(&sidecar_path) {
                    match hash_file(raw_path) {
                        Ok(hash) if hash != meta.raw_hash => return false,
                        _ => {}
                    }
                }
            }
        }
        true
    }

    fn invalidate(&self, coordinate: &ChunkCoordinate, cache_path: &Path) -> Result<()> {
        let _ = std::fs::remove_file(cache_path);
        if let Ok(sidecar) = self.layout.sidecar_path(coordinate) {
            let _ = std::fs::remove_file(sidecar);
        }
        Ok(())
    }
}

fn read_sidecar(path: &Path) -> Option<SidecarMeta> {
    let data = std::fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

fn hash_file(path: &Path) -> Result<String> {
    let data = std::fs::read(path)?;
    Ok(blake3::hash(&data).to_hex().to_string())
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TableCatalog;
    use crate::codec::ParquetCodec;
    use crate::fetch::MirrorFetcher;
    use tempfile::tempdir;

    const SAMPLE_CSV: &str = "SETTLEMENTDATE,REGIONID,INTERVENTION,RRP\n\
                              2024/01/01 00:05:00,R1,0,40\n\
                              2024/01/01 00:10:00,R1,0,41\n";

    fn setup(dir: &Path) -> (ChunkCache, TableCatalog, ChunkCoordinate) {
        let mirror = dir.join("mirror");
        std::fs::create_dir_all(mirror.join("DISPATCHPRICE")).unwrap();
        std::fs::write(
            mirror.join("DISPATCHPRICE/DISPATCHPRICE_202401.csv"),
            SAMPLE_CSV,
        )
        .unwrap();

        let cache = ChunkCache::new(
            CacheLayout::new(dir.join("store")),
            Arc::new(MirrorFetcher::new(mirror)),
            Arc::new(ParquetCodec),
        );
        let coord = ChunkCoordinate::monthly("DISPATCHPRICE", 2024, 1);
        (cache, TableCatalog::builtin(), coord)
    }

    #[test]
    fn test_ensure_converts_and_removes_raw() {
        let dir = tempdir().expect("tempdir");
        let (cache, catalog, coord) = setup(dir.path());
        let descriptor = catalog.get("DISPATCHPRICE").unwrap();

        let artifact = cache
            .ensure(&coord, descriptor, &CacheOptions::default())
            .unwrap()
            .expect("artifact");
        assert_eq!(artifact.state, ChunkState::Cached);
        assert!(artifact.cache_path.exists());
        assert!(!artifact.raw_path.exists());

        let batch = cache.read(&artifact, None).unwrap();
        assert_eq!(batch.num_rows(), 2);
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let (cache, catalog, coord) = setup(dir.path());
        let descriptor = catalog.get("DISPATCHPRICE").unwrap();
        let opts = CacheOptions::default();

        cache.ensure(&coord, descriptor, &opts).unwrap().unwrap();
        let first = std::fs::read(cache.layout().cache_path(&coord).unwrap()).unwrap();

        cache.ensure(&coord, descriptor, &opts).unwrap().unwrap();
        let second = std::fs::read(cache.layout().cache_path(&coord).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_cache_artifact_is_rebuilt() {
        let dir = tempdir().expect("tempdir");
        let (cache, catalog, coord) = setup(dir.path());
        let descriptor = catalog.get("DISPATCHPRICE").unwrap();
        let opts = CacheOptions {
            keep_raw: true,
            ..CacheOptions::default()
        };

        cache.ensure(&coord, descriptor, &opts).unwrap().unwrap();
        let cache_path = cache.layout().cache_path(&coord).unwrap();
        std::fs::write(&cache_path, b"truncated junk").unwrap();

        let artifact = cache.ensure(&coord, descriptor, &opts).unwrap().unwrap();
        assert_eq!(artifact.state, ChunkState::Cached);
        let batch = cache.read(&artifact, None).unwrap();
        assert_eq!(batch.num_rows(), 2);
    }

    #[test]
    fn test_fetch_failure_yields_empty_chunk() {
        let dir = tempdir().expect("tempdir");
        let (cache, catalog, _) = setup(dir.path());
        let descriptor = catalog.get("DISPATCHPRICE").unwrap();
        let missing = ChunkCoordinate::monthly("DISPATCHPRICE", 2019, 7);

        let artifact = cache
            .ensure(&missing, descriptor, &CacheOptions::default())
            .unwrap();
        assert!(artifact.is_none());
    }

    #[test]
    fn test_raw_format_skips_conversion() {
        let dir = tempdir().expect("tempdir");
        let (cache, catalog, coord) = setup(dir.path());
        let descriptor = catalog.get("DISPATCHPRICE").unwrap();
        let opts = CacheOptions {
            format: CacheFormat::Raw,
            ..CacheOptions::default()
        };

        let artifact = cache.ensure(&coord, descriptor, &opts).unwrap().unwrap();
        assert_eq!(artifact.state, ChunkState::RawOnly);
        assert!(artifact.raw_path.exists());
        assert!(!artifact.cache_path.exists());

        let batch = cache.read(&artifact, Some(&["RRP".to_string()])).unwrap();
        assert_eq!(batch.num_columns(), 1);
    }
}
