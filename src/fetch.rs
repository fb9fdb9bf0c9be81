//! Chunk fetching.
//!
//! The compiler only needs one guarantee from a fetcher: after a
//! successful call, the raw artifact exists at the requested path.
//! Fetch failures are non-fatal at the chunk level; the cache layer
//! downgrades them to "chunk empty".

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use url::Url;

use crate::catalog::TableDescriptor;
use crate::error::{Error, Result};
use crate::window::ChunkCoordinate;

pub trait Fetcher: Send + Sync {
    /// Make the raw bytes for `coordinate` exist at `raw_path`.
    fn fetch(
        &self,
        coordinate: &ChunkCoordinate,
        descriptor: &TableDescriptor,
        raw_path: &Path,
    ) -> Result<()>;
}

/// Fetches artifacts over HTTP from the provider's archive.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| Error::Fetch(err.to_string()))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        coordinate: &ChunkCoordinate,
        descriptor: &TableDescriptor,
        raw_path: &Path,
    ) -> Result<()> {
        let template = descriptor
            .url_template
            .as_deref()
            .ok_or_else(|| Error::Fetch(format!("table {} has no source url", descriptor.name)))?;
        let url = Url::parse(&coordinate.fill_template(template))
            .map_err(|err| Error::Fetch(format!("bad source url: {err}")))?;
        let gzipped = url.path().ends_with(".gz");

        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|err| Error::Fetch(err.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Fetch(format!("{} returned {}", url, response.status())));
        }
        let body = response
            .bytes()
            .map_err(|err| Error::Fetch(err.to_string()))?;

        if gzipped {
            let mut decoder = GzDecoder::new(body.as_ref());
            let mut decoded = Vec::new();
            decoder
                .read_to_end(&mut decoded)
                .map_err(|err| Error::Fetch(format!("gunzip {url}: {err}")))?;
            write_atomic(raw_path, &decoded)
        } else {
            write_atomic(raw_path, &body)
        }
    }
}

/// Fetches artifacts from a local mirror directory laid out as
/// `<mirror>/<TABLE>/<coordinate>.csv[.gz]`. Used by tests and
/// offline runs against a pre-synced archive.
pub struct MirrorFetcher {
    root: PathBuf,
}

impl MirrorFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn source_path(&self, coordinate: &ChunkCoordinate) -> Option<PathBuf> {
        let dir = self.root.join(&coordinate.table);
        let plain = dir.join(format!("{}.csv", coordinate.file_stem()));
        if plain.exists() {
            return Some(plain);
        }
        let gz = dir.join(format!("{}.csv.gz", coordinate.file_stem()));
        gz.exists().then_some(gz)
    }
}

impl Fetcher for MirrorFetcher {
    fn fetch(
        &self,
        coordinate: &ChunkCoordinate,
        _descriptor: &TableDescriptor,
        raw_path: &Path,
    ) -> Result<()> {
        let source = self
            .source_path(coordinate)
            .ok_or_else(|| Error::Fetch(format!("no mirror artifact for {coordinate}")))?;

        let mut data = Vec::new();
        let file = File::open(&source)?;
        if source.extension().map(|ext| ext == "gz").unwrap_or(false) {
            GzDecoder::new(file)
                .read_to_end(&mut data)
                .map_err(|err| Error::Fetch(format!("gunzip {}: {err}", source.display())))?;
        } else {
            let mut file = file;
            file.read_to_end(&mut data)?;
        }
        write_atomic(raw_path, &data)
    }
}

/// Write via a tmp file and rename so readers never observe a partial
/// artifact.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path_for(path)?;
    let _ = std::fs::remove_file(&tmp);

    let mut out = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    out.write_all(data)?;
    out.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn tmp_path_for(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| Error::Fetch(format!("missing filename for {}", path.display())))?
        .to_string_lossy();
    Ok(path.with_file_name(format!("{name}.tmp")))
}
