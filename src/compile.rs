//! The dynamic compiler.
//!
//! Orchestration of a compile: window decomposition, per-chunk
//! ensure/project/read/filter, concatenation, reconciliation, and the
//! caller-level value filter. Chunk processing is a pure function of
//! the chunk coordinate, so chunks fan out across a small worker pool;
//! reconciliation is not streaming-safe and waits for every chunk.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use log::{debug, warn};

use crate::batch::RowBatch;
use crate::cache::{CacheOptions, ChunkCache};
use crate::catalog::{Granularity, TableCatalog, TableDescriptor};
use crate::error::{Error, Result};
use crate::timefmt::{micros_to_datetime, parse_api_time};
use crate::window::{self, ChunkCoordinate};
use crate::{filter, project, reconcile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSelect {
    /// The table's default column set.
    Default,
    /// Every column the chunks carry.
    All,
    /// An explicit list.
    Columns(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Window start, inclusive per the table's boundary convention.
    pub start: i64,
    /// Window end.
    pub end: i64,
    pub table: String,
    pub select: ColumnSelect,
    /// Caller-level value filter: AND across columns, OR within a
    /// column's allowed set. Parallel to `filter_values`.
    pub filter_cols: Vec<String>,
    pub filter_values: Vec<Vec<String>>,
    pub cache: CacheOptions,
    /// Worker threads for chunk processing. 1 runs sequentially.
    pub workers: usize,
}

impl CompileRequest {
    pub fn new(start: i64, end: i64, table: impl Into<String>) -> Self {
        Self {
            start,
            end,
            table: table.into(),
            select: ColumnSelect::Default,
            filter_cols: Vec::new(),
            filter_values: Vec::new(),
            cache: CacheOptions::default(),
            workers: 1,
        }
    }

    /// Build a request from the public `YYYY/MM/DD HH:MM:SS` strings.
    pub fn parse(start: &str, end: &str, table: &str) -> Result<Self> {
        Ok(Self::new(
            parse_api_time(start)?,
            parse_api_time(end)?,
            table,
        ))
    }

    pub fn select(mut self, select: ColumnSelect) -> Self {
        self.select = select;
        self
    }

    pub fn filters(mut self, cols: Vec<String>, values: Vec<Vec<String>>) -> Self {
        self.filter_cols = cols;
        self.filter_values = values;
        self
    }

    pub fn cache_options(mut self, cache: CacheOptions) -> Self {
        self.cache = cache;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

pub struct DynamicCompiler {
    catalog: TableCatalog,
    cache: Arc<ChunkCache>,
}

impl DynamicCompiler {
    pub fn new(catalog: TableCatalog, cache: Arc<ChunkCache>) -> Self {
        Self { catalog, cache }
    }

    pub fn catalog(&self) -> &TableCatalog {
        &self.catalog
    }

    /// Compile `[start, end)` for one table into a single reconciled batch.
    pub fn compile(&self, request: &CompileRequest) -> Result<RowBatch> {
        let descriptor = self.validate(request)?;
        let requested = self.requested_columns(request, descriptor);
        let coordinates = self.window(request, descriptor)?;
        debug!(
            "compiling {} over {} chunks",
            descriptor.name,
            coordinates.len()
        );

        let chunks = self.process_chunks(&coordinates, descriptor, request, requested.as_deref())?;
        let batches: Vec<RowBatch> = chunks.into_iter().flatten().collect();
        if batches.is_empty() {
            return Err(Error::NoDataToReturn);
        }

        let merged = RowBatch::concat(batches);
        let reconciled = reconcile::apply(descriptor.policy, &merged, descriptor, request.start);
        let deduped = reconcile::dedup_by_primary_key(&reconciled, descriptor);
        let sorted = match &descriptor.time_column {
            Some(column) => deduped.sort_by_time(column),
            None => deduped,
        };
        let filtered = sorted.filter_in(&request.filter_cols, &request.filter_values);

        if filtered.is_empty() {
            return Err(Error::NoDataToReturn);
        }
        Ok(filtered)
    }

    /// Convenience wrapper over [`compile`](Self::compile) taking the
    /// public `YYYY/MM/DD HH:MM:SS` window strings and defaults for
    /// everything else.
    pub fn compile_str(&self, start: &str, end: &str, table: &str) -> Result<RowBatch> {
        self.compile(&CompileRequest::parse(start, end, table)?)
    }

    /// Pre-warm the cache for a window without returning data.
    pub fn cache_only(&self, request: &CompileRequest) -> Result<()> {
        let descriptor = self.validate(request)?;
        let coordinates = self.window(request, descriptor)?;

        let mut any = false;
        for coordinate in &coordinates {
            if self
                .cache
                .ensure(coordinate, descriptor, &request.cache)?
                .is_some()
            {
                any = true;
            }
        }
        if !any {
            return Err(Error::NoDataToReturn);
        }
        Ok(())
    }

    /// Argument validation. Runs before any I/O and fails fast.
    fn validate(&self, request: &CompileRequest) -> Result<&TableDescriptor> {
        let descriptor = self.catalog.get(&request.table)?;

        if request.start >= request.end {
            return Err(Error::UserInput(format!(
                "window start must precede end for table {}",
                descriptor.name
            )));
        }
        if request.select == ColumnSelect::All
            && descriptor.granularity == Granularity::SubDailyBundle
        {
            return Err(Error::UserInput(format!(
                "select-all is not supported for bundle table {}; the archive has no stable full column set",
                descriptor.name
            )));
        }
        if request.filter_cols.len() != request.filter_values.len() {
            return Err(Error::UserInput(format!(
                "{} filter columns but {} value sets",
                request.filter_cols.len(),
                request.filter_values.len()
            )));
        }
        if let Some(selected) = self.requested_columns(request, descriptor) {
            for column in &request.filter_cols {
                if !selected.contains(column) {
                    return Err(Error::UserInput(format!(
                        "filter column {column} is not among the selected columns"
                    )));
                }
            }
        }
        Ok(descriptor)
    }

    /// The explicit column request, or `None` for read-everything.
    fn requested_columns(
        &self,
        request: &CompileRequest,
        descriptor: &TableDescriptor,
    ) -> Option<Vec<String>> {
        match &request.select {
            ColumnSelect::All => None,
            ColumnSelect::Default => Some(descriptor.default_columns.clone()),
            ColumnSelect::Columns(columns) => Some(columns.clone()),
        }
    }

    fn window(
        &self,
        request: &CompileRequest,
        descriptor: &TableDescriptor,
    ) -> Result<Vec<ChunkCoordinate>> {
        let start = micros_to_datetime(request.start)?;
        let end = micros_to_datetime(request.end)?;
        Ok(window::chunks(
            &descriptor.name,
            start,
            end,
            descriptor.granularity,
        ))
    }

    fn process_chunks(
        &self,
        coordinates: &[ChunkCoordinate],
        descriptor: &TableDescriptor,
        request: &CompileRequest,
        requested: Option<&[String]>,
    ) -> Result<Vec<Option<RowBatch>>> {
        let workers = request.workers.min(coordinates.len()).max(1);
        if workers == 1 {
            return coordinates
                .iter()
                .map(|c| self.process_chunk(c, descriptor, request, requested))
                .collect();
        }

        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel();
        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                scope.spawn(move || loop {
                    let idx = next.fetch_add(1, Ordering::Relaxed);
                    if idx >= coordinates.len() {
                        break;
                    }
                    let outcome =
                        self.process_chunk(&coordinates[idx], descriptor, request, requested);
                    if tx.send((idx, outcome)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            let mut results: Vec<Result<Option<RowBatch>>> =
                (0..coordinates.len()).map(|_| Ok(None)).collect();
            for (idx, outcome) in rx {
                results[idx] = outcome;
            }
            results.into_iter().collect()
        })
    }

    /// Ensure, project, read, and window-filter one chunk. `Ok(None)`
    /// means the chunk contributes no rows, which is tolerated.
    fn process_chunk(
        &self,
        coordinate: &ChunkCoordinate,
        descriptor: &TableDescriptor,
        request: &CompileRequest,
        requested: Option<&[String]>,
    ) -> Result<Option<RowBatch>> {
        let Some(artifact) = self.cache.ensure(coordinate, descriptor, &request.cache)? else {
            return Ok(None);
        };

        let batch = match requested {
            Some(requested) => {
                let available = self.cache.available_columns(&artifact)?;
                let resolved = project::resolve(
                    requested,
                    &available,
                    &descriptor.forced_columns(),
                    &descriptor.name,
                    &artifact.cache_path,
                )?;
                if !resolved.missing.is_empty() {
                    warn!(
                        "chunk {coordinate}: columns {:?} absent, continuing without them",
                        resolved.missing
                    );
                }
                self.cache.read(&artifact, Some(&resolved.columns))?
            }
            None => self.cache.read(&artifact, None)?,
        };

        Ok(Some(filter::filter(
            &batch,
            request.start,
            request.end,
            descriptor,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheFormat;
    use crate::codec::ParquetCodec;
    use crate::fetch::MirrorFetcher;
    use crate::layout::CacheLayout;
    use tempfile::tempdir;

    fn compiler_without_mirror() -> (tempfile::TempDir, DynamicCompiler) {
        let dir = tempdir().expect("tempdir");
        let cache = ChunkCache::new(
            CacheLayout::new(dir.path().join("store")),
            Arc::new(MirrorFetcher::new(dir.path().join("empty-mirror"))),
            Arc::new(ParquetCodec),
        );
        let compiler = DynamicCompiler::new(TableCatalog::builtin(), Arc::new(cache));
        (dir, compiler)
    }

    fn request(table: &str) -> CompileRequest {
        CompileRequest::parse("2024/01/01 00:00:00", "2024/01/02 00:00:00", table).unwrap()
    }

    #[test]
    fn test_unknown_table_fails_before_io() {
        let (_dir, compiler) = compiler_without_mirror();
        let err = compiler.compile(&request("NOT_A_TABLE")).unwrap_err();
        assert!(matches!(err, Error::UserInput(_)));
    }

    #[test]
    fn test_compile_str_rejects_bad_window_text() {
        let (_dir, compiler) = compiler_without_mirror();
        let err = compiler
            .compile_str("yesterday", "2024/01/02 00:00:00", "DISPATCHPRICE")
            .unwrap_err();
        assert!(matches!(err, Error::UserInput(_)));
    }

    #[test]
    fn test_inverted_window_rejected() {
        let (_dir, compiler) = compiler_without_mirror();
        let mut req = request("DISPATCHPRICE");
        std::mem::swap(&mut req.start, &mut req.end);
        let err = compiler.compile(&req).unwrap_err();
        assert!(matches!(err, Error::UserInput(_)));
    }

    #[test]
    fn test_select_all_rejected_for_bundle_table() {
        let (_dir, compiler) = compiler_without_mirror();
        let req = request("FCAS_4_SECOND").select(ColumnSelect::All);
        let err = compiler.compile(&req).unwrap_err();
        assert!(matches!(err, Error::UserInput(_)));
    }

    #[test]
    fn test_filter_column_outside_selection_rejected() {
        let (_dir, compiler) = compiler_without_mirror();
        let req = request("DISPATCHPRICE")
            .select(ColumnSelect::Columns(vec!["RRP".into(), "SETTLEMENTDATE".into()]))
            .filters(vec!["REGIONID".into()], vec![vec!["R1".into()]]);
        let err = compiler.compile(&req).unwrap_err();
        assert!(matches!(err, Error::UserInput(_)));
    }

    #[test]
    fn test_filter_arity_mismatch_rejected() {
        let (_dir, compiler) = compiler_without_mirror();
        let req = request("DISPATCHPRICE").filters(
            vec!["REGIONID".into(), "INTERVENTION".into()],
            vec![vec!["R1".into()]],
        );
        let err = compiler.compile(&req).unwrap_err();
        assert!(matches!(err, Error::UserInput(_)));
    }

    #[test]
    fn test_all_chunks_missing_is_no_data() {
        let (_dir, compiler) = compiler_without_mirror();
        let err = compiler.compile(&request("DISPATCHPRICE")).unwrap_err();
        assert!(matches!(err, Error::NoDataToReturn));

        let err = compiler.cache_only(&request("DISPATCHPRICE")).unwrap_err();
        assert!(matches!(err, Error::NoDataToReturn));
    }

    #[test]
    fn test_raw_format_request_validates_too() {
        let (_dir, compiler) = compiler_without_mirror();
        let mut req = request("DISPATCHPRICE");
        req.cache.format = CacheFormat::Raw;
        let err = compiler.compile(&req).unwrap_err();
        assert!(matches!(err, Error::NoDataToReturn));
    }
}
