use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use almanac::cache::{CacheFormat, CacheOptions, ChunkCache};
use almanac::codec::ParquetCodec;
use almanac::compile::{ColumnSelect, CompileRequest, DynamicCompiler};
use almanac::fetch::{Fetcher, HttpFetcher, MirrorFetcher};
use almanac::layout::CacheLayout;
use almanac::{RowBatch, TableCatalog};

#[derive(Parser)]
#[command(name = "almanac-cli")]
#[command(about = "Compile revisioned market archive tables over a query window")]
struct Cli {
    /// Local cache root.
    #[arg(long, default_value = "almanac-cache")]
    store: PathBuf,

    /// Fetch chunks from a local mirror directory instead of HTTP.
    #[arg(long)]
    mirror: Option<PathBuf>,

    /// Table catalog JSON; the built-in catalog is used when omitted.
    #[arg(long)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a window into CSV on stdout or a file
    Compile {
        table: String,

        /// Window start, `YYYY/MM/DD HH:MM:SS`
        start: String,

        /// Window end, `YYYY/MM/DD HH:MM:SS`
        end: String,

        /// Comma-separated column list, or `all`
        #[arg(long)]
        columns: Option<String>,

        /// Value filter, `COLUMN=V1,V2`; repeatable
        #[arg(long = "filter")]
        filters: Vec<String>,

        /// Output CSV path (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Re-fetch and re-convert even when cached
        #[arg(long)]
        rebuild: bool,

        /// Keep raw source files next to the columnar cache
        #[arg(long)]
        keep_raw: bool,

        /// Worker threads for chunk processing
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },
    /// Populate the cache for a window without producing output
    Cache {
        table: String,
        start: String,
        end: String,

        /// Cache raw files only, skipping columnar conversion
        #[arg(long)]
        raw: bool,

        #[arg(long)]
        rebuild: bool,

        #[arg(long)]
        keep_raw: bool,
    },
    /// List the tables the catalog knows about
    Tables,
}

fn main() -> Result<()> {
    env_logger::init();
    let Cli {
        store,
        mirror,
        catalog,
        command,
    } = Cli::parse();

    let catalog = match &catalog {
        Some(path) => TableCatalog::from_json_file(path)?,
        None => TableCatalog::builtin(),
    };

    match command {
        Commands::Tables => {
            for name in catalog.table_names() {
                println!("{name}");
            }
        }
        Commands::Compile {
            table,
            start,
            end,
            columns,
            filters,
            output,
            rebuild,
            keep_raw,
            workers,
        } => {
            let compiler = build_compiler(&store, mirror.as_deref(), catalog)?;
            let (filter_cols, filter_values) = parse_filters(&filters)?;
            let request = CompileRequest::parse(&start, &end, &table)?
                .select(parse_columns(columns.as_deref()))
                .filters(filter_cols, filter_values)
                .cache_options(CacheOptions {
                    rebuild,
                    keep_raw,
                    format: CacheFormat::Columnar,
                })
                .workers(workers);
            let batch = compiler.compile(&request)?;
            write_csv(&batch, output.as_deref())?;
        }
        Commands::Cache {
            table,
            start,
            end,
            raw,
            rebuild,
            keep_raw,
        } => {
            let compiler = build_compiler(&store, mirror.as_deref(), catalog)?;
            let format = if raw {
                CacheFormat::Raw
            } else {
                CacheFormat::Columnar
            };
            let request = CompileRequest::parse(&start, &end, &table)?.cache_options(
                CacheOptions {
                    rebuild,
                    keep_raw,
                    format,
                },
            );
            compiler.cache_only(&request)?;
        }
    }
    Ok(())
}

fn build_compiler(
    store: &Path,
    mirror: Option<&Path>,
    catalog: TableCatalog,
) -> Result<DynamicCompiler> {
    let fetcher: Arc<dyn Fetcher> = match mirror {
        Some(root) => Arc::new(MirrorFetcher::new(root)),
        None => Arc::new(HttpFetcher::new()?),
    };
    let cache = Arc::new(ChunkCache::new(
        CacheLayout::new(store),
        fetcher,
        Arc::new(ParquetCodec),
    ));
    Ok(DynamicCompiler::new(catalog, cache))
}

fn parse_columns(spec: Option<&str>) -> ColumnSelect {
    match spec {
        None => ColumnSelect::Default,
        Some("all") => ColumnSelect::All,
        Some(list) => ColumnSelect::Columns(
            list.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        ),
    }
}

fn parse_filters(specs: &[String]) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut cols = Vec::new();
    let mut values = Vec::new();
    for spec in specs {
        let Some((column, allowed)) = spec.split_once('=') else {
            bail!("filter {spec:?} is not COLUMN=V1,V2");
        };
        cols.push(column.trim().to_string());
        values.push(allowed.split(',').map(|v| v.trim().to_string()).collect());
    }
    Ok((cols, values))
}

fn write_csv(batch: &RowBatch, output: Option<&Path>) -> Result<()> {
    let mut writer: csv::Writer<Box<dyn std::io::Write>> = match output {
        Some(path) => csv::Writer::from_writer(Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("creating {}", path.display()))?,
        )),
        None => csv::Writer::from_writer(Box::new(std::io::stdout().lock())),
    };
    writer.write_record(batch.column_names())?;
    for row in 0..batch.num_rows() {
        let record: Vec<String> = (0..batch.num_columns())
            .map(|col| batch.value(col, row).render())
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
