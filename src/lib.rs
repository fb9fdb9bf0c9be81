//! Almanac: a compile-on-demand cache for revisioned market time series.
//!
//! The provider publishes history as coarse archive files that are
//! re-issued, revised, and schema-drifted over the years. This crate
//! turns an arbitrary query window into the set of covering chunks,
//! maintains a local columnar cache of them, and compiles the window
//! into a single reconciled batch.

pub mod batch;
pub mod cache;
pub mod catalog;
pub mod codec;
pub mod compile;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod layout;
pub mod matcher;
pub mod project;
pub mod reconcile;
pub mod timefmt;
pub mod window;

pub use batch::RowBatch;
pub use cache::{CacheFormat, CacheOptions, ChunkCache};
pub use catalog::{TableCatalog, TableDescriptor};
pub use compile::{ColumnSelect, CompileRequest, DynamicCompiler};
pub use error::{Error, Result};
pub use fetch::{Fetcher, HttpFetcher, MirrorFetcher};
pub use layout::CacheLayout;
