//! Concurrent scraper for OPA property records.
//!
//! Identifiers are split into spans, each handled by a fetcher/persister
//! thread pair. Raw responses land in `<id>.json` files and are flattened by
//! a single transformer into `opa.csv` and `opa-val.csv`.

pub mod config;
pub mod fetch;
pub mod input;
pub mod model;
pub mod persist;
pub mod pipeline;
pub mod tables;
pub mod transform;

pub use config::{FieldSchema, PipelineConfig};
pub use fetch::{FetchError, HttpSource, ResourceSource};
pub use input::load_identifiers;
pub use model::{FetchResult, FlatRow, Identifier, RawResource, SpanDone};
pub use pipeline::{partition, CancellationToken, Pipeline, RunSummary};
pub use tables::{CsvTables, TableSink};
pub use transform::{decode_date, render_cell, RecordFlattener, TransformStats};
