//! srake core - SRA metadata ingestion and tiered search
//!
//! This library ingests NCBI Sequence Read Archive metadata dumps
//! (gzip-compressed tar archives of XML) into an embedded SQLite store and
//! serves search and lookup over it: a lazy tantivy inverted index for
//! keyword queries, an FTS5 accession tier, and an optional vector tier.

pub mod config;
pub mod embed;
pub mod error;
pub mod export;
pub mod ingest;
pub mod lookup;
pub mod paths;
pub mod record;
pub mod search;
pub mod store;

pub use config::Config;
pub use error::{ErrorEnvelope, SrakeError};
pub use ingest::{IngestController, IngestOptions, IngestOutcome, RecordFilter};
pub use record::{accession_kind, is_accession, RecordKind, SraRecord};
pub use search::{
    classify, IndexBuilder, LazyIndex, SearchIntent, SearchMode, SearchOptions, SearchResult,
    SearchRouter,
};
pub use store::MetadataStore;

/// Result type alias for srake operations
pub type Result<T> = std::result::Result<T, SrakeError>;
