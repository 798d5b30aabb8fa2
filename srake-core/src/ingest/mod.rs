//! Resumable streaming ingestion: byte source → gzip → tar → XML →
//! batched store writes, with per-member progress rows and checkpoints.

pub mod archive;
pub mod batch;
pub mod controller;
pub mod extract;
pub mod fetch;
pub mod filter;
pub mod progress;
pub mod sources;

pub use batch::{BatchWriter, WriteCounts};
pub use controller::{IngestController, IngestOptions, IngestOutcome, ProgressUpdate};
pub use extract::ExtractCounts;
pub use filter::RecordFilter;

use crate::store::ingest_state::{self, FileRow};
use crate::store::{MetadataStore, SourceRow};
use serde::Serialize;

/// One source's progress as reported by `ingest --status`.
#[derive(Debug, Serialize)]
pub struct SourceStatus {
    #[serde(flatten)]
    pub source: SourceRow,
    pub bytes_done: u64,
    pub records_done: u64,
    pub files: Vec<FileRow>,
    pub last_checkpoint: Option<crate::store::Checkpoint>,
}

/// Snapshot of every known source, for `--status` and the service.
pub fn status(store: &MetadataStore) -> crate::Result<Vec<SourceStatus>> {
    let mut statuses = Vec::new();
    for source in ingest_state::list_sources(&store.conn)? {
        let (bytes_done, records_done) = ingest_state::source_totals(&store.conn, &source.source_id)?;
        let files = ingest_state::list_files(&store.conn, &source.source_id)?;
        let last_checkpoint = ingest_state::last_checkpoint(&store.conn, &source.source_id)?;
        statuses.push(SourceStatus {
            source,
            bytes_done,
            records_done,
            files,
            last_checkpoint,
        });
    }
    Ok(statuses)
}

/// `ingest --cleanup`: prune file/checkpoint rows of completed sources.
pub fn cleanup(store: &MetadataStore) -> crate::Result<usize> {
    ingest_state::cleanup_completed(&store.conn)
}
