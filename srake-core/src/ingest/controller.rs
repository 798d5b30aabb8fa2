//! Resumable ingest controller.
//!
//! Owns the per-source state machine:
//!
//! ```text
//!   pending ──start──▶ running ──done──▶ completed
//!      │                  │
//!      │                  ├──pause/signal──▶ paused ──resume──▶ running
//!      │                  │
//!      └──error──▶ failed ──retry──▶ running
//! ```
//!
//! Remote archives are first staged into the download cache with ranged,
//! ETag-guarded resume; the decode pipeline then streams the staged (or
//! local) file through gzip → tar → XML → batched writes. Per-member file
//! rows make re-runs skip finished members; accession-keyed inserts make
//! reprocessing the one possibly half-done member harmless.

use crate::config::Config;
use crate::error::SrakeError;
use crate::ingest::archive::{is_xml_member, open_tar, CountingReader};
use crate::ingest::batch::{BatchWriter, WriteCounts};
use crate::ingest::extract::{extract_member, ExtractCounts};
use crate::ingest::fetch::{self, is_remote};
use crate::ingest::filter::RecordFilter;
use crate::ingest::progress::ProgressTracker;
use crate::paths;
use crate::store::ingest_state::{self, upsert_file};
use crate::store::{FileCursor, FileState, MetadataStore, SourceRow, SourceState};
use rand::Rng;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Download copy chunk; also the cancellation check granularity.
const DOWNLOAD_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Drop all prior progress for this source and start over.
    pub force: bool,
    /// Count records through the filters without writing anything.
    pub stats_only: bool,
    /// Override for the checkpoint record interval.
    pub checkpoint_records: Option<u64>,
}

/// Result of one `run` invocation.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub source_id: String,
    pub origin_uri: String,
    pub state: SourceState,
    pub counts: ExtractCounts,
    pub writes: WriteCounts,
    pub files_done: u64,
    pub files_skipped: u64,
    pub files_errored: u64,
    pub bytes_done: u64,
    /// True when the source was already completed and nothing ran.
    pub already_complete: bool,
}

/// Periodic progress callback payload.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub records_done: u64,
    pub bytes_per_second: Option<f64>,
    pub records_per_second: Option<f64>,
    pub eta: Option<Duration>,
    pub current_file: Option<String>,
}

pub struct IngestController {
    config: Config,
    filter: RecordFilter,
    cancel: Arc<AtomicBool>,
    client: reqwest::blocking::Client,
    progress_fn: Option<Box<dyn FnMut(&ProgressUpdate) + Send>>,
}

impl IngestController {
    pub fn new(config: Config, filter: RecordFilter) -> Self {
        Self {
            config,
            filter,
            cancel: Arc::new(AtomicBool::new(false)),
            client: reqwest::blocking::Client::new(),
            progress_fn: None,
        }
    }

    /// Shared flag observed at member and batch boundaries.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn on_progress(&mut self, f: impl FnMut(&ProgressUpdate) + Send + 'static) {
        self.progress_fn = Some(Box::new(f));
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Ingest one origin (URL or local path) into the store.
    pub fn run(
        &mut self,
        store: &mut MetadataStore,
        origin: &str,
        opts: &IngestOptions,
    ) -> crate::Result<IngestOutcome> {
        let source = match ingest_state::source_by_origin(&store.conn, origin)? {
            Some(source) => source,
            None => ingest_state::create_source(&store.conn, origin)?,
        };

        if source.state == SourceState::Completed && !opts.force {
            info!(origin, "source already completed, nothing to do");
            return Ok(IngestOutcome {
                source_id: source.source_id,
                origin_uri: source.origin_uri,
                state: SourceState::Completed,
                counts: ExtractCounts::default(),
                writes: WriteCounts::default(),
                files_done: 0,
                files_skipped: 0,
                files_errored: 0,
                bytes_done: 0,
                already_complete: true,
            });
        }

        if opts.force {
            info!(origin, "force requested, resetting ingest state");
            let source_id = source.source_id.clone();
            store.tx(|tx| ingest_state::reset_source(tx, &source_id))?;
        }

        let local_path = if is_remote(origin) {
            match self.stage_download(store, &source, origin)? {
                Some(path) => path,
                None => {
                    // cancelled mid-download
                    ingest_state::set_source_state(&store.conn, &source.source_id, SourceState::Paused)?;
                    return Ok(self.outcome(source, SourceState::Paused, Default::default(), Default::default(), 0, 0, 0, 0));
                }
            }
        } else {
            PathBuf::from(origin)
        };

        if !opts.stats_only {
            ingest_state::set_source_state(&store.conn, &source.source_id, SourceState::Running)?;
        }

        let result = self.pipeline(store, &source, &local_path, opts);

        match result {
            Ok(outcome) => {
                if !opts.stats_only {
                    ingest_state::set_source_state(&store.conn, &source.source_id, outcome.state)?;
                }
                Ok(outcome)
            }
            Err(err) => {
                if !opts.stats_only {
                    ingest_state::set_source_state(&store.conn, &source.source_id, SourceState::Failed)?;
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn outcome(
        &self,
        source: SourceRow,
        state: SourceState,
        counts: ExtractCounts,
        writes: WriteCounts,
        files_done: u64,
        files_skipped: u64,
        files_errored: u64,
        bytes_done: u64,
    ) -> IngestOutcome {
        IngestOutcome {
            source_id: source.source_id,
            origin_uri: source.origin_uri,
            state,
            counts,
            writes,
            files_done,
            files_skipped,
            files_errored,
            bytes_done,
            already_complete: false,
        }
    }

    /// Download a remote archive into the cache with resume; retries
    /// transient failures with jittered exponential backoff.
    ///
    /// Returns None when cancelled.
    fn stage_download(
        &mut self,
        store: &mut MetadataStore,
        source: &SourceRow,
        url: &str,
    ) -> crate::Result<Option<PathBuf>> {
        let cache_dir = paths::cache_home().join("downloads");
        std::fs::create_dir_all(&cache_dir)?;
        let filename = url.rsplit('/').next().unwrap_or("archive.tar.gz");
        let target = cache_dir.join(filename);

        let mut attempt = 0u32;
        loop {
            match self.download_once(store, source, url, &target) {
                Ok(done) => return Ok(done.then_some(target)),
                Err(err) if err.is_transient() && attempt < self.config.ingest.max_retries => {
                    let delay = backoff_delay(attempt);
                    warn!(url, attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient download failure, backing off");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One download attempt. Ok(false) means cancelled.
    fn download_once(
        &mut self,
        store: &mut MetadataStore,
        source: &SourceRow,
        url: &str,
        target: &Path,
    ) -> crate::Result<bool> {
        let existing = std::fs::metadata(target).map(|m| m.len()).unwrap_or(0);
        let mut stream = fetch::open_remote(
            &self.client,
            url,
            existing,
            source.etag.as_deref(),
        )?;

        if let Some(total) = stream.content_length {
            if stream.resumed_from == existing && existing == total {
                debug!(url, "download already complete");
                return Ok(true);
            }
        }

        ingest_state::set_source_entity(
            &store.conn,
            &source.source_id,
            stream.content_length,
            stream.etag.as_deref(),
        )?;

        let mut file = if stream.resumed_from > 0 {
            debug!(url, offset = stream.resumed_from, "resuming download");
            std::fs::OpenOptions::new().append(true).open(target)?
        } else {
            std::fs::File::create(target)?
        };

        let mut buf = [0u8; DOWNLOAD_CHUNK];
        loop {
            if self.cancelled() {
                file.flush()?;
                info!(url, "download cancelled, partial bytes kept for resume");
                return Ok(false);
            }
            let n = stream
                .read(&mut buf)
                .map_err(|e| SrakeError::NetworkTransient(e.to_string()))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
        }
        file.flush()?;
        Ok(true)
    }

    /// Decode pipeline over a staged or local archive file.
    fn pipeline(
        &mut self,
        store: &mut MetadataStore,
        source: &SourceRow,
        path: &Path,
        opts: &IngestOptions,
    ) -> crate::Result<IngestOutcome> {
        let stream = fetch::open_local(path)?;
        let bytes_total = stream.content_length;

        let checkpoint_records = opts
            .checkpoint_records
            .unwrap_or(self.config.ingest.checkpoint_records);
        let mut tracker = ProgressTracker::new(checkpoint_records, self.config.checkpoint_interval());
        tracker.bytes_total = bytes_total;
        if !opts.force {
            let (_prior_bytes, records) = ingest_state::source_totals(&store.conn, &source.source_id)?;
            if records > 0 {
                info!(origin = %source.origin_uri, records, "resuming source with prior progress");
            }
            // byte progress restarts with the re-read; record totals carry over
            tracker.resume_from(0, records);
        }

        // a file left in_progress by an unclean shutdown restarts from its
        // beginning; accession conflicts make the replay a no-op
        if let Some(stale) = ingest_state::in_progress_file(&store.conn, &source.source_id)? {
            debug!(member = %stale, "restarting file interrupted by previous run");
        }

        let counting = CountingReader::new(stream);
        let byte_counter = counting.counter();
        let mut archive = open_tar(counting);

        let mut writer = BatchWriter::new(
            self.config.ingest.batch_records,
            self.config.ingest.batch_bytes,
        );
        let mut counts = ExtractCounts::default();
        let mut files_done = 0u64;
        let mut files_skipped = 0u64;
        let mut files_errored = 0u64;
        let mut paused = false;

        let entries = archive.entries().map_err(|e| SrakeError::DecodeCorrupt {
            member: path.display().to_string(),
            message: e.to_string(),
        })?;

        for entry in entries {
            tracker.set_bytes_done(byte_counter.load(Ordering::Relaxed));
            self.emit_progress(&tracker);

            if self.cancelled() {
                paused = true;
                break;
            }

            let mut entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    // the tar stream itself is unreadable past this point
                    return Err(SrakeError::DecodeCorrupt {
                        member: path.display().to_string(),
                        message: err.to_string(),
                    });
                }
            };

            if !entry.header().entry_type().is_file() {
                continue;
            }
            let member_path = entry.path()?.to_string_lossy().into_owned();
            let member_size = entry.header().size().unwrap_or(0);

            if !is_xml_member(&member_path) {
                debug!(member = %member_path, "skipping non-XML member");
                if !opts.stats_only {
                    upsert_file(
                        &store.conn,
                        &FileCursor {
                            source_id: source.source_id.clone(),
                            member_path,
                            bytes_total: member_size,
                            bytes_done: 0,
                            records_done: 0,
                            state: FileState::Skipped,
                        },
                    )?;
                }
                continue;
            }

            if !opts.stats_only {
                if let Some(row) =
                    ingest_state::file_row(&store.conn, &source.source_id, &member_path)?
                {
                    if row.state == FileState::Done {
                        // fast-forward: never read the body, tar seeks past it
                        files_skipped += 1;
                        continue;
                    }
                }
                upsert_file(
                    &store.conn,
                    &FileCursor {
                        source_id: source.source_id.clone(),
                        member_path: member_path.clone(),
                        bytes_total: member_size,
                        bytes_done: 0,
                        records_done: 0,
                        state: FileState::InProgress,
                    },
                )?;
            }

            tracker.current_file = Some(member_path.clone());

            let member_result = self.consume_member(
                store,
                source,
                &member_path,
                member_size,
                &mut entry,
                &mut writer,
                &mut tracker,
                opts,
            );

            match member_result {
                Ok(member_counts) => {
                    counts.absorb(member_counts);
                    files_done += 1;
                }
                Err(SrakeError::Cancelled) => {
                    paused = true;
                    break;
                }
                Err(SrakeError::DecodeCorrupt { member, message }) => {
                    warn!(member = %member, message = %message, "corrupt member, marking errored");
                    files_errored += 1;
                    if !opts.stats_only {
                        upsert_file(
                            &store.conn,
                            &FileCursor {
                                source_id: source.source_id.clone(),
                                member_path: member_path.clone(),
                                bytes_total: member_size,
                                bytes_done: 0,
                                records_done: 0,
                                state: FileState::Error,
                            },
                        )?;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        tracker.set_bytes_done(byte_counter.load(Ordering::Relaxed));
        self.emit_progress(&tracker);

        if !opts.stats_only {
            let started = Instant::now();
            ingest_state::write_checkpoint(&store.conn, &tracker.snapshot(&source.source_id))?;
            tracker.note_checkpoint(started.elapsed());
        }

        let state = if paused {
            info!(origin = %source.origin_uri, "ingest paused at a clean boundary");
            SourceState::Paused
        } else {
            info!(
                origin = %source.origin_uri,
                inserted = writer.counts.inserted,
                accepted = counts.accepted,
                rejected = counts.rejected,
                warnings = counts.warnings,
                "ingest completed"
            );
            SourceState::Completed
        };

        Ok(self.outcome(
            source.clone(),
            state,
            counts,
            writer.counts,
            files_done,
            files_skipped,
            files_errored,
            tracker.bytes_done,
        ))
    }

    /// Extract one member and write its records, co-committing progress.
    #[allow(clippy::too_many_arguments)]
    fn consume_member(
        &mut self,
        store: &mut MetadataStore,
        source: &SourceRow,
        member_path: &str,
        member_size: u64,
        entry: impl Read,
        writer: &mut BatchWriter,
        tracker: &mut ProgressTracker,
        opts: &IngestOptions,
    ) -> crate::Result<ExtractCounts> {
        let mut file_records = 0u64;
        // tracker counters only advance as batches commit, so checkpoints
        // never overstate what source_totals() can recover
        let mut committed_records = 0u64;
        let cancel = Arc::clone(&self.cancel);

        let counts = {
            let filter = self.filter.clone();
            let reader = BufReader::new(entry);

            if opts.stats_only {
                extract_member(member_path, reader, &filter, |record| {
                    if cancel.load(Ordering::Relaxed) {
                        return Err(SrakeError::Cancelled);
                    }
                    file_records += 1;
                    tracker.add_records(1);
                    tracker.last_accession = Some(record.accession().to_string());
                    Ok(())
                })?
            } else {
                // the closure flushes full batches inline so cancellation
                // and checkpoints both land on batch boundaries
                let mut flush_error: Option<SrakeError> = None;
                let extract_result = extract_member(member_path, reader, &filter, |record| {
                    if cancel.load(Ordering::Relaxed) {
                        return Err(SrakeError::Cancelled);
                    }
                    file_records += 1;
                    tracker.last_accession = Some(record.accession().to_string());
                    writer.push(record);
                    if writer.is_full() {
                        let cursor = FileCursor {
                            source_id: source.source_id.clone(),
                            member_path: member_path.to_string(),
                            bytes_total: member_size,
                            bytes_done: 0,
                            records_done: file_records,
                            state: FileState::InProgress,
                        };
                        if let Err(err) = writer.flush(store, &cursor) {
                            flush_error = Some(err);
                            return Err(SrakeError::Cancelled);
                        }
                        tracker.add_records(file_records - committed_records);
                        committed_records = file_records;
                        if tracker.should_checkpoint() {
                            let started = Instant::now();
                            if let Err(err) = ingest_state::write_checkpoint(
                                &store.conn,
                                &tracker.snapshot(&source.source_id),
                            ) {
                                flush_error = Some(err);
                                return Err(SrakeError::Cancelled);
                            }
                            tracker.note_checkpoint(started.elapsed());
                        }
                    }
                    Ok(())
                });
                if let Some(err) = flush_error {
                    return Err(err);
                }
                extract_result?
            }
        };

        if !opts.stats_only {
            // final co-commit: remaining records + the done transition
            let cursor = FileCursor {
                source_id: source.source_id.clone(),
                member_path: member_path.to_string(),
                bytes_total: member_size,
                bytes_done: member_size,
                records_done: file_records,
                state: FileState::Done,
            };
            writer.flush(store, &cursor)?;
            tracker.add_records(file_records - committed_records);
        }

        Ok(counts)
    }

    fn emit_progress(&mut self, tracker: &ProgressTracker) {
        if let Some(f) = self.progress_fn.as_mut() {
            f(&ProgressUpdate {
                bytes_done: tracker.bytes_done,
                bytes_total: tracker.bytes_total,
                records_done: tracker.records_done,
                bytes_per_second: tracker.bytes_per_second(),
                records_per_second: tracker.records_per_second(),
                eta: tracker.eta(),
                current_file: tracker.current_file.clone(),
            });
        }
    }
}

/// Exponential backoff with ±20% jitter: 500 ms base, 30 s cap.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let capped = exp.min(BACKOFF_CAP.as_millis() as u64);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((capped as f64 * jitter) as u64)
}
