//! Index builder: rebuilds the search tiers from the store with its own
//! resumable, per-document-type progress.
//!
//! Document types run in order (studies → experiments → samples → runs)
//! with a join barrier between them: workers embed a batch in parallel,
//! the batch lands in the index, and only then does the builder state row
//! advance. A rebuild is always out-of-date relative to concurrent ingest;
//! it re-reads the store and converges on the next run.

use crate::embed::{embedding_text, Embedder};
use crate::error::SrakeError;
use crate::search::inverted::{IndexDoc, LazyIndex};
use crate::search::vector::VectorWriter;
use crate::store::{fts, MetadataStore};
use rayon::prelude::*;
use rusqlite::params;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Rows fetched from the store per batch.
const BUILD_BATCH: usize = 1000;
/// Tantivy commits happen every this many batches.
const COMMIT_EVERY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl BuildState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Idle,
        }
    }
}

/// Build phases in execution order.
const PHASES: &[&str] = &["studies", "experiments", "samples", "runs"];

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub studies: u64,
    pub experiments: u64,
    pub fts_rows: u64,
    pub vectors: u64,
    pub paused: bool,
    pub time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub store_docs: u64,
    pub index_docs: u64,
    pub fts_rows: u64,
    pub fts_expected: u64,
    pub consistent: bool,
}

pub struct IndexBuilder {
    embedder: Option<Arc<dyn Embedder>>,
    quantize: bool,
    cancel: Arc<AtomicBool>,
}

impl IndexBuilder {
    pub fn new(embedder: Option<Arc<dyn Embedder>>, quantize: bool) -> Self {
        Self {
            embedder,
            quantize,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Build or resume. With `resume` false everything is cleared first.
    pub fn build(
        &self,
        store: &mut MetadataStore,
        index: &LazyIndex,
        vector_path: &Path,
        resume: bool,
    ) -> crate::Result<BuildReport> {
        let started = Instant::now();
        let mut report = BuildReport::default();

        if !resume {
            info!("full rebuild: clearing inverted index and builder state");
            index.clear()?;
            for phase in PHASES {
                set_phase(store, phase, 0, BuildState::Idle)?;
            }
        }

        // Embeddings stream to a fresh companion file; a partially built
        // studies phase cannot append to it, so it restarts from zero.
        let mut vector_writer = if self.embedder.is_some() {
            let (_, state) = phase_status(store, "studies")?;
            if state != BuildState::Completed {
                set_phase(store, "studies", 0, BuildState::Idle)?;
                Some(VectorWriter::create(
                    vector_path,
                    self.embedder.as_ref().unwrap().dimensions(),
                    self.quantize,
                )?)
            } else {
                None
            }
        } else {
            None
        };

        for phase in PHASES {
            let (last_rowid, state) = phase_status(store, phase)?;
            if state == BuildState::Completed {
                debug!(phase, "phase already completed, skipping");
                continue;
            }
            set_phase(store, phase, last_rowid, BuildState::Running)?;

            let outcome = match *phase {
                "studies" => self.build_studies(store, index, last_rowid, &mut vector_writer, &mut report),
                "experiments" => self.build_experiments(store, index, last_rowid, &mut report),
                "samples" | "runs" => self.build_fts_tier(store, phase, &mut report),
                _ => unreachable!(),
            };

            match outcome {
                Ok(true) => set_phase(store, phase, 0, BuildState::Completed)?,
                Ok(false) => {
                    report.paused = true;
                    // last_rowid was advanced batch by batch
                    let (rowid, _) = phase_status(store, phase)?;
                    set_phase(store, phase, rowid, BuildState::Paused)?;
                    break;
                }
                Err(err) => {
                    let (rowid, _) = phase_status(store, phase)?;
                    set_phase(store, phase, rowid, BuildState::Failed)?;
                    return Err(err);
                }
            }
        }

        index.commit()?;
        if let Some(writer) = vector_writer {
            if report.paused {
                // partial vector files are unusable; drop so the next run
                // restarts the studies phase cleanly
                drop(writer);
                let _ = std::fs::remove_file(vector_path);
            } else {
                report.vectors = writer.finish()?;
            }
        }

        report.time_ms = started.elapsed().as_millis() as u64;
        info!(
            studies = report.studies,
            experiments = report.experiments,
            fts_rows = report.fts_rows,
            vectors = report.vectors,
            paused = report.paused,
            "index build finished"
        );
        Ok(report)
    }

    /// Returns Ok(true) on phase completion, Ok(false) when cancelled.
    fn build_studies(
        &self,
        store: &mut MetadataStore,
        index: &LazyIndex,
        mut last_rowid: i64,
        vector_writer: &mut Option<VectorWriter>,
        report: &mut BuildReport,
    ) -> crate::Result<bool> {
        let mut batches = 0usize;
        loop {
            if self.cancelled() {
                index.commit()?;
                return Ok(false);
            }

            let rows = fetch_study_rows(store, last_rowid, BUILD_BATCH)?;
            if rows.is_empty() {
                index.commit()?;
                return Ok(true);
            }
            last_rowid = rows.last().map(|r| r.0).unwrap_or(last_rowid);

            let docs: Vec<IndexDoc> = rows
                .iter()
                .map(|(_, doc)| doc.clone())
                .collect();

            // fan-out: embeddings are the expensive part; workers share
            // nothing but the embedder handle
            if let (Some(embedder), Some(writer)) = (self.embedder.as_ref(), vector_writer.as_mut()) {
                let texts: Vec<(String, String)> = docs
                    .iter()
                    .map(|d| {
                        (
                            d.accession.clone(),
                            embedding_text(
                                d.title.as_deref(),
                                d.abstract_text.as_deref(),
                                d.organism.as_deref(),
                            ),
                        )
                    })
                    .filter(|(_, text)| !text.is_empty())
                    .collect();

                let vectors: Vec<(String, crate::Result<Vec<f32>>)> = texts
                    .par_iter()
                    .map(|(accession, text)| (accession.clone(), embedder.embed(text)))
                    .collect();

                // join barrier: every worker is done before anything commits
                for (accession, vector) in vectors {
                    match vector {
                        Ok(vector) => writer.push(&accession, &vector)?,
                        Err(err) => {
                            warn!(accession = %accession, error = %err, "embedding failed, study left out of vector tier");
                        }
                    }
                }
            }

            index.index_batch(&docs)?;
            report.studies += docs.len() as u64;
            batches += 1;
            if batches % COMMIT_EVERY == 0 {
                index.commit()?;
            }
            set_phase(store, "studies", last_rowid, BuildState::Running)?;
        }
    }

    fn build_experiments(
        &self,
        store: &mut MetadataStore,
        index: &LazyIndex,
        mut last_rowid: i64,
        report: &mut BuildReport,
    ) -> crate::Result<bool> {
        let mut batches = 0usize;
        loop {
            if self.cancelled() {
                index.commit()?;
                return Ok(false);
            }

            let rows = fetch_experiment_rows(store, last_rowid, BUILD_BATCH)?;
            if rows.is_empty() {
                index.commit()?;
                return Ok(true);
            }
            last_rowid = rows.last().map(|r| r.0).unwrap_or(last_rowid);

            let docs: Vec<IndexDoc> = rows.into_iter().map(|(_, doc)| doc).collect();
            index.index_batch(&docs)?;
            report.experiments += docs.len() as u64;
            batches += 1;
            if batches % COMMIT_EVERY == 0 {
                index.commit()?;
            }
            set_phase(store, "experiments", last_rowid, BuildState::Running)?;
        }
    }

    fn build_fts_tier(
        &self,
        store: &mut MetadataStore,
        phase: &str,
        report: &mut BuildReport,
    ) -> crate::Result<bool> {
        if self.cancelled() {
            return Ok(false);
        }
        report.fts_rows += fts::rebuild_tier(&store.conn, phase)?;
        // the low-volume tiers piggyback on their owning phases
        if phase == "samples" {
            report.fts_rows += fts::rebuild_tier(&store.conn, "studies")?;
        } else {
            report.fts_rows += fts::rebuild_tier(&store.conn, "experiments")?;
        }
        Ok(true)
    }

    /// Cross-check index document counts against the store.
    pub fn verify(&self, store: &MetadataStore, index: &LazyIndex) -> crate::Result<VerifyReport> {
        let counts = store.counts()?;
        let store_docs = counts.studies + counts.experiments;
        let index_docs = index.doc_count()?;
        let fts_rows = fts::count(&store.conn)?;
        let fts_expected = counts.studies + counts.experiments + counts.samples + counts.runs;
        Ok(VerifyReport {
            store_docs,
            index_docs,
            fts_rows,
            fts_expected,
            consistent: store_docs == index_docs && fts_rows == fts_expected,
        })
    }
}

// ---------------------------------------------------------------------------
// Builder state rows
// ---------------------------------------------------------------------------

fn phase_status(store: &MetadataStore, phase: &str) -> crate::Result<(i64, BuildState)> {
    let row: Option<(i64, String)> = store
        .conn
        .query_row(
            "SELECT last_rowid, state FROM builder_state WHERE doc_type = ?",
            params![phase],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(match row {
        Some((rowid, state)) => (rowid, BuildState::parse(&state)),
        None => (0, BuildState::Idle),
    })
}

fn set_phase(
    store: &MetadataStore,
    phase: &str,
    last_rowid: i64,
    state: BuildState,
) -> crate::Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    store.conn.execute(
        "INSERT INTO builder_state (doc_type, last_rowid, state, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (doc_type) DO UPDATE SET
             last_rowid = excluded.last_rowid,
             state = excluded.state,
             updated_at = excluded.updated_at",
        params![phase, last_rowid, state.as_str(), now],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row readers
// ---------------------------------------------------------------------------

/// Study rows with organisms aggregated from their pooled samples.
fn fetch_study_rows(
    store: &MetadataStore,
    after_rowid: i64,
    limit: usize,
) -> crate::Result<Vec<(i64, IndexDoc)>> {
    let mut stmt = store.conn.prepare(
        "SELECT s.id, s.accession, s.title, s.abstract,
                (SELECT GROUP_CONCAT(DISTINCT sa.scientific_name)
                 FROM experiments e
                 JOIN experiment_samples es ON es.experiment_accession = e.accession
                 JOIN samples sa ON sa.accession = es.sample_accession
                 WHERE e.study_accession = s.accession
                   AND sa.scientific_name IS NOT NULL)
         FROM studies s WHERE s.id > ? ORDER BY s.id LIMIT ?",
    )?;
    let rows = stmt
        .query_map(params![after_rowid, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                IndexDoc {
                    accession: row.get(1)?,
                    doc_type: "study".into(),
                    title: row.get(2)?,
                    abstract_text: row.get(3)?,
                    organism: row.get::<_, Option<String>>(4)?.map(|o| o.replace(',', " ")),
                    ..Default::default()
                },
            ))
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

fn fetch_experiment_rows(
    store: &MetadataStore,
    after_rowid: i64,
    limit: usize,
) -> crate::Result<Vec<(i64, IndexDoc)>> {
    let mut stmt = store.conn.prepare(
        "SELECT e.id, e.accession, e.title, e.platform, e.library_strategy,
                (SELECT GROUP_CONCAT(DISTINCT sa.scientific_name)
                 FROM experiment_samples es
                 JOIN samples sa ON sa.accession = es.sample_accession
                 WHERE es.experiment_accession = e.accession
                   AND sa.scientific_name IS NOT NULL),
                (SELECT st.title FROM studies st WHERE st.accession = e.study_accession)
         FROM experiments e WHERE e.id > ? ORDER BY e.id LIMIT ?",
    )?;
    let rows = stmt
        .query_map(params![after_rowid, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                IndexDoc {
                    accession: row.get(1)?,
                    doc_type: "experiment".into(),
                    title: row.get(2)?,
                    platform: row.get(3)?,
                    library_strategy: row.get(4)?,
                    organism: row.get::<_, Option<String>>(5)?.map(|o| o.replace(',', " ")),
                    description: row.get(6)?,
                    ..Default::default()
                },
            ))
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Archive the index directory to `out` as tar.gz and return the content
/// hash, also written next to the archive as `<out>.sha256`.
pub fn snapshot(index_path: &Path, out: &Path) -> crate::Result<String> {
    let file = std::fs::File::create(out)?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", index_path)?;
    builder.into_inner()?.finish()?;

    let hash = hash_file(out)?;
    std::fs::write(sidecar_path(out), format!("{hash}\n"))?;
    info!(archive = %out.display(), hash = %hash, "index snapshot written");
    Ok(hash)
}

/// Recompute the archive hash against its sidecar.
pub fn verify_snapshot(archive: &Path) -> crate::Result<bool> {
    let recorded = std::fs::read_to_string(sidecar_path(archive))
        .map_err(|_| SrakeError::NotFound(format!("checksum for {}", archive.display())))?;
    let actual = hash_file(archive)?;
    Ok(recorded.trim() == actual)
}

fn sidecar_path(archive: &Path) -> std::path::PathBuf {
    let mut name = archive.file_name().unwrap_or_default().to_os_string();
    name.push(".sha256");
    archive.with_file_name(name)
}

fn hash_file(path: &Path) -> crate::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::testing::StubEmbedder;
    use crate::record::{Experiment, Sample, SraRecord, Study};
    use crate::search::vector::VectorIndex;
    use crate::store::insert_record;
    use std::time::Duration;
    use tempfile::TempDir;

    fn seeded_store(dir: &TempDir) -> MetadataStore {
        let mut store = MetadataStore::open(&dir.path().join("srake.db")).unwrap();
        store
            .tx(|tx| {
                insert_record(
                    tx,
                    &SraRecord::Study(Study {
                        accession: "SRP000001".into(),
                        title: Some("RNA-Seq of human liver".into()),
                        abstract_text: Some("Expression profiling".into()),
                        ..Default::default()
                    }),
                )?;
                insert_record(
                    tx,
                    &SraRecord::Study(Study {
                        accession: "SRP000002".into(),
                        title: Some("ChIP-Seq of mouse brain".into()),
                        ..Default::default()
                    }),
                )?;
                insert_record(
                    tx,
                    &SraRecord::Experiment(Experiment {
                        accession: "SRX000001".into(),
                        study_accession: Some("SRP000001".into()),
                        title: Some("HiSeq paired-end".into()),
                        platform: Some("ILLUMINA".into()),
                        library_strategy: Some("RNA-Seq".into()),
                        sample_accessions: vec!["SRS000001".into()],
                        ..Default::default()
                    }),
                )?;
                insert_record(
                    tx,
                    &SraRecord::Sample(Sample {
                        accession: "SRS000001".into(),
                        scientific_name: Some("Homo sapiens".into()),
                        ..Default::default()
                    }),
                )?;
                Ok(())
            })
            .unwrap();
        store
    }

    #[test]
    fn test_full_build_populates_all_tiers() {
        let dir = TempDir::new().unwrap();
        let mut store = seeded_store(&dir);
        let index = LazyIndex::new(&dir.path().join("srake.bleve"), Duration::from_secs(300));
        let vector_path = dir.path().join("srake.embeddings");

        let builder = IndexBuilder::new(
            Some(Arc::new(StubEmbedder { dimensions: 16 })),
            false,
        );
        let report = builder.build(&mut store, &index, &vector_path, false).unwrap();

        assert_eq!(report.studies, 2);
        assert_eq!(report.experiments, 1);
        assert_eq!(report.vectors, 2);
        assert!(!report.paused);
        assert_eq!(index.doc_count().unwrap(), 3);

        let vectors = VectorIndex::open(&vector_path).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.vector_for("SRP000001").is_some());

        let verify = builder.verify(&store, &index).unwrap();
        assert!(verify.consistent, "{verify:?}");
    }

    #[test]
    fn test_study_organism_aggregated_from_samples() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let rows = fetch_study_rows(&store, 0, 10).unwrap();
        let study = rows.iter().find(|(_, d)| d.accession == "SRP000001").unwrap();
        assert_eq!(study.1.organism.as_deref(), Some("Homo sapiens"));
    }

    #[test]
    fn test_resume_skips_completed_phases() {
        let dir = TempDir::new().unwrap();
        let mut store = seeded_store(&dir);
        let index = LazyIndex::new(&dir.path().join("srake.bleve"), Duration::from_secs(300));
        let vector_path = dir.path().join("srake.embeddings");

        let builder = IndexBuilder::new(None, false);
        builder.build(&mut store, &index, &vector_path, false).unwrap();
        let first_docs = index.doc_count().unwrap();

        // resuming a completed build indexes nothing new
        let report = builder.build(&mut store, &index, &vector_path, true).unwrap();
        assert_eq!(report.studies, 0);
        assert_eq!(report.experiments, 0);
        assert_eq!(index.doc_count().unwrap(), first_docs);
    }

    #[test]
    fn test_cancel_leaves_paused_state() {
        let dir = TempDir::new().unwrap();
        let mut store = seeded_store(&dir);
        let index = LazyIndex::new(&dir.path().join("srake.bleve"), Duration::from_secs(300));
        let vector_path = dir.path().join("srake.embeddings");

        let builder = IndexBuilder::new(None, false);
        builder.cancel_flag().store(true, Ordering::Relaxed);
        let report = builder.build(&mut store, &index, &vector_path, false).unwrap();
        assert!(report.paused);

        let (_, state) = phase_status(&store, "studies").unwrap();
        assert_eq!(state, BuildState::Paused);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let index_dir = dir.path().join("srake.bleve");
        std::fs::create_dir_all(&index_dir).unwrap();
        std::fs::write(index_dir.join("meta.json"), b"{}").unwrap();

        let archive = dir.path().join("snapshot.tar.gz");
        let hash = snapshot(&index_dir, &archive).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(verify_snapshot(&archive).unwrap());

        // tamper and verify failure
        std::fs::write(&archive, b"garbage").unwrap();
        assert!(!verify_snapshot(&archive).unwrap());
    }
}
