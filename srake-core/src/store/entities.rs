//! Domain-table reads and writes.
//!
//! Inserts suppress conflicts on the accession key only: re-ingesting an
//! archive never duplicates rows, the first writer wins, and genuine
//! constraint violations still surface as errors.

use crate::record::{
    Analysis, AttributeBag, Experiment, Run, RunFile, Sample, SraRecord, Study, Submission,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TableCounts {
    pub studies: u64,
    pub experiments: u64,
    pub samples: u64,
    pub runs: u64,
    pub submissions: u64,
    pub analyses: u64,
}

/// A fetched entity, tagged for API serialization.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntityRow {
    Study(Study),
    Experiment(Experiment),
    Sample(Sample),
    Run(Run),
    Submission(Submission),
    Analysis(Analysis),
}

impl EntityRow {
    pub fn accession(&self) -> &str {
        match self {
            Self::Study(r) => &r.accession,
            Self::Experiment(r) => &r.accession,
            Self::Sample(r) => &r.accession,
            Self::Run(r) => &r.accession,
            Self::Submission(r) => &r.accession,
            Self::Analysis(r) => &r.accession,
        }
    }
}

fn metadata_json(
    metadata: &serde_json::Map<String, serde_json::Value>,
) -> Option<String> {
    if metadata.is_empty() {
        None
    } else {
        serde_json::to_string(metadata).ok()
    }
}

fn parse_metadata(raw: Option<String>) -> serde_json::Map<String, serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

/// Insert one record, keeping any existing row with the same accession.
/// Returns true when a row was actually written.
pub fn insert_record(tx: &Transaction<'_>, record: &SraRecord) -> crate::Result<bool> {
    let changed = match record {
        SraRecord::Study(study) => tx.execute(
            "INSERT INTO studies
                 (accession, title, abstract, study_type, center_name, submission_date,
                  attributes, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(accession) DO NOTHING",
            params![
                study.accession,
                study.title,
                study.abstract_text,
                study.study_type,
                study.center_name,
                study.submission_date,
                study.attributes.to_json(),
                metadata_json(&study.metadata),
            ],
        )?,
        SraRecord::Experiment(exp) => {
            let changed = tx.execute(
                "INSERT INTO experiments
                     (accession, study_accession, title, library_strategy, library_source,
                      library_selection, library_layout, platform, instrument_model, metadata)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(accession) DO NOTHING",
                params![
                    exp.accession,
                    exp.study_accession,
                    exp.title,
                    exp.library_strategy,
                    exp.library_source,
                    exp.library_selection,
                    exp.library_layout,
                    exp.platform,
                    exp.instrument_model,
                    metadata_json(&exp.metadata),
                ],
            )?;
            for sample in &exp.sample_accessions {
                tx.execute(
                    "INSERT OR IGNORE INTO experiment_samples
                         (experiment_accession, sample_accession)
                     VALUES (?, ?)",
                    params![exp.accession, sample],
                )?;
            }
            changed
        }
        SraRecord::Sample(sample) => tx.execute(
            "INSERT INTO samples
                 (accession, title, description, scientific_name, taxon_id, attributes, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(accession) DO NOTHING",
            params![
                sample.accession,
                sample.title,
                sample.description,
                sample.scientific_name,
                sample.taxon_id,
                sample.attributes.to_json(),
                metadata_json(&sample.metadata),
            ],
        )?,
        SraRecord::Run(run) => tx.execute(
            "INSERT INTO runs
                 (accession, experiment_accession, run_date, center, total_spots, total_bases,
                  files, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(accession) DO NOTHING",
            params![
                run.accession,
                run.experiment_accession,
                run.run_date,
                run.center,
                run.total_spots.map(|v| v as i64),
                run.total_bases.map(|v| v as i64),
                serde_json::to_string(&run.files)?,
                metadata_json(&run.metadata),
            ],
        )?,
        SraRecord::Submission(sub) => tx.execute(
            "INSERT INTO submissions
                 (accession, center_name, lab_name, submission_date, metadata)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(accession) DO NOTHING",
            params![
                sub.accession,
                sub.center_name,
                sub.lab_name,
                sub.submission_date,
                metadata_json(&sub.metadata),
            ],
        )?,
        SraRecord::Analysis(analysis) => tx.execute(
            "INSERT INTO analyses
                 (accession, title, analysis_type, study_accession, metadata)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(accession) DO NOTHING",
            params![
                analysis.accession,
                analysis.title,
                analysis.analysis_type,
                analysis.study_accession,
                metadata_json(&analysis.metadata),
            ],
        )?,
    };
    Ok(changed > 0)
}

pub fn counts(conn: &Connection) -> crate::Result<TableCounts> {
    let count = |table: &str| -> crate::Result<u64> {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        Ok(n as u64)
    };
    Ok(TableCounts {
        studies: count("studies")?,
        experiments: count("experiments")?,
        samples: count("samples")?,
        runs: count("runs")?,
        submissions: count("submissions")?,
        analyses: count("analyses")?,
    })
}

pub fn study_by_accession(conn: &Connection, accession: &str) -> crate::Result<Option<Study>> {
    conn.query_row(
        "SELECT accession, title, abstract, study_type, center_name, submission_date,
                attributes, metadata
         FROM studies WHERE accession = ?",
        params![accession],
        |row| {
            Ok(Study {
                accession: row.get(0)?,
                title: row.get(1)?,
                abstract_text: row.get(2)?,
                study_type: row.get(3)?,
                center_name: row.get(4)?,
                submission_date: row.get(5)?,
                attributes: AttributeBag::from_json(&row.get::<_, String>(6)?),
                metadata: parse_metadata(row.get(7)?),
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn experiment_by_accession(
    conn: &Connection,
    accession: &str,
) -> crate::Result<Option<Experiment>> {
    let experiment = conn
        .query_row(
            "SELECT accession, study_accession, title, library_strategy, library_source,
                    library_selection, library_layout, platform, instrument_model, metadata
             FROM experiments WHERE accession = ?",
            params![accession],
            |row| {
                Ok(Experiment {
                    accession: row.get(0)?,
                    study_accession: row.get(1)?,
                    title: row.get(2)?,
                    library_strategy: row.get(3)?,
                    library_source: row.get(4)?,
                    library_selection: row.get(5)?,
                    library_layout: row.get(6)?,
                    platform: row.get(7)?,
                    instrument_model: row.get(8)?,
                    sample_accessions: Vec::new(),
                    metadata: parse_metadata(row.get(9)?),
                })
            },
        )
        .optional()?;

    let Some(mut experiment) = experiment else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT sample_accession FROM experiment_samples
         WHERE experiment_accession = ? ORDER BY sample_accession",
    )?;
    experiment.sample_accessions = stmt
        .query_map(params![accession], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(Some(experiment))
}

pub fn sample_by_accession(conn: &Connection, accession: &str) -> crate::Result<Option<Sample>> {
    conn.query_row(
        "SELECT accession, title, description, scientific_name, taxon_id, attributes, metadata
         FROM samples WHERE accession = ?",
        params![accession],
        |row| {
            Ok(Sample {
                accession: row.get(0)?,
                title: row.get(1)?,
                description: row.get(2)?,
                scientific_name: row.get(3)?,
                taxon_id: row.get(4)?,
                attributes: AttributeBag::from_json(&row.get::<_, String>(5)?),
                metadata: parse_metadata(row.get(6)?),
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn run_by_accession(conn: &Connection, accession: &str) -> crate::Result<Option<Run>> {
    conn.query_row(
        "SELECT accession, experiment_accession, run_date, center, total_spots, total_bases,
                files, metadata
         FROM runs WHERE accession = ?",
        params![accession],
        |row| {
            let files: String = row.get(6)?;
            Ok(Run {
                accession: row.get(0)?,
                experiment_accession: row.get(1)?,
                run_date: row.get(2)?,
                center: row.get(3)?,
                total_spots: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
                total_bases: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
                files: serde_json::from_str::<Vec<RunFile>>(&files).unwrap_or_default(),
                metadata: parse_metadata(row.get(7)?),
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn submission_by_accession(
    conn: &Connection,
    accession: &str,
) -> crate::Result<Option<Submission>> {
    conn.query_row(
        "SELECT accession, center_name, lab_name, submission_date, metadata
         FROM submissions WHERE accession = ?",
        params![accession],
        |row| {
            Ok(Submission {
                accession: row.get(0)?,
                center_name: row.get(1)?,
                lab_name: row.get(2)?,
                submission_date: row.get(3)?,
                metadata: parse_metadata(row.get(4)?),
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn analysis_by_accession(
    conn: &Connection,
    accession: &str,
) -> crate::Result<Option<Analysis>> {
    conn.query_row(
        "SELECT accession, title, analysis_type, study_accession, metadata
         FROM analyses WHERE accession = ?",
        params![accession],
        |row| {
            Ok(Analysis {
                accession: row.get(0)?,
                title: row.get(1)?,
                analysis_type: row.get(2)?,
                study_accession: row.get(3)?,
                metadata: parse_metadata(row.get(4)?),
            })
        },
    )
    .optional()
    .map_err(Into::into)
}
