//! Accession-keyed entity retrieval and whitelisted aggregations.

use crate::error::SrakeError;
use crate::record::{accession_kind, RecordKind};
use crate::search::FacetValue;
use crate::store::{entities, EntityRow, MetadataStore};
use rusqlite::params;

/// Aggregation whitelist: field name → (table, column). Anything else is
/// rejected before touching SQL.
const AGGREGATE_FIELDS: &[(&str, &str, &str)] = &[
    ("organism", "samples", "scientific_name"),
    ("library_strategy", "experiments", "library_strategy"),
    ("platform", "experiments", "platform"),
];

pub fn aggregate_fields() -> impl Iterator<Item = &'static str> {
    AGGREGATE_FIELDS.iter().map(|(name, _, _)| *name)
}

/// Fetch the entity a canonical accession names. Submissions and analyses
/// are not tier-addressable and are tried as a fallback.
pub fn get(store: &MetadataStore, accession: &str) -> crate::Result<Option<EntityRow>> {
    let conn = &store.conn;
    match accession_kind(accession) {
        Some(RecordKind::Study) => Ok(entities::study_by_accession(conn, accession)?.map(EntityRow::Study)),
        Some(RecordKind::Experiment) => {
            Ok(entities::experiment_by_accession(conn, accession)?.map(EntityRow::Experiment))
        }
        Some(RecordKind::Sample) => Ok(entities::sample_by_accession(conn, accession)?.map(EntityRow::Sample)),
        Some(RecordKind::Run) => Ok(entities::run_by_accession(conn, accession)?.map(EntityRow::Run)),
        Some(_) | None => {
            if let Some(submission) = entities::submission_by_accession(conn, accession)? {
                return Ok(Some(EntityRow::Submission(submission)));
            }
            if let Some(analysis) = entities::analysis_by_accession(conn, accession)? {
                return Ok(Some(EntityRow::Analysis(analysis)));
            }
            Ok(None)
        }
    }
}

/// Fetch an entity of a specific tier, for the typed HTTP routes.
pub fn get_typed(
    store: &MetadataStore,
    kind: RecordKind,
    accession: &str,
) -> crate::Result<Option<EntityRow>> {
    let conn = &store.conn;
    Ok(match kind {
        RecordKind::Study => entities::study_by_accession(conn, accession)?.map(EntityRow::Study),
        RecordKind::Experiment => {
            entities::experiment_by_accession(conn, accession)?.map(EntityRow::Experiment)
        }
        RecordKind::Sample => entities::sample_by_accession(conn, accession)?.map(EntityRow::Sample),
        RecordKind::Run => entities::run_by_accession(conn, accession)?.map(EntityRow::Run),
        RecordKind::Submission => {
            entities::submission_by_accession(conn, accession)?.map(EntityRow::Submission)
        }
        RecordKind::Analysis => {
            entities::analysis_by_accession(conn, accession)?.map(EntityRow::Analysis)
        }
    })
}

/// Top-K value counts for a whitelisted field.
pub fn aggregate(store: &MetadataStore, field: &str, top_k: usize) -> crate::Result<Vec<FacetValue>> {
    let Some((_, table, column)) = AGGREGATE_FIELDS.iter().find(|(name, _, _)| *name == field)
    else {
        return Err(SrakeError::FieldNotAllowed(field.to_string()));
    };

    let mut stmt = store.conn.prepare(&format!(
        "SELECT {column}, COUNT(*) AS n FROM {table}
         WHERE {column} IS NOT NULL
         GROUP BY {column} ORDER BY n DESC, {column} LIMIT ?"
    ))?;
    let values = stmt
        .query_map(params![top_k as i64], |row| {
            Ok(FacetValue {
                value: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Experiment, Sample, SraRecord, Study};
    use crate::store::insert_record;
    use tempfile::TempDir;

    fn seeded() -> (TempDir, MetadataStore) {
        let dir = TempDir::new().unwrap();
        let mut store = MetadataStore::open(&dir.path().join("srake.db")).unwrap();
        store
            .tx(|tx| {
                insert_record(
                    tx,
                    &SraRecord::Study(Study {
                        accession: "SRP000001".into(),
                        title: Some("liver study".into()),
                        ..Default::default()
                    }),
                )?;
                for (acc, organism) in [
                    ("SRS000001", "Homo sapiens"),
                    ("SRS000002", "Homo sapiens"),
                    ("SRS000003", "Mus musculus"),
                ] {
                    insert_record(
                        tx,
                        &SraRecord::Sample(Sample {
                            accession: acc.into(),
                            scientific_name: Some(organism.into()),
                            ..Default::default()
                        }),
                    )?;
                }
                insert_record(
                    tx,
                    &SraRecord::Experiment(Experiment {
                        accession: "SRX000001".into(),
                        platform: Some("ILLUMINA".into()),
                        library_strategy: Some("RNA-Seq".into()),
                        ..Default::default()
                    }),
                )?;
                Ok(())
            })
            .unwrap();
        (dir, store)
    }

    #[test]
    fn test_get_routes_by_tier() {
        let (_dir, store) = seeded();
        let entity = get(&store, "SRP000001").unwrap().unwrap();
        assert!(matches!(entity, EntityRow::Study(_)));
        assert_eq!(entity.accession(), "SRP000001");

        let entity = get(&store, "SRS000003").unwrap().unwrap();
        assert!(matches!(entity, EntityRow::Sample(_)));

        assert!(get(&store, "SRR999999").unwrap().is_none());
    }

    #[test]
    fn test_aggregate_organism_top_k() {
        let (_dir, store) = seeded();
        let values = aggregate(&store, "organism", 10).unwrap();
        assert_eq!(values[0].value, "Homo sapiens");
        assert_eq!(values[0].count, 2);
        assert_eq!(values[1].value, "Mus musculus");

        let top1 = aggregate(&store, "organism", 1).unwrap();
        assert_eq!(top1.len(), 1);
    }

    #[test]
    fn test_aggregate_rejects_unlisted_field() {
        let (_dir, store) = seeded();
        match aggregate(&store, "accession; DROP TABLE studies", 5) {
            Err(SrakeError::FieldNotAllowed(_)) => {}
            other => panic!("expected whitelist rejection, got {:?}", other.map(|v| v.len())),
        }
    }
}
