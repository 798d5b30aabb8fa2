//! Accession tier: FTS5 virtual table for accession-pattern lookup.
//!
//! Consulted by the search router for accession-shaped queries so the
//! inverted index never has to load for them. Rebuilt wholesale by the
//! index builder whenever accession columns change.

use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct AccessionHit {
    pub accession: String,
    pub doc_type: String,
    pub label: String,
    pub rank: f64,
}

/// Sources feeding the accession tier: every entity table contributes its
/// accession plus one human-readable label column.
const FTS_SOURCES: &[(&str, &str, &str)] = &[
    ("studies", "study", "COALESCE(title, '')"),
    ("experiments", "experiment", "COALESCE(title, '')"),
    ("samples", "sample", "COALESCE(scientific_name, title, '')"),
    ("runs", "run", "COALESCE(experiment_accession, '')"),
];

/// Drop and repopulate the accession tier. Returns indexed row count.
pub fn rebuild(conn: &Connection) -> crate::Result<u64> {
    let mut total = 0u64;
    for (table, _, _) in FTS_SOURCES {
        total += rebuild_tier(conn, table)?;
    }
    Ok(total)
}

/// Rebuild one entity table's slice of the accession tier.
pub fn rebuild_tier(conn: &Connection, table: &str) -> crate::Result<u64> {
    let Some((table, doc_type, label_expr)) = FTS_SOURCES.iter().find(|(t, _, _)| *t == table)
    else {
        return Err(crate::SrakeError::FieldNotAllowed(table.to_string()));
    };
    conn.execute(
        "DELETE FROM accession_fts WHERE doc_type = ?",
        params![doc_type],
    )?;
    let inserted = conn.execute(
        &format!(
            "INSERT INTO accession_fts (accession, doc_type, label)
             SELECT accession, '{doc_type}', {label_expr} FROM {table}"
        ),
        [],
    )?;
    Ok(inserted as u64)
}

pub fn count(conn: &Connection) -> crate::Result<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM accession_fts", [], |row| row.get(0))?;
    Ok(n as u64)
}

/// FTS match over the accession tier, best rank first.
pub fn search(conn: &Connection, query: &str, limit: usize) -> crate::Result<Vec<AccessionHit>> {
    let escaped = escape_fts5_query(query);
    let mut stmt = conn.prepare(
        "SELECT accession, doc_type, label, rank FROM accession_fts
         WHERE accession_fts MATCH ?
         ORDER BY rank LIMIT ?",
    )?;
    let hits = stmt
        .query_map(params![escaped, limit as i64], |row| {
            Ok(AccessionHit {
                accession: row.get(0)?,
                doc_type: row.get(1)?,
                label: row.get(2)?,
                rank: row.get(3)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(hits)
}

/// Exact accession lookup via the tier, used by `AccessionLookup` intent.
pub fn lookup_accession(conn: &Connection, accession: &str) -> crate::Result<Vec<AccessionHit>> {
    let mut stmt = conn.prepare(
        "SELECT accession, doc_type, label, 0.0 FROM accession_fts WHERE accession = ?",
    )?;
    let hits = stmt
        .query_map(params![accession], |row| {
            Ok(AccessionHit {
                accession: row.get(0)?,
                doc_type: row.get(1)?,
                label: row.get(2)?,
                rank: row.get(3)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(hits)
}

/// Escape FTS5 special characters by quoting the whole query.
fn escape_fts5_query(query: &str) -> String {
    if query.contains(['"', '(', ')', '-', '*', '<', '>', ':']) {
        format!("\"{}\"", query.replace('"', "\"\""))
    } else {
        query.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{SraRecord, Study};
    use crate::store::{insert_record, MetadataStore};
    use tempfile::TempDir;

    fn seeded_store() -> (TempDir, MetadataStore) {
        let dir = TempDir::new().unwrap();
        let mut store = MetadataStore::open(&dir.path().join("srake.db")).unwrap();
        store
            .tx(|tx| {
                for (accession, title) in [
                    ("SRP000001", "Human liver RNA-Seq"),
                    ("SRP000002", "Mouse brain ChIP-Seq"),
                ] {
                    insert_record(
                        tx,
                        &SraRecord::Study(Study {
                            accession: accession.into(),
                            title: Some(title.into()),
                            ..Default::default()
                        }),
                    )?;
                }
                Ok(())
            })
            .unwrap();
        (dir, store)
    }

    #[test]
    fn test_rebuild_and_lookup() {
        let (_dir, store) = seeded_store();
        let indexed = rebuild(&store.conn).unwrap();
        assert_eq!(indexed, 2);

        let hits = lookup_accession(&store.conn, "SRP000001").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_type, "study");
        assert_eq!(hits[0].label, "Human liver RNA-Seq");
    }

    #[test]
    fn test_match_on_label() {
        let (_dir, store) = seeded_store();
        rebuild(&store.conn).unwrap();
        let hits = search(&store.conn, "liver", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].accession, "SRP000001");
    }

    #[test]
    fn test_rebuild_replaces_previous_contents() {
        let (_dir, store) = seeded_store();
        rebuild(&store.conn).unwrap();
        rebuild(&store.conn).unwrap();
        assert_eq!(count(&store.conn).unwrap(), 2);
    }
}
