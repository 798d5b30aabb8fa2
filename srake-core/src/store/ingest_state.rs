//! Ingest progress state: sources, per-member file rows, checkpoints.
//!
//! The resumable controller is the only writer of these tables. The file
//! row update and the domain-row batch it accounts for always commit in the
//! same transaction (see the batch writer), which is the sole guarantee
//! against double-counting after a crash.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Checkpoints kept per source; older rows are pruned on write.
pub const CHECKPOINTS_RETAINED: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl SourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    InProgress,
    Done,
    Skipped,
    Error,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_progress" => Self::InProgress,
            "done" => Self::Done,
            "skipped" => Self::Skipped,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRow {
    pub source_id: String,
    pub origin_uri: String,
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    pub state: SourceState,
    pub started_at: i64,
    pub last_active_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileRow {
    pub member_path: String,
    pub bytes_total: u64,
    pub bytes_done: u64,
    pub records_done: u64,
    pub state: FileState,
}

/// Progress delta for one member, co-committed with its domain rows.
#[derive(Debug, Clone)]
pub struct FileCursor {
    pub source_id: String,
    pub member_path: String,
    pub bytes_total: u64,
    pub bytes_done: u64,
    pub records_done: u64,
    pub state: FileState,
}

#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    pub source_id: String,
    pub created_at: i64,
    pub bytes_done: u64,
    pub records_done: u64,
    pub last_file: Option<String>,
    pub last_accession: Option<String>,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn source_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SourceRow> {
    Ok(SourceRow {
        source_id: row.get(0)?,
        origin_uri: row.get(1)?,
        content_length: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
        etag: row.get(3)?,
        state: SourceState::parse(&row.get::<_, String>(4)?),
        started_at: row.get(5)?,
        last_active_at: row.get(6)?,
    })
}

const SOURCE_SELECT: &str =
    "SELECT source_id, origin_uri, content_length, etag, state, started_at, last_active_at
     FROM sources";

pub fn source_by_origin(conn: &Connection, origin_uri: &str) -> crate::Result<Option<SourceRow>> {
    conn.query_row(
        &format!("{SOURCE_SELECT} WHERE origin_uri = ?"),
        params![origin_uri],
        source_from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn list_sources(conn: &Connection) -> crate::Result<Vec<SourceRow>> {
    let mut stmt = conn.prepare(&format!("{SOURCE_SELECT} ORDER BY started_at"))?;
    let rows = stmt
        .query_map([], source_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Create a pending source for a new origin.
pub fn create_source(conn: &Connection, origin_uri: &str) -> crate::Result<SourceRow> {
    let now = now_secs();
    let source = SourceRow {
        source_id: Uuid::new_v4().to_string(),
        origin_uri: origin_uri.to_string(),
        content_length: None,
        etag: None,
        state: SourceState::Pending,
        started_at: now,
        last_active_at: now,
    };
    conn.execute(
        "INSERT INTO sources (source_id, origin_uri, state, started_at, last_active_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
            source.source_id,
            source.origin_uri,
            source.state.as_str(),
            source.started_at,
            source.last_active_at,
        ],
    )?;
    Ok(source)
}

pub fn set_source_state(conn: &Connection, source_id: &str, state: SourceState) -> crate::Result<()> {
    conn.execute(
        "UPDATE sources SET state = ?, last_active_at = ? WHERE source_id = ?",
        params![state.as_str(), now_secs(), source_id],
    )?;
    Ok(())
}

/// Record the origin's Content-Length and ETag observed at open time.
pub fn set_source_entity(
    conn: &Connection,
    source_id: &str,
    content_length: Option<u64>,
    etag: Option<&str>,
) -> crate::Result<()> {
    conn.execute(
        "UPDATE sources SET content_length = ?, etag = ?, last_active_at = ?
         WHERE source_id = ?",
        params![content_length.map(|v| v as i64), etag, now_secs(), source_id],
    )?;
    Ok(())
}

/// `--force`: drop all per-file and checkpoint state, keep the source row.
pub fn reset_source(tx: &Transaction<'_>, source_id: &str) -> crate::Result<()> {
    tx.execute("DELETE FROM source_files WHERE source_id = ?", params![source_id])?;
    tx.execute("DELETE FROM checkpoints WHERE source_id = ?", params![source_id])?;
    tx.execute(
        "UPDATE sources SET state = 'pending', content_length = NULL, etag = NULL,
                last_active_at = ? WHERE source_id = ?",
        params![now_secs(), source_id],
    )?;
    Ok(())
}

pub fn file_row(
    conn: &Connection,
    source_id: &str,
    member_path: &str,
) -> crate::Result<Option<FileRow>> {
    conn.query_row(
        "SELECT member_path, bytes_total, bytes_done, records_done, state
         FROM source_files WHERE source_id = ? AND member_path = ?",
        params![source_id, member_path],
        |row| {
            Ok(FileRow {
                member_path: row.get(0)?,
                bytes_total: row.get::<_, i64>(1)? as u64,
                bytes_done: row.get::<_, i64>(2)? as u64,
                records_done: row.get::<_, i64>(3)? as u64,
                state: FileState::parse(&row.get::<_, String>(4)?),
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn list_files(conn: &Connection, source_id: &str) -> crate::Result<Vec<FileRow>> {
    let mut stmt = conn.prepare(
        "SELECT member_path, bytes_total, bytes_done, records_done, state
         FROM source_files WHERE source_id = ? ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map(params![source_id], |row| {
            Ok(FileRow {
                member_path: row.get(0)?,
                bytes_total: row.get::<_, i64>(1)? as u64,
                bytes_done: row.get::<_, i64>(2)? as u64,
                records_done: row.get::<_, i64>(3)? as u64,
                state: FileState::parse(&row.get::<_, String>(4)?),
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Upsert one file's progress. Callable both standalone (state transitions)
/// and inside a batch transaction (the co-commit path).
pub fn upsert_file(conn: &Connection, cursor: &FileCursor) -> crate::Result<()> {
    conn.execute(
        "INSERT INTO source_files
             (source_id, member_path, bytes_total, bytes_done, records_done, state)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT (source_id, member_path) DO UPDATE SET
             bytes_total = excluded.bytes_total,
             bytes_done = excluded.bytes_done,
             records_done = excluded.records_done,
             state = excluded.state",
        params![
            cursor.source_id,
            cursor.member_path,
            cursor.bytes_total as i64,
            cursor.bytes_done as i64,
            cursor.records_done as i64,
            cursor.state.as_str(),
        ],
    )?;
    Ok(())
}

/// The at-most-one file left `in_progress` by an unclean shutdown.
pub fn in_progress_file(conn: &Connection, source_id: &str) -> crate::Result<Option<String>> {
    conn.query_row(
        "SELECT member_path FROM source_files
         WHERE source_id = ? AND state = 'in_progress' LIMIT 1",
        params![source_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

/// Summed progress across file rows, used for resume offsets and `--status`.
pub fn source_totals(conn: &Connection, source_id: &str) -> crate::Result<(u64, u64)> {
    let (bytes, records): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(bytes_done), 0), COALESCE(SUM(records_done), 0)
         FROM source_files WHERE source_id = ?",
        params![source_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((bytes as u64, records as u64))
}

/// Append a checkpoint and prune beyond the retention window.
pub fn write_checkpoint(conn: &Connection, checkpoint: &Checkpoint) -> crate::Result<()> {
    conn.execute(
        "INSERT INTO checkpoints
             (source_id, created_at, bytes_done, records_done, last_file, last_accession)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            checkpoint.source_id,
            checkpoint.created_at,
            checkpoint.bytes_done as i64,
            checkpoint.records_done as i64,
            checkpoint.last_file,
            checkpoint.last_accession,
        ],
    )?;
    conn.execute(
        "DELETE FROM checkpoints WHERE source_id = ?1 AND id NOT IN
             (SELECT id FROM checkpoints WHERE source_id = ?1
              ORDER BY id DESC LIMIT ?2)",
        params![checkpoint.source_id, CHECKPOINTS_RETAINED as i64],
    )?;
    Ok(())
}

pub fn last_checkpoint(conn: &Connection, source_id: &str) -> crate::Result<Option<Checkpoint>> {
    conn.query_row(
        "SELECT source_id, created_at, bytes_done, records_done, last_file, last_accession
         FROM checkpoints WHERE source_id = ? ORDER BY id DESC LIMIT 1",
        params![source_id],
        |row| {
            Ok(Checkpoint {
                source_id: row.get(0)?,
                created_at: row.get(1)?,
                bytes_done: row.get::<_, i64>(2)? as u64,
                records_done: row.get::<_, i64>(3)? as u64,
                last_file: row.get(4)?,
                last_accession: row.get(5)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn checkpoint_count(conn: &Connection, source_id: &str) -> crate::Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM checkpoints WHERE source_id = ?",
        params![source_id],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

/// `--cleanup`: drop file and checkpoint rows of completed sources.
pub fn cleanup_completed(conn: &Connection) -> crate::Result<usize> {
    let removed = conn.execute(
        "DELETE FROM source_files WHERE source_id IN
             (SELECT source_id FROM sources WHERE state = 'completed')",
        [],
    )?;
    conn.execute(
        "DELETE FROM checkpoints WHERE source_id IN
             (SELECT source_id FROM sources WHERE state = 'completed')",
        [],
    )?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetadataStore;
    use tempfile::TempDir;

    fn store() -> (TempDir, MetadataStore) {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::open(&dir.path().join("srake.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_source_lifecycle() {
        let (_dir, store) = store();
        let source = create_source(&store.conn, "file:///tmp/mirror.tar.gz").unwrap();
        assert_eq!(source.state, SourceState::Pending);

        set_source_state(&store.conn, &source.source_id, SourceState::Running).unwrap();
        let fetched = source_by_origin(&store.conn, "file:///tmp/mirror.tar.gz")
            .unwrap()
            .unwrap();
        assert_eq!(fetched.state, SourceState::Running);
        assert_eq!(fetched.source_id, source.source_id);
    }

    #[test]
    fn test_file_upsert_is_monotonic_friendly() {
        let (_dir, store) = store();
        let source = create_source(&store.conn, "x").unwrap();
        let mut cursor = FileCursor {
            source_id: source.source_id.clone(),
            member_path: "batch/study.xml".into(),
            bytes_total: 1000,
            bytes_done: 100,
            records_done: 5,
            state: FileState::InProgress,
        };
        upsert_file(&store.conn, &cursor).unwrap();
        cursor.bytes_done = 1000;
        cursor.records_done = 40;
        cursor.state = FileState::Done;
        upsert_file(&store.conn, &cursor).unwrap();

        let row = file_row(&store.conn, &source.source_id, "batch/study.xml")
            .unwrap()
            .unwrap();
        assert_eq!(row.records_done, 40);
        assert_eq!(row.state, FileState::Done);
        assert_eq!(
            source_totals(&store.conn, &source.source_id).unwrap(),
            (1000, 40)
        );
    }

    #[test]
    fn test_checkpoint_pruning() {
        let (_dir, store) = store();
        let source = create_source(&store.conn, "x").unwrap();
        for i in 0..(CHECKPOINTS_RETAINED as u64 + 5) {
            write_checkpoint(
                &store.conn,
                &Checkpoint {
                    source_id: source.source_id.clone(),
                    created_at: i as i64,
                    bytes_done: i * 10,
                    records_done: i,
                    last_file: None,
                    last_accession: None,
                },
            )
            .unwrap();
        }
        assert_eq!(
            checkpoint_count(&store.conn, &source.source_id).unwrap(),
            CHECKPOINTS_RETAINED as u64
        );
        let last = last_checkpoint(&store.conn, &source.source_id)
            .unwrap()
            .unwrap();
        assert_eq!(last.records_done, CHECKPOINTS_RETAINED as u64 + 4);
    }

    #[test]
    fn test_reset_source_clears_progress() {
        let (_dir, mut store) = store();
        let source = create_source(&store.conn, "x").unwrap();
        upsert_file(
            &store.conn,
            &FileCursor {
                source_id: source.source_id.clone(),
                member_path: "a.xml".into(),
                bytes_total: 10,
                bytes_done: 10,
                records_done: 1,
                state: FileState::Done,
            },
        )
        .unwrap();
        let source_id = source.source_id.clone();
        store.tx(|tx| reset_source(tx, &source_id)).unwrap();
        assert!(file_row(&store.conn, &source.source_id, "a.xml")
            .unwrap()
            .is_none());
        let fetched = source_by_origin(&store.conn, "x").unwrap().unwrap();
        assert_eq!(fetched.state, SourceState::Pending);
    }

    #[test]
    fn test_in_progress_discovery() {
        let (_dir, store) = store();
        let source = create_source(&store.conn, "x").unwrap();
        assert!(in_progress_file(&store.conn, &source.source_id)
            .unwrap()
            .is_none());
        upsert_file(
            &store.conn,
            &FileCursor {
                source_id: source.source_id.clone(),
                member_path: "b.xml".into(),
                bytes_total: 10,
                bytes_done: 3,
                records_done: 0,
                state: FileState::InProgress,
            },
        )
        .unwrap();
        assert_eq!(
            in_progress_file(&store.conn, &source.source_id).unwrap(),
            Some("b.xml".to_string())
        );
    }
}
