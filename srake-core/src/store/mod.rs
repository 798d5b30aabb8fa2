//! Embedded metadata store backed by SQLite.
//!
//! Single writer, many readers: writes go through [`MetadataStore::tx`] on
//! one connection; concurrent readers open their own read-only handles with
//! [`MetadataStore::open_read`] and never block each other under WAL.

pub mod entities;
pub mod fts;
pub mod ingest_state;
pub mod schema;

pub use entities::{insert_record, EntityRow, TableCounts};
pub use fts::AccessionHit;
pub use ingest_state::{
    Checkpoint, FileCursor, FileState, SourceRow, SourceState, CHECKPOINTS_RETAINED,
};

use crate::error::SrakeError;
use rusqlite::{Connection, OpenFlags, Transaction};
use schema::{SCHEMA, SCHEMA_VERSION};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// ~40 MB page cache, expressed in KiB per SQLite convention.
const CACHE_SIZE_KIB: i64 = -40960;
/// 256 MB memory map.
const MMAP_SIZE: i64 = 268_435_456;
/// How long a reader/writer waits on a locked database before giving up.
const BUSY_TIMEOUT_MS: u64 = 5000;

pub struct MetadataStore {
    pub(crate) conn: Connection,
    path: PathBuf,
}

impl MetadataStore {
    /// Open or create the store at `path`, running idempotent migrations.
    pub fn open(path: &Path) -> crate::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        Self::migrate(&conn)?;

        info!(path = %path.display(), "metadata store open");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open a read-only handle for concurrent queries.
    pub fn open_read(path: &Path) -> crate::Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    fn configure(conn: &Connection) -> crate::Result<()> {
        conn.execute_batch(&format!(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = {CACHE_SIZE_KIB};
            PRAGMA mmap_size = {MMAP_SIZE};
            PRAGMA foreign_keys = ON;
            "
        ))?;
        Ok(())
    }

    fn migrate(conn: &Connection) -> crate::Result<()> {
        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version > SCHEMA_VERSION {
            return Err(SrakeError::SchemaVersionMismatch {
                found: version,
                expected: SCHEMA_VERSION,
            });
        }

        debug!(found = version, expected = SCHEMA_VERSION, "running schema migrations");
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Direct access for callers layering their own parameterized SQL on
    /// the store.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a write transaction; commits on Ok, rolls back on Err
    /// or panic (via the transaction's drop guard).
    pub fn tx<T>(&mut self, f: impl FnOnce(&Transaction<'_>) -> crate::Result<T>) -> crate::Result<T> {
        let tx = self.conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Liveness probe: fails with `StoreUnavailable` once the busy timeout
    /// is exhausted on a locked database.
    pub fn ping(&self) -> crate::Result<()> {
        match self.conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Err(SrakeError::StoreUnavailable(self.path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Per-table row counts.
    pub fn counts(&self) -> crate::Result<TableCounts> {
        entities::counts(&self.conn)
    }

    /// Size of the database file in bytes.
    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn schema_version(&self) -> crate::Result<i32> {
        Ok(self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, MetadataStore) {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::open(&dir.path().join("srake.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_open_creates_schema() {
        let (_dir, store) = open_store();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
        let counts = store.counts().unwrap();
        assert_eq!(counts.studies, 0);
        assert_eq!(counts.runs, 0);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("srake.db");
        drop(MetadataStore::open(&path).unwrap());
        let store = MetadataStore::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_future_schema_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("srake.db");
        {
            let store = MetadataStore::open(&path).unwrap();
            store
                .conn
                .pragma_update(None, "user_version", SCHEMA_VERSION + 10)
                .unwrap();
        }
        match MetadataStore::open(&path) {
            Err(SrakeError::SchemaVersionMismatch { found, expected }) => {
                assert_eq!(found, SCHEMA_VERSION + 10);
                assert_eq!(expected, SCHEMA_VERSION);
            }
            other => panic!("expected schema mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_tx_rolls_back_on_error() {
        let (_dir, mut store) = open_store();
        let result: crate::Result<()> = store.tx(|tx| {
            tx.execute(
                "INSERT INTO studies (accession) VALUES (?)",
                ["SRP000001"],
            )?;
            Err(SrakeError::Cancelled)
        });
        assert!(result.is_err());
        assert_eq!(store.counts().unwrap().studies, 0);
    }

    #[test]
    fn test_ping_ok() {
        let (_dir, store) = open_store();
        store.ping().unwrap();
    }
}
