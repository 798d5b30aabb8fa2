//! Transactional batch writes with progress co-commit.
//!
//! Records accumulate until the count or byte cap is hit; a flush writes
//! the whole batch plus the owning file's progress delta in one
//! transaction. Domain rows and ingest accounting are therefore never
//! visible out of step, which is what makes crash recovery double-count
//! free.

use crate::record::SraRecord;
use crate::store::ingest_state::upsert_file;
use crate::store::{insert_record, FileCursor, MetadataStore};
use tracing::warn;

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteCounts {
    pub inserted: u64,
    /// Accession already present; row kept as-is.
    pub ignored: u64,
    /// Rows dropped after a constraint failure inside a batch.
    pub failed: u64,
}

impl WriteCounts {
    pub fn absorb(&mut self, other: WriteCounts) {
        self.inserted += other.inserted;
        self.ignored += other.ignored;
        self.failed += other.failed;
    }
}

/// Buffers records between flushes. The store is borrowed per flush so the
/// controller can interleave checkpoint writes on the same connection.
pub struct BatchWriter {
    pending: Vec<SraRecord>,
    pending_bytes: usize,
    max_records: usize,
    max_bytes: usize,
    pub counts: WriteCounts,
}

impl BatchWriter {
    pub fn new(max_records: usize, max_bytes: usize) -> Self {
        Self {
            pending: Vec::with_capacity(max_records.min(4096)),
            pending_bytes: 0,
            max_records,
            max_bytes,
            counts: WriteCounts::default(),
        }
    }

    pub fn push(&mut self, record: SraRecord) {
        self.pending_bytes += record.approx_bytes();
        self.pending.push(record);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Count cap is hard; the byte cap is soft and only checked between
    /// records.
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_records || self.pending_bytes >= self.max_bytes
    }

    /// Commit everything pending together with `cursor`'s file delta.
    ///
    /// On a row error the transaction is rolled back and the batch is
    /// salvaged record by record: failing accessions are logged and
    /// skipped, everything else lands, and the cursor still commits last.
    pub fn flush(&mut self, store: &mut MetadataStore, cursor: &FileCursor) -> crate::Result<()> {
        if self.pending.is_empty() {
            // Still co-commit state transitions (e.g. marking a file done
            // whose records were all filtered out).
            return store.tx(|tx| upsert_file(tx, cursor));
        }

        let pending = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;

        let attempt = store.tx(|tx| {
            let mut batch = WriteCounts::default();
            for record in &pending {
                if insert_record(tx, record)? {
                    batch.inserted += 1;
                } else {
                    batch.ignored += 1;
                }
            }
            upsert_file(tx, cursor)?;
            Ok(batch)
        });

        match attempt {
            Ok(batch) => {
                self.counts.absorb(batch);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, records = pending.len(), "batch failed, salvaging record by record");
                self.salvage(store, &pending, cursor)
            }
        }
    }

    fn salvage(
        &mut self,
        store: &mut MetadataStore,
        records: &[SraRecord],
        cursor: &FileCursor,
    ) -> crate::Result<()> {
        for record in records {
            let outcome = store.tx(|tx| insert_record(tx, record));
            match outcome {
                Ok(true) => self.counts.inserted += 1,
                Ok(false) => self.counts.ignored += 1,
                Err(err) => {
                    warn!(accession = record.accession(), error = %err, "skipping record");
                    self.counts.failed += 1;
                }
            }
        }
        store.tx(|tx| upsert_file(tx, cursor))
    }
}
