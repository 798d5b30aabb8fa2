//! In-memory ingest counters, rate estimation, and checkpoint cadence.
//!
//! The controller feeds `add_records` only after the owning batch's
//! transaction commits, so `records_done` (and every checkpoint snapshot
//! built from it) never overstates what the file rows can recover.
//! `current_file` and `last_accession` track the live read position and
//! may run ahead of the committed counters.

use crate::store::Checkpoint;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A checkpoint write slower than this coalesces the next trigger.
const CHECKPOINT_BUDGET: Duration = Duration::from_millis(100);

/// Exponentially weighted moving average of a rate (units per second).
#[derive(Debug)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
    last: Instant,
    pending: f64,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            value: None,
            last: Instant::now(),
            pending: 0.0,
        }
    }

    /// Record `delta` units; the rate sample closes once ≥250 ms elapsed.
    pub fn add(&mut self, delta: u64) {
        self.pending += delta as f64;
        let elapsed = self.last.elapsed();
        if elapsed < Duration::from_millis(250) {
            return;
        }
        let sample = self.pending / elapsed.as_secs_f64();
        self.value = Some(match self.value {
            Some(prev) => prev + self.alpha * (sample - prev),
            None => sample,
        });
        self.pending = 0.0;
        self.last = Instant::now();
    }

    pub fn rate(&self) -> Option<f64> {
        self.value
    }
}

/// Live counters for one ingest run.
pub struct ProgressTracker {
    pub bytes_total: Option<u64>,
    pub bytes_done: u64,
    pub records_done: u64,
    pub current_file: Option<String>,
    pub last_accession: Option<String>,

    records_since_checkpoint: u64,
    checkpoint_records: u64,
    checkpoint_interval: Duration,
    last_checkpoint: Instant,
    /// Set when the previous checkpoint write blew the latency budget.
    coalesce_next: bool,

    bytes_rate: Ewma,
    records_rate: Ewma,
}

impl ProgressTracker {
    pub fn new(checkpoint_records: u64, checkpoint_interval: Duration) -> Self {
        Self {
            bytes_total: None,
            bytes_done: 0,
            records_done: 0,
            current_file: None,
            last_accession: None,
            records_since_checkpoint: 0,
            checkpoint_records,
            checkpoint_interval,
            last_checkpoint: Instant::now(),
            coalesce_next: false,
            bytes_rate: Ewma::new(0.2),
            records_rate: Ewma::new(0.2),
        }
    }

    /// Seed counters from a previous run's persisted totals.
    pub fn resume_from(&mut self, bytes_done: u64, records_done: u64) {
        self.bytes_done = bytes_done;
        self.records_done = records_done;
    }

    pub fn set_bytes_done(&mut self, total_read: u64) {
        if total_read > self.bytes_done {
            self.bytes_rate.add(total_read - self.bytes_done);
            self.bytes_done = total_read;
        }
    }

    /// Account for `n` records whose batch has committed.
    pub fn add_records(&mut self, n: u64) {
        self.records_done += n;
        self.records_since_checkpoint += n;
        self.records_rate.add(n);
    }

    /// Record-count OR elapsed-time trigger, whichever fires first. A slow
    /// previous write eats exactly one trigger.
    pub fn should_checkpoint(&mut self) -> bool {
        let due = self.records_since_checkpoint >= self.checkpoint_records
            || self.last_checkpoint.elapsed() >= self.checkpoint_interval;
        if !due {
            return false;
        }
        if self.coalesce_next {
            self.coalesce_next = false;
            self.reset_checkpoint_window();
            return false;
        }
        true
    }

    /// Call after persisting a checkpoint, with the time the write took.
    pub fn note_checkpoint(&mut self, write_cost: Duration) {
        self.coalesce_next = write_cost > CHECKPOINT_BUDGET;
        self.reset_checkpoint_window();
    }

    fn reset_checkpoint_window(&mut self) {
        self.records_since_checkpoint = 0;
        self.last_checkpoint = Instant::now();
    }

    pub fn bytes_per_second(&self) -> Option<f64> {
        self.bytes_rate.rate()
    }

    pub fn records_per_second(&self) -> Option<f64> {
        self.records_rate.rate()
    }

    /// Remaining time estimate; undefined without a known total.
    pub fn eta(&self) -> Option<Duration> {
        let total = self.bytes_total?;
        let rate = self.bytes_per_second()?;
        if rate <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.bytes_done) as f64;
        Some(Duration::from_secs_f64(remaining / rate))
    }

    pub fn snapshot(&self, source_id: &str) -> Checkpoint {
        Checkpoint {
            source_id: source_id.to_string(),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_secs() as i64,
            bytes_done: self.bytes_done,
            records_done: self.records_done,
            last_file: self.current_file.clone(),
            last_accession: self.last_accession.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_trigger() {
        let mut tracker = ProgressTracker::new(10, Duration::from_secs(3600));
        tracker.add_records(9);
        assert!(!tracker.should_checkpoint());
        tracker.add_records(1);
        assert!(tracker.should_checkpoint());
        tracker.note_checkpoint(Duration::from_millis(5));
        assert!(!tracker.should_checkpoint());
    }

    #[test]
    fn test_slow_write_coalesces_one_trigger() {
        let mut tracker = ProgressTracker::new(5, Duration::from_secs(3600));
        tracker.add_records(5);
        assert!(tracker.should_checkpoint());
        tracker.note_checkpoint(Duration::from_millis(500));

        // next due trigger is swallowed...
        tracker.add_records(5);
        assert!(!tracker.should_checkpoint());
        // ...and the one after fires again
        tracker.add_records(5);
        assert!(tracker.should_checkpoint());
    }

    #[test]
    fn test_eta_requires_total_and_rate() {
        let mut tracker = ProgressTracker::new(1000, Duration::from_secs(30));
        assert!(tracker.eta().is_none());
        tracker.bytes_total = Some(1_000_000);
        // no rate sample yet
        assert!(tracker.eta().is_none());
    }

    #[test]
    fn test_bytes_done_is_monotonic() {
        let mut tracker = ProgressTracker::new(1000, Duration::from_secs(30));
        tracker.set_bytes_done(100);
        tracker.set_bytes_done(50);
        assert_eq!(tracker.bytes_done, 100);
    }

    #[test]
    fn test_snapshot_carries_cursor_fields() {
        let mut tracker = ProgressTracker::new(1000, Duration::from_secs(30));
        tracker.add_records(7);
        tracker.current_file = Some("batch/study.xml".into());
        tracker.last_accession = Some("SRP000001".into());
        let snapshot = tracker.snapshot("src-1");
        assert_eq!(snapshot.records_done, 7);
        assert_eq!(snapshot.last_file.as_deref(), Some("batch/study.xml"));
        assert_eq!(snapshot.last_accession.as_deref(), Some("SRP000001"));
    }
}
