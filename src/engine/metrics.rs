//! EZKV - Store Metrics
//! Atomic counters for tracking store operations in a lock-free,
//! thread-safe manner using `AtomicU64`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic operation counters for a store.
///
/// All counters use `Ordering::Relaxed`; they are for observation only.
#[derive(Debug)]
pub struct StoreMetrics {
    /// Total number of `set` operations.
    pub sets: AtomicU64,
    /// Total number of `get` operations.
    pub gets: AtomicU64,
    /// Total number of `delete` operations.
    pub deletes: AtomicU64,
    /// Total number of prefix scans.
    pub scans: AtomicU64,
    /// Write transactions that reached the log.
    pub commits: AtomicU64,
    /// Write transactions discarded, explicitly or by drop.
    pub aborts: AtomicU64,
    /// Expired entries physically removed.
    pub expired_purged: AtomicU64,
    /// Log rewrites.
    pub shrinks: AtomicU64,
    /// Bytes appended to the log.
    pub bytes_written: AtomicU64,
    /// Bytes of values returned to callers.
    pub bytes_read: AtomicU64,
    /// Records replayed when the store was opened.
    pub recovered_records: AtomicU64,
    opened_at: Instant,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self {
            sets: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            scans: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            expired_purged: AtomicU64::new(0),
            shrinks: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            recovered_records: AtomicU64::new(0),
            opened_at: Instant::now(),
        }
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a get; `value_size` is `None` on a miss.
    pub fn record_get(&self, value_size: Option<usize>) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if let Some(size) = value_size {
            self.bytes_read.fetch_add(size as u64, Ordering::Relaxed);
        }
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan(&self, bytes: usize) {
        self.scans.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_commit(&self, frame_bytes: usize, purged: usize) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(frame_bytes as u64, Ordering::Relaxed);
        self.expired_purged
            .fetch_add(purged as u64, Ordering::Relaxed);
    }

    pub fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shrink(&self) {
        self.shrinks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self, records: usize) {
        self.recovered_records
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> f64 {
        self.opened_at.elapsed().as_secs_f64()
    }

    /// Sets + gets + deletes + scans.
    pub fn total_ops(&self) -> u64 {
        self.sets.load(Ordering::Relaxed)
            + self.gets.load(Ordering::Relaxed)
            + self.deletes.load(Ordering::Relaxed)
            + self.scans.load(Ordering::Relaxed)
    }

    /// Format metrics as a human-readable report.
    pub fn report(&self) -> String {
        format!(
            "\n═══ ezkv Store Metrics ═══\n\
             Operations:\n\
               sets:      {}\n\
               gets:      {}\n\
               deletes:   {}\n\
               scans:     {}\n\
             Transactions:\n\
               commits:   {}\n\
               aborts:    {}\n\
             Maintenance:\n\
               expired purged: {}\n\
               shrinks:        {}\n\
             I/O:\n\
               written:   {} bytes\n\
               read:      {} bytes\n\
               recovered: {} records\n\
             Uptime: {:.2}s",
            self.sets.load(Ordering::Relaxed),
            self.gets.load(Ordering::Relaxed),
            self.deletes.load(Ordering::Relaxed),
            self.scans.load(Ordering::Relaxed),
            self.commits.load(Ordering::Relaxed),
            self.aborts.load(Ordering::Relaxed),
            self.expired_purged.load(Ordering::Relaxed),
            self.shrinks.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
            self.bytes_read.load(Ordering::Relaxed),
            self.recovered_records.load(Ordering::Relaxed),
            self.uptime_secs(),
        )
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}
