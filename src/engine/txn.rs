//! EZKV - Transaction Manager
//! Serializes writers and hands readers immutable snapshots.
//!
//! ## Concurrency Model
//! - The last committed [`KeyIndex`] is published as an `Arc` behind a
//!   `RwLock`. A reader clones the `Arc` and never touches the lock again,
//!   so it sees the state as of the last commit for its whole lifetime.
//! - Writers take the `writer` mutex, which also owns the store log. Only
//!   one write transaction can be active at a time.
//! - A write transaction buffers its changes. `commit` appends them to the
//!   log first and only then applies them to the published index with
//!   `Arc::make_mut`, which copies the index only while a reader still holds
//!   the old snapshot.
//! - `close` first marks the gate closed, so every later `begin_read` or
//!   `begin_write` fails with `Closed` without blocking. It then waits for
//!   the open read transactions to drain and finally for the writer mutex.
//!   Close holds no lock while it waits, so a reader that tries to write
//!   during a pending close gets `Closed` instead of deadlocking.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{EzkvError, Result};
use crate::types::{Deadline, Entry, Key, Value};

use super::index::KeyIndex;
use super::journal::{Record, StoreLog};
use super::metrics::StoreMetrics;
use super::shrink::{self, ShrinkStrategy};

/// Deadline `ttl_secs` whole seconds after `now_ms`.
pub(crate) fn deadline_after(now_ms: u64, ttl_secs: u64) -> Deadline {
    now_ms.saturating_add(ttl_secs.saturating_mul(1_000))
}

/// State owned by the single writer.
pub(crate) struct Writer {
    pub(crate) log: StoreLog,
    shrink: Box<dyn ShrinkStrategy>,
}

impl Writer {
    /// Rewrite the log from `index`.
    fn rewrite(&mut self, index: &KeyIndex, now_ms: u64) -> Result<()> {
        let before = self.log.len();
        self.log.rewrite(&shrink::live_records(index, now_ms))?;
        self.shrink.rewritten(self.log.len());
        log::info!(
            "Shrank {:?} from {} to {} bytes ({})",
            self.log.path(),
            before,
            self.log.len(),
            self.shrink.name()
        );
        Ok(())
    }
}

/// Admission state shared by every transaction.
#[derive(Debug, Default)]
struct Gate {
    closed: bool,
    readers: usize,
}

pub(crate) struct TxnManager {
    committed: RwLock<Arc<KeyIndex>>,
    /// `None` once the store is closed.
    writer: Mutex<Option<Writer>>,
    gate: Mutex<Gate>,
    /// Signalled when the last open reader finishes.
    drained: Condvar,
    clock: Arc<dyn Clock>,
    metrics: StoreMetrics,
}

impl TxnManager {
    pub(crate) fn new(log: StoreLog, index: KeyIndex, config: &Config) -> Self {
        let shrink = shrink::strategy_for(config, log.len());
        Self {
            committed: RwLock::new(Arc::new(index)),
            writer: Mutex::new(Some(Writer { log, shrink })),
            gate: Mutex::new(Gate::default()),
            drained: Condvar::new(),
            clock: Arc::clone(&config.clock),
            metrics: StoreMetrics::new(),
        }
    }

    pub(crate) fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Start a read transaction on the last committed state.
    pub(crate) fn begin_read(&self) -> Result<ReadTxn<'_>> {
        let snapshot = {
            let mut gate = self.gate.lock()?;
            if gate.closed {
                return Err(EzkvError::Closed);
            }
            let snapshot = Arc::clone(&*self.committed.read()?);
            gate.readers += 1;
            snapshot
        };
        Ok(ReadTxn {
            manager: self,
            snapshot,
            now_ms: self.now_ms(),
        })
    }

    fn end_read(&self) {
        let mut gate = match self.gate.lock() {
            Ok(gate) => gate,
            Err(poisoned) => poisoned.into_inner(),
        };
        gate.readers -= 1;
        if gate.readers == 0 {
            self.drained.notify_all();
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.gate.lock()?.closed {
            return Err(EzkvError::Closed);
        }
        Ok(())
    }

    /// Start a write transaction, blocking while another one is active.
    ///
    /// Entries already due are queued for removal as part of this
    /// transaction.
    pub(crate) fn begin_write(&self) -> Result<WriteTxn<'_>> {
        self.ensure_open()?;
        let writer = self.writer.lock()?;
        if writer.is_none() {
            return Err(EzkvError::Closed);
        }
        let base = Arc::clone(&*self.committed.read()?);
        let now_ms = self.now_ms();

        let mut changes = BTreeMap::new();
        for key in base.due(now_ms) {
            changes.insert(key.to_owned(), None);
        }
        let purged = changes.len();
        if purged > 0 {
            log::debug!("Purging {} expired entries", purged);
        }

        Ok(WriteTxn {
            manager: self,
            writer,
            base: Some(base),
            changes,
            purged,
            now_ms,
            state: TxState::Active,
        })
    }

    /// Rewrite the log so it only holds live entries.
    pub(crate) fn shrink(&self) -> Result<()> {
        self.ensure_open()?;
        let mut guard = self.writer.lock()?;
        let writer = guard.as_mut().ok_or(EzkvError::Closed)?;
        let snapshot = Arc::clone(&*self.committed.read()?);
        writer.rewrite(&snapshot, self.now_ms())?;
        self.metrics.record_shrink();
        Ok(())
    }

    /// Refuse new transactions, wait for the open ones to finish, then
    /// release the log.
    ///
    /// Must not be called from a thread that holds a transaction.
    /// Returns `Ok(false)` if the store was already closed.
    pub(crate) fn close(&self) -> Result<bool> {
        {
            let mut gate = self.gate.lock()?;
            if gate.closed {
                return Ok(false);
            }
            gate.closed = true;
            while gate.readers > 0 {
                gate = self.drained.wait(gate)?;
            }
        }
        let mut writer = self.writer.lock()?;
        if let Some(mut writer) = writer.take() {
            writer.log.sync()?;
            log::info!("Closed store at {:?}", writer.log.path());
        }
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn inject_append_failure(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            if let Some(writer) = writer.as_mut() {
                writer.log.inject_append_failure();
            }
        }
    }
}

/// A read-only view of the store as of the last commit before it began.
pub struct ReadTxn<'a> {
    manager: &'a TxnManager,
    snapshot: Arc<KeyIndex>,
    now_ms: u64,
}

impl<'a> ReadTxn<'a> {
    pub fn get(&self, key: &str) -> Result<&Value> {
        self.snapshot
            .lookup(key, self.now_ms)
            .map(|entry| &entry.value)
            .ok_or(EzkvError::NotFound)
    }

    /// Remaining lifetime in milliseconds, `None` if the key never expires.
    pub fn ttl_ms(&self, key: &str) -> Result<Option<u64>> {
        self.snapshot
            .lookup(key, self.now_ms)
            .map(|entry| entry.remaining_ms(self.now_ms))
            .ok_or(EzkvError::NotFound)
    }

    /// Lazily iterate live entries under `prefix` in ascending key order.
    pub fn scan_prefix<'s>(
        &'s self,
        prefix: &'s str,
    ) -> impl Iterator<Item = (&'s Key, &'s Value)> + 's {
        self.snapshot
            .scan_prefix(prefix, self.now_ms)
            .map(|(key, entry)| (key, &entry.value))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.snapshot.live_len(self.now_ms)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        self.manager.end_read();
    }
}

/// `Active → {Committed, Aborted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    Aborted,
}

/// The single active write transaction.
///
/// Changes are buffered until [`WriteTxn::commit`]. Dropping a transaction
/// without committing aborts it.
pub struct WriteTxn<'a> {
    manager: &'a TxnManager,
    writer: MutexGuard<'a, Option<Writer>>,
    /// State as of the last commit. Released before publishing.
    base: Option<Arc<KeyIndex>>,
    /// `None` marks a deletion.
    changes: BTreeMap<Key, Option<Entry>>,
    purged: usize,
    now_ms: u64,
    state: TxState,
}

impl<'a> WriteTxn<'a> {
    /// Read through this transaction's own changes.
    pub fn get(&self, key: &str) -> Result<&Value> {
        let entry = match self.changes.get(key) {
            Some(change) => change.as_ref(),
            None => self
                .base
                .as_ref()
                .and_then(|base| base.lookup(key, self.now_ms)),
        };
        entry
            .filter(|entry| !entry.is_expired(self.now_ms))
            .map(|entry| &entry.value)
            .ok_or(EzkvError::NotFound)
    }

    /// Insert or replace `key` with no deadline.
    pub fn set(&mut self, key: impl Into<Key>, value: impl Into<Value>) {
        self.changes
            .insert(key.into(), Some(Entry::persistent(value)));
        self.manager.metrics.record_set();
    }

    /// Insert or replace `key`, expiring `ttl_secs` seconds from now.
    /// A TTL of zero is already expired.
    pub fn set_ttl(&mut self, key: impl Into<Key>, value: impl Into<Value>, ttl_secs: u64) {
        let deadline = deadline_after(self.now_ms, ttl_secs);
        self.changes
            .insert(key.into(), Some(Entry::expiring(value, deadline)));
        self.manager.metrics.record_set();
    }

    /// Remove `key`, returning its value.
    pub fn delete(&mut self, key: &str) -> Result<Value> {
        let prior = self.get(key)?.clone();
        self.changes.insert(key.to_owned(), None);
        self.manager.metrics.record_delete();
        Ok(prior)
    }

    /// Entries removed because their deadline had passed.
    pub fn purged(&self) -> usize {
        self.purged
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    fn records(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.changes)
            .into_iter()
            .map(|(key, change)| match change {
                Some(Entry { value, deadline }) => Record::Set {
                    key,
                    value,
                    deadline,
                },
                None => Record::Delete { key },
            })
            .collect()
    }

    /// Persist and publish every buffered change.
    ///
    /// Nothing becomes visible unless the log append succeeds. On failure the
    /// transaction is rolled back and [`EzkvError::Persistence`] is returned.
    pub fn commit(mut self) -> Result<()> {
        let records = self.records();
        if records.is_empty() {
            self.state = TxState::Committed;
            return Ok(());
        }

        let manager = self.manager;
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => {
                self.state = TxState::Aborted;
                return Err(EzkvError::Closed);
            }
        };

        let frame_bytes = match writer.log.append(&records) {
            Ok(n) => n,
            Err(err) => {
                self.state = TxState::Aborted;
                manager.metrics.record_abort();
                return Err(err);
            }
        };

        // Drop our snapshot so make_mut can usually update in place.
        self.base = None;
        let published = {
            let mut committed = manager.committed.write()?;
            let index = Arc::make_mut(&mut *committed);
            for record in records {
                record.apply(index);
            }
            Arc::clone(&*committed)
        };
        self.state = TxState::Committed;
        manager.metrics.record_commit(frame_bytes, self.purged);

        if writer.shrink.should_shrink(writer.log.len()) {
            // The commit itself is already durable.
            match writer.rewrite(&published, self.now_ms) {
                Ok(()) => manager.metrics.record_shrink(),
                Err(err) => log::warn!("Auto-shrink failed: {}", err),
            }
        }
        Ok(())
    }

    /// Discard every buffered change.
    pub fn abort(mut self) {
        self.changes.clear();
        self.state = TxState::Aborted;
        self.manager.metrics.record_abort();
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            log::debug!("Write transaction dropped without commit, aborting");
            self.state = TxState::Aborted;
            self.manager.metrics.record_abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::Ordering;

    fn manager_at(clock: Arc<ManualClock>) -> (tempfile::TempDir, TxnManager) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default().with_clock(clock.clone());
        let (log, recovery) =
            StoreLog::open(dir.path().join("store.db"), true, clock.now_ms()).unwrap();
        let manager = TxnManager::new(log, recovery.index, &config);
        (dir, manager)
    }

    fn manager() -> (tempfile::TempDir, TxnManager) {
        manager_at(Arc::new(ManualClock::new(1_000)))
    }

    #[test]
    fn test_commit_publishes() {
        let (_dir, mgr) = manager();
        let mut tx = mgr.begin_write().unwrap();
        assert_eq!(tx.state(), TxState::Active);
        tx.set("a", "1");
        assert_eq!(tx.get("a").unwrap(), "1");
        tx.commit().unwrap();

        let rx = mgr.begin_read().unwrap();
        assert_eq!(rx.get("a").unwrap(), "1");
        assert_eq!(mgr.metrics().commits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_abort_discards() {
        let (_dir, mgr) = manager();
        let mut tx = mgr.begin_write().unwrap();
        tx.set("a", "1");
        tx.abort();

        assert!(mgr.begin_read().unwrap().get("a").unwrap_err().is_not_found());
        assert_eq!(mgr.metrics().aborts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_drop_aborts() {
        let (_dir, mgr) = manager();
        {
            let mut tx = mgr.begin_write().unwrap();
            tx.set("a", "1");
        }
        assert!(mgr.begin_read().unwrap().get("a").is_err());
        assert_eq!(mgr.metrics().aborts.load(Ordering::Relaxed), 1);
        // writer lock was released
        mgr.begin_write().unwrap().commit().unwrap();
    }

    #[test]
    fn test_reader_keeps_snapshot_across_commit() {
        let (_dir, mgr) = manager();
        let mut tx = mgr.begin_write().unwrap();
        tx.set("k", "old");
        tx.commit().unwrap();

        let before = mgr.begin_read().unwrap();

        let mut tx = mgr.begin_write().unwrap();
        tx.set("k", "new");
        tx.set("extra", "x");
        // uncommitted change is invisible
        assert_eq!(before.get("k").unwrap(), "old");
        tx.commit().unwrap();

        // committed change is invisible to the older snapshot too
        assert_eq!(before.get("k").unwrap(), "old");
        assert!(before.get("extra").is_err());

        let after = mgr.begin_read().unwrap();
        assert_eq!(after.get("k").unwrap(), "new");
        assert_eq!(after.len(), 2);
    }

    #[test]
    fn test_delete_within_transaction() {
        let (_dir, mgr) = manager();
        let mut tx = mgr.begin_write().unwrap();
        tx.set("k", "v");
        assert_eq!(tx.delete("k").unwrap(), "v");
        assert!(tx.get("k").unwrap_err().is_not_found());
        assert!(tx.delete("k").unwrap_err().is_not_found());
        tx.commit().unwrap();
        assert!(mgr.begin_read().unwrap().is_empty());
    }

    #[test]
    fn test_zero_ttl_is_expired() {
        let (_dir, mgr) = manager();
        let mut tx = mgr.begin_write().unwrap();
        tx.set_ttl("k", "v", 0);
        assert!(tx.get("k").is_err());
        tx.commit().unwrap();
        assert!(mgr.begin_read().unwrap().get("k").is_err());
    }

    #[test]
    fn test_write_purges_due_entries() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (_dir, mgr) = manager_at(clock.clone());

        let mut tx = mgr.begin_write().unwrap();
        tx.set_ttl("short", "a", 1);
        tx.set_ttl("long", "b", 60);
        tx.commit().unwrap();

        clock.advance(1_000);
        let tx = mgr.begin_write().unwrap();
        assert_eq!(tx.purged(), 1);
        tx.commit().unwrap();

        let rx = mgr.begin_read().unwrap();
        assert_eq!(rx.snapshot.len(), 1);
        assert_eq!(rx.get("long").unwrap(), "b");
        assert_eq!(mgr.metrics().expired_purged.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_failed_commit_rolls_back() {
        let (_dir, mgr) = manager();
        let mut tx = mgr.begin_write().unwrap();
        tx.set("k", "v1");
        tx.commit().unwrap();

        mgr.inject_append_failure();
        let mut tx = mgr.begin_write().unwrap();
        tx.set("k", "v2");
        tx.set("other", "x");
        assert!(matches!(tx.commit(), Err(EzkvError::Persistence(_))));

        let rx = mgr.begin_read().unwrap();
        assert_eq!(rx.get("k").unwrap(), "v1");
        assert!(rx.get("other").is_err());
    }

    #[test]
    fn test_closed_rejects_transactions() {
        let (_dir, mgr) = manager();
        assert!(mgr.close().unwrap());
        assert!(matches!(mgr.begin_read(), Err(EzkvError::Closed)));
        assert!(matches!(mgr.begin_write(), Err(EzkvError::Closed)));
        assert!(matches!(mgr.shrink(), Err(EzkvError::Closed)));
        assert!(!mgr.close().unwrap());
    }

    #[test]
    fn test_explicit_transaction_counts_writes() {
        let (_dir, mgr) = manager();
        let mut tx = mgr.begin_write().unwrap();
        tx.set("a", "1");
        tx.set_ttl("b", "2", 30);
        tx.delete("a").unwrap();
        tx.commit().unwrap();

        let metrics = mgr.metrics();
        assert_eq!(metrics.sets.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.deletes.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_ops(), 3);
    }

    #[test]
    fn test_close_rejects_reader_of_pending_close() {
        let (_dir, mgr) = manager();
        let rx = mgr.begin_read().unwrap();

        std::thread::scope(|s| {
            let closer = s.spawn(|| mgr.close());
            while !mgr.gate.lock().unwrap().closed {
                std::thread::yield_now();
            }
            assert!(matches!(mgr.begin_write(), Err(EzkvError::Closed)));
            assert!(matches!(mgr.begin_read(), Err(EzkvError::Closed)));
            assert!(!closer.is_finished());
            drop(rx);
            assert!(closer.join().unwrap().unwrap());
        });
        assert_eq!(mgr.gate.lock().unwrap().readers, 0);
    }

    #[test]
    fn test_ttl_ms() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (_dir, mgr) = manager_at(clock.clone());
        let mut tx = mgr.begin_write().unwrap();
        tx.set_ttl("k", "v", 10);
        tx.set("p", "v");
        tx.commit().unwrap();

        clock.advance(4_000);
        let rx = mgr.begin_read().unwrap();
        assert_eq!(rx.ttl_ms("k").unwrap(), Some(6_000));
        assert_eq!(rx.ttl_ms("p").unwrap(), None);
        assert!(rx.ttl_ms("missing").is_err());
    }
}
