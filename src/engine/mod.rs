//! EZKV - Store Module
//! The public store handle and the components it wires together:
//! key index, expiry index, transaction manager and backing log.

pub mod expiry;
pub mod index;
pub mod journal;
pub mod metrics;
pub mod shrink;
pub mod sweeper;
pub mod txn;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec;
use crate::config::Config;
use crate::error::Result;
use crate::types::{Key, Value};

use self::journal::StoreLog;
use self::metrics::StoreMetrics;
use self::sweeper::Sweeper;
use self::txn::{ReadTxn, TxnManager, WriteTxn};

pub(crate) struct StoreInner {
    path: PathBuf,
    txn: TxnManager,
    sweeper: Mutex<Option<Sweeper>>,
}

impl StoreInner {
    fn sweep(&self) -> Result<usize> {
        let tx = self.txn.begin_write()?;
        let purged = tx.purged();
        tx.commit()?;
        Ok(purged)
    }
}

/// An open store.
///
/// Cloning is cheap and every clone refers to the same store, so a `Store`
/// can be handed to several threads. Each operation runs in its own
/// transaction; use [`Store::update`] or [`Store::begin_write`] to group
/// several.
///
/// ## Example
/// ```no_run
/// use ezkv::Store;
///
/// let store = Store::open("data/app.db").unwrap();
/// store.set("greeting", "hello").unwrap();
/// store.set_int_ttl("visits", 3, 60).unwrap();
/// assert_eq!(store.get("greeting").unwrap(), "hello");
/// store.close().unwrap();
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open or create a store file with the default configuration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, Config::default())
    }

    /// Open or create a store file.
    ///
    /// Fails with an I/O error if the path is inaccessible and with
    /// [`EzkvError::Corruption`](crate::EzkvError::Corruption) if the file is not a valid store.
    pub fn open_with(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        Config::ensure_parent_dir(&path)?;

        let (store_log, recovery) =
            StoreLog::open(&path, config.sync_writes, config.clock.now_ms())?;

        log::info!(
            "Store opened at {:?} ({} entries, {} records replayed)",
            path,
            recovery.index.len(),
            recovery.records
        );

        let txn = TxnManager::new(store_log, recovery.index, &config);
        txn.metrics().record_recovery(recovery.records);

        let inner = Arc::new(StoreInner {
            path,
            txn,
            sweeper: Mutex::new(None),
        });

        if let Some(interval) = config.sweep_interval {
            let sweeper = Sweeper::start(Arc::downgrade(&inner), interval)?;
            *inner.sweeper.lock()? = Some(sweeper);
        }

        Ok(Self { inner })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn metrics(&self) -> &StoreMetrics {
        self.inner.txn.metrics()
    }

    /// Start a snapshot read transaction.
    pub fn begin_read(&self) -> Result<ReadTxn<'_>> {
        self.inner.txn.begin_read()
    }

    /// Start a write transaction, waiting for any active writer to finish.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        self.inner.txn.begin_write()
    }

    /// Run `f` in a write transaction. Commits if `f` returns `Ok`,
    /// aborts otherwise.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<T>,
    {
        let mut tx = self.begin_write()?;
        match f(&mut tx) {
            Ok(out) => {
                tx.commit()?;
                Ok(out)
            }
            Err(err) => {
                tx.abort();
                Err(err)
            }
        }
    }

    // ---- writes ----

    /// Store `value` under `key` with no expiration.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.update(|tx| {
            tx.set(key, value);
            Ok(())
        })
    }

    /// Store `value` under `key`, expiring `ttl_secs` seconds from now.
    /// With a TTL of zero the entry is unreadable immediately.
    pub fn set_ttl(&self, key: impl Into<Key>, value: impl Into<Value>, ttl_secs: u64) -> Result<()> {
        self.update(|tx| {
            tx.set_ttl(key, value, ttl_secs);
            Ok(())
        })
    }

    fn set_maybe_ttl(&self, key: impl Into<Key>, value: Value, ttl_secs: Option<u64>) -> Result<()> {
        match ttl_secs {
            Some(ttl) => self.set_ttl(key, value, ttl),
            None => self.set(key, value),
        }
    }

    pub fn set_int(&self, key: impl Into<Key>, value: i64) -> Result<()> {
        self.set_maybe_ttl(key, codec::encode_int(value), None)
    }

    pub fn set_int_ttl(&self, key: impl Into<Key>, value: i64, ttl_secs: u64) -> Result<()> {
        self.set_maybe_ttl(key, codec::encode_int(value), Some(ttl_secs))
    }

    pub fn set_bool(&self, key: impl Into<Key>, value: bool) -> Result<()> {
        self.set_maybe_ttl(key, codec::encode_bool(value), None)
    }

    pub fn set_bool_ttl(&self, key: impl Into<Key>, value: bool, ttl_secs: u64) -> Result<()> {
        self.set_maybe_ttl(key, codec::encode_bool(value), Some(ttl_secs))
    }

    /// Store any serializable value as JSON.
    pub fn set_json<T: Serialize + ?Sized>(&self, key: impl Into<Key>, value: &T) -> Result<()> {
        self.set_maybe_ttl(key, codec::encode_structured(value)?, None)
    }

    pub fn set_json_ttl<T: Serialize + ?Sized>(
        &self,
        key: impl Into<Key>,
        value: &T,
        ttl_secs: u64,
    ) -> Result<()> {
        self.set_maybe_ttl(key, codec::encode_structured(value)?, Some(ttl_secs))
    }

    pub fn set_time(&self, key: impl Into<Key>, value: &DateTime<Utc>) -> Result<()> {
        self.set_maybe_ttl(key, codec::encode_time(value), None)
    }

    pub fn set_time_ttl(&self, key: impl Into<Key>, value: &DateTime<Utc>, ttl_secs: u64) -> Result<()> {
        self.set_maybe_ttl(key, codec::encode_time(value), Some(ttl_secs))
    }

    /// Remove `key` and return the value it held.
    pub fn delete(&self, key: &str) -> Result<Value> {
        self.update(|tx| tx.delete(key))
    }

    // ---- reads ----

    /// The value stored under `key`.
    pub fn get(&self, key: &str) -> Result<Value> {
        let rx = self.begin_read()?;
        let result = rx.get(key).cloned();
        self.metrics()
            .record_get(result.as_ref().ok().map(|value| value.len()));
        result
    }

    /// The value under `key`, or `default` on any error.
    pub fn get_or_default(&self, key: &str, default: &str) -> Value {
        self.get(key).unwrap_or_else(|_| default.to_owned())
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        codec::decode_int(&self.get(key)?)
    }

    pub fn get_int_or_default(&self, key: &str, default: i64) -> i64 {
        self.get_int(key).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        codec::decode_bool(&self.get(key)?)
    }

    pub fn get_bool_or_default(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Decode the JSON stored under `key`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        codec::decode_structured(&self.get(key)?)
    }

    pub fn get_time(&self, key: &str) -> Result<DateTime<Utc>> {
        codec::decode_time(&self.get(key)?)
    }

    /// Raw bytes of the stored text.
    pub fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        self.get(key).map(String::into_bytes)
    }

    /// Time left before `key` expires, `None` if it never does.
    pub fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let rx = self.begin_read()?;
        Ok(rx.ttl_ms(key)?.map(Duration::from_millis))
    }

    /// All live entries whose key starts with `prefix`.
    pub fn scan_prefix(&self, prefix: &str) -> Result<BTreeMap<Key, Value>> {
        let rx = self.begin_read()?;
        let pairs: BTreeMap<Key, Value> = rx
            .scan_prefix(prefix)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let bytes = pairs.values().map(String::len).sum();
        self.metrics().record_scan(bytes);
        Ok(pairs)
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<usize> {
        Ok(self.begin_read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // ---- maintenance ----

    /// Physically remove every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> Result<usize> {
        self.inner.sweep()
    }

    /// Rewrite the backing file so it only holds live entries.
    pub fn shrink(&self) -> Result<()> {
        self.inner.txn.shrink()
    }

    /// Stop the sweeper, wait for open transactions, and release the file.
    ///
    /// Transactions started on any thread once the close has begun, including
    /// those while it is still waiting, fail with
    /// [`EzkvError::Closed`](crate::EzkvError::Closed), as does every later
    /// operation on this store or its clones. Closing twice is a no-op. Must
    /// not be called while the calling thread holds a transaction.
    pub fn close(&self) -> Result<()> {
        let sweeper = self.inner.sweeper.lock()?.take();
        if let Some(sweeper) = sweeper {
            sweeper.stop();
        }
        if !self.inner.txn.close()? {
            log::debug!("Store at {:?} already closed", self.inner.path);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_append_failure(&self) {
        self.inner.txn.inject_append_failure();
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.inner.path).finish()
    }
}
