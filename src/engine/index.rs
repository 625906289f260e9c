//! EZKV - Key Index
//! Ordered in-memory map from key to entry. Owns every entry and keeps the
//! expiry index in step with each mutation.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::types::{Deadline, Entry, Key, Value};

use super::expiry::ExpiryIndex;

/// Sorted key/entry map backed by a `BTreeMap`.
///
/// Lookups and scans take the current time and hide entries whose deadline
/// has passed. Those entries stay in the map until a write transaction
/// purges them through [`KeyIndex::due`].
#[derive(Debug, Clone, Default)]
pub struct KeyIndex {
    entries: BTreeMap<Key, Entry>,
    expiry: ExpiryIndex,
    /// Approximate size of keys and values in bytes.
    size_bytes: usize,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point lookup. Expired entries are reported as absent.
    pub fn lookup(&self, key: &str, now_ms: u64) -> Option<&Entry> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now_ms))
    }

    /// Insert or replace the entry for `key`.
    pub fn upsert(&mut self, key: Key, value: Value, deadline: Option<Deadline>) -> Option<Entry> {
        self.expiry.cancel(&key);
        if let Some(deadline) = deadline {
            self.expiry.schedule(&key, deadline);
        }
        let key_len = key.len();
        self.size_bytes += key_len + value.len();
        let old = self.entries.insert(key, Entry { value, deadline });
        if let Some(ref old) = old {
            self.size_bytes = self.size_bytes.saturating_sub(key_len + old.value.len());
        }
        old
    }

    /// Delete `key` and return its previous entry, expired or not.
    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        self.expiry.cancel(key);
        let old = self.entries.remove(key)?;
        self.size_bytes = self
            .size_bytes
            .saturating_sub(key.len() + old.value.len());
        Some(old)
    }

    /// Live entries whose key starts with `prefix`, in ascending key order.
    ///
    /// The comparison is on bytes, so `"dance"` matches both `"dance"` and
    /// `"dancer"`. The iterator is lazy; call again to restart.
    pub fn scan_prefix<'a>(
        &'a self,
        prefix: &'a str,
        now_ms: u64,
    ) -> impl Iterator<Item = (&'a Key, &'a Entry)> + 'a {
        self.entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(key, _)| key.starts_with(prefix))
            .filter(move |(_, entry)| !entry.is_expired(now_ms))
    }

    /// Keys due for purge at `now_ms`, earliest deadline first.
    pub fn due(&self, now_ms: u64) -> impl Iterator<Item = &str> + '_ {
        self.expiry.due(now_ms)
    }

    /// Every physically present entry, including expired ones.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Entry)> {
        self.entries.iter()
    }

    /// Number of live entries at `now_ms`.
    pub fn live_len(&self, now_ms: u64) -> usize {
        let expired = self.expiry.due(now_ms).count();
        self.entries.len() - expired
    }

    /// Number of physically present entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size_bytes
    }

    pub fn expiring_len(&self) -> usize {
        self.expiry.len()
    }
}
