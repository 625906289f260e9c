//! EZKV - Expiry Index
//! Orders keys by deadline so that due entries can be found without
//! scanning the whole key index.
//!
//! ## Design
//! - `by_deadline` is an ordered set of `(deadline, key)` pairs, so the
//!   entries that expire first are at the front
//! - `by_key` maps each key to its current deadline, which keeps one
//!   association per key and makes `cancel` O(log n)

use std::collections::{BTreeSet, HashMap};

use crate::types::{Deadline, Key};

#[derive(Debug, Clone, Default)]
pub struct ExpiryIndex {
    by_deadline: BTreeSet<(Deadline, Key)>,
    by_key: HashMap<Key, Deadline>,
}

impl ExpiryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `key` with `deadline`, replacing any previous association.
    pub fn schedule(&mut self, key: &str, deadline: Deadline) {
        self.cancel(key);
        self.by_deadline.insert((deadline, key.to_owned()));
        self.by_key.insert(key.to_owned(), deadline);
    }

    /// Remove the deadline association for `key`, if any.
    pub fn cancel(&mut self, key: &str) {
        if let Some(old) = self.by_key.remove(key) {
            self.by_deadline.remove(&(old, key.to_owned()));
        }
    }

    /// Keys whose deadline is at or before `now_ms`, earliest first.
    /// Does not mutate the index.
    pub fn due(&self, now_ms: u64) -> impl Iterator<Item = &str> + '_ {
        self.by_deadline
            .iter()
            .take_while(move |(deadline, _)| *deadline <= now_ms)
            .map(|(_, key)| key.as_str())
    }

    pub fn deadline(&self, key: &str) -> Option<Deadline> {
        self.by_key.get(key).copied()
    }

    /// Number of keys with a deadline.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_and_due() {
        let mut index = ExpiryIndex::new();
        index.schedule("b", 20);
        index.schedule("a", 10);
        index.schedule("c", 30);

        let due: Vec<&str> = index.due(20).collect();
        assert_eq!(due, vec!["a", "b"]);
        // due() is read-only
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_reschedule_replaces_old_deadline() {
        let mut index = ExpiryIndex::new();
        index.schedule("key", 10);
        index.schedule("key", 100);

        assert_eq!(index.len(), 1);
        assert_eq!(index.deadline("key"), Some(100));
        assert_eq!(index.due(50).count(), 0);
        assert_eq!(index.due(100).collect::<Vec<_>>(), vec!["key"]);
    }

    #[test]
    fn test_cancel() {
        let mut index = ExpiryIndex::new();
        index.schedule("key", 10);
        index.cancel("key");
        assert!(index.is_empty());
        assert_eq!(index.due(u64::MAX).count(), 0);

        // no-op when absent
        index.cancel("missing");
        assert!(index.is_empty());
    }

    #[test]
    fn test_same_deadline_orders_by_key() {
        let mut index = ExpiryIndex::new();
        index.schedule("zeta", 5);
        index.schedule("alpha", 5);
        assert_eq!(index.due(5).collect::<Vec<_>>(), vec!["alpha", "zeta"]);
    }
}
