//! EZKV - Core Type Definitions
//! Defines fundamental types used across the store.

/// Key type. Keys sort byte-lexicographically.
pub type Key = String;

/// Value type. Typed values are encoded to text by [`crate::codec`].
pub type Value = String;

/// Absolute expiration time, in milliseconds since the Unix epoch.
pub type Deadline = u64;

/// A single stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: Value,
    /// `None` means the entry never expires.
    pub deadline: Option<Deadline>,
}

impl Entry {
    /// Create an entry without a deadline.
    pub fn persistent(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            deadline: None,
        }
    }

    /// Create an entry that expires at `deadline`.
    pub fn expiring(value: impl Into<Value>, deadline: Deadline) -> Self {
        Self {
            value: value.into(),
            deadline: Some(deadline),
        }
    }

    /// An entry whose deadline is at or before `now_ms` is logically absent.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.deadline, Some(deadline) if deadline <= now_ms)
    }

    /// Milliseconds left before expiry. `None` if the entry has no deadline.
    pub fn remaining_ms(&self, now_ms: u64) -> Option<u64> {
        self.deadline.map(|deadline| deadline.saturating_sub(now_ms))
    }
}
