//! EZKV - Log Shrinking
//! Every commit appends to the store log, so overwritten, deleted and expired
//! records pile up. Shrinking rewrites the log to hold only live entries.
//!
//! ## Growth Strategy
//! - Remember the log size right after the last rewrite (or open)
//! - Once the log is at least `min_size` bytes and has grown by
//!   `percentage` percent over that base, rewrite it

use crate::config::Config;
use crate::types::Entry;

use super::index::KeyIndex;
use super::journal::Record;

/// Decides when the log should be rewritten.
pub trait ShrinkStrategy: Send {
    /// Called after each commit with the current log size.
    fn should_shrink(&self, log_len: u64) -> bool;

    /// Called after a rewrite with the new log size.
    fn rewritten(&mut self, log_len: u64);

    fn name(&self) -> &str;
}

/// Rewrite once the log has grown by a percentage since the last rewrite.
#[derive(Debug, Clone)]
pub struct GrowthShrink {
    percentage: u64,
    min_size: u64,
    base_len: u64,
}

impl GrowthShrink {
    pub fn new(percentage: u64, min_size: u64, base_len: u64) -> Self {
        Self {
            percentage,
            min_size,
            base_len,
        }
    }

    fn threshold(&self) -> u64 {
        self.base_len
            .saturating_add(self.base_len.saturating_mul(self.percentage) / 100)
    }
}

impl ShrinkStrategy for GrowthShrink {
    fn should_shrink(&self, log_len: u64) -> bool {
        log_len >= self.min_size && log_len > self.threshold()
    }

    fn rewritten(&mut self, log_len: u64) {
        self.base_len = log_len;
    }

    fn name(&self) -> &str {
        "GrowthShrink"
    }
}

/// Never rewrite automatically.
#[derive(Debug, Clone, Default)]
pub struct ManualShrink;

impl ShrinkStrategy for ManualShrink {
    fn should_shrink(&self, _log_len: u64) -> bool {
        false
    }

    fn rewritten(&mut self, _log_len: u64) {}

    fn name(&self) -> &str {
        "ManualShrink"
    }
}

/// Pick the strategy described by `config`.
pub fn strategy_for(config: &Config, base_len: u64) -> Box<dyn ShrinkStrategy> {
    if config.auto_shrink {
        Box::new(GrowthShrink::new(
            config.auto_shrink_percentage,
            config.auto_shrink_min_size,
            base_len,
        ))
    } else {
        Box::new(ManualShrink)
    }
}

/// The records a rewritten log holds: one `Set` per live entry, in key order.
pub fn live_records(index: &KeyIndex, now_ms: u64) -> Vec<Record> {
    index
        .iter()
        .filter(|(_, entry)| !entry.is_expired(now_ms))
        .map(|(key, Entry { value, deadline })| Record::Set {
            key: key.clone(),
            value: value.clone(),
            deadline: *deadline,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_threshold() {
        let mut strategy = GrowthShrink::new(100, 1_000, 800);

        assert!(!strategy.should_shrink(999)); // below min size
        assert!(!strategy.should_shrink(1_600)); // exactly doubled
        assert!(strategy.should_shrink(1_601));

        strategy.rewritten(2_000);
        assert!(!strategy.should_shrink(3_000));
        assert!(strategy.should_shrink(4_001));
    }

    #[test]
    fn test_min_size_dominates_small_logs() {
        let strategy = GrowthShrink::new(10, 4_096, 12);
        assert!(!strategy.should_shrink(4_000));
        assert!(strategy.should_shrink(4_096));
    }

    #[test]
    fn test_manual_never_shrinks() {
        let strategy = ManualShrink;
        assert!(!strategy.should_shrink(u64::MAX));
        assert_eq!(strategy.name(), "ManualShrink");
    }

    #[test]
    fn test_strategy_for_config() {
        let config = Config::default().with_auto_shrink(false);
        assert_eq!(strategy_for(&config, 0).name(), "ManualShrink");
        let config = Config::default();
        assert_eq!(strategy_for(&config, 0).name(), "GrowthShrink");
    }

    #[test]
    fn test_live_records_skip_expired() {
        let mut index = KeyIndex::new();
        index.upsert("b".into(), "2".into(), Some(100));
        index.upsert("a".into(), "1".into(), None);
        index.upsert("c".into(), "3".into(), Some(10));

        let records = live_records(&index, 50);
        assert_eq!(
            records,
            vec![
                Record::Set {
                    key: "a".into(),
                    value: "1".into(),
                    deadline: None
                },
                Record::Set {
                    key: "b".into(),
                    value: "2".into(),
                    deadline: Some(100)
                },
            ]
        );
    }
}
