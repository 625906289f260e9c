//! EZKV - Store Configuration
//! Defines tunable parameters for the store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::{EzkvError, Result};

/// Configuration for an ezkv store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to fsync the log on every commit.
    pub sync_writes: bool,

    /// Rewrite the log automatically once it has grown enough.
    pub auto_shrink: bool,

    /// Growth since the last rewrite, in percent, that triggers an auto-shrink.
    pub auto_shrink_percentage: u64,

    /// The log is never auto-shrunk below this size in bytes.
    pub auto_shrink_min_size: u64,

    /// Interval of the background expiry sweeper. `None` disables it.
    pub sweep_interval: Option<Duration>,

    /// Time source for deadlines.
    pub clock: Arc<dyn Clock>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_writes: true,
            auto_shrink: true,
            auto_shrink_percentage: 100,
            auto_shrink_min_size: 32 * 1024 * 1024, // 32 MB
            sweep_interval: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn with_auto_shrink(mut self, enabled: bool) -> Self {
        self.auto_shrink = enabled;
        self
    }

    /// Set the auto-shrink thresholds.
    pub fn with_auto_shrink_thresholds(mut self, percentage: u64, min_size: u64) -> Self {
        self.auto_shrink_percentage = percentage;
        self.auto_shrink_min_size = min_size;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reject settings the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval == Some(Duration::ZERO) {
            return Err(EzkvError::Config(
                "sweep_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Ensure the directory holding the store file exists.
    pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }
}
