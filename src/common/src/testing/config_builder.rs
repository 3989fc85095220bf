//! Test configuration builder for creating test setups quickly.

use std::path::Path;
use std::time::Duration;

use crate::config::{ArchiveConfig, Configuration, DatabaseConfig};

/// Builder for creating test configurations.
///
/// # Example
///
/// ```rust,ignore
/// use common::testing::TestConfigBuilder;
///
/// let config = TestConfigBuilder::new()
///     .with_threshold(-1)
///     .with_threads(2)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: Configuration,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    /// Defaults tuned for tests: in-memory state, no throttling rests,
    /// cancellation checked on every record.
    pub fn new() -> Self {
        let mut config = Configuration::default();
        config.scavenge.cancellation_check_period = 1;
        config.scavenge.min_rest = Duration::ZERO;
        Self { config }
    }

    pub fn with_state_file(mut self, path: impl AsRef<Path>) -> Self {
        self.config.database = DatabaseConfig::file(path);
        self
    }

    pub fn with_threshold(mut self, threshold: i32) -> Self {
        self.config.scavenge.threshold = threshold;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.config.scavenge.threads = threads;
        self
    }

    pub fn with_checkpoint_period(mut self, period: usize) -> Self {
        self.config.scavenge.checkpoint_period = period;
        self
    }

    pub fn with_merge_chunks(mut self, merge_chunks: bool) -> Self {
        self.config.scavenge.merge_chunks = merge_chunks;
        self
    }

    pub fn with_unsafe_ignore_hard_deletes(mut self) -> Self {
        self.config.scavenge.unsafe_ignore_hard_deletes = true;
        self
    }

    pub fn with_sync_only(mut self) -> Self {
        self.config.scavenge.sync_only = true;
        self
    }

    /// Enable archiving with immediate retries.
    pub fn with_archive(mut self, retain_period: Duration, retain_bytes: u64) -> Self {
        self.config.archive = ArchiveConfig {
            enabled: true,
            retain_period,
            retain_bytes,
            max_attempts: 3,
            retry_delay: Duration::ZERO,
            ..ArchiveConfig::default()
        };
        self
    }

    /// Archived chunks are deleted instead of switched to a remote locator.
    pub fn with_delete_local_chunks(mut self) -> Self {
        self.config.archive.delete_local_chunks = true;
        self
    }

    pub fn build(self) -> Configuration {
        self.config
    }
}
