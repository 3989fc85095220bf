//! Effective settings of one scavenge run.

use std::time::Duration;

use common::config::{ArchiveConfig, Configuration};

/// Most chunks rewritten at once
pub const MAX_THREADS: usize = 4;

/// Archive retention settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveSettings {
    pub retain_period: Duration,
    pub retain_bytes: u64,
    pub delete_local_chunks: bool,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl From<&ArchiveConfig> for ArchiveSettings {
    fn from(config: &ArchiveConfig) -> Self {
        Self {
            retain_period: config.retain_period,
            retain_bytes: config.retain_bytes,
            delete_local_chunks: config.delete_local_chunks,
            max_attempts: config.max_attempts,
            retry_delay: config.retry_delay,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScavengeSettings {
    pub threads: usize,
    pub threshold: i32,
    pub throttle_percent: u8,
    pub cancellation_check_period: usize,
    pub checkpoint_period: usize,
    pub hash_users_cache_capacity: usize,
    pub merge_chunks: bool,
    pub unsafe_ignore_hard_deletes: bool,
    pub sync_only: bool,
    pub min_rest: Duration,
    pub long_rest_warning: Duration,
    /// Set when archiving is enabled
    pub archive: Option<ArchiveSettings>,
}

impl ScavengeSettings {
    pub fn from_config(config: &Configuration) -> Self {
        let scavenge = &config.scavenge;
        Self {
            threads: clamp_threads(scavenge.threads),
            threshold: scavenge.threshold,
            throttle_percent: scavenge.throttle_percent,
            cancellation_check_period: scavenge.cancellation_check_period.max(1),
            checkpoint_period: scavenge.checkpoint_period.max(1),
            hash_users_cache_capacity: scavenge.buffer_pages.max(1),
            merge_chunks: scavenge.merge_chunks,
            unsafe_ignore_hard_deletes: scavenge.unsafe_ignore_hard_deletes,
            sync_only: scavenge.sync_only,
            min_rest: scavenge.min_rest,
            long_rest_warning: scavenge.long_rest_warning,
            archive: config
                .archive
                .enabled
                .then(|| ArchiveSettings::from(&config.archive)),
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = clamp_threads(threads);
        self
    }

    /// Chunks are merged only when archiving does not retire them
    pub fn merging_enabled(&self) -> bool {
        self.merge_chunks && self.archive.is_none()
    }
}

/// Clamp the number of chunk execution threads to 1..=MAX_THREADS
pub fn clamp_threads(threads: usize) -> usize {
    let clamped = threads.clamp(1, MAX_THREADS);
    if clamped != threads {
        tracing::warn!(
            requested = threads,
            using = clamped,
            "Scavenge threads out of range, clamping"
        );
    }
    clamped
}
