use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "EVENTLOG__";

/// Default configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "eventlog.toml";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// DSN of the scavenge state database.
    ///
    /// Env: EVENTLOG__DATABASE__DSN
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl DatabaseConfig {
    /// In-memory scavenge state, lost when the run's connection pool closes
    pub fn in_memory() -> Self {
        Self {
            dsn: String::from("sqlite::memory:"),
        }
    }

    /// Scavenge state persisted in a sqlite file
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            dsn: format!("sqlite://{}", path.as_ref().display()),
        }
    }
}

/// Settings for a scavenge run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScavengeConfig {
    /// Number of chunks rewritten in parallel. Clamped to 1..=4.
    ///
    /// Env: EVENTLOG__SCAVENGE__THREADS
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Weight a chunk must exceed before it is rewritten.
    /// Negative values rewrite every chunk.
    ///
    /// Env: EVENTLOG__SCAVENGE__THRESHOLD
    #[serde(default)]
    pub threshold: i32,

    /// Share of wall clock time the scavenge may spend working.
    ///
    /// Env: EVENTLOG__SCAVENGE__THROTTLE_PERCENT
    #[serde(default = "default_throttle_percent")]
    pub throttle_percent: u8,

    /// Number of records between cancellation checks.
    ///
    /// Env: EVENTLOG__SCAVENGE__CANCELLATION_CHECK_PERIOD
    #[serde(default = "default_cancellation_check_period")]
    pub cancellation_check_period: usize,

    /// Number of streams calculated per checkpointed batch.
    ///
    /// Env: EVENTLOG__SCAVENGE__CHECKPOINT_PERIOD
    #[serde(default = "default_checkpoint_period")]
    pub checkpoint_period: usize,

    /// Capacity of the hash users cache.
    ///
    /// Env: EVENTLOG__SCAVENGE__BUFFER_PAGES
    #[serde(default = "default_buffer_pages")]
    pub buffer_pages: usize,

    /// Merge small chunks after execution. Ignored when archiving is enabled.
    ///
    /// Env: EVENTLOG__SCAVENGE__MERGE_CHUNKS
    #[serde(default = "default_merge_chunks")]
    pub merge_chunks: bool,

    /// Discard tombstoned streams entirely, tombstone included. Irreversible.
    ///
    /// Env: EVENTLOG__SCAVENGE__UNSAFE_IGNORE_HARD_DELETES
    #[serde(default)]
    pub unsafe_ignore_hard_deletes: bool,

    /// Only complete pending work, never create a new scavenge point.
    ///
    /// Env: EVENTLOG__SCAVENGE__SYNC_ONLY
    #[serde(default)]
    pub sync_only: bool,

    /// Shortest rest the throttle takes.
    ///
    /// Env: EVENTLOG__SCAVENGE__MIN_REST
    #[serde(with = "humantime_serde", default = "default_min_rest")]
    pub min_rest: Duration,

    /// Rests longer than this are logged.
    ///
    /// Env: EVENTLOG__SCAVENGE__LONG_REST_WARNING
    #[serde(with = "humantime_serde", default = "default_long_rest_warning")]
    pub long_rest_warning: Duration,
}

fn default_threads() -> usize {
    1
}

fn default_throttle_percent() -> u8 {
    100
}

fn default_cancellation_check_period() -> usize {
    1024
}

fn default_checkpoint_period() -> usize {
    32_768
}

fn default_buffer_pages() -> usize {
    4096
}

fn default_merge_chunks() -> bool {
    true
}

fn default_min_rest() -> Duration {
    Duration::from_millis(1)
}

fn default_long_rest_warning() -> Duration {
    Duration::from_secs(5)
}

impl Default for ScavengeConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            threshold: 0,
            throttle_percent: default_throttle_percent(),
            cancellation_check_period: default_cancellation_check_period(),
            checkpoint_period: default_checkpoint_period(),
            buffer_pages: default_buffer_pages(),
            merge_chunks: default_merge_chunks(),
            unsafe_ignore_hard_deletes: false,
            sync_only: false,
            min_rest: default_min_rest(),
            long_rest_warning: default_long_rest_warning(),
        }
    }
}

impl ScavengeConfig {
    /// Validate the scavenge configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.throttle_percent == 0 || self.throttle_percent > 100 {
            return Err(ConfigError::InvalidThrottlePercent(self.throttle_percent));
        }
        if self.cancellation_check_period == 0 {
            return Err(ConfigError::ZeroValue("cancellation_check_period"));
        }
        if self.checkpoint_period == 0 {
            return Err(ConfigError::ZeroValue("checkpoint_period"));
        }
        if self.buffer_pages == 0 {
            return Err(ConfigError::ZeroValue("buffer_pages"));
        }
        Ok(())
    }
}

/// Archive backed retention of old chunks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Retire archived chunks instead of merging them.
    ///
    /// Env: EVENTLOG__ARCHIVE__ENABLED
    #[serde(default)]
    pub enabled: bool,

    /// Object store holding the archive.
    ///
    /// Env: EVENTLOG__ARCHIVE__DSN
    #[serde(default = "default_archive_dsn")]
    pub dsn: String,

    /// Object in the archive store holding the archived log position.
    ///
    /// Env: EVENTLOG__ARCHIVE__CHECKPOINT_OBJECT
    #[serde(default = "default_checkpoint_object")]
    pub checkpoint_object: String,

    /// Minimum age of a chunk's newest record before it may leave local storage.
    ///
    /// Env: EVENTLOG__ARCHIVE__RETAIN_PERIOD
    #[serde(with = "humantime_serde", default)]
    pub retain_period: Duration,

    /// Bytes of log kept locally behind the scavenge point.
    ///
    /// Env: EVENTLOG__ARCHIVE__RETAIN_BYTES
    #[serde(default)]
    pub retain_bytes: u64,

    /// Delete archived chunks instead of replacing them with a remote locator.
    ///
    /// Env: EVENTLOG__ARCHIVE__DELETE_LOCAL_CHUNKS
    #[serde(default)]
    pub delete_local_chunks: bool,

    /// Attempts at confirming a chunk is archived before giving up.
    ///
    /// Env: EVENTLOG__ARCHIVE__MAX_ATTEMPTS
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between archive confirmation attempts.
    ///
    /// Env: EVENTLOG__ARCHIVE__RETRY_DELAY
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub retry_delay: Duration,
}

fn default_archive_dsn() -> String {
    String::from("memory://")
}

fn default_checkpoint_object() -> String {
    String::from("archive.chk")
}

fn default_max_attempts() -> u32 {
    10
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dsn: default_archive_dsn(),
            checkpoint_object: default_checkpoint_object(),
            retain_period: Duration::ZERO,
            retain_bytes: 0,
            delete_local_chunks: false,
            max_attempts: default_max_attempts(),
            retry_delay: default_retry_delay(),
        }
    }
}

impl ArchiveConfig {
    /// Validate the archive configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroValue("max_attempts"));
        }
        if self.checkpoint_object.is_empty() {
            return Err(ConfigError::EmptyValue("checkpoint_object"));
        }
        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Throttle percent must be between 1 and 100, got {0}")]
    InvalidThrottlePercent(u8),

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("{0} must not be empty")]
    EmptyValue(&'static str),
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scavenge: ScavengeConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
}

impl Configuration {
    fn figment(config_file: &Path) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::load_from_path(CONFIG_FILE)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        let config = Self::figment(path.as_ref())
            .extract::<Configuration>()
            .map_err(Box::new)?;

        Ok(config)
    }

    /// Run all section validations
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scavenge.validate()?;
        self.archive.validate()?;
        Ok(())
    }
}
