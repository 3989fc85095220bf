//! Test utilities shared by the workspace crates.
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! common = { path = "../common", features = ["testing"] }
//! ```

mod config_builder;

pub use config_builder::TestConfigBuilder;

/// Install a fmt subscriber writing through the test harness.
///
/// Safe to call from every test; only the first call installs the subscriber.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
