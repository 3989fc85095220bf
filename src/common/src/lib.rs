pub mod config;
pub mod database;
pub mod storage;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::Configuration;
