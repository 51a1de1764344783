//! Nightshift Common Library
//!
//! Shared error type, configuration and result data model for the
//! Nightshift test runner.

pub mod config;
pub mod error;
pub mod results;

// Re-export commonly used types
pub use config::Settings;
pub use error::{Error, Result};
pub use results::{GlobalResults, SuiteResults, TestcaseResult, UncaughtError};

/// Nightshift version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "nightshift.toml";

/// Environment variable set on every spawned worker process
pub const WORKER_ID_ENV: &str = "NIGHTSHIFT_WORKER_ID";
