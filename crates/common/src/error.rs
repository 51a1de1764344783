//! Error types for Nightshift

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias using Nightshift Error
pub type Result<T> = std::result::Result<T, Error>;

/// Nightshift error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Error while loading suite {path}: {reason}")]
    SuiteInit { path: PathBuf, reason: String },

    #[error("Suite {name} failed: {reason}")]
    SuiteRun { name: String, reason: String },

    #[error("Step aborted: {0}")]
    Aborted(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Report error: {0}")]
    Report(String),

    #[error("WebDriver error: {0}")]
    WebDriver(String),

    #[error("Worker {id} failed: {reason}")]
    Worker { id: usize, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wraps a suite construction failure into the standard runner error.
    pub fn suite_init(path: &Path, err: impl std::fmt::Display) -> Self {
        Error::SuiteInit {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }

    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::InvalidConfig(_) => "invalid_config",
            Error::SuiteInit { .. } => "suite_init",
            Error::SuiteRun { .. } => "suite_run",
            Error::Aborted(_) => "aborted",
            Error::Session(_) => "session",
            Error::Report(_) => "report",
            Error::WebDriver(_) => "webdriver",
            Error::Worker { .. } => "worker",
            Error::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_init_keeps_path_and_reason() {
        let err = Error::suite_init(Path::new("tests/login.yaml"), "missing field `name`");
        assert_eq!(
            err.to_string(),
            "Error while loading suite tests/login.yaml: missing field `name`"
        );
        assert_eq!(err.as_label(), "suite_init");
    }
}
