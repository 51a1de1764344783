//! Step execution errors

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StepError {
    #[error("No browser session: {0}")]
    NoSession(String),

    #[error("Browser session failed: {0}")]
    Session(String),

    #[error("Step failed: {step} - {reason}")]
    Failed { step: String, reason: String },

    #[error("Step aborted: {0}")]
    Aborted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StepResult<T> = Result<T, StepError>;

impl From<StepError> for nightshift_common::Error {
    fn from(err: StepError) -> Self {
        match err {
            StepError::Aborted(reason) => nightshift_common::Error::Aborted(reason),
            StepError::Io(e) => nightshift_common::Error::Io(e),
            other => nightshift_common::Error::Session(other.to_string()),
        }
    }
}
