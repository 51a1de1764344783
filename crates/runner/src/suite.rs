//! Suite engine contracts
//!
//! The coordinator drives suites only through these traits. Methods take
//! `&self` because the lifecycle guard reads and aborts a suite while its
//! `run()` future is still in flight.

use async_trait::async_trait;
use nightshift_common::{Result, SuiteResults, UncaughtError};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The step currently executing inside a suite
#[async_trait]
pub trait Runnable: Send + Sync {
    fn name(&self) -> &str;

    /// Requests the step to stop; resolves once it has unwound
    async fn abort(&self, error: &UncaughtError) -> Result<()>;
}

/// Live browser session held by a suite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: String,
    /// The suite opened this session itself and is responsible for closing it
    pub start_session_enabled: bool,
}

/// One test suite bound to one browser session
#[async_trait]
pub trait TestSuite: Send + Sync {
    fn name(&self) -> &str;

    /// Loads and validates the suite module
    fn init(&self) -> Result<()>;

    /// Runs every queued step; test failures are recorded, not returned
    async fn run(&self) -> Result<()>;

    /// Stops the suite and closes its session
    async fn terminate(&self) -> Result<()>;

    /// Drops queued steps that have not started yet
    fn empty_queue(&self);

    fn current_runnable(&self) -> Option<Arc<dyn Runnable>>;

    fn session(&self) -> Option<SessionHandle>;

    fn export_results(&self) -> SuiteResults;
}

/// Builds suites from module paths
pub trait SuiteFactory: Send + Sync {
    fn create(&self, module_path: &Path, all_paths: &[PathBuf]) -> Result<Arc<dyn TestSuite>>;
}
