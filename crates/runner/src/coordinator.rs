//! Run coordinator
//!
//! Sequences suite execution (or hands it to a [`WorkerPool`]), owns the
//! single "current suite" slot the lifecycle guard reads, and performs the
//! close-sessions → report → exit-code sequence.
//!
//! Every suite's session is closed as soon as that suite finishes; the
//! guard closes the in-flight one when a run is torn down early.
//!
//! ```text
//! Idle ──► Running(i of n) ──► ClosingSessions ──► Reporting ──► Done
//!              │                      ▲        └──► Suppressed ──┘
//!              └── abort() ───────────┘
//! ```

use nightshift_common::{Error, Result, UncaughtError};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::concurrency::WorkerPool;
use crate::reporter::ResultAggregator;
use crate::suite::{SuiteFactory, TestSuite};

static NOT_A_FUNCTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w is not a function$").expect("valid regex"));

const NOT_A_FUNCTION_HINT: &str = "- writing an async test case? - keep in mind that commands return a future;\n - writing unit tests? - make sure to specify \"unit_tests_mode = true\" in your config.";

/// Position of one `run()` in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running { index: usize, total: usize },
    ClosingSessions,
    Reporting,
    Suppressed,
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => f.write_str("idle"),
            RunState::Running { index, total } => write!(f, "running {} of {}", index, total),
            RunState::ClosingSessions => f.write_str("closing sessions"),
            RunState::Reporting => f.write_str("reporting"),
            RunState::Suppressed => f.write_str("report suppressed"),
            RunState::Done => f.write_str("done"),
        }
    }
}

/// Behavior switches for one coordinator
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// This process is a worker; the parent prints the global report
    pub test_worker: bool,
    /// Sessions are opened by suites and must be closed by the runner
    pub close_sessions: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            test_worker: false,
            close_sessions: true,
        }
    }
}

/// State of one invocation
#[derive(Debug)]
struct RunSession {
    worklist: VecDeque<PathBuf>,
    full_paths: Vec<PathBuf>,
    publish_report: bool,
    exit_code: i32,
}

impl RunSession {
    fn new(paths: &[PathBuf]) -> Self {
        Self {
            worklist: paths.iter().cloned().collect(),
            full_paths: paths.to_vec(),
            publish_report: true,
            exit_code: 0,
        }
    }
}

/// A started suite plus the latch that makes its termination happen once
#[derive(Clone)]
struct ActiveSuite {
    suite: Arc<dyn TestSuite>,
    closed: Arc<OnceCell<std::result::Result<(), String>>>,
}

impl ActiveSuite {
    fn new(suite: Arc<dyn TestSuite>) -> Self {
        Self {
            suite,
            closed: Arc::new(OnceCell::new()),
        }
    }

    async fn terminate_once(&self) -> Result<()> {
        let suite = self.suite.clone();
        self.closed
            .get_or_init(|| async move { suite.terminate().await.map_err(|e| e.to_string()) })
            .await
            .clone()
            .map_err(Error::Session)
    }
}

/// Drives one test run.
///
/// A coordinator is single-use once aborted: the abort is sticky, so a later
/// `run()` schedules nothing and leaves reporting to the guard.
pub struct RunCoordinator {
    factory: Arc<dyn SuiteFactory>,
    aggregator: Arc<dyn ResultAggregator>,
    pool: Option<Arc<dyn WorkerPool>>,
    options: RunOptions,
    session: Mutex<RunSession>,
    current: Mutex<Option<ActiveSuite>>,
    last: Mutex<Option<ActiveSuite>>,
    state: Mutex<RunState>,
    started: AtomicBool,
    abort: CancellationToken,
}

impl RunCoordinator {
    pub fn new(
        factory: Arc<dyn SuiteFactory>,
        aggregator: Arc<dyn ResultAggregator>,
        options: RunOptions,
    ) -> Self {
        Self {
            factory,
            aggregator,
            pool: None,
            options,
            session: Mutex::new(RunSession::new(&[])),
            current: Mutex::new(None),
            last: Mutex::new(None),
            state: Mutex::new(RunState::Idle),
            started: AtomicBool::new(false),
            abort: CancellationToken::new(),
        }
    }

    pub fn with_worker_pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Main entry point: runs every suite, closes sessions, publishes the
    /// report. Returns whether the run had failures; never fails itself.
    pub async fn run(&self, suite_paths: &[PathBuf]) -> bool {
        self.begin(suite_paths);

        if let Err(e) = self.run_sequential(suite_paths).await {
            warn!(label = e.as_label(), "run interrupted: {}", e);
            self.register_uncaught_err(UncaughtError::from_error(&e));
        }

        self.set_state(RunState::ClosingSessions);
        if let Err(e) = self.close_open_sessions().await {
            warn!("failed to close session: {}", e);
            self.register_uncaught_err(UncaughtError::from_error(&e));
        }

        let has_failures = if self.publish_report() && !self.is_aborted() {
            self.set_state(RunState::Reporting);
            match self.report_results().await {
                Ok(has_failures) => has_failures,
                Err(e) => {
                    warn!("failed to publish report: {}", e);
                    self.register_uncaught_err(UncaughtError::from_error(&e));
                    true
                }
            }
        } else {
            self.set_state(RunState::Suppressed);
            self.aggregator.has_test_failures()
        };

        self.finish(if has_failures { 1 } else { 0 });
        has_failures
    }

    /// Runs suites one at a time, strictly in order.
    ///
    /// Errors returned by a suite's `run()` are registered and the next suite
    /// still starts. Construction failures end the worklist.
    pub async fn run_sequential(&self, suite_paths: &[PathBuf]) -> Result<()> {
        let total = suite_paths.len();
        {
            let mut session = self.session.lock();
            session.worklist = suite_paths.iter().cloned().collect();
            session.full_paths = suite_paths.to_vec();
        }

        let mut index = 0;
        loop {
            if self.is_aborted() {
                info!("Run aborted; skipping remaining suites");
                break;
            }

            let next = self.session.lock().worklist.pop_front();
            let Some(path) = next else { break };

            index += 1;
            self.set_state(RunState::Running { index, total });
            self.run_test_suite(path).await?;
        }
        Ok(())
    }

    async fn run_test_suite(&self, path: PathBuf) -> Result<()> {
        let full_paths = self.session.lock().full_paths.clone();
        let suite = self
            .factory
            .create(&path, &full_paths)
            .and_then(|suite| suite.init().map(|_| suite))
            .map_err(|e| match e {
                e @ Error::SuiteInit { .. } => e,
                e => Error::suite_init(&path, e),
            })?;

        let active = ActiveSuite::new(suite.clone());
        *self.last.lock() = Some(active.clone());
        *self.current.lock() = Some(active.clone());

        debug!(suite = suite.name(), path = %path.display(), "suite started");
        let outcome = suite.run().await;

        self.aggregator.add_test_suite_results(suite.export_results());
        if let Err(e) = outcome {
            warn!(suite = suite.name(), "suite ended with error: {}", e);
            self.register_uncaught_err(UncaughtError::from_error(&e));
        }

        // stays current while closing so an abort meets the same latch
        if let Err(e) = self.close_session(&active).await {
            warn!(suite = suite.name(), "failed to close session: {}", e);
            self.register_uncaught_err(UncaughtError::from_error(&e));
        }
        *self.current.lock() = None;
        Ok(())
    }

    /// Fans suites out over the worker pool and merges the verdict.
    pub async fn run_concurrent(&self, test_envs: &[String], suite_paths: &[PathBuf]) -> Result<i32> {
        let pool = self
            .pool
            .clone()
            .ok_or_else(|| Error::InvalidConfig("concurrent mode requires a worker pool".to_string()))?;

        self.begin(suite_paths);
        self.set_state(RunState::Running {
            index: 0,
            total: suite_paths.len(),
        });

        let outcome = pool
            .run_multiple(test_envs, suite_paths, self.aggregator.clone())
            .await;
        let workers_code = match outcome {
            Ok(code) => code,
            Err(e) => {
                self.finish(1);
                return Err(e);
            }
        };

        self.set_state(RunState::Reporting);
        let has_failures = match self.report_results().await {
            Ok(has_failures) => has_failures,
            Err(e) => {
                self.finish(1);
                return Err(e);
            }
        };

        let code = if has_failures { workers_code.max(1) } else { workers_code };
        self.finish(code);
        Ok(code)
    }

    /// Terminates the current (or last started) suite when it still holds a
    /// session this runner opened. Happens at most once per suite.
    pub async fn close_open_sessions(&self) -> Result<()> {
        let target = self.current.lock().clone().or_else(|| self.last.lock().clone());
        match target {
            Some(active) => self.close_session(&active).await,
            None => Ok(()),
        }
    }

    async fn close_session(&self, active: &ActiveSuite) -> Result<()> {
        if !self.options.close_sessions {
            return Ok(());
        }
        let Some(session) = active.suite.session() else {
            return Ok(());
        };
        if !session.start_session_enabled {
            return Ok(());
        }

        info!("Attempting to close session {}...", session.session_id);
        active.terminate_once().await
    }

    /// Prints and persists the report, unless this is a worker process.
    pub async fn report_results(&self) -> Result<bool> {
        if self.options.test_worker {
            return Ok(self.aggregator.has_test_failures());
        }

        self.aggregator.print();
        self.aggregator.save().await?;
        Ok(self.aggregator.has_test_failures())
    }

    /// Records an error that escaped normal handling, with a hint for the
    /// common "is not a function" misuse.
    pub fn register_uncaught_err(&self, mut error: UncaughtError) {
        if error.detailed.is_none() && NOT_A_FUNCTION.is_match(&error.message) {
            error.detailed = Some(NOT_A_FUNCTION_HINT.to_string());
        }
        self.aggregator.register_uncaught_err(error);
    }

    /// The suite executing right now, if any
    pub fn current_suite(&self) -> Option<Arc<dyn TestSuite>> {
        self.current.lock().as_ref().map(|active| active.suite.clone())
    }

    /// Stops scheduling further suites
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Whether `run()` (or `run_concurrent()`) has been entered
    pub fn has_result(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn publish_report(&self) -> bool {
        self.session.lock().publish_report
    }

    pub fn suppress_report(&self) {
        self.session.lock().publish_report = false;
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub fn exit_code(&self) -> i32 {
        self.session.lock().exit_code
    }

    pub fn aggregator(&self) -> &Arc<dyn ResultAggregator> {
        &self.aggregator
    }

    fn begin(&self, suite_paths: &[PathBuf]) {
        *self.session.lock() = RunSession::new(suite_paths);
        self.current.lock().take();
        self.last.lock().take();
        self.started.store(true, Ordering::SeqCst);
        info!("Running {} suite(s)...", suite_paths.len());
    }

    fn finish(&self, exit_code: i32) {
        self.session.lock().exit_code = exit_code;
        self.set_state(RunState::Done);
    }

    fn set_state(&self, next: RunState) {
        let mut state = self.state.lock();
        let previous = *state;
        debug!(from = %previous, to = %next, "run state");
        *state = next;
    }
}
