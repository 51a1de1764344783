//! Multi-process execution
//!
//! The parent re-invokes its own executable once per worker with
//! `--test-worker`, hands each worker its suites on the command line and
//! reads results back as JSON lines on the worker's stdout.
//!
//! ```text
//!  parent ──spawn(--test-worker --env E paths..)──► worker N
//!    ▲                                                │
//!    └──── {"type":"suite_results",...}\n ◄───────────┤ stdout
//!    └──── {"type":"uncaught_error",...}\n ◄──────────┤
//!    └──── exit status ◄──────────────────────────────┘
//! ```

use async_trait::async_trait;
use futures::future::join_all;
use nightshift_common::{Error, Result, SuiteResults, UncaughtError, WORKER_ID_ENV};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::driver::DriverRegistry;
use crate::reporter::ResultAggregator;

/// Spawns workers and merges their results into the aggregator
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Resolves with the combined exit code once every worker has exited
    async fn run_multiple(
        &self,
        test_envs: &[String],
        modules: &[PathBuf],
        aggregator: Arc<dyn ResultAggregator>,
    ) -> Result<i32>;
}

/// One line of the worker → parent protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    SuiteResults { results: SuiteResults },
    UncaughtError { error: UncaughtError },
}

impl WorkerMessage {
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }

    fn deliver(self, aggregator: &dyn ResultAggregator) {
        match self {
            WorkerMessage::SuiteResults { results } => aggregator.add_test_suite_results(results),
            WorkerMessage::UncaughtError { error } => aggregator.register_uncaught_err(error),
        }
    }
}

/// Suites assigned to one worker, in execution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAssignment {
    pub id: usize,
    pub env: String,
    pub modules: Vec<PathBuf>,
}

/// Splits the run across workers.
///
/// Several environments get one worker each running every suite. A single
/// environment deals suites round-robin over at most `max_workers` workers.
pub fn plan_workers(
    test_envs: &[String],
    modules: &[PathBuf],
    max_workers: usize,
) -> Vec<WorkerAssignment> {
    if modules.is_empty() {
        return Vec::new();
    }

    if test_envs.len() > 1 {
        return test_envs
            .iter()
            .enumerate()
            .map(|(id, env)| WorkerAssignment {
                id,
                env: env.clone(),
                modules: modules.to_vec(),
            })
            .collect();
    }

    let env = test_envs
        .first()
        .cloned()
        .unwrap_or_else(|| "default".to_string());
    let count = max_workers.clamp(1, modules.len());
    let mut assignments: Vec<WorkerAssignment> = (0..count)
        .map(|id| WorkerAssignment {
            id,
            env: env.clone(),
            modules: Vec::new(),
        })
        .collect();

    for (idx, module) in modules.iter().enumerate() {
        assignments[idx % count].modules.push(module.clone());
    }
    assignments
}

/// How one worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub id: usize,
    /// None when the worker was killed by a signal
    pub code: Option<i32>,
    pub messages: usize,
}

impl WorkerExit {
    fn from_status(id: usize, status: ExitStatus, messages: usize) -> Self {
        Self {
            id,
            code: status.code(),
            messages,
        }
    }

    pub fn crashed(&self) -> bool {
        self.code.is_none()
    }
}

/// Combined exit code: the highest worker code, a crash counting as 1
pub fn combine_exit_codes(exits: &[WorkerExit]) -> i32 {
    exits
        .iter()
        .map(|exit| exit.code.unwrap_or(1))
        .max()
        .unwrap_or(0)
}

/// Whether this process was spawned by a [`ProcessWorkerPool`]
pub fn is_child_process() -> bool {
    std::env::var_os(WORKER_ID_ENV).is_some()
}

/// Keeps a worker listed for shutdown until it has been reaped
struct TrackedWorker {
    registry: Arc<DriverRegistry>,
    pid: u32,
}

impl TrackedWorker {
    fn new(registry: Arc<DriverRegistry>, pid: u32) -> Self {
        registry.track_worker(pid);
        Self { registry, pid }
    }
}

impl Drop for TrackedWorker {
    fn drop(&mut self) {
        self.registry.release_worker(self.pid);
    }
}

/// Worker pool backed by OS processes
pub struct ProcessWorkerPool {
    program: PathBuf,
    base_args: Vec<String>,
    max_workers: usize,
    instances: Option<Arc<DriverRegistry>>,
}

impl ProcessWorkerPool {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<String>, max_workers: usize) -> Self {
        Self {
            program: program.into(),
            base_args,
            max_workers,
            instances: None,
        }
    }

    /// Lists every spawned worker in `registry` so the lifecycle guard
    /// stops them with the driver servers
    pub fn with_instances(mut self, registry: Arc<DriverRegistry>) -> Self {
        self.instances = Some(registry);
        self
    }

    /// Re-invokes the running executable as workers
    pub fn current_exe(base_args: Vec<String>, max_workers: usize) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, base_args, max_workers))
    }

    fn command(&self, assignment: &WorkerAssignment) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("--test-worker")
            .arg("--env")
            .arg(&assignment.env)
            .args(&assignment.modules)
            .env(WORKER_ID_ENV, assignment.id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }

    async fn run_worker(
        &self,
        assignment: WorkerAssignment,
        aggregator: Arc<dyn ResultAggregator>,
    ) -> Result<WorkerExit> {
        let id = assignment.id;
        let mut child = self.command(&assignment).spawn().map_err(|e| Error::Worker {
            id,
            reason: format!("failed to spawn {}: {}", self.program.display(), e),
        })?;
        let _tracked = match (&self.instances, child.id()) {
            (Some(registry), Some(pid)) => Some(TrackedWorker::new(registry.clone(), pid)),
            _ => None,
        };

        info!(
            worker = id,
            env = %assignment.env,
            suites = assignment.modules.len(),
            "worker started"
        );

        let mut messages = 0;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                match WorkerMessage::parse(&line) {
                    Some(message) => {
                        messages += 1;
                        message.deliver(aggregator.as_ref());
                    }
                    None if line.trim().is_empty() => {}
                    None => debug!(worker = id, "{}", line),
                }
            }
        }

        let status = child.wait().await?;
        let exit = WorkerExit::from_status(id, status, messages);

        if exit.crashed() {
            error!(worker = id, "worker crashed: {}", status);
            aggregator.register_uncaught_err(UncaughtError::new(format!(
                "worker {} ({}) crashed: {}",
                id, assignment.env, status
            )));
        } else {
            info!(worker = id, code = exit.code, messages, "worker finished");
        }
        Ok(exit)
    }
}

#[async_trait]
impl WorkerPool for ProcessWorkerPool {
    async fn run_multiple(
        &self,
        test_envs: &[String],
        modules: &[PathBuf],
        aggregator: Arc<dyn ResultAggregator>,
    ) -> Result<i32> {
        let plan = plan_workers(test_envs, modules, self.max_workers);
        info!("Launching {} worker(s) for {} suite(s)", plan.len(), modules.len());

        let runs = plan
            .into_iter()
            .map(|assignment| self.run_worker(assignment, aggregator.clone()));

        let mut exits = Vec::new();
        let mut first_error = None;
        for outcome in join_all(runs).await {
            match outcome {
                Ok(exit) => exits.push(exit),
                Err(e) => {
                    warn!("{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(combine_exit_codes(&exits))
    }
}

/// Aggregator used inside a worker process.
///
/// Records locally (for the worker's own verdict) and streams every result
/// to the parent over stdout.
pub struct WorkerReporter<A> {
    inner: A,
}

impl<A: ResultAggregator> WorkerReporter<A> {
    pub fn new(inner: A) -> Self {
        Self { inner }
    }

    fn emit(&self, message: &WorkerMessage) {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                error!("failed to encode worker message: {}", e);
                return;
            }
        };
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            error!("failed to send worker message: {}", e);
        }
    }
}

#[async_trait]
impl<A: ResultAggregator> ResultAggregator for WorkerReporter<A> {
    fn add_test_suite_results(&self, results: SuiteResults) {
        self.emit(&WorkerMessage::SuiteResults {
            results: results.clone(),
        });
        self.inner.add_test_suite_results(results);
    }

    fn register_uncaught_err(&self, error: UncaughtError) {
        self.emit(&WorkerMessage::UncaughtError {
            error: error.clone(),
        });
        self.inner.register_uncaught_err(error);
    }

    fn has_test_failures(&self) -> bool {
        self.inner.has_test_failures()
    }

    fn print(&self) {
        self.inner.print();
    }

    async fn save(&self) -> Result<()> {
        self.inner.save().await
    }
}
