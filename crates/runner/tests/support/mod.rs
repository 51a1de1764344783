//! Scripted collaborators for coordinator and guard tests.
//!
//! Every mock appends to one shared call log so tests can assert on the
//! exact order of side effects.

#![allow(dead_code)]

use async_trait::async_trait;
use nightshift_common::{Error, Result, SuiteResults, TestcaseResult, UncaughtError};
use nightshift_runner::{
    DriverInstances, EventSender, GlobalReporter, HostProcess, ProcessLifecycleGuard, ResultAggregator,
    RunCoordinator, RunOptions, Runnable, SessionHandle, SuiteFactory, TestSuite, WorkerPool,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| e.as_str() == entry).count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }

    /// Entries starting with `prefix`, prefix stripped
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Pass,
    Fail,
    Error,
    InitError,
    /// Blocks inside a step until that step is aborted
    Hang,
    /// Panics after its session is open
    Panic,
}

pub struct MockRunnable {
    name: String,
    log: CallLog,
    release: Arc<Notify>,
}

#[async_trait]
impl Runnable for MockRunnable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn abort(&self, error: &UncaughtError) -> Result<()> {
        self.log.push(format!("abort:{}", self.name));
        self.log.push(format!("abort_reason:{}", error.message));
        self.release.notify_one();
        Ok(())
    }
}

pub struct MockSuite {
    name: String,
    path: PathBuf,
    behavior: Behavior,
    close_fails: bool,
    log: CallLog,
    runnable: Mutex<Option<Arc<MockRunnable>>>,
    session: Mutex<Option<SessionHandle>>,
    results: Mutex<SuiteResults>,
}

#[async_trait]
impl TestSuite for MockSuite {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self) -> Result<()> {
        self.log.push(format!("init:{}", self.name));
        if self.behavior == Behavior::InitError {
            return Err(Error::InvalidConfig("module exports nothing".to_string()));
        }
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        self.log.push(format!("run:{}", self.name));
        *self.session.lock() = Some(SessionHandle {
            session_id: format!("session-{}", self.name),
            start_session_enabled: true,
        });

        let testcase = |passed: bool, error: Option<&str>| TestcaseResult {
            name: format!("{} case", self.name),
            passed,
            error: error.map(str::to_string),
            ..Default::default()
        };

        match self.behavior {
            Behavior::Pass => self.results.lock().push(testcase(true, None)),
            Behavior::Fail => self.results.lock().push(testcase(false, Some("assertion failed"))),
            Behavior::Error => {
                return Err(Error::SuiteRun {
                    name: self.name.clone(),
                    reason: "hook threw".to_string(),
                })
            }
            Behavior::InitError => unreachable!("init failed"),
            Behavior::Panic => panic!("suite {} lost its page object", self.name),
            Behavior::Hang => {
                let release = Arc::new(Notify::new());
                *self.runnable.lock() = Some(Arc::new(MockRunnable {
                    name: format!("{} step", self.name),
                    log: self.log.clone(),
                    release: release.clone(),
                }));
                release.notified().await;
                *self.runnable.lock() = None;
                self.log.push(format!("unwound:{}", self.name));
                self.results.lock().push(testcase(false, Some("aborted")));
            }
        }
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.log.push(format!("terminate:{}", self.name));
        *self.session.lock() = None;
        if self.close_fails {
            return Err(Error::Session("driver went away".to_string()));
        }
        Ok(())
    }

    fn empty_queue(&self) {
        self.log.push(format!("empty_queue:{}", self.name));
    }

    fn current_runnable(&self) -> Option<Arc<dyn Runnable>> {
        self.runnable
            .lock()
            .clone()
            .map(|runnable| runnable as Arc<dyn Runnable>)
    }

    fn session(&self) -> Option<SessionHandle> {
        self.session.lock().clone()
    }

    fn export_results(&self) -> SuiteResults {
        let mut results = self.results.lock().clone();
        results.module_path = self.path.clone();
        results
    }
}

pub struct MockFactory {
    behaviors: HashMap<PathBuf, Behavior>,
    close_fails: bool,
    log: CallLog,
}

impl SuiteFactory for MockFactory {
    fn create(&self, module_path: &Path, _all_paths: &[PathBuf]) -> Result<Arc<dyn TestSuite>> {
        let name = module_path.display().to_string();
        self.log.push(format!("create:{}", name));
        let behavior = *self
            .behaviors
            .get(module_path)
            .ok_or_else(|| Error::Internal(format!("unknown module {}", name)))?;

        Ok(Arc::new(MockSuite {
            name: name.clone(),
            path: module_path.to_path_buf(),
            behavior,
            close_fails: self.close_fails,
            log: self.log.clone(),
            runnable: Mutex::new(None),
            session: Mutex::new(None),
            results: Mutex::new(SuiteResults::new(name, module_path)),
        }))
    }
}

/// GlobalReporter that logs print/save and can be told to fail saving
pub struct MockAggregator {
    pub inner: GlobalReporter,
    log: CallLog,
    fail_save: bool,
}

#[async_trait]
impl ResultAggregator for MockAggregator {
    fn add_test_suite_results(&self, results: SuiteResults) {
        self.log.push(format!("results:{}", results.name));
        self.inner.add_test_suite_results(results);
    }

    fn register_uncaught_err(&self, error: UncaughtError) {
        self.log.push("uncaught");
        self.inner.register_uncaught_err(error);
    }

    fn has_test_failures(&self) -> bool {
        self.inner.has_test_failures()
    }

    fn print(&self) {
        self.log.push("print");
    }

    async fn save(&self) -> Result<()> {
        self.log.push("save");
        if self.fail_save {
            return Err(Error::Report("disk full".to_string()));
        }
        Ok(())
    }
}

pub struct MockDrivers {
    log: CallLog,
    fail: bool,
}

#[async_trait]
impl DriverInstances for MockDrivers {
    async fn stop_instances(&self) -> Result<()> {
        self.log.push("stop_instances");
        if self.fail {
            return Err(Error::WebDriver("already gone".to_string()));
        }
        Ok(())
    }
}

pub struct RecordingHost {
    log: CallLog,
    pub exits: Mutex<Vec<i32>>,
}

impl HostProcess for RecordingHost {
    fn exit(&self, code: i32) {
        self.log.push(format!("exit:{}", code));
        self.exits.lock().push(code);
    }
}

/// Worker pool that replays canned worker results
pub struct MockPool {
    pub results: Vec<SuiteResults>,
    pub exit_code: i32,
    log: CallLog,
}

#[async_trait]
impl WorkerPool for MockPool {
    async fn run_multiple(
        &self,
        test_envs: &[String],
        modules: &[PathBuf],
        aggregator: Arc<dyn ResultAggregator>,
    ) -> Result<i32> {
        self.log.push(format!("run_multiple:{}x{}", test_envs.len(), modules.len()));
        for results in &self.results {
            aggregator.add_test_suite_results(results.clone());
        }
        Ok(self.exit_code)
    }
}

#[derive(Default, Clone, Copy)]
pub struct HarnessOptions {
    pub close_fails: bool,
    pub fail_save: bool,
    pub fail_drivers: bool,
    pub test_worker: bool,
    pub sessions_disabled: bool,
}

pub struct Harness {
    pub log: CallLog,
    pub coordinator: Arc<RunCoordinator>,
    pub guard: Arc<ProcessLifecycleGuard>,
    pub aggregator: Arc<MockAggregator>,
    pub host: Arc<RecordingHost>,
    pub paths: Vec<PathBuf>,
}

impl Harness {
    pub fn new(suites: &[(&str, Behavior)]) -> Self {
        Self::with_options(suites, HarnessOptions::default(), None)
    }

    pub fn with_options(
        suites: &[(&str, Behavior)],
        options: HarnessOptions,
        pool: Option<MockPool>,
    ) -> Self {
        let log = CallLog::default();
        let paths: Vec<PathBuf> = suites.iter().map(|(name, _)| PathBuf::from(name)).collect();

        let factory = Arc::new(MockFactory {
            behaviors: suites
                .iter()
                .map(|(name, behavior)| (PathBuf::from(name), *behavior))
                .collect(),
            close_fails: options.close_fails,
            log: log.clone(),
        });
        let aggregator = Arc::new(MockAggregator {
            inner: GlobalReporter::new("unused"),
            log: log.clone(),
            fail_save: options.fail_save,
        });

        let mut coordinator = RunCoordinator::new(
            factory,
            aggregator.clone(),
            RunOptions {
                test_worker: options.test_worker,
                close_sessions: !options.sessions_disabled,
            },
        );
        if let Some(pool) = pool {
            coordinator = coordinator.with_worker_pool(Arc::new(pool));
        }
        let coordinator = Arc::new(coordinator);

        let host = Arc::new(RecordingHost {
            log: log.clone(),
            exits: Mutex::new(Vec::new()),
        });
        let guard = Arc::new(ProcessLifecycleGuard::new(
            Arc::new(MockDrivers {
                log: log.clone(),
                fail: options.fail_drivers,
            }),
            host.clone(),
        ));
        guard.bind_coordinator(coordinator.clone());

        Self {
            log,
            coordinator,
            guard,
            aggregator,
            host,
            paths,
        }
    }

    pub fn pool(&self, results: Vec<SuiteResults>, exit_code: i32) -> MockPool {
        MockPool {
            results,
            exit_code,
            log: self.log.clone(),
        }
    }

    /// Starts `run()` on its own task
    pub fn spawn_run(&self) -> tokio::task::JoinHandle<bool> {
        let coordinator = self.coordinator.clone();
        let paths = self.paths.clone();
        tokio::spawn(async move { coordinator.run(&paths).await })
    }

    /// Starts `run()` on a task whose panic or error is reported to the guard
    pub fn spawn_watched_run(&self, sender: &EventSender) {
        let coordinator = self.coordinator.clone();
        let paths = self.paths.clone();
        let run = tokio::spawn(async move {
            coordinator.run(&paths).await;
            Ok::<(), anyhow::Error>(())
        });
        sender.watch(run);
    }

    /// Waits until a suite is blocked inside a step
    pub async fn wait_for_runnable(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(suite) = self.coordinator.current_suite() {
                    if suite.current_runnable().is_some() {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("a suite never reached a blocking step");
    }

    pub fn uncaught_errors(&self) -> Vec<UncaughtError> {
        self.aggregator.inner.results().uncaught_errors
    }

    pub fn exits(&self) -> Vec<i32> {
        self.host.exits.lock().clone()
    }
}
