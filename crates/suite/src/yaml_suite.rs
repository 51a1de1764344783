//! YAML-backed implementation of the runner's suite contracts

use async_trait::async_trait;
use nightshift_common::{Error, Result, Settings, SuiteResults, TestcaseResult, UncaughtError};
use nightshift_runner::{Runnable, SessionHandle, SuiteFactory, TestSuite};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{StepError, StepResult};
use crate::playwright::{step_to_js, BrowserSession, SessionLauncher, SessionOptions};
use crate::spec::{Step, SuiteSpec, TestcaseSpec};

/// The step a suite is executing right now
pub struct StepRunnable {
    label: String,
    token: CancellationToken,
    reason: Mutex<Option<String>>,
    done: watch::Sender<bool>,
}

impl StepRunnable {
    fn new(label: String, token: CancellationToken) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            label,
            token,
            reason: Mutex::new(None),
            done,
        }
    }

    fn reason(&self) -> String {
        self.reason
            .lock()
            .clone()
            .unwrap_or_else(|| "suite terminated".to_string())
    }

    fn mark_done(&self) {
        self.done.send_replace(true);
    }
}

#[async_trait]
impl Runnable for StepRunnable {
    fn name(&self) -> &str {
        &self.label
    }

    async fn abort(&self, error: &UncaughtError) -> Result<()> {
        *self.reason.lock() = Some(error.to_string());
        self.token.cancel();

        let mut done = self.done.subscribe();
        done.wait_for(|done| *done)
            .await
            .map_err(|_| Error::Internal(format!("step {} vanished while aborting", self.label)))?;
        debug!(step = %self.label, "step unwound after abort");
        Ok(())
    }
}

/// Marks a step unwound however its future ends, including being dropped
struct Unwound(Arc<StepRunnable>);

impl Drop for Unwound {
    fn drop(&mut self) {
        self.0.mark_done();
    }
}

pub struct YamlSuite {
    name: String,
    path: PathBuf,
    env: Option<String>,
    spec: OnceCell<SuiteSpec>,
    launcher: Arc<SessionLauncher>,
    options: SessionOptions,
    sessions_enabled: bool,
    browser: Mutex<Option<Arc<BrowserSession>>>,
    handle: Mutex<Option<SessionHandle>>,
    runnable: Mutex<Option<Arc<StepRunnable>>>,
    queue_emptied: AtomicBool,
    cancel: CancellationToken,
    results: Mutex<SuiteResults>,
}

impl YamlSuite {
    fn new(path: &Path, factory: &YamlSuiteFactory) -> Self {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mut results = SuiteResults::new(name.clone(), path);
        results.env = factory.env.clone();

        Self {
            name,
            path: path.to_path_buf(),
            env: factory.env.clone(),
            spec: OnceCell::new(),
            launcher: factory.launcher.clone(),
            options: factory.options.clone(),
            sessions_enabled: factory.sessions_enabled,
            browser: Mutex::new(None),
            handle: Mutex::new(None),
            runnable: Mutex::new(None),
            queue_emptied: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            results: Mutex::new(results),
        }
    }

    fn stopped(&self) -> bool {
        self.queue_emptied.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    async fn open_session(&self) -> Result<()> {
        let browser = match self.launcher.open(&self.options).await {
            Ok(browser) => browser,
            Err(e) => {
                let message = format!("failed to start browser session: {}", e);
                let mut results = self.results.lock();
                results.errors += 1;
                results.last_error = Some(message.clone());
                return Err(Error::Session(message));
            }
        };

        *self.handle.lock() = Some(SessionHandle {
            session_id: browser.id().to_string(),
            start_session_enabled: true,
        });
        *self.browser.lock() = Some(Arc::new(browser));
        Ok(())
    }

    async fn run_testcase(&self, testcase: &TestcaseSpec) -> TestcaseResult {
        let started = Instant::now();
        let mut result = TestcaseResult {
            name: testcase.name.clone(),
            ..Default::default()
        };

        for step in &testcase.steps {
            if self.stopped() {
                result.error = Some("run stopped before step ".to_string() + &step.label());
                break;
            }
            result.steps_run += 1;
            if let Err(e) = self.run_step(step).await {
                warn!(suite = %self.name, testcase = %testcase.name, "{}", e);
                result.error = Some(e.to_string());
                break;
            }
        }

        result.passed = result.error.is_none();
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn run_step(&self, step: &Step) -> StepResult<()> {
        let runnable = Arc::new(StepRunnable::new(step.label(), self.cancel.child_token()));
        *self.runnable.lock() = Some(runnable.clone());
        let _unwound = Unwound(runnable.clone());

        debug!(
            suite = %self.name,
            step = %runnable.label,
            native = step.is_native(),
            "step started"
        );
        let outcome = tokio::select! {
            biased;
            _ = runnable.token.cancelled() => Err(StepError::Aborted(runnable.reason())),
            outcome = self.execute(step) => outcome,
        };

        *self.runnable.lock() = None;
        outcome
    }

    async fn execute(&self, step: &Step) -> StepResult<()> {
        match step {
            Step::Sleep { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(())
            }
            Step::Log { message } => {
                info!(suite = %self.name, "[TEST LOG] {}", message);
                Ok(())
            }
            _ => {
                let browser = self.browser.lock().clone().ok_or_else(|| {
                    StepError::NoSession(format!("{} needs a browser", step.label()))
                })?;
                browser
                    .exec(&step.label(), &step_to_js(step, &self.options.screenshot_dir))
                    .await
            }
        }
    }
}

#[async_trait]
impl TestSuite for YamlSuite {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self) -> Result<()> {
        let spec = SuiteSpec::from_file(&self.path)?;
        self.results.lock().name = spec.name.clone();
        self.spec
            .set(spec)
            .map_err(|_| Error::suite_init(&self.path, "suite initialized twice"))
    }

    async fn run(&self) -> Result<()> {
        let spec = self
            .spec
            .get()
            .ok_or_else(|| Error::Internal(format!("suite {} ran before init", self.name)))?;

        info!(suite = %spec.name, env = ?self.env, "running {} testcase(s)", spec.testcases.len());
        if self.sessions_enabled {
            self.open_session().await?;
        }

        for testcase in &spec.testcases {
            let result = if testcase.skip || self.stopped() {
                TestcaseResult {
                    name: testcase.name.clone(),
                    skipped: true,
                    ..Default::default()
                }
            } else {
                self.run_testcase(testcase).await
            };
            self.results.lock().push(result);
        }
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.cancel.cancel();
        self.handle.lock().take();
        let browser = self.browser.lock().take();
        if let Some(browser) = browser {
            info!(suite = %self.name, session = %browser.id(), "closing browser session");
            browser.close().await?;
        }
        Ok(())
    }

    fn empty_queue(&self) {
        self.queue_emptied.store(true, Ordering::SeqCst);
    }

    fn current_runnable(&self) -> Option<Arc<dyn Runnable>> {
        self.runnable
            .lock()
            .clone()
            .map(|runnable| runnable as Arc<dyn Runnable>)
    }

    fn session(&self) -> Option<SessionHandle> {
        self.handle.lock().clone()
    }

    fn export_results(&self) -> SuiteResults {
        self.results.lock().clone()
    }
}

/// Builds [`YamlSuite`]s sharing one browser configuration
pub struct YamlSuiteFactory {
    launcher: Arc<SessionLauncher>,
    options: SessionOptions,
    sessions_enabled: bool,
    env: Option<String>,
}

impl YamlSuiteFactory {
    /// `endpoint` is the driver server suites connect to, when one was started
    pub fn new(settings: &Settings, env: Option<&str>, endpoint: Option<String>) -> Self {
        Self {
            launcher: Arc::new(SessionLauncher::default()),
            options: SessionOptions::from_config(&settings.browser_for(env), endpoint),
            sessions_enabled: settings.sessions_enabled(),
            env: env.map(str::to_string),
        }
    }

    pub fn with_launcher(mut self, launcher: SessionLauncher) -> Self {
        self.launcher = Arc::new(launcher);
        self
    }
}

impl SuiteFactory for YamlSuiteFactory {
    fn create(&self, module_path: &Path, all_paths: &[PathBuf]) -> Result<Arc<dyn TestSuite>> {
        debug!(
            path = %module_path.display(),
            of = all_paths.len(),
            "creating suite"
        );
        if !module_path.is_file() {
            return Err(Error::suite_init(module_path, "no such suite file"));
        }
        Ok(Arc::new(YamlSuite::new(module_path, self)))
    }
}
