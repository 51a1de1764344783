//! Runner configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Top-level runner settings, loaded from `nightshift.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Folders searched for suite files when no paths are given
    pub src_folders: Vec<PathBuf>,

    /// Where reports are written
    pub output_folder: PathBuf,

    /// Open a browser session for every suite
    pub start_session: bool,

    /// Suites do not need a browser; sessions are never opened
    pub unit_tests_mode: bool,

    /// Parallel worker processes
    pub test_workers: WorkersConfig,

    /// Browser driver server managed by the runner
    pub webdriver: WebDriverConfig,

    /// Browser used by the suite engine
    pub browser: BrowserConfig,

    /// Named test environments overriding browser settings
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            src_folders: vec![PathBuf::from("tests")],
            output_folder: PathBuf::from("tests_output"),
            start_session: true,
            unit_tests_mode: false,
            test_workers: WorkersConfig::default(),
            webdriver: WebDriverConfig::default(),
            browser: BrowserConfig::default(),
            environments: BTreeMap::new(),
        }
    }
}

/// Parallel worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Run suites across worker processes when more than one suite is selected
    pub enabled: bool,

    /// Maximum number of workers (0 = available parallelism)
    pub workers: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            workers: 0,
        }
    }
}

impl WorkersConfig {
    /// Resolves `workers = 0` to the machine's parallelism
    pub fn max_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Browser driver server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDriverConfig {
    /// Spawn the driver server before running suites
    pub start_process: bool,

    /// Driver server binary
    pub server_path: PathBuf,

    /// Extra arguments; `{port}` is replaced with the chosen port
    pub server_args: Vec<String>,

    /// Host the server listens on
    pub host: String,

    /// Port to listen on (None = find free port)
    pub port: Option<u16>,

    /// How long to wait for the server to accept connections
    pub startup_timeout_ms: u64,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            start_process: false,
            server_path: PathBuf::from("npx"),
            server_args: vec![
                "playwright".to_string(),
                "run-server".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
            ],
            host: "127.0.0.1".to_string(),
            port: None,
            startup_timeout_ms: 30_000,
        }
    }
}

/// Browser settings for the suite engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// chromium, firefox or webkit
    pub name: String,
    pub headless: bool,
    pub base_url: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub screenshot_dir: PathBuf,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            name: "chromium".to_string(),
            headless: true,
            base_url: "http://127.0.0.1:8080".to_string(),
            viewport_width: 1280,
            viewport_height: 720,
            screenshot_dir: PathBuf::from("tests_output/screenshots"),
        }
    }
}

/// Per-environment overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub browser: Option<String>,
    pub base_url: Option<String>,
}

const BROWSERS: [&str; 3] = ["chromium", "firefox", "webkit"];

impl Settings {
    /// Load configuration from file; a missing file yields defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let settings: Self = toml::from_str(&content)?;
            Ok(settings)
        } else {
            Ok(Self::default())
        }
    }

    /// Rejects settings the runner cannot honor
    pub fn validate(&self) -> crate::Result<()> {
        if !BROWSERS.contains(&self.browser.name.as_str()) {
            return Err(Error::InvalidConfig(format!(
                "unknown browser '{}', expected one of {:?}",
                self.browser.name, BROWSERS
            )));
        }

        for (name, env) in &self.environments {
            if let Some(browser) = &env.browser {
                if !BROWSERS.contains(&browser.as_str()) {
                    return Err(Error::InvalidConfig(format!(
                        "environment '{}' uses unknown browser '{}'",
                        name, browser
                    )));
                }
            }
        }

        if self.webdriver.start_process && self.webdriver.server_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "webdriver.start_process requires webdriver.server_path".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether suites should open (and later close) browser sessions
    pub fn sessions_enabled(&self) -> bool {
        self.start_session && !self.unit_tests_mode
    }

    /// Browser settings with the named environment's overrides applied
    pub fn browser_for(&self, env: Option<&str>) -> BrowserConfig {
        let mut browser = self.browser.clone();
        if let Some(overrides) = env.and_then(|name| self.environments.get(name)) {
            if let Some(name) = &overrides.browser {
                browser.name = name.clone();
            }
            if let Some(base_url) = &overrides.base_url {
                browser.base_url = base_url.clone();
            }
        }
        browser
    }
}
