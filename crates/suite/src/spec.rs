//! Declarative YAML suite files

use nightshift_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One suite file: a named list of testcases sharing one browser session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Used by `--tag` to select suites
    #[serde(default)]
    pub tags: Vec<String>,

    pub testcases: Vec<TestcaseSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestcaseSpec {
    pub name: String,

    /// Marked skipped without running any step
    #[serde(default)]
    pub skip: bool,

    pub steps: Vec<Step>,
}

/// A single step in a testcase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Navigate to a URL (relative to the base URL)
    Navigate {
        url: String,
        #[serde(default)]
        wait_for_selector: Option<String>,
    },

    Click {
        selector: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    Fill {
        selector: String,
        value: String,
    },

    /// Wait for an element to reach a state
    Wait {
        selector: String,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
        #[serde(default)]
        state: WaitState,
    },

    Assert {
        selector: String,
        #[serde(default)]
        visible: Option<bool>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        text_contains: Option<String>,
        #[serde(default)]
        count: Option<usize>,
    },

    Screenshot {
        name: String,
        #[serde(default)]
        full_page: bool,
    },

    /// Wait for a fixed amount of time (runs without a browser)
    Sleep { ms: u64 },

    /// Log a message (runs without a browser)
    Log { message: String },
}

fn default_wait_timeout() -> u64 {
    5000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Visible => "visible",
            WaitState::Hidden => "hidden",
            WaitState::Attached => "attached",
            WaitState::Detached => "detached",
        }
    }
}

impl Step {
    /// Short label used in logs and failure messages
    pub fn label(&self) -> String {
        match self {
            Step::Navigate { url, .. } => format!("navigate:{}", url),
            Step::Click { selector, .. } => format!("click:{}", selector),
            Step::Fill { selector, .. } => format!("fill:{}", selector),
            Step::Wait { selector, .. } => format!("wait:{}", selector),
            Step::Assert { selector, .. } => format!("assert:{}", selector),
            Step::Screenshot { name, .. } => format!("screenshot:{}", name),
            Step::Sleep { ms } => format!("sleep:{}ms", ms),
            Step::Log { message } => {
                format!("log:{}", message.chars().take(30).collect::<String>())
            }
        }
    }

    /// Steps that run in-process instead of in the browser
    pub fn is_native(&self) -> bool {
        matches!(self, Step::Sleep { .. } | Step::Log { .. })
    }
}

impl SuiteSpec {
    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Reads and parses a suite file; failures are suite construction errors
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::suite_init(path, e))?;
        let spec = Self::from_yaml(&content).map_err(|e| Error::suite_init(path, e))?;
        if spec.testcases.is_empty() {
            return Err(Error::suite_init(path, "suite has no testcases"));
        }
        Ok(spec)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

fn is_suite_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext == "yaml" || ext == "yml")
        .unwrap_or(false)
}

/// Expands files and directories into an ordered list of suite files.
///
/// Directories are walked recursively and sorted. With a tag, suites
/// without that tag are dropped; files that fail to parse are kept so the
/// run reports the parse error.
pub fn discover_suites(paths: &[PathBuf], tag: Option<&str>) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut seen = BTreeSet::new();

    for path in paths {
        if !path.exists() {
            return Err(Error::InvalidConfig(format!(
                "suite path does not exist: {}",
                path.display()
            )));
        }

        let candidates: Vec<PathBuf> = if path.is_dir() {
            walkdir::WalkDir::new(path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && is_suite_file(e.path()))
                .map(|e| e.into_path())
                .collect()
        } else {
            vec![path.clone()]
        };

        for candidate in candidates {
            if seen.insert(candidate.clone()) {
                found.push(candidate);
            }
        }
    }

    let Some(tag) = tag else {
        return Ok(found);
    };

    Ok(found
        .into_iter()
        .filter(|path| match SuiteSpec::from_file(path) {
            Ok(spec) => spec.has_tag(tag),
            Err(e) => {
                warn!("keeping unparseable suite {}: {}", path.display(), e);
                true
            }
        })
        .inspect(|path| debug!(tag, path = %path.display(), "suite selected"))
        .collect())
}
