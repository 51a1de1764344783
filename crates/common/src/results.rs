//! Result data model shared by the runner, the suite engine and workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of a single testcase inside a suite
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestcaseResult {
    pub name: String,
    pub passed: bool,
    pub skipped: bool,
    pub duration_ms: u64,
    pub steps_run: usize,
    pub error: Option<String>,
}

/// Results exported by one suite once it has finished (or been aborted)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteResults {
    pub name: String,
    pub module_path: PathBuf,
    pub env: Option<String>,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub testcases: Vec<TestcaseResult>,
    pub last_error: Option<String>,
}

impl SuiteResults {
    pub fn new(name: impl Into<String>, module_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            module_path: module_path.into(),
            ..Default::default()
        }
    }

    /// Folds a testcase into the counters
    pub fn push(&mut self, testcase: TestcaseResult) {
        if testcase.skipped {
            self.skipped += 1;
        } else if testcase.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
            self.last_error = testcase.error.clone();
        }
        self.duration_ms += testcase.duration_ms;
        self.testcases.push(testcase);
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.errors > 0
    }
}

/// An error that escaped all application-level handling
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UncaughtError {
    pub message: String,
    /// Cause chain, outermost first, excluding `message`
    pub causes: Vec<String>,
    /// Diagnostic guidance attached for well-known misuse patterns
    pub detailed: Option<String>,
}

impl UncaughtError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Captures an error and its source chain
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            causes,
            detailed: None,
        }
    }

    /// Captures an `anyhow` error and its context chain
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let mut chain = err.chain().map(|e| e.to_string());
        let message = chain.next().unwrap_or_default();
        Self {
            message,
            causes: chain.collect(),
            detailed: None,
        }
    }
}

impl std::fmt::Display for UncaughtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in &self.causes {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

/// Everything accumulated across suites and workers for one invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalResults {
    pub started_at: DateTime<Utc>,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
    pub suites: Vec<SuiteResults>,
    pub uncaught_errors: Vec<UncaughtError>,
}

impl GlobalResults {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            passed: 0,
            failed: 0,
            errors: 0,
            skipped: 0,
            suites: Vec::new(),
            uncaught_errors: Vec::new(),
        }
    }

    pub fn add_suite(&mut self, results: SuiteResults) {
        self.passed += results.passed;
        self.failed += results.failed;
        self.errors += results.errors;
        self.skipped += results.skipped;
        self.suites.push(results);
    }

    pub fn register_uncaught(&mut self, error: UncaughtError) {
        self.uncaught_errors.push(error);
    }

    /// True if any suite failed or errored, or any uncaught error was recorded
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.errors > 0 || !self.uncaught_errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_counters_follow_testcases() {
        let mut suite = SuiteResults::new("login", "tests/login.yaml");
        suite.push(TestcaseResult {
            name: "renders form".into(),
            passed: true,
            duration_ms: 20,
            ..Default::default()
        });
        suite.push(TestcaseResult {
            name: "rejects bad password".into(),
            passed: false,
            duration_ms: 30,
            error: Some("expected banner".into()),
            ..Default::default()
        });

        assert_eq!(suite.passed, 1);
        assert_eq!(suite.failed, 1);
        assert_eq!(suite.duration_ms, 50);
        assert_eq!(suite.last_error.as_deref(), Some("expected banner"));
        assert!(suite.has_failures());
    }

    #[test]
    fn uncaught_error_alone_is_a_failure() {
        let mut global = GlobalResults::new(Utc::now());
        global.add_suite(SuiteResults::new("ok", "ok.yaml"));
        assert!(!global.has_failures());

        global.register_uncaught(UncaughtError::new("boom"));
        assert!(global.has_failures());
    }

    #[test]
    fn anyhow_context_becomes_causes() {
        let err = anyhow::anyhow!("disk full").context("saving report");
        let uncaught = UncaughtError::from_anyhow(&err);
        assert_eq!(uncaught.message, "saving report");
        assert_eq!(uncaught.causes, vec!["disk full".to_string()]);
        assert_eq!(uncaught.to_string(), "saving report: disk full");
    }

    #[test]
    fn worker_payload_tolerates_missing_fields() {
        let results: SuiteResults = serde_json::from_str(r#"{"name":"a","failed":2}"#).unwrap();
        assert_eq!(results.name, "a");
        assert!(results.has_failures());
    }
}
