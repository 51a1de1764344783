//! Result aggregation and the global report

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use nightshift_common::{Error, GlobalResults, Result, SuiteResults, UncaughtError};
use parking_lot::Mutex;
use std::path::PathBuf;
use tracing::{debug, info};

/// Accumulates results across suites and workers
#[async_trait]
pub trait ResultAggregator: Send + Sync {
    fn add_test_suite_results(&self, results: SuiteResults);

    fn register_uncaught_err(&self, error: UncaughtError);

    fn has_test_failures(&self) -> bool;

    /// Renders the human-readable summary
    fn print(&self);

    /// Persists the report
    async fn save(&self) -> Result<()>;
}

/// Default aggregator: keeps everything in memory and writes `results.json`
pub struct GlobalReporter {
    output_folder: PathBuf,
    results: Mutex<GlobalResults>,
}

impl GlobalReporter {
    pub fn new(output_folder: impl Into<PathBuf>) -> Self {
        Self::starting_at(output_folder, Utc::now())
    }

    pub fn starting_at(output_folder: impl Into<PathBuf>, started_at: DateTime<Utc>) -> Self {
        Self {
            output_folder: output_folder.into(),
            results: Mutex::new(GlobalResults::new(started_at)),
        }
    }

    /// Snapshot of everything aggregated so far
    pub fn results(&self) -> GlobalResults {
        self.results.lock().clone()
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_folder.join("results.json")
    }

    fn render_table(results: &GlobalResults) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Suite", "Env", "Passed", "Failed", "Errors", "Skipped", "Time"]);

        for suite in &results.suites {
            table.add_row(vec![
                suite.name.clone(),
                suite.env.clone().unwrap_or_else(|| "-".to_string()),
                suite.passed.to_string(),
                suite.failed.to_string(),
                suite.errors.to_string(),
                suite.skipped.to_string(),
                format!("{} ms", suite.duration_ms),
            ]);
        }
        table
    }
}

#[async_trait]
impl ResultAggregator for GlobalReporter {
    fn add_test_suite_results(&self, results: SuiteResults) {
        debug!(suite = %results.name, failed = results.failed, "suite results added");
        self.results.lock().add_suite(results);
    }

    fn register_uncaught_err(&self, error: UncaughtError) {
        self.results.lock().register_uncaught(error);
    }

    fn has_test_failures(&self) -> bool {
        self.results.lock().has_failures()
    }

    fn print(&self) {
        let results = self.results();
        let elapsed = Utc::now() - results.started_at;

        if !results.suites.is_empty() {
            println!("{}", Self::render_table(&results));
        }

        for suite in results.suites.iter().filter(|s| s.has_failures()) {
            for testcase in suite.testcases.iter().filter(|t| !t.passed && !t.skipped) {
                println!(
                    "  {} {} › {} - {}",
                    "✗".red(),
                    suite.name,
                    testcase.name,
                    testcase.error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        for error in &results.uncaught_errors {
            println!("  {} uncaught error: {}", "✗".red(), error);
            if let Some(detailed) = &error.detailed {
                println!("{}", detailed.yellow());
            }
        }

        let summary = format!(
            "{} passed, {} failed, {} errors, {} skipped ({} ms)",
            results.passed,
            results.failed,
            results.errors + results.uncaught_errors.len(),
            results.skipped,
            elapsed.num_milliseconds()
        );
        if results.has_failures() {
            println!("{} {}", "✗".red().bold(), summary);
        } else {
            println!("{} {}", "✓".green().bold(), summary);
        }
    }

    async fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.results())?;
        tokio::fs::create_dir_all(&self.output_folder)
            .await
            .map_err(|e| Error::Report(format!("{}: {}", self.output_folder.display(), e)))?;

        let path = self.report_path();
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| Error::Report(format!("{}: {}", path.display(), e)))?;

        info!("Results written to: {}", path.display());
        Ok(())
    }
}
