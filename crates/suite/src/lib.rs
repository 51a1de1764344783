//! Nightshift YAML suite engine
//!
//! Suites are YAML files holding testcases made of browser steps. Browser
//! steps run in a Playwright page owned by a long-lived `node` process, one
//! per suite; `sleep` and `log` steps run in-process.
//!
//! ```text
//! login.yaml ──► SuiteSpec ──► YamlSuite ──► StepRunnable (one per step)
//!                                  │
//!                                  └── BrowserSession ◄─ JSON lines ─► node + playwright
//! ```

pub mod error;
pub mod playwright;
pub mod spec;
pub mod yaml_suite;

pub use error::{StepError, StepResult};
pub use playwright::{BrowserSession, SessionLauncher, SessionOptions};
pub use spec::{discover_suites, Step, SuiteSpec, TestcaseSpec};
pub use yaml_suite::{StepRunnable, YamlSuite, YamlSuiteFactory};
