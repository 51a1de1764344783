//! Playwright browser sessions
//!
//! A session is one long-lived `node` process holding a single page. Steps
//! are compiled to small JavaScript bodies and sent as JSON lines on stdin;
//! the process answers each with one JSON line on stdout.

use nightshift_common::config::BrowserConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::error::{StepError, StepResult};
use crate::spec::Step;

/// Environment variable carrying the launch options to the session script
pub const BROWSER_ENV: &str = "NIGHTSHIFT_BROWSER";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_SCRIPT: &str = r#"
const pw = require('playwright');
const readline = require('readline');
const AsyncFunction = Object.getPrototypeOf(async function () {}).constructor;
const cfg = JSON.parse(process.env.NIGHTSHIFT_BROWSER);
const reply = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');

(async () => {
  const type = pw[cfg.browser];
  const browser = cfg.endpoint
    ? await type.connect(cfg.endpoint)
    : await type.launch({ headless: cfg.headless });
  const context = await browser.newContext({
    viewport: { width: cfg.width, height: cfg.height }
  });
  const page = await context.newPage();
  reply({ ready: true });

  const rl = readline.createInterface({ input: process.stdin });
  for await (const line of rl) {
    const cmd = JSON.parse(line);
    try {
      await new AsyncFunction('page', 'baseUrl', cmd.code)(page, cfg.base_url);
      reply({ id: cmd.id, ok: true });
    } catch (error) {
      reply({ id: cmd.id, ok: false, error: error.message });
    }
  }
  await browser.close();
})().catch((error) => {
  reply({ ready: false, error: error.message });
  process.exit(1);
});
"#;

/// Browser settings for one session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub browser: String,
    pub headless: bool,
    pub base_url: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub screenshot_dir: PathBuf,
    /// Driver server to connect to instead of launching a browser
    pub endpoint: Option<String>,
}

impl SessionOptions {
    pub fn from_config(config: &BrowserConfig, endpoint: Option<String>) -> Self {
        Self {
            browser: config.name.clone(),
            headless: config.headless,
            base_url: config.base_url.clone(),
            viewport_width: config.viewport_width,
            viewport_height: config.viewport_height,
            screenshot_dir: config.screenshot_dir.clone(),
            endpoint,
        }
    }
}

#[derive(Serialize)]
struct LaunchConfig<'a> {
    browser: &'a str,
    headless: bool,
    base_url: &'a str,
    width: u32,
    height: u32,
    endpoint: Option<&'a str>,
}

#[derive(Serialize)]
struct StepCommand<'a> {
    id: u64,
    code: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Reply {
    id: Option<u64>,
    ready: bool,
    ok: bool,
    error: Option<String>,
}

/// How session processes are started
#[derive(Debug, Clone)]
pub struct SessionLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl Default for SessionLauncher {
    fn default() -> Self {
        Self {
            program: PathBuf::from("node"),
            args: vec!["-e".to_string(), SESSION_SCRIPT.to_string()],
        }
    }
}

impl SessionLauncher {
    /// A custom session program speaking the same line protocol
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Starts a session process and waits until its page is ready
    pub async fn open(&self, options: &SessionOptions) -> StepResult<BrowserSession> {
        let launch = LaunchConfig {
            browser: &options.browser,
            headless: options.headless,
            base_url: &options.base_url,
            width: options.viewport_width,
            height: options.viewport_height,
            endpoint: options.endpoint.as_deref(),
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(BROWSER_ENV, serde_json::to_string(&launch)?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StepError::Session(format!("failed to spawn {}: {}", self.program.display(), e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StepError::Session("session stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StepError::Session("session stdout not captured".to_string()))?;

        let mut process = SessionProcess {
            child,
            stdin: Some(stdin),
            lines: BufReader::new(stdout).lines(),
        };

        let reply = process.read_reply().await?;
        if !reply.ready {
            return Err(StepError::Session(
                reply
                    .error
                    .unwrap_or_else(|| "browser did not become ready".to_string()),
            ));
        }

        let session = BrowserSession {
            id: uuid::Uuid::new_v4().to_string(),
            process: tokio::sync::Mutex::new(process),
            next_id: AtomicU64::new(1),
        };
        info!(session = %session.id, browser = %options.browser, "browser session started");
        Ok(session)
    }
}

struct SessionProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
}

impl SessionProcess {
    /// Next protocol line; other output is skipped
    async fn read_reply(&mut self) -> StepResult<Reply> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Err(StepError::Session("browser process exited".to_string()));
            };
            match serde_json::from_str::<Reply>(&line) {
                Ok(reply) => return Ok(reply),
                Err(_) => debug!("session output: {}", line),
            }
        }
    }
}

/// A live browser page owned by one suite
pub struct BrowserSession {
    id: String,
    process: tokio::sync::Mutex<SessionProcess>,
    next_id: AtomicU64,
}

impl BrowserSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs one compiled step and waits for its reply
    pub async fn exec(&self, label: &str, code: &str) -> StepResult<()> {
        let mut process = self.process.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut line = serde_json::to_string(&StepCommand { id, code })?;
        line.push('\n');
        let stdin = process
            .stdin
            .as_mut()
            .ok_or_else(|| StepError::Session("session already closed".to_string()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        // Replies to steps abandoned by an abort may still be queued
        let reply = loop {
            let reply = process.read_reply().await?;
            if reply.id.map_or(true, |r| r == id) {
                break reply;
            }
        };

        if reply.ok {
            Ok(())
        } else {
            Err(StepError::Failed {
                step: label.to_string(),
                reason: reply.error.unwrap_or_else(|| "unknown error".to_string()),
            })
        }
    }

    /// Ends the session; the process is killed if it does not exit in time
    pub async fn close(&self) -> StepResult<()> {
        let mut process = self.process.lock().await;
        drop(process.stdin.take());

        match tokio::time::timeout(CLOSE_TIMEOUT, process.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(session = %self.id, %status, "browser session exited");
            }
            Err(_) => {
                warn!(session = %self.id, "browser session did not exit, killing");
                process.child.kill().await?;
            }
        }
        info!(session = %self.id, "browser session closed");
        Ok(())
    }
}

fn js(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Compiles a step into the body of an async function taking `page` and
/// `baseUrl`.
pub fn step_to_js(step: &Step, screenshot_dir: &Path) -> String {
    match step {
        Step::Navigate {
            url,
            wait_for_selector,
        } => {
            let mut code = format!("await page.goto(baseUrl + {});", js(url));
            if let Some(selector) = wait_for_selector {
                code.push_str(&format!("\nawait page.waitForSelector({});", js(selector)));
            }
            code
        }
        Step::Click {
            selector,
            timeout_ms,
        } => format!(
            "await page.click({}, {{ timeout: {} }});",
            js(selector),
            timeout_ms.unwrap_or(5000)
        ),
        Step::Fill { selector, value } => {
            format!("await page.fill({}, {});", js(selector), js(value))
        }
        Step::Wait {
            selector,
            timeout_ms,
            state,
        } => format!(
            "await page.waitForSelector({}, {{ state: '{}', timeout: {} }});",
            js(selector),
            state.as_str(),
            timeout_ms
        ),
        Step::Assert {
            selector,
            visible,
            text,
            text_contains,
            count,
        } => {
            let sel = js(selector);
            let mut lines = vec![format!("const loc = page.locator({});", sel)];
            if let Some(visible) = visible {
                lines.push(format!(
                    "if ((await loc.first().isVisible()) !== {}) throw new Error('expected ' + {} + ' to be {}');",
                    visible,
                    sel,
                    if *visible { "visible" } else { "hidden" }
                ));
            }
            if let Some(text) = text {
                lines.push(format!(
                    "{{ const t = (await loc.first().textContent() || '').trim(); if (t !== {0}) throw new Error('expected text ' + {0} + ', got ' + t); }}",
                    js(text)
                ));
            }
            if let Some(part) = text_contains {
                lines.push(format!(
                    "{{ const t = await loc.first().textContent() || ''; if (!t.includes({0})) throw new Error('expected text containing ' + {0}); }}",
                    js(part)
                ));
            }
            if let Some(count) = count {
                lines.push(format!(
                    "{{ const n = await loc.count(); if (n !== {0}) throw new Error('expected {0} elements, got ' + n); }}",
                    count
                ));
            }
            lines.join("\n")
        }
        Step::Screenshot { name, full_page } => {
            let path = screenshot_dir.join(format!("{}.png", name));
            format!(
                "await page.screenshot({{ path: {}, fullPage: {} }});",
                js(&path.to_string_lossy()),
                full_page
            )
        }
        Step::Sleep { ms } => format!("await page.waitForTimeout({});", ms),
        Step::Log { message } => format!("console.error('[TEST] ' + {});", js(message)),
    }
}
