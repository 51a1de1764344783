//! Browser driver server management - spawning, readiness and shutdown.
//! Worker processes are tracked here too so one shutdown reaches both.

use async_trait::async_trait;
use nightshift_common::config::WebDriverConfig;
use nightshift_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{debug, info};

/// Time a process gets between SIGTERM and kill
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Driver and worker processes the lifecycle guard must stop on shutdown
#[async_trait]
pub trait DriverInstances: Send + Sync {
    async fn stop_instances(&self) -> Result<()>;
}

/// Handle to a running driver server process
pub struct DriverServer {
    child: Child,
    pub host: String,
    pub port: u16,
}

impl DriverServer {
    /// Spawn the driver server and wait until it accepts connections
    pub async fn spawn(config: &WebDriverConfig) -> Result<Self> {
        let port = match config.port {
            Some(port) => port,
            None => find_free_port()?,
        };

        let args: Vec<String> = config
            .server_args
            .iter()
            .map(|arg| arg.replace("{port}", &port.to_string()))
            .collect();

        info!(
            "Spawning driver server {} on port {}",
            config.server_path.display(),
            port
        );

        let child = Command::new(&config.server_path)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::WebDriver(format!(
                    "Failed to spawn {}: {}",
                    config.server_path.display(),
                    e
                ))
            })?;

        let mut server = DriverServer {
            child,
            host: config.host.clone(),
            port,
        };

        if let Err(e) = server
            .wait_for_ready(Duration::from_millis(config.startup_timeout_ms))
            .await
        {
            server.stop().await;
            return Err(e);
        }

        info!("Driver server is ready at {}", server.endpoint());
        Ok(server)
    }

    /// Poll the port until the server accepts a TCP connection
    async fn wait_for_ready(&mut self, timeout: Duration) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let start = Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout {
            attempts += 1;

            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(Error::WebDriver(format!(
                    "driver server exited during startup with {}",
                    status
                )));
            }

            if TcpStream::connect(&addr).await.is_ok() {
                return Ok(());
            }

            if attempts == 1 {
                info!("Waiting for driver server to start...");
            }
            sleep(Duration::from_millis(100)).await;
        }

        Err(Error::WebDriver(format!(
            "driver server not ready at {} after {} attempts",
            addr, attempts
        )))
    }

    /// WebSocket endpoint the suite engine connects to
    pub fn endpoint(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Asks the server to stop; false when it is already gone
    fn request_stop(&mut self) -> bool {
        if self.has_exited() {
            return false;
        }
        info!("Stopping driver server (pid: {})", self.child.id());
        send_sigterm(self.child.id())
    }

    fn kill(&mut self) {
        if self.has_exited() {
            return;
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// Stop the server: SIGTERM first, then kill after a grace period
    pub async fn stop(&mut self) {
        if self.request_stop() {
            sleep(STOP_GRACE).await;
        }
        self.kill();
    }
}

impl Drop for DriverServer {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match i32::try_from(pid) {
        Ok(raw) => kill(Pid::from_raw(raw), signal).is_ok(),
        Err(_) => false,
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_sigkill(pid: u32) {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn send_sigkill(pid: u32) {
    tracing::warn!(pid, "cannot signal worker processes on this platform");
}

/// Every driver server and worker process started by this process
#[derive(Default)]
pub struct DriverRegistry {
    servers: Mutex<Vec<DriverServer>>,
    workers: Mutex<BTreeSet<u32>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a server from config and keep it until `stop_instances`
    pub async fn start(&self, config: &WebDriverConfig) -> Result<String> {
        let server = DriverServer::spawn(config).await?;
        let endpoint = server.endpoint();
        self.servers.lock().push(server);
        Ok(endpoint)
    }

    /// Records a live worker process until [`release_worker`](Self::release_worker)
    pub fn track_worker(&self, pid: u32) {
        self.workers.lock().insert(pid);
    }

    /// Forgets a worker once it has been reaped
    pub fn release_worker(&self, pid: u32) {
        self.workers.lock().remove(&pid);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn len(&self) -> usize {
        self.servers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.worker_count() == 0
    }
}

#[async_trait]
impl DriverInstances for DriverRegistry {
    /// SIGTERM to every server and worker, one grace period, then kill
    /// whatever is still running
    async fn stop_instances(&self) -> Result<()> {
        let mut servers: Vec<DriverServer> = std::mem::take(&mut *self.servers.lock());
        let workers: Vec<u32> = self.workers.lock().iter().copied().collect();
        if servers.is_empty() && workers.is_empty() {
            return Ok(());
        }

        info!(
            servers = servers.len(),
            workers = workers.len(),
            "Stopping driver and worker processes"
        );
        let mut signalled = false;
        for server in servers.iter_mut() {
            signalled |= server.request_stop();
        }
        for pid in &workers {
            signalled |= send_sigterm(*pid);
        }
        if signalled {
            sleep(STOP_GRACE).await;
        }

        for server in servers.iter_mut() {
            server.kill();
        }
        // workers reaped during the grace period were released already
        let remaining: Vec<u32> = self.workers.lock().iter().copied().collect();
        for pid in remaining.into_iter().filter(|pid| workers.contains(pid)) {
            debug!(pid, "killing worker process");
            send_sigkill(pid);
        }
        Ok(())
    }
}

/// Find a free port to use
fn find_free_port() -> Result<u16> {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
