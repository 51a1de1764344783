//! # Process lifecycle guard
//!
//! Last line of defense between a runaway failure and the host process.
//! Every termination path (normal exit, an error escaping all handlers, an
//! unhandled rejection from a background task, an OS signal) arrives here
//! as a [`ProcessEvent`] and ends in exactly one call to
//! [`HostProcess::exit`].
//!
//! ## Abort pipeline
//! ```text
//! uncaught / unhandled / signal
//!   ├─► coordinator bound and a suite active?
//!   │     ├─ register error, stop scheduling, empty the suite queue
//!   │     ├─ abort the in-flight runnable and wait for it
//!   │     └─ run started? suppress own report, then in parallel:
//!   │           close sessions ║ print + save partial report
//!   ├─► stop driver and worker processes (best effort)
//!   ├─► finish callback(error)         (if registered)
//!   └─► exit code = max(code, 1), terminate
//! ```
//!
//! ## Exit code policy
//! Monotonic maximum: once a failure code is recorded, a later lower value
//! (including 0) never replaces it.

use nightshift_common::UncaughtError;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::coordinator::RunCoordinator;
use crate::driver::DriverInstances;
use crate::events::{EventReceiver, ProcessEvent, ShutdownSignal};

/// The process boundary: the one place the process actually ends
pub trait HostProcess: Send + Sync {
    fn exit(&self, code: i32);
}

/// Production host: ends the OS process
#[derive(Debug, Default, Clone, Copy)]
pub struct StdProcess;

impl HostProcess for StdProcess {
    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Hook for embedding contexts, invoked with the error that ended the run
pub type FinishCallback = Box<dyn Fn(&UncaughtError) + Send + Sync>;

pub struct ProcessLifecycleGuard {
    exit_code: AtomicI32,
    coordinator: RwLock<Option<Arc<RunCoordinator>>>,
    drivers: Arc<dyn DriverInstances>,
    host: Arc<dyn HostProcess>,
    finish_callback: Mutex<Option<FinishCallback>>,
    terminated: AtomicBool,
}

impl ProcessLifecycleGuard {
    pub fn new(drivers: Arc<dyn DriverInstances>, host: Arc<dyn HostProcess>) -> Self {
        Self {
            exit_code: AtomicI32::new(0),
            coordinator: RwLock::new(None),
            drivers,
            host,
            finish_callback: Mutex::new(None),
            terminated: AtomicBool::new(false),
        }
    }

    /// Binds (or rebinds) the coordinator the guard may interrogate
    pub fn bind_coordinator(&self, coordinator: Arc<RunCoordinator>) -> &Self {
        *self.coordinator.write() = Some(coordinator);
        self
    }

    pub fn set_finish_callback(&self, callback: FinishCallback) -> &Self {
        *self.finish_callback.lock() = Some(callback);
        self
    }

    /// Records a candidate exit code; the effective code never decreases
    pub fn set_exit_code(&self, code: i32) -> &Self {
        let previous = self.exit_code.fetch_max(code, Ordering::SeqCst);
        debug!(
            requested = code,
            previous,
            effective = previous.max(code),
            "set_exit_code"
        );
        self
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// The host finished on its own
    pub fn on_normal_exit(&self, code: i32) {
        info!(code, "process exiting");
        if code > 0 {
            self.set_exit_code(code);
        }
        self.terminate();
    }

    pub async fn on_uncaught_error(&self, error: UncaughtError) {
        error!("uncaught error: {}", error);
        self.abort_pipeline(error).await;
    }

    pub async fn on_unhandled_rejection(&self, error: UncaughtError) {
        warn!("unhandled rejection: {}", error);
        self.abort_pipeline(error).await;
    }

    pub async fn on_signal(&self, signal: ShutdownSignal) {
        warn!("received {}; shutting down", signal);
        self.set_exit_code(signal.exit_code());
        self.abort_pipeline(UncaughtError::new(format!("run interrupted by {}", signal)))
            .await;
    }

    /// Ends the process with the recorded code; later calls are no-ops
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            debug!("terminate called again; ignoring");
            return;
        }
        let code = self.exit_code();
        info!(code, "terminating process");
        self.host.exit(code);
    }

    /// Dispatches process events until one of them ends the process
    pub async fn listen(self: Arc<Self>, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            debug!(event = event.as_label(), "process event");
            match event {
                ProcessEvent::Exit(code) => self.on_normal_exit(code),
                ProcessEvent::UncaughtError(error) => self.on_uncaught_error(error).await,
                ProcessEvent::UnhandledRejection(error) => self.on_unhandled_rejection(error).await,
                ProcessEvent::Signal(signal) => self.on_signal(signal).await,
            }
            if self.is_terminated() {
                break;
            }
        }
    }

    async fn abort_pipeline(&self, error: UncaughtError) {
        if self.is_terminated() {
            debug!("process already terminating; ignoring {}", error);
            return;
        }

        self.unwind_active_run(&error).await;

        if let Err(e) = self.drivers.stop_instances().await {
            warn!("failed to stop driver instances: {}", e);
        }

        if let Some(callback) = self.finish_callback.lock().as_ref() {
            callback(&error);
        }

        self.set_exit_code(1);
        self.terminate();
    }

    /// Aborts in-flight work and flushes what the run has produced so far
    async fn unwind_active_run(&self, error: &UncaughtError) {
        let coordinator = self.coordinator.read().clone();
        let Some(coordinator) = coordinator else {
            error!("no active run to unwind: {}", error);
            return;
        };
        let Some(suite) = coordinator.current_suite() else {
            error!("no active suite to unwind: {}", error);
            return;
        };

        coordinator.register_uncaught_err(error.clone());
        coordinator.abort();
        suite.empty_queue();

        if let Some(runnable) = suite.current_runnable() {
            info!(suite = suite.name(), step = runnable.name(), "aborting in-flight step");
            if let Err(e) = runnable.abort(error).await {
                warn!("step abort failed: {}", e);
            }
        }

        if !coordinator.has_result() {
            return;
        }

        coordinator.suppress_report();
        let (closed, reported) = tokio::join!(
            coordinator.close_open_sessions(),
            coordinator.report_results()
        );
        if let Err(e) = closed {
            warn!("failed to close session during shutdown: {}", e);
            coordinator.register_uncaught_err(UncaughtError::from_error(&e));
        }
        if let Err(e) = reported {
            warn!("failed to publish report during shutdown: {}", e);
            coordinator.register_uncaught_err(UncaughtError::from_error(&e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverRegistry;

    #[derive(Default)]
    struct RecordingHost {
        exits: Mutex<Vec<i32>>,
    }

    impl HostProcess for RecordingHost {
        fn exit(&self, code: i32) {
            self.exits.lock().push(code);
        }
    }

    fn guard() -> (ProcessLifecycleGuard, Arc<RecordingHost>) {
        let host = Arc::new(RecordingHost::default());
        let guard = ProcessLifecycleGuard::new(Arc::new(DriverRegistry::new()), host.clone());
        (guard, host)
    }

    #[test]
    fn exit_code_never_decreases() {
        let (guard, _) = guard();
        guard.set_exit_code(1).set_exit_code(0);
        assert_eq!(guard.exit_code(), 1);

        guard.set_exit_code(3).set_exit_code(1);
        assert_eq!(guard.exit_code(), 3);
    }

    #[test]
    fn terminate_exits_once() {
        let (guard, host) = guard();
        guard.set_exit_code(2);
        guard.terminate();
        guard.terminate();
        assert_eq!(*host.exits.lock(), vec![2]);
    }

    #[test]
    fn normal_exit_records_failure_code() {
        let (guard, host) = guard();
        guard.on_normal_exit(4);
        assert_eq!(*host.exits.lock(), vec![4]);
    }

    #[test]
    fn normal_exit_zero_keeps_earlier_failure() {
        let (guard, host) = guard();
        guard.set_exit_code(1);
        guard.on_normal_exit(0);
        assert_eq!(*host.exits.lock(), vec![1]);
    }

    #[tokio::test]
    async fn uncaught_without_coordinator_still_exits_with_failure() {
        let (guard, host) = guard();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        guard.set_finish_callback(Box::new(move |err| seen.lock().push(err.message.clone())));

        guard.on_uncaught_error(UncaughtError::new("boom")).await;

        assert_eq!(*host.exits.lock(), vec![1]);
        assert_eq!(*calls.lock(), vec!["boom".to_string()]);
    }

    #[tokio::test]
    async fn signal_keeps_conventional_code() {
        let (guard, host) = guard();
        guard.on_signal(ShutdownSignal::Interrupt).await;
        assert_eq!(*host.exits.lock(), vec![130]);
    }
}
