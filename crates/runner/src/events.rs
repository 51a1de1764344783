//! Process-level termination events
//!
//! Everything that can end the process (natural exit, an error escaping all
//! handlers, an OS signal) is delivered to the lifecycle guard as a
//! [`ProcessEvent`] over one channel.

use nightshift_common::UncaughtError;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// OS signals that request shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Quit,
}

impl ShutdownSignal {
    /// Conventional `128 + signo` exit status
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownSignal::Interrupt => 130,
            ShutdownSignal::Terminate => 143,
            ShutdownSignal::Quit => 131,
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Quit => "SIGQUIT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// The host finished normally with this code
    Exit(i32),
    UncaughtError(UncaughtError),
    UnhandledRejection(UncaughtError),
    Signal(ShutdownSignal),
}

impl ProcessEvent {
    pub fn as_label(&self) -> &'static str {
        match self {
            ProcessEvent::Exit(_) => "exit",
            ProcessEvent::UncaughtError(_) => "uncaught_error",
            ProcessEvent::UnhandledRejection(_) => "unhandled_rejection",
            ProcessEvent::Signal(_) => "signal",
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<ProcessEvent>;

/// Cloneable handle for reporting process events
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<ProcessEvent>,
}

pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

impl EventSender {
    /// Returns false once the guard has stopped listening
    pub fn send(&self, event: ProcessEvent) -> bool {
        let label = event.as_label();
        if self.tx.send(event).is_err() {
            warn!(event = label, "process event dropped; guard is no longer listening");
            return false;
        }
        true
    }

    pub fn exit(&self, code: i32) -> bool {
        self.send(ProcessEvent::Exit(code))
    }

    pub fn uncaught(&self, error: UncaughtError) -> bool {
        self.send(ProcessEvent::UncaughtError(error))
    }

    pub fn unhandled(&self, error: UncaughtError) -> bool {
        self.send(ProcessEvent::UnhandledRejection(error))
    }

    /// Reports the outcome of a background task nobody else awaits.
    ///
    /// A panic becomes an uncaught error, an `Err` return an unhandled
    /// rejection. Cancelled tasks are ignored.
    pub fn watch<E>(&self, handle: JoinHandle<Result<(), E>>) -> JoinHandle<()>
    where
        E: Into<anyhow::Error> + Send + 'static,
    {
        let sender = self.clone();
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    sender.unhandled(UncaughtError::from_anyhow(&e.into()));
                }
                Err(join) if join.is_panic() => {
                    sender.uncaught(UncaughtError::new(format!("background task panicked: {}", join)));
                }
                Err(_) => {}
            }
        })
    }
}

/// Forwards the first OS shutdown signal to the guard
pub fn spawn_signal_listener(sender: EventSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(signal) => {
                sender.send(ProcessEvent::Signal(signal));
            }
            Err(e) => warn!("failed to install signal handlers: {}", e),
        }
    })
}

/// Forwards panics from any thread to the guard, after the default hook ran
pub fn install_panic_hook(sender: EventSender) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);

        let payload = info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        let mut error = UncaughtError::new(format!("panic: {}", message));
        if let Some(location) = info.location() {
            error.causes.push(format!("at {}:{}", location.file(), location.line()));
        }
        sender.uncaught(error);
    }));
}

/// Waits for a termination signal.
///
/// Returns `Err` if signal registration fails.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<ShutdownSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let received = tokio::select! {
        _ = sigint.recv()  => ShutdownSignal::Interrupt,
        _ = sigterm.recv() => ShutdownSignal::Terminate,
        _ = sigquit.recv() => ShutdownSignal::Quit,
    };
    Ok(received)
}

/// Waits for a termination signal.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}
