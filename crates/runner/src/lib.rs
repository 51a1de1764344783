//! Nightshift runner core
//!
//! Orchestrates a browser test run and guarantees an orderly process exit
//! however the run ends.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  CLI                                                         │
//! │    builds RunCoordinator + ProcessLifecycleGuard, binds them │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │  RunCoordinator              │  ProcessLifecycleGuard        │
//! │    run() / run_concurrent()  │    listen(ProcessEvent)       │
//! │    current_suite() ◄─────────┼──── abort pipeline            │
//! │    close_open_sessions()     │    set_exit_code/terminate    │
//! │    report_results()          │                               │
//! ├──────────────────────────────┴───────────────────────────────┤
//! │  Collaborators (traits)                                      │
//! │    SuiteFactory / TestSuite / Runnable   suite engine        │
//! │    ResultAggregator (GlobalReporter)     results + report    │
//! │    WorkerPool (ProcessWorkerPool)        worker processes    │
//! │    DriverInstances (DriverRegistry)      drivers + workers   │
//! │    HostProcess (StdProcess)              process exit        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod concurrency;
pub mod coordinator;
pub mod driver;
pub mod events;
pub mod guard;
pub mod reporter;
pub mod suite;

pub use concurrency::{ProcessWorkerPool, WorkerMessage, WorkerPool, WorkerReporter};
pub use coordinator::{RunCoordinator, RunOptions, RunState};
pub use driver::{DriverInstances, DriverRegistry, DriverServer};
pub use events::{EventSender, ProcessEvent, ShutdownSignal};
pub use guard::{FinishCallback, HostProcess, ProcessLifecycleGuard, StdProcess};
pub use reporter::{GlobalReporter, ResultAggregator};
pub use suite::{Runnable, SessionHandle, SuiteFactory, TestSuite};
