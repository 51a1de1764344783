//! Lifecycle guard unwinding a live run

mod support;

use nightshift_common::UncaughtError;
use nightshift_runner::{events, RunState, ShutdownSignal};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use support::{Behavior, Harness, HarnessOptions};

fn hanging_run() -> Harness {
    hanging_run_with(HarnessOptions::default())
}

fn hanging_run_with(options: HarnessOptions) -> Harness {
    Harness::with_options(
        &[("a", Behavior::Pass), ("b", Behavior::Hang), ("c", Behavior::Pass)],
        options,
        None,
    )
}

#[tokio::test]
async fn uncaught_error_unwinds_active_run() {
    let h = hanging_run();
    let callbacks = Arc::new(Mutex::new(Vec::new()));
    let seen = callbacks.clone();
    h.guard
        .set_finish_callback(Box::new(move |err| seen.lock().push(err.message.clone())));

    let run = h.spawn_run();
    h.wait_for_runnable().await;
    h.guard.on_uncaught_error(UncaughtError::new("boom")).await;
    run.await.unwrap();

    assert_eq!(h.log.count("abort:b step"), 1);
    assert_eq!(h.log.count("abort_reason:boom"), 1);
    assert_eq!(h.log.count("empty_queue:b"), 1);
    assert_eq!(h.log.count("terminate:b"), 1);
    assert_eq!(h.log.count("print"), 1);
    assert_eq!(h.log.count("save"), 1);
    assert_eq!(h.log.count("stop_instances"), 1);
    assert!(!h.log.contains("create:c"));

    assert_eq!(h.exits(), vec![1]);
    assert_eq!(*callbacks.lock(), vec!["boom".to_string()]);
    assert!(h.guard.is_terminated());
    assert!(h.coordinator.is_aborted());
    assert_eq!(h.coordinator.state(), RunState::Done);

    let uncaught = h.uncaught_errors();
    assert_eq!(uncaught.len(), 1);
    assert_eq!(uncaught[0].message, "boom");
}

#[tokio::test]
async fn teardown_follows_abort_then_report_then_exit() {
    let h = hanging_run();

    let run = h.spawn_run();
    h.wait_for_runnable().await;
    h.guard.on_uncaught_error(UncaughtError::new("boom")).await;
    run.await.unwrap();

    let entries = h.log.entries();
    let position = |entry: &str| entries.iter().position(|e| e == entry).unwrap();
    assert!(position("uncaught") < position("abort:b step"));
    assert!(position("abort:b step") < position("terminate:b"));
    assert!(position("terminate:b") < position("stop_instances"));
    assert!(position("save") < position("stop_instances"));
    assert!(position("stop_instances") < position("exit:1"));
}

#[tokio::test]
async fn failing_session_close_still_exits_with_failure() {
    let h = hanging_run_with(HarnessOptions {
        close_fails: true,
        fail_save: true,
        fail_drivers: true,
        ..Default::default()
    });

    let run = h.spawn_run();
    h.wait_for_runnable().await;
    h.guard.on_uncaught_error(UncaughtError::new("boom")).await;
    run.await.unwrap();

    assert_eq!(h.log.count("terminate:b"), 1);
    assert_eq!(h.log.count("save"), 1);
    assert_eq!(h.exits(), vec![1]);
    assert!(h
        .uncaught_errors()
        .iter()
        .any(|e| e.message.contains("driver went away")));
}

#[tokio::test]
async fn unhandled_rejection_unwinds_like_uncaught_error() {
    let uncaught = hanging_run();
    let run = uncaught.spawn_run();
    uncaught.wait_for_runnable().await;
    uncaught
        .guard
        .on_uncaught_error(UncaughtError::new("lost promise"))
        .await;
    run.await.unwrap();

    let unhandled = hanging_run();
    let run = unhandled.spawn_run();
    unhandled.wait_for_runnable().await;
    unhandled
        .guard
        .on_unhandled_rejection(UncaughtError::new("lost promise"))
        .await;
    run.await.unwrap();

    assert_eq!(uncaught.log.entries(), unhandled.log.entries());
    assert_eq!(uncaught.exits(), unhandled.exits());
}

#[tokio::test]
async fn second_failure_during_teardown_is_ignored() {
    let h = hanging_run();

    let run = h.spawn_run();
    h.wait_for_runnable().await;
    h.guard.on_uncaught_error(UncaughtError::new("first")).await;
    h.guard.on_uncaught_error(UncaughtError::new("second")).await;
    run.await.unwrap();

    assert_eq!(h.log.count("abort:b step"), 1);
    assert_eq!(h.log.count("stop_instances"), 1);
    assert_eq!(h.exits(), vec![1]);
}

#[tokio::test]
async fn error_between_suites_skips_the_unwind() {
    let h = Harness::new(&[("a", Behavior::Pass)]);
    h.coordinator.run(&h.paths).await;

    h.guard.on_uncaught_error(UncaughtError::new("late")).await;

    assert_eq!(h.log.count("abort:a step"), 0);
    assert_eq!(h.log.count("save"), 1);
    assert_eq!(h.log.count("stop_instances"), 1);
    assert_eq!(h.exits(), vec![1]);
}

#[tokio::test]
async fn signal_interrupts_run_with_conventional_code() {
    let h = hanging_run();

    let run = h.spawn_run();
    h.wait_for_runnable().await;
    h.guard.on_signal(ShutdownSignal::Terminate).await;
    run.await.unwrap();

    assert_eq!(h.log.count("abort:b step"), 1);
    assert_eq!(h.exits(), vec![143]);
}

#[tokio::test]
async fn listen_dispatches_events_until_terminated() {
    let h = hanging_run();
    let (sender, receiver) = events::channel();
    let listener = tokio::spawn(h.guard.clone().listen(receiver));

    let run = h.spawn_run();
    h.wait_for_runnable().await;
    sender.uncaught(UncaughtError::new("from a background task"));

    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap();
    run.await.unwrap();

    // events after termination have nobody listening
    sender.exit(0);

    assert_eq!(h.log.count("terminate:b"), 1);
    assert_eq!(h.exits(), vec![1]);
}

#[tokio::test]
async fn normal_exit_after_failed_run_keeps_failure_code() {
    let h = Harness::new(&[("a", Behavior::Fail)]);
    let (sender, receiver) = events::channel();
    let listener = tokio::spawn(h.guard.clone().listen(receiver));

    h.coordinator.run(&h.paths).await;
    h.guard.set_exit_code(h.coordinator.exit_code());
    sender.exit(0);
    listener.await.unwrap();

    assert_eq!(h.exits(), vec![1]);
    assert!(!h.log.contains("stop_instances"));
}

#[tokio::test]
async fn panicking_suite_ends_in_the_abort_pipeline() {
    let h = Harness::new(&[("a", Behavior::Pass), ("b", Behavior::Panic), ("c", Behavior::Pass)]);
    let (sender, receiver) = events::channel();
    let listener = tokio::spawn(h.guard.clone().listen(receiver));

    h.spawn_watched_run(&sender);
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.log.count("empty_queue:b"), 1);
    assert_eq!(h.log.count("terminate:b"), 1);
    assert_eq!(h.log.count("print"), 1);
    assert_eq!(h.log.count("save"), 1);
    assert_eq!(h.log.count("stop_instances"), 1);
    assert!(!h.log.contains("create:c"));
    assert_eq!(h.exits(), vec![1]);

    let uncaught = h.uncaught_errors();
    assert_eq!(uncaught.len(), 1);
    assert!(uncaught[0].message.starts_with("background task panicked"));
}
