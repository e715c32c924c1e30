mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{engine, fast_config, ScriptedProvider};
use speedwatch::error::SpeedwatchError;
use speedwatch::measurement::{Stage, TestStatus};
use speedwatch::runner::AsyncRunner;

const WAIT: Duration = Duration::from_secs(10);

fn wait_until_idle(runner: &AsyncRunner) {
    let deadline = Instant::now() + WAIT;
    while runner.is_running() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_run_delivers_progress_and_result() {
    let provider = Arc::new(ScriptedProvider::new());
    let mut runner = AsyncRunner::new(engine(&provider, fast_config()));

    runner.start().unwrap();
    let outcome = runner.wait_result(WAIT).expect("outcome");
    assert_eq!(outcome.status, TestStatus::Succeeded);
    assert!(!runner.is_running());

    // Everything buffered during the run collapses to the newest update.
    let latest = runner.poll_progress().expect("progress");
    assert_eq!(latest.stage, Stage::Complete);
    assert!(runner.poll_progress().is_none());
    assert_eq!(runner.latest_progress().map(|p| p.stage), Some(Stage::Complete));
}

#[test]
fn test_second_start_while_running_is_rejected() {
    let provider =
        Arc::new(ScriptedProvider::new().with_transfer_time(Duration::from_millis(500)));
    let mut runner = AsyncRunner::new(engine(&provider, fast_config()));

    runner.start().unwrap();
    assert!(runner.is_running());
    assert!(matches!(runner.start(), Err(SpeedwatchError::AlreadyRunning)));

    let outcome = runner.wait_result(WAIT).expect("outcome");
    assert!(outcome.is_success());
    assert_eq!(provider.attempts(), 1);
}

#[test]
fn test_start_rejected_until_result_drained() {
    let provider = Arc::new(ScriptedProvider::new());
    let mut runner = AsyncRunner::new(engine(&provider, fast_config()));

    runner.start().unwrap();
    wait_until_idle(&runner);
    assert!(matches!(runner.start(), Err(SpeedwatchError::AlreadyRunning)));

    assert!(runner.try_result().is_some());
    runner.start().unwrap();
    assert!(runner.wait_result(WAIT).is_some());
    assert_eq!(provider.attempts(), 2);
}

#[test]
fn test_try_result_is_non_blocking() {
    let provider =
        Arc::new(ScriptedProvider::new().with_transfer_time(Duration::from_millis(300)));
    let mut runner = AsyncRunner::new(engine(&provider, fast_config()));

    runner.start().unwrap();
    let started = Instant::now();
    assert!(runner.try_result().is_none());
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(runner.wait_result(WAIT).is_some());
}

#[test]
fn test_cancel_running_test() {
    let provider =
        Arc::new(ScriptedProvider::new().with_transfer_time(Duration::from_secs(10)));
    let mut runner = AsyncRunner::new(engine(&provider, fast_config()));

    runner.start().unwrap();
    thread::sleep(Duration::from_millis(200));
    runner.cancel();

    let outcome = runner.wait_result(Duration::from_secs(3)).expect("outcome");
    assert!(outcome.is_cancelled());

    // The flag was consumed; a later run is unaffected.
    assert!(!runner.cancel_token().is_cancelled());
}

#[test]
fn test_cancel_during_final_stage_does_not_leak_into_next_run() {
    let provider = Arc::new(ScriptedProvider::new());
    let mut runner = AsyncRunner::new(engine(&provider, fast_config()));
    provider.cancel_during_next_upload(runner.cancel_token());

    runner.start().unwrap();
    let first = runner.wait_result(WAIT).expect("outcome");
    assert!(first.is_cancelled());
    assert!(!runner.cancel_token().is_cancelled());

    runner.start().unwrap();
    let second = runner.wait_result(WAIT).expect("outcome");
    assert_eq!(second.status, TestStatus::Succeeded);
    assert_eq!(provider.attempts(), 2);
}

#[test]
fn test_cancel_while_idle_applies_to_next_run() {
    let provider = Arc::new(ScriptedProvider::new());
    let mut runner = AsyncRunner::new(engine(&provider, fast_config()));

    runner.cancel();
    runner.start().unwrap();
    let outcome = runner.wait_result(WAIT).expect("outcome");
    assert!(outcome.is_cancelled());
    assert_eq!(outcome.attempts, 0);
    assert_eq!(provider.total_calls(), 0);

    runner.start().unwrap();
    let outcome = runner.wait_result(WAIT).expect("outcome");
    assert!(outcome.is_success());
}

#[test]
fn test_reset_cancel_clears_pending_cancel() {
    let provider = Arc::new(ScriptedProvider::new());
    let mut runner = AsyncRunner::new(engine(&provider, fast_config()));

    runner.cancel();
    runner.reset_cancel();
    runner.start().unwrap();
    assert!(runner.wait_result(WAIT).expect("outcome").is_success());
}

#[test]
fn test_shutdown_stops_worker() {
    let provider =
        Arc::new(ScriptedProvider::new().with_transfer_time(Duration::from_secs(10)));
    let mut runner = AsyncRunner::new(engine(&provider, fast_config()));

    runner.start().unwrap();
    thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    assert!(runner.shutdown(Duration::from_secs(3)));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!runner.is_running());
}

#[test]
fn test_shutdown_when_idle() {
    let provider = Arc::new(ScriptedProvider::new());
    let mut runner = AsyncRunner::new(engine(&provider, fast_config()));
    assert!(runner.shutdown(Duration::from_millis(10)));
}
