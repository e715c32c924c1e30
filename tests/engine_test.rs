mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{engine, fast_config, ScriptedProvider};
use speedwatch::measurement::{CancelToken, FailureClass, ProviderError, Stage, TestStatus};

#[test]
fn test_successful_run() {
    let provider = Arc::new(ScriptedProvider::new());
    let outcome = engine(&provider, fast_config()).run(&CancelToken::new(), None);

    assert_eq!(outcome.status, TestStatus::Succeeded);
    assert_eq!(outcome.classification(), "succeeded");
    assert_eq!(outcome.attempts, 1);
    assert!(outcome.result.is_valid);
    assert_eq!(outcome.result.download_mbps, 100.0);
    assert_eq!(outcome.result.upload_mbps, 20.0);
    assert_eq!(outcome.result.ping_ms, 15.0);
    assert_eq!(outcome.result.server_info, "Test ISP (speed.test.local)");
}

#[test]
fn test_transient_failures_then_success() {
    let provider = Arc::new(
        ScriptedProvider::new().failing_times(2, ProviderError::Connectivity("reset".into())),
    );
    let config = fast_config();
    assert_eq!(config.max_retries, 3);

    let outcome = engine(&provider, config).run(&CancelToken::new(), None);

    assert_eq!(outcome.status, TestStatus::Succeeded);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(provider.attempts(), 3);
}

#[test]
fn test_always_transient_uses_exactly_max_retries() {
    let provider = Arc::new(
        ScriptedProvider::new().always_failing(ProviderError::ConfigRetrieval("503".into())),
    );
    let config = fast_config();
    let outcome = engine(&provider, config.clone()).run(&CancelToken::new(), None);

    assert_eq!(outcome.status, TestStatus::Failed(FailureClass::Connectivity));
    assert_eq!(outcome.classification(), "connectivity");
    assert_eq!(outcome.attempts, config.max_retries);
    assert_eq!(provider.attempts(), config.max_retries as usize);
    assert!(outcome.reason.contains("All 3 attempts failed"));
    assert!(!outcome.result.is_valid);
    assert_eq!(outcome.result.warnings, vec![outcome.reason.clone()]);
}

#[test]
fn test_internal_error_is_not_retried() {
    let provider =
        Arc::new(ScriptedProvider::new().always_failing(ProviderError::Other("boom".into())));
    let outcome = engine(&provider, fast_config()).run(&CancelToken::new(), None);

    assert_eq!(outcome.status, TestStatus::Failed(FailureClass::Internal));
    assert_eq!(outcome.attempts, 1);
    assert_eq!(provider.attempts(), 1);
}

#[test]
fn test_cancel_before_start_makes_no_provider_calls() {
    let provider = Arc::new(ScriptedProvider::new());
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = engine(&provider, fast_config()).run(&cancel, None);

    assert!(outcome.is_cancelled());
    assert_eq!(outcome.classification(), "cancelled");
    assert_eq!(outcome.attempts, 0);
    assert_eq!(provider.total_calls(), 0);
}

#[test]
fn test_no_connectivity_skips_measurement() {
    let provider = Arc::new(ScriptedProvider::new().unreachable());
    let outcome = engine(&provider, fast_config()).run(&CancelToken::new(), None);

    assert_eq!(outcome.status, TestStatus::Failed(FailureClass::Connectivity));
    assert_eq!(outcome.reason, "No network connection");
    assert_eq!(outcome.attempts, 0);
    assert_eq!(provider.attempts(), 0);
}

#[test]
fn test_attempt_timeout_is_retried() {
    let provider =
        Arc::new(ScriptedProvider::new().with_transfer_time(Duration::from_secs(5)));
    let mut config = fast_config();
    config.speedtest_timeout = 0.3;
    config.max_retries = 2;

    let started = Instant::now();
    let outcome = engine(&provider, config).run(&CancelToken::new(), None);

    assert_eq!(outcome.status, TestStatus::Failed(FailureClass::Timeout));
    assert_eq!(outcome.attempts, 2);
    assert_eq!(provider.attempts(), 2);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn test_cancel_during_slow_measurement() {
    let provider =
        Arc::new(ScriptedProvider::new().with_transfer_time(Duration::from_secs(10)));
    let mut config = fast_config();
    config.speedtest_timeout = 60.0;
    let engine = engine(&provider, config);

    let cancel = CancelToken::new();
    let canceller = cancel.clone();
    let t = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        canceller.cancel();
    });

    let started = Instant::now();
    let outcome = engine.run(&cancel, None);
    t.join().unwrap();

    assert!(outcome.is_cancelled());
    assert_eq!(outcome.attempts, 1);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_cancel_during_retry_wait() {
    let provider = Arc::new(
        ScriptedProvider::new().always_failing(ProviderError::Connectivity("down".into())),
    );
    let mut config = fast_config();
    config.retry_delay = 30.0;
    let engine = engine(&provider, config);

    let cancel = CancelToken::new();
    let canceller = cancel.clone();
    let t = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        canceller.cancel();
    });

    let started = Instant::now();
    let outcome = engine.run(&cancel, None);
    t.join().unwrap();

    assert!(outcome.is_cancelled());
    assert_eq!(provider.attempts(), 1);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_cancel_raised_as_attempt_succeeds_wins() {
    let provider = Arc::new(ScriptedProvider::new());
    let cancel = CancelToken::new();
    provider.cancel_during_next_upload(cancel.clone());

    let outcome = engine(&provider, fast_config()).run(&cancel, None);
    assert!(outcome.is_cancelled());
    assert_eq!(outcome.attempts, 1);
    assert_eq!(provider.upload_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn test_implausible_result_is_rejected_without_retry() {
    // 2 Tbps is far beyond the reasonable bound.
    let provider = Arc::new(ScriptedProvider::new().with_speeds(2e12, 20e6, 15.0));
    let outcome = engine(&provider, fast_config()).run(&CancelToken::new(), None);

    assert_eq!(outcome.status, TestStatus::Rejected);
    assert_eq!(outcome.classification(), "rejected");
    assert_eq!(outcome.attempts, 1);
    assert!(!outcome.result.is_valid);
    assert!(!outcome.result.warnings.is_empty());
}

#[test]
fn test_progress_ends_with_complete() {
    let provider = Arc::new(ScriptedProvider::new());
    let (tx, rx) = flume::unbounded();
    let outcome = engine(&provider, fast_config()).run(&CancelToken::new(), Some(tx));
    assert!(outcome.is_success());

    let stages: Vec<Stage> = rx.drain().map(|p| p.stage).collect();
    assert_eq!(stages.first(), Some(&Stage::ConnectivityStart));
    assert_eq!(stages.last(), Some(&Stage::Complete));

    let pos = |s: Stage| stages.iter().position(|x| *x == s).unwrap();
    assert!(pos(Stage::Attempt) < pos(Stage::ServerSelection));
    assert!(pos(Stage::DownloadStart) < pos(Stage::DownloadProgress));
    assert!(pos(Stage::DownloadDone) < pos(Stage::UploadStart));
    assert!(pos(Stage::UploadProgress) < pos(Stage::UploadDone));
}

#[test]
fn test_detailed_progress_can_be_disabled() {
    let provider = Arc::new(ScriptedProvider::new());
    let mut config = fast_config();
    config.show_detailed_progress = false;
    let (tx, rx) = flume::unbounded();
    engine(&provider, config).run(&CancelToken::new(), Some(tx));

    let stages: Vec<Stage> = rx.drain().map(|p| p.stage).collect();
    assert!(stages.contains(&Stage::DownloadStart));
    assert!(!stages.contains(&Stage::DownloadProgress));
    assert!(!stages.contains(&Stage::UploadProgress));
}

#[test]
fn test_no_progress_after_terminal_outcome() {
    let provider =
        Arc::new(ScriptedProvider::new().with_transfer_time(Duration::from_millis(800)));
    let mut config = fast_config();
    config.speedtest_timeout = 0.2;
    config.max_retries = 1;
    let (tx, rx) = flume::unbounded();

    let outcome = engine(&provider, config).run(&CancelToken::new(), Some(tx));
    assert_eq!(outcome.status, TestStatus::Failed(FailureClass::Timeout));

    // Let the abandoned attempt run to its next checkpoint.
    thread::sleep(Duration::from_millis(500));
    let stages: Vec<Stage> = rx.drain().map(|p| p.stage).collect();
    assert_eq!(stages.last(), Some(&Stage::Complete));
    assert_eq!(stages.iter().filter(|s| **s == Stage::Complete).count(), 1);
}

#[test]
fn test_run_with_retry_skips_connectivity_check() {
    let provider = Arc::new(ScriptedProvider::new().unreachable());
    let outcome = engine(&provider, fast_config()).run_with_retry(&CancelToken::new(), None);

    assert!(outcome.is_success());
    assert_eq!(
        provider
            .connectivity_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[test]
fn test_check_connectivity() {
    let up = Arc::new(ScriptedProvider::new());
    let down = Arc::new(ScriptedProvider::new().unreachable());
    assert!(engine(&up, fast_config()).check_connectivity());
    assert!(!engine(&down, fast_config()).check_connectivity());
}
