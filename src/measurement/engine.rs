use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::provider::{MeasurementProvider, ProgressRelay, ProgressSink, ProviderError};
use super::validation;
use super::{CancelToken, FailureClass, Progress, RawMeasurement, Stage, TestOutcome, TestStatus};
use crate::config::{ATTEMPT_GRACE, CANCEL_POLL_INTERVAL};
use crate::settings::SpeedTestConfig;

/// Orchestrates one logical speed test against a [`MeasurementProvider`]:
/// connectivity pre-check, bounded and retried attempts, validation.
pub struct SpeedTestEngine {
    provider: Arc<dyn MeasurementProvider>,
    config: SpeedTestConfig,
}

/// Result of a provider call made on a helper thread.
enum Bounded<T> {
    Done(T),
    TimedOut,
    Cancelled,
    Lost,
}

impl SpeedTestEngine {
    pub fn new(provider: Arc<dyn MeasurementProvider>, config: SpeedTestConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &SpeedTestConfig {
        &self.config
    }

    /// Run one complete test. Progress goes to `progress` if given; the
    /// sender is never blocked on.
    pub fn run(
        &self,
        cancel: &CancelToken,
        progress: Option<flume::Sender<Progress>>,
    ) -> TestOutcome {
        let relay = ProgressRelay::new(progress, self.config.show_detailed_progress);
        let outcome = self.run_relayed(cancel, &relay);
        relay.emit(Stage::Complete, outcome.reason.clone(), Some(1.0));
        relay.close();
        info!(
            "Speed test finished: {} after {} attempt(s): {}",
            outcome.classification(),
            outcome.attempts,
            outcome.reason
        );
        outcome
    }

    fn run_relayed(&self, cancel: &CancelToken, relay: &ProgressRelay) -> TestOutcome {
        if cancel.is_cancelled() {
            debug!("Cancelled before start, skipping provider");
            return TestOutcome::cancelled(0);
        }

        relay.emit(Stage::ConnectivityStart, "Checking network connectivity...", None);
        match self.connectivity(cancel) {
            None => return TestOutcome::cancelled(0),
            Some(false) => {
                warn!("Connectivity check failed, not attempting measurement");
                return TestOutcome::failed(FailureClass::Connectivity, "No network connection", 0);
            }
            Some(true) => relay.emit(Stage::ConnectivityDone, "Network is reachable", None),
        }

        self.run_with_retry_relayed(cancel, relay)
    }

    /// Cheap reachability check bounded by `connectivity_check_timeout`.
    pub fn check_connectivity(&self) -> bool {
        self.connectivity(&CancelToken::new()).unwrap_or(false)
    }

    /// Attempt the measurement up to `max_retries` times without the
    /// connectivity pre-check.
    pub fn run_with_retry(
        &self,
        cancel: &CancelToken,
        progress: Option<flume::Sender<Progress>>,
    ) -> TestOutcome {
        let relay = ProgressRelay::new(progress, self.config.show_detailed_progress);
        let outcome = self.run_with_retry_relayed(cancel, &relay);
        relay.close();
        outcome
    }

    fn connectivity(&self, cancel: &CancelToken) -> Option<bool> {
        let timeout = self.config.connectivity_timeout();
        let abort = CancelToken::new();
        match self.call_bounded(timeout + ATTEMPT_GRACE, cancel, &abort, move |p| {
            p.check_connectivity(timeout)
        }) {
            Bounded::Done(reachable) => Some(reachable),
            Bounded::Cancelled => None,
            Bounded::TimedOut | Bounded::Lost => Some(false),
        }
    }

    fn run_with_retry_relayed(&self, cancel: &CancelToken, relay: &ProgressRelay) -> TestOutcome {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return TestOutcome::cancelled(attempt);
            }
            attempt += 1;
            relay.emit(
                Stage::Attempt,
                format!("Attempt {}/{}", attempt, max_attempts),
                Some(0.0),
            );

            let error = match self.attempt(cancel, relay) {
                Ok(_) if cancel.is_cancelled() => return TestOutcome::cancelled(attempt),
                Ok(raw) => return self.finish(&raw, attempt),
                Err(ProviderError::Interrupted) => return TestOutcome::cancelled(attempt),
                Err(_) if cancel.is_cancelled() => return TestOutcome::cancelled(attempt),
                Err(e) => e,
            };

            let class = error.class().unwrap_or(FailureClass::Internal);
            warn!(
                "Attempt {}/{} failed ({}): {}",
                attempt,
                max_attempts,
                class.tag(),
                error
            );
            if !class.is_transient() {
                return TestOutcome::failed(class, error.to_string(), attempt);
            }
            if attempt >= max_attempts {
                return TestOutcome::failed(
                    class,
                    format!("All {} attempts failed; last error: {}", max_attempts, error),
                    attempt,
                );
            }

            let wait = self.config.retry_wait(attempt);
            relay.emit(
                Stage::RetryWait,
                format!("Retrying in {:.1} seconds...", wait.as_secs_f64()),
                None,
            );
            if wait_cancellable(cancel, wait) {
                return TestOutcome::cancelled(attempt);
            }
        }
    }

    fn finish(&self, raw: &RawMeasurement, attempts: u32) -> TestOutcome {
        let result = validation::validate(raw, &self.config);
        let (status, reason) = if result.is_valid {
            (TestStatus::Succeeded, "Test completed".to_string())
        } else {
            let why = result
                .warnings
                .first()
                .cloned()
                .unwrap_or_else(|| "Result failed validation".to_string());
            (TestStatus::Rejected, why)
        };
        TestOutcome {
            status,
            reason,
            attempts,
            result,
        }
    }

    /// One measurement attempt on a helper thread, bounded by
    /// `speedtest_timeout`. An abandoned attempt has its progress relay closed
    /// and its own abort flag raised so the provider stops at its next
    /// checkpoint.
    fn attempt(
        &self,
        cancel: &CancelToken,
        relay: &ProgressRelay,
    ) -> Result<RawMeasurement, ProviderError> {
        let timeout = self.config.attempt_timeout();
        let abort = CancelToken::new();
        let attempt_relay = relay.child();

        let thread_relay = attempt_relay.clone();
        let thread_abort = abort.clone();
        let outcome = self.call_bounded(timeout, cancel, &abort, move |p| {
            measure(p, &thread_relay, &thread_abort)
        });

        match outcome {
            Bounded::Done(result) => result,
            Bounded::Cancelled => {
                attempt_relay.close();
                Err(ProviderError::Interrupted)
            }
            Bounded::TimedOut => {
                attempt_relay.close();
                Err(ProviderError::Timeout(format!(
                    "no result within {:.0}s",
                    timeout.as_secs_f64()
                )))
            }
            Bounded::Lost => {
                attempt_relay.close();
                Err(ProviderError::Other("measurement thread terminated".into()))
            }
        }
    }

    /// Run `f` against the provider on a helper thread and wait at most
    /// `timeout`, polling `cancel` every [`CANCEL_POLL_INTERVAL`]. On timeout
    /// or cancellation `abort` is raised and the helper is left to finish.
    fn call_bounded<T, F>(
        &self,
        timeout: Duration,
        cancel: &CancelToken,
        abort: &CancelToken,
        f: F,
    ) -> Bounded<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MeasurementProvider) -> T + Send + 'static,
    {
        let provider = Arc::clone(&self.provider);
        let (tx, rx) = flume::bounded(1);
        let spawned = thread::Builder::new()
            .name("speedtest-call".into())
            .spawn(move || {
                let value = f(provider.as_ref());
                let _ = tx.send(value);
            });
        if let Err(e) = spawned {
            error!("Failed to spawn measurement thread: {}", e);
            return Bounded::Lost;
        }

        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                abort.cancel();
                return Bounded::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                abort.cancel();
                return Bounded::TimedOut;
            }
            match rx.recv_timeout((deadline - now).min(CANCEL_POLL_INTERVAL)) {
                Ok(value) => return Bounded::Done(value),
                Err(flume::RecvTimeoutError::Timeout) => continue,
                Err(flume::RecvTimeoutError::Disconnected) => {
                    error!("Measurement thread ended without a result");
                    return Bounded::Lost;
                }
            }
        }
    }
}

/// The provider call sequence for one attempt.
fn measure(
    provider: &dyn MeasurementProvider,
    relay: &ProgressRelay,
    abort: &CancelToken,
) -> Result<RawMeasurement, ProviderError> {
    let checkpoint = || {
        if abort.is_cancelled() {
            Err(ProviderError::Interrupted)
        } else {
            Ok(())
        }
    };

    relay.emit(Stage::ServerSelection, "Selecting best server...", None);
    checkpoint()?;
    let server = provider.select_server()?;
    debug!("Selected server {}", server);

    relay.emit(Stage::Latency, format!("Measuring latency to {}...", server), None);
    checkpoint()?;
    let ping_ms = provider.measure_latency(&server)?;

    relay.emit(Stage::DownloadStart, "Testing download speed...", Some(0.0));
    checkpoint()?;
    let sink = ProgressSink::new(
        relay.clone(),
        abort.clone(),
        Stage::DownloadProgress,
        "Download",
    );
    let download_bps = provider.measure_download(&server, &sink)?;
    relay.emit(Stage::DownloadDone, "Download complete", Some(1.0));

    relay.emit(Stage::UploadStart, "Testing upload speed...", Some(0.0));
    checkpoint()?;
    let sink = ProgressSink::new(relay.clone(), abort.clone(), Stage::UploadProgress, "Upload");
    let upload_bps = provider.measure_upload(&server, &sink)?;
    relay.emit(Stage::UploadDone, "Upload complete", Some(1.0));
    checkpoint()?;

    Ok(RawMeasurement {
        download_bps,
        upload_bps,
        ping_ms,
        server_info: server.to_string(),
    })
}

/// Sleep for `total`, waking every [`CANCEL_POLL_INTERVAL`]. Returns true if
/// cancelled.
fn wait_cancellable(cancel: &CancelToken, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
    }
}
