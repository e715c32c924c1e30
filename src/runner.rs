use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::RESULT_CHANNEL_CAPACITY;
use crate::error::{Result, SpeedwatchError};
use crate::measurement::{CancelToken, Progress, SpeedTestEngine, TestOutcome};

struct Worker {
    handle: JoinHandle<()>,
    done_rx: flume::Receiver<()>,
}

/// Runs a [`SpeedTestEngine`] on a dedicated worker thread and relays
/// progress and the terminal outcome back to the owning thread.
///
/// At most one run is in flight per runner. Cancellation is observed by the
/// engine every `CANCEL_POLL_INTERVAL` and by the provider at its next
/// checkpoint. A cancel raised while idle applies to the next run, which then
/// makes no provider calls; the worker clears the flag once a run has
/// observed it.
pub struct AsyncRunner {
    engine: Arc<SpeedTestEngine>,
    cancel: CancelToken,
    progress_tx: flume::Sender<Progress>,
    progress_rx: flume::Receiver<Progress>,
    result_tx: flume::Sender<TestOutcome>,
    result_rx: flume::Receiver<TestOutcome>,
    worker: Option<Worker>,
    latest: Option<Progress>,
}

impl AsyncRunner {
    pub fn new(engine: Arc<SpeedTestEngine>) -> Self {
        let (progress_tx, progress_rx) = flume::unbounded();
        let (result_tx, result_rx) = flume::bounded(RESULT_CHANNEL_CAPACITY);
        Self {
            engine,
            cancel: CancelToken::new(),
            progress_tx,
            progress_rx,
            result_tx,
            result_rx,
            worker: None,
            latest: None,
        }
    }

    /// Start a run. Fails fast with `AlreadyRunning` while a run is in flight
    /// or its outcome has not been collected.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() || !self.result_rx.is_empty() {
            return Err(SpeedwatchError::AlreadyRunning);
        }
        self.reap();
        let _ = self.progress_rx.drain();
        self.latest = None;

        let engine = Arc::clone(&self.engine);
        let cancel = self.cancel.clone();
        let progress_tx = self.progress_tx.clone();
        let result_tx = self.result_tx.clone();
        let (done_tx, done_rx) = flume::bounded(1);

        let handle = thread::Builder::new()
            .name("speedtest-worker".into())
            .spawn(move || {
                let outcome = engine.run(&cancel, Some(progress_tx));
                if outcome.is_cancelled() {
                    cancel.reset();
                }
                if let Err(e) = result_tx.try_send(outcome) {
                    error!("Dropping speed test outcome: {}", e);
                }
                let _ = done_tx.send(());
            })?;

        info!("Speed test worker started");
        self.worker = Some(Worker { handle, done_rx });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Drain every buffered progress update and return the newest one, or
    /// `None` if nothing arrived since the last poll.
    pub fn poll_progress(&mut self) -> Option<Progress> {
        let newest = self.progress_rx.try_iter().last()?;
        self.latest = Some(newest.clone());
        Some(newest)
    }

    /// Most recent progress seen by [`poll_progress`](Self::poll_progress).
    pub fn latest_progress(&self) -> Option<&Progress> {
        self.latest.as_ref()
    }

    pub fn try_result(&mut self) -> Option<TestOutcome> {
        let outcome = self.result_rx.try_recv().ok()?;
        self.join_worker();
        Some(outcome)
    }

    pub fn wait_result(&mut self, timeout: Duration) -> Option<TestOutcome> {
        let outcome = self.result_rx.recv_timeout(timeout).ok()?;
        self.join_worker();
        Some(outcome)
    }

    pub fn cancel(&self) {
        debug!("Cancellation requested");
        self.cancel.cancel();
    }

    pub fn reset_cancel(&self) {
        self.cancel.reset();
    }

    /// Handle for cancelling from elsewhere, e.g. a signal handler.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Cancel any run and join the worker for at most `timeout`. Returns false
    /// if the worker had to be left behind.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };
        if !worker.handle.is_finished() {
            self.cancel.cancel();
        }
        match worker.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => {
                let _ = worker.handle.join();
                true
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                warn!("Speed test worker did not stop within {:?}, detaching", timeout);
                false
            }
        }
    }

    // The outcome is the worker's last message, so this join is immediate.
    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.handle.join();
        }
    }

    fn reap(&mut self) {
        if self.worker.as_ref().is_some_and(|w| w.handle.is_finished()) {
            if let Some(worker) = self.worker.take() {
                let _ = worker.handle.join();
            }
        }
    }
}

impl Drop for AsyncRunner {
    fn drop(&mut self) {
        if self.is_running() {
            self.cancel.cancel();
        }
    }
}
