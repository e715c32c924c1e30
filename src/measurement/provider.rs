use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{CancelToken, FailureClass, Progress, Stage};

/// Capability interface of an external measurement backend.
///
/// All calls may block. Long-running calls receive a [`ProgressSink`] and
/// should return [`ProviderError::Interrupted`] once
/// [`ProgressSink::is_cancelled`] turns true.
pub trait MeasurementProvider: Send + Sync {
    fn check_connectivity(&self, timeout: Duration) -> bool;

    fn select_server(&self) -> Result<ServerDescriptor, ProviderError>;

    /// Round-trip latency in milliseconds.
    fn measure_latency(&self, server: &ServerDescriptor) -> Result<f64, ProviderError>;

    /// Download throughput in bits per second.
    fn measure_download(
        &self,
        server: &ServerDescriptor,
        sink: &ProgressSink,
    ) -> Result<f64, ProviderError>;

    /// Upload throughput in bits per second.
    fn measure_upload(
        &self,
        server: &ServerDescriptor,
        sink: &ProgressSink,
    ) -> Result<f64, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("Connection failed: {0}")]
    Connectivity(String),

    #[error("Unable to retrieve measurement configuration: {0}")]
    ConfigRetrieval(String),

    #[error("No measurement servers matched")]
    NoMatchedServers,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Interrupted by cancellation")]
    Interrupted,

    #[error("Unexpected error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Failure class, or `None` for a cancellation.
    pub fn class(&self) -> Option<FailureClass> {
        match self {
            ProviderError::Connectivity(_)
            | ProviderError::ConfigRetrieval(_)
            | ProviderError::NoMatchedServers => Some(FailureClass::Connectivity),
            ProviderError::Timeout(_) => Some(FailureClass::Timeout),
            ProviderError::Other(_) => Some(FailureClass::Internal),
            ProviderError::Interrupted => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub host: String,
    pub url: String,
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.host)
    }
}

// ============================================================================
// Progress plumbing
// ============================================================================

/// Progress sender that can be closed. After `close` returns no further
/// update goes out through any clone.
#[derive(Clone)]
pub(crate) struct ProgressRelay {
    tx: Arc<Mutex<Option<flume::Sender<Progress>>>>,
    detailed: bool,
}

impl ProgressRelay {
    pub(crate) fn new(tx: Option<flume::Sender<Progress>>, detailed: bool) -> Self {
        Self {
            tx: Arc::new(Mutex::new(tx)),
            detailed,
        }
    }

    /// A relay sharing the same channel but closable on its own.
    pub(crate) fn child(&self) -> Self {
        let tx = self.tx.lock().clone();
        Self::new(tx, self.detailed)
    }

    pub(crate) fn emit(&self, stage: Stage, message: impl Into<String>, fraction: Option<f64>) {
        let is_detail = matches!(stage, Stage::DownloadProgress | Stage::UploadProgress);
        if is_detail && !self.detailed {
            return;
        }
        let guard = self.tx.lock();
        if let Some(tx) = guard.as_ref() {
            // Unbounded: never blocks. A dropped receiver is not our problem.
            let _ = tx.send(Progress {
                stage,
                message: message.into(),
                fraction: fraction.map(|f| f.clamp(0.0, 1.0)),
            });
        }
    }

    pub(crate) fn close(&self) {
        self.tx.lock().take();
    }
}

/// Handed to a provider for one transfer phase.
pub struct ProgressSink {
    relay: ProgressRelay,
    cancel: CancelToken,
    stage: Stage,
    label: &'static str,
}

impl ProgressSink {
    pub(crate) fn new(
        relay: ProgressRelay,
        cancel: CancelToken,
        stage: Stage,
        label: &'static str,
    ) -> Self {
        Self {
            relay,
            cancel,
            stage,
            label,
        }
    }

    /// A sink that reports nowhere, for driving a provider directly.
    pub fn detached(cancel: CancelToken) -> Self {
        Self::new(
            ProgressRelay::new(None, false),
            cancel,
            Stage::DownloadProgress,
            "Transfer",
        )
    }

    /// Report transfer progress; `None` means indeterminate.
    pub fn report(&self, fraction: Option<f64>) {
        let message = match fraction {
            Some(f) => format!("{}: {:.0}%", self.label, f.clamp(0.0, 1.0) * 100.0),
            None => format!("{}...", self.label),
        };
        self.relay.emit(self.stage, message, fraction);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
