pub mod engine;
pub mod http;
pub mod provider;
pub mod validation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use engine::SpeedTestEngine;
pub use provider::{MeasurementProvider, ProgressSink, ProviderError, ServerDescriptor};

// ============================================================================
// Results
// ============================================================================

/// Validated outcome of one measurement, in display units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub server_info: String,
    pub is_valid: bool,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl MeasurementResult {
    /// An invalid, value-less result carrying the given warnings.
    pub fn empty(warnings: Vec<String>) -> Self {
        MeasurementResult {
            download_mbps: 0.0,
            upload_mbps: 0.0,
            ping_ms: 0.0,
            server_info: String::new(),
            is_valid: false,
            warnings,
            timestamp: Utc::now(),
        }
    }
}

/// Provider figures before validation and unit conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMeasurement {
    pub download_bps: f64,
    pub upload_bps: f64,
    pub ping_ms: f64,
    pub server_info: String,
}

// ============================================================================
// Outcome classification
// ============================================================================

/// Why a run failed. Connectivity and timeout failures are transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Connectivity,
    Timeout,
    Internal,
}

impl FailureClass {
    pub fn tag(&self) -> &'static str {
        match self {
            FailureClass::Connectivity => "connectivity",
            FailureClass::Timeout => "timeout",
            FailureClass::Internal => "internal",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FailureClass::Connectivity | FailureClass::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "class", rename_all = "snake_case")]
pub enum TestStatus {
    /// Measured and within the reasonable bounds.
    Succeeded,
    /// Measured, but the values breached a reasonable bound.
    Rejected,
    Failed(FailureClass),
    Cancelled,
}

/// Terminal value of one engine invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub status: TestStatus,
    pub reason: String,
    pub attempts: u32,
    pub result: MeasurementResult,
}

impl TestOutcome {
    pub fn cancelled(attempts: u32) -> Self {
        TestOutcome {
            status: TestStatus::Cancelled,
            reason: "Test cancelled".to_string(),
            attempts,
            result: MeasurementResult::empty(Vec::new()),
        }
    }

    pub fn failed(class: FailureClass, reason: impl Into<String>, attempts: u32) -> Self {
        let reason = reason.into();
        TestOutcome {
            status: TestStatus::Failed(class),
            result: MeasurementResult::empty(vec![reason.clone()]),
            reason,
            attempts,
        }
    }

    /// Stable machine-readable tag for the outcome.
    pub fn classification(&self) -> &'static str {
        match self.status {
            TestStatus::Succeeded => "succeeded",
            TestStatus::Rejected => "rejected",
            TestStatus::Failed(class) => class.tag(),
            TestStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == TestStatus::Cancelled
    }

    pub fn is_success(&self) -> bool {
        self.status == TestStatus::Succeeded
    }
}

// ============================================================================
// Progress
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Attempt,
    ConnectivityStart,
    ConnectivityDone,
    ServerSelection,
    Latency,
    DownloadStart,
    DownloadProgress,
    DownloadDone,
    UploadStart,
    UploadProgress,
    UploadDone,
    RetryWait,
    Complete,
}

/// One progress update. `fraction` is `None` when progress is indeterminate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub stage: Stage,
    pub message: String,
    pub fraction: Option<f64>,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fraction {
            Some(p) => write!(f, "[{:>3.0}%] {}", p * 100.0, self.message),
            None => write!(f, "[ .. ] {}", self.message),
        }
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Shared cancellation flag, settable from any thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
