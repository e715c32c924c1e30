pub mod db;
pub mod export;
pub mod queries;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::measurement::MeasurementResult;

pub use db::ResultStore;
pub use queries::{MetricStats, Statistics};

// ============================================================================
// Shared data model structs
// ============================================================================

/// A persisted measurement. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: i64,
    /// Capture time in epoch seconds.
    pub timestamp: f64,
    /// Capture time as RFC 3339 UTC.
    pub test_date: String,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub server_info: String,
    pub is_valid: bool,
    pub warnings: Vec<String>,
}

impl StoredRecord {
    /// Record for `result`, not yet assigned an id.
    pub fn from_result(result: &MeasurementResult) -> Self {
        StoredRecord {
            id: 0,
            timestamp: epoch_seconds(&result.timestamp),
            test_date: iso_date(&result.timestamp),
            download_mbps: result.download_mbps,
            upload_mbps: result.upload_mbps,
            ping_ms: result.ping_ms,
            server_info: result.server_info.clone(),
            is_valid: result.is_valid,
            warnings: result.warnings.clone(),
        }
    }

    pub fn to_result(&self) -> MeasurementResult {
        MeasurementResult {
            download_mbps: self.download_mbps,
            upload_mbps: self.upload_mbps,
            ping_ms: self.ping_ms,
            server_info: self.server_info.clone(),
            is_valid: self.is_valid,
            warnings: self.warnings.clone(),
            timestamp: from_epoch_seconds(self.timestamp).unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    pub database_path: String,
    pub database_size_bytes: u64,
    pub total_records: i64,
    pub valid_records: i64,
    pub first_test: Option<String>,
    pub last_test: Option<String>,
}

// ============================================================================
// Time helpers
// ============================================================================

pub fn epoch_seconds(ts: &DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

pub fn from_epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
}

pub fn iso_date(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Epoch-seconds cutoff for "the last `days` days". A window reaching past
/// the representable calendar covers every record.
pub fn cutoff(days: u32) -> f64 {
    chrono::Duration::try_days(i64::from(days))
        .and_then(|span| Utc::now().checked_sub_signed(span))
        .map(|start| epoch_seconds(&start))
        .unwrap_or(f64::MIN)
}
