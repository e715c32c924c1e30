use rusqlite::params;
use serde::Serialize;

use super::{cutoff, ResultStore};
use crate::error::Result;

// ============================================================================
// Result types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub count: usize,
    pub period_days: Option<u32>,
    pub first_test: Option<String>,
    pub last_test: Option<String>,
    pub download: Option<MetricStats>,
    pub upload: Option<MetricStats>,
    pub ping: Option<MetricStats>,
}

// ============================================================================
// Helpers
// ============================================================================

impl MetricStats {
    /// Summary of `values`, or `None` when empty.
    pub fn from_values(mut values: Vec<f64>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        let n = values.len();
        let median = if n % 2 == 1 {
            values[n / 2]
        } else {
            (values[n / 2 - 1] + values[n / 2]) / 2.0
        };
        Some(MetricStats {
            min: values[0],
            max: values[n - 1],
            mean: values.iter().sum::<f64>() / n as f64,
            median,
            count: n,
        })
    }
}

// ============================================================================
// Queries
// ============================================================================

impl ResultStore {
    /// Aggregates over valid records, optionally limited to the last
    /// `since_days`.
    pub fn statistics(&self, since_days: Option<u32>) -> Result<Statistics> {
        let conn = self.session()?;
        let mut stmt = conn.prepare(
            "SELECT download_mbps, upload_mbps, ping_ms, test_date FROM test_results
             WHERE is_valid = 1 AND (?1 IS NULL OR timestamp >= ?1)
             ORDER BY timestamp ASC, id ASC",
        )?;
        let mut rows = stmt.query(params![since_days.map(cutoff)])?;

        let mut downloads = Vec::new();
        let mut uploads = Vec::new();
        let mut pings = Vec::new();
        let mut first_test: Option<String> = None;
        let mut last_test: Option<String> = None;
        while let Some(row) = rows.next()? {
            downloads.push(row.get::<_, f64>(0)?);
            uploads.push(row.get::<_, f64>(1)?);
            pings.push(row.get::<_, f64>(2)?);
            let date: String = row.get(3)?;
            if first_test.is_none() {
                first_test = Some(date.clone());
            }
            last_test = Some(date);
        }

        Ok(Statistics {
            count: downloads.len(),
            period_days: since_days,
            first_test,
            last_test,
            download: MetricStats::from_values(downloads),
            upload: MetricStats::from_values(uploads),
            ping: MetricStats::from_values(pings),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_even_count_averages_middle_pair() {
        let stats = MetricStats::from_values(vec![40.0, 10.0, 30.0, 20.0]).unwrap();
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 40.0);
        assert_eq!(stats.mean, 25.0);
        assert_eq!(stats.median, 25.0);
        assert_eq!(stats.count, 4);
    }

    #[test]
    fn median_of_odd_count_is_middle_value() {
        let stats = MetricStats::from_values(vec![3.0, 100.0, 5.0]).unwrap();
        assert_eq!(stats.median, 5.0);
    }

    #[test]
    fn empty_input_has_no_stats() {
        assert!(MetricStats::from_values(Vec::new()).is_none());
    }
}
