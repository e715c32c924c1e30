use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{cutoff, epoch_seconds, DatabaseInfo, StoredRecord};
use crate::config::DB_BUSY_TIMEOUT;
use crate::error::Result;
use crate::measurement::MeasurementResult;

pub(crate) const RECORD_COLUMNS: &str =
    "id, timestamp, test_date, download_mbps, upload_mbps, ping_ms, server_info, is_valid, warnings";

/// File-backed result history.
///
/// Every call opens its own connection with a busy timeout and closes it on
/// return, so the store can be shared across threads and processes; WAL
/// journaling lets readers proceed while a writer holds the lock.
#[derive(Debug, Clone)]
pub struct ResultStore {
    db_path: PathBuf,
}

impl ResultStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        info!("Result store opened at {:?}", db_path);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Scoped connection; closed when dropped.
    pub(crate) fn session(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(DB_BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.session()?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS test_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                download_mbps REAL NOT NULL,
                upload_mbps REAL NOT NULL,
                ping_ms REAL NOT NULL,
                server_info TEXT NOT NULL,
                is_valid BOOLEAN NOT NULL,
                warnings TEXT,
                test_date TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS latest_valid (
                slot INTEGER PRIMARY KEY CHECK (slot = 1),
                record_id INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_timestamp ON test_results(timestamp);
            CREATE INDEX IF NOT EXISTS idx_test_date ON test_results(test_date);
        ",
        )?;
        Ok(())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Append `result` to the history, valid or not.
    pub fn save(&self, result: &MeasurementResult) -> Result<i64> {
        let record = StoredRecord::from_result(result);
        let mut conn = self.session()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = insert_record(&tx, &record)?;
        tx.commit()?;
        debug!("Saved result {} (valid: {})", id, record.is_valid);
        Ok(id)
    }

    /// Point the quick-lookup cache at record `id`. Invalid results are
    /// ignored and `false` returned.
    pub fn cache_latest(&self, result: &MeasurementResult, id: i64) -> Result<bool> {
        if !result.is_valid {
            debug!("Not caching invalid result {}", id);
            return Ok(false);
        }
        let conn = self.session()?;
        conn.execute(
            "INSERT INTO latest_valid (slot, record_id) VALUES (1, ?1)
             ON CONFLICT(slot) DO UPDATE SET record_id = excluded.record_id",
            params![id],
        )?;
        Ok(true)
    }

    /// Delete records older than `keep_days`. Returns the number removed.
    pub fn cleanup(&self, keep_days: u32) -> Result<usize> {
        let mut conn = self.session()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let deleted = tx.execute(
            "DELETE FROM test_results WHERE timestamp < ?1",
            params![cutoff(keep_days)],
        )?;
        tx.execute(
            "DELETE FROM latest_valid WHERE record_id NOT IN (SELECT id FROM test_results)",
            [],
        )?;
        tx.commit()?;
        info!("Cleanup removed {} record(s) older than {} days", deleted, keep_days);
        Ok(deleted)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Newest record of any validity.
    pub fn latest(&self) -> Result<Option<StoredRecord>> {
        let conn = self.session()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM test_results ORDER BY timestamp DESC, id DESC LIMIT 1"
                ),
                [],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Newest valid record, as recorded by the quick-lookup cache.
    pub fn cached_latest(&self) -> Result<Option<StoredRecord>> {
        let conn = self.session()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {cols} FROM test_results
                     WHERE id = (SELECT record_id FROM latest_valid WHERE slot = 1)",
                    cols = RECORD_COLUMNS
                ),
                [],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Valid records, newest first, optionally limited to the last `since_days`.
    pub fn query(&self, since_days: Option<u32>) -> Result<Vec<StoredRecord>> {
        self.select(true, since_days)
    }

    /// Invalid records (failed or implausible runs), newest first.
    pub fn failures(&self, since_days: Option<u32>) -> Result<Vec<StoredRecord>> {
        self.select(false, since_days)
    }

    /// The `limit` newest valid records.
    pub fn recent(&self, limit: usize) -> Result<Vec<StoredRecord>> {
        let conn = self.session()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM test_results
             WHERE is_valid = 1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], row_to_record)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Valid records taken between `start` and `end` inclusive, newest first.
    /// An inverted range is empty.
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<StoredRecord>> {
        let conn = self.session()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM test_results
             WHERE is_valid = 1 AND timestamp BETWEEN ?1 AND ?2
             ORDER BY timestamp DESC, id DESC"
        ))?;
        let rows = stmt.query_map(
            params![epoch_seconds(&start), epoch_seconds(&end)],
            row_to_record,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    fn select(&self, valid: bool, since_days: Option<u32>) -> Result<Vec<StoredRecord>> {
        let conn = self.session()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM test_results
             WHERE is_valid = ?1 AND (?2 IS NULL OR timestamp >= ?2)
             ORDER BY timestamp DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![valid, since_days.map(cutoff)], row_to_record)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// One page of valid records, oldest first, strictly after the
    /// `(timestamp, id)` position `after`.
    pub(crate) fn batch(
        conn: &Connection,
        since: Option<f64>,
        after: Option<(f64, i64)>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RECORD_COLUMNS} FROM test_results
             WHERE is_valid = 1 AND (?1 IS NULL OR timestamp >= ?1)
               AND (?2 IS NULL OR timestamp > ?2 OR (timestamp = ?2 AND id > ?3))
             ORDER BY timestamp ASC, id ASC
             LIMIT ?4"
        ))?;
        let (after_ts, after_id) = match after {
            Some((ts, id)) => (Some(ts), id),
            None => (None, 0),
        };
        let rows = stmt.query_map(
            params![since, after_ts, after_id, limit as i64],
            row_to_record,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn database_info(&self) -> Result<DatabaseInfo> {
        let conn = self.session()?;
        let total_records: i64 =
            conn.query_row("SELECT COUNT(*) FROM test_results", [], |row| row.get(0))?;
        let valid_records: i64 = conn.query_row(
            "SELECT COUNT(*) FROM test_results WHERE is_valid = 1",
            [],
            |row| row.get(0),
        )?;
        let (first_test, last_test): (Option<String>, Option<String>) = conn.query_row(
            "SELECT MIN(test_date), MAX(test_date) FROM test_results WHERE is_valid = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let database_size_bytes = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(DatabaseInfo {
            database_path: self.db_path.display().to_string(),
            database_size_bytes,
            total_records,
            valid_records,
            first_test,
            last_test,
        })
    }
}

pub(crate) fn insert_record(conn: &Connection, record: &StoredRecord) -> Result<i64> {
    let warnings = if record.warnings.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&record.warnings)?)
    };
    conn.execute(
        "INSERT INTO test_results
            (timestamp, download_mbps, upload_mbps, ping_ms, server_info, is_valid, warnings, test_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.timestamp,
            record.download_mbps,
            record.upload_mbps,
            record.ping_ms,
            record.server_info,
            record.is_valid,
            warnings,
            record.test_date,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn row_to_record(row: &Row<'_>) -> rusqlite::Result<StoredRecord> {
    let id: i64 = row.get(0)?;
    let warnings = match row.get::<_, Option<String>>(8)? {
        None => Vec::new(),
        Some(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!("Record {} has unreadable warnings {:?}: {}", id, text, e);
            Vec::new()
        }),
    };
    Ok(StoredRecord {
        id,
        timestamp: row.get(1)?,
        test_date: row.get(2)?,
        download_mbps: row.get(3)?,
        upload_mbps: row.get(4)?,
        ping_ms: row.get(5)?,
        server_info: row.get(6)?,
        is_valid: row.get(7)?,
        warnings,
    })
}
