use chrono::Utc;
use rusqlite::TransactionBehavior;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

use super::db::insert_record;
use super::{cutoff, iso_date, ResultStore, StoredRecord};
use crate::config::EXPORT_BATCH_SIZE;
use crate::error::{Result, SpeedwatchError};

const CSV_HEADER: [&str; 9] = [
    "id",
    "timestamp",
    "test_date",
    "download_mbps",
    "upload_mbps",
    "ping_ms",
    "server_info",
    "is_valid",
    "warnings",
];

#[derive(Deserialize)]
struct ExportDocument {
    results: Vec<StoredRecord>,
}

impl ResultStore {
    /// Write valid records, oldest first, as CSV. Rows are fetched
    /// `EXPORT_BATCH_SIZE` at a time. Returns the number written.
    pub fn export_csv(&self, path: &Path, since_days: Option<u32>) -> Result<usize> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "{}", CSV_HEADER.join(","))?;

        let total = self.for_each_batch(since_days, |record| {
            writeln!(out, "{}", csv_row(record))?;
            Ok(())
        })?;

        out.flush()?;
        info!("Exported {} record(s) to {:?}", total, path);
        Ok(total)
    }

    /// Write valid records, oldest first, as a JSON document. Records are
    /// streamed to the file rather than collected first.
    pub fn export_json(&self, path: &Path, since_days: Option<u32>) -> Result<usize> {
        let mut out = BufWriter::new(File::create(path)?);
        write!(
            out,
            "{{\n  \"export_date\": {},\n  \"export_period_days\": {},\n  \"results\": [",
            serde_json::to_string(&iso_date(&Utc::now()))?,
            serde_json::to_string(&since_days)?
        )?;

        let mut first = true;
        let total = self.for_each_batch(since_days, |record| {
            out.write_all(if first { "\n    " } else { ",\n    " }.as_bytes())?;
            first = false;
            serde_json::to_writer(&mut out, record)?;
            Ok(())
        })?;

        write!(out, "\n  ],\n  \"total_results\": {}\n}}\n", total)?;
        out.flush()?;
        info!("Exported {} record(s) to {:?}", total, path);
        Ok(total)
    }

    /// Insert the records of a CSV export. Ids are reassigned.
    pub fn import_csv(&self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path)?;
        let mut rows = parse_csv(&text).into_iter();
        match rows.next() {
            Some(header) if header == CSV_HEADER => {}
            _ => return Err(SpeedwatchError::Import("unexpected CSV header".into())),
        }
        let records = rows
            .enumerate()
            .map(|(i, fields)| record_from_csv(&fields).map_err(|e| line_error(i + 2, e)))
            .collect::<Result<Vec<_>>>()?;
        self.insert_all(&records)
    }

    /// Insert the records of a JSON export. Ids are reassigned.
    pub fn import_json(&self, path: &Path) -> Result<usize> {
        let doc: ExportDocument = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        self.insert_all(&doc.results)
    }

    fn insert_all(&self, records: &[StoredRecord]) -> Result<usize> {
        let mut conn = self.session()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for record in records {
            insert_record(&tx, record)?;
        }
        tx.commit()?;
        info!("Imported {} record(s)", records.len());
        Ok(records.len())
    }

    fn for_each_batch<F>(&self, since_days: Option<u32>, mut f: F) -> Result<usize>
    where
        F: FnMut(&StoredRecord) -> Result<()>,
    {
        let conn = self.session()?;
        let since = since_days.map(cutoff);
        let mut after = None;
        let mut total = 0;
        loop {
            let batch = Self::batch(&conn, since, after, EXPORT_BATCH_SIZE)?;
            for record in &batch {
                f(record)?;
            }
            total += batch.len();
            match batch.last() {
                Some(last) if batch.len() == EXPORT_BATCH_SIZE => {
                    after = Some((last.timestamp, last.id));
                }
                _ => return Ok(total),
            }
        }
    }
}

fn line_error(line: usize, message: String) -> SpeedwatchError {
    SpeedwatchError::Import(format!("row {}: {}", line, message))
}

// ============================================================================
// CSV
// ============================================================================

fn csv_row(record: &StoredRecord) -> String {
    let warnings = serde_json::to_string(&record.warnings).unwrap_or_else(|_| "[]".into());
    [
        record.id.to_string(),
        record.timestamp.to_string(),
        escape(&record.test_date),
        record.download_mbps.to_string(),
        record.upload_mbps.to_string(),
        record.ping_ms.to_string(),
        escape(&record.server_info),
        record.is_valid.to_string(),
        escape(&warnings),
    ]
    .join(",")
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split CSV text into rows of fields. Quoted fields may contain commas,
/// doubled quotes and line breaks.
fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

fn record_from_csv(fields: &[String]) -> std::result::Result<StoredRecord, String> {
    if fields.len() != CSV_HEADER.len() {
        return Err(format!(
            "expected {} fields, found {}",
            CSV_HEADER.len(),
            fields.len()
        ));
    }
    let num = |i: usize| {
        fields[i]
            .parse::<f64>()
            .map_err(|e| format!("{}: {}", CSV_HEADER[i], e))
    };
    Ok(StoredRecord {
        id: fields[0].parse().map_err(|e| format!("id: {}", e))?,
        timestamp: num(1)?,
        test_date: fields[2].clone(),
        download_mbps: num(3)?,
        upload_mbps: num(4)?,
        ping_ms: num(5)?,
        server_info: fields[6].clone(),
        is_valid: fields[7].parse().map_err(|e| format!("is_valid: {}", e))?,
        warnings: serde_json::from_str(&fields[8]).map_err(|e| format!("warnings: {}", e))?,
    })
}
