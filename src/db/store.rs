//! SQLite database store implementation.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Timelike, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, Result as SqlResult, Row};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::probe::port_description;

/// Storage format for timestamps; lexical order matches time order.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Blocked fraction above which a port is listed in a history summary.
pub const SUMMARY_BLOCK_THRESHOLD: f64 = 0.5;

/// Blocked percentage above which an hour is listed in the evidence report.
pub const REPORT_HOURLY_BLOCK_THRESHOLD: f64 = 30.0;

/// Fields of the row-oriented export. `protocol_info` is left out.
pub const EXPORT_FIELDS: [&str; 6] = [
    "timestamp",
    "host",
    "port",
    "status",
    "response_time_ms",
    "error_message",
];

const SELECT_SCANS: &str = "SELECT id, timestamp, host, port, status, response_time_ms, error_message, protocol_info, created_at FROM port_scans";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("refusing to persist in-flight result for port {0}")]
    Unfinished(u16),
}

/// Thread-safe database store.
///
/// All access goes through one connection behind a mutex, so concurrent
/// appends are serialized.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- Scan ledger ---

    /// Persist every result of a batch, returning the new row ids.
    pub fn append<'a, I>(&self, results: I) -> Result<Vec<i64>, DbError>
    where
        I: IntoIterator<Item = &'a ScanResult>,
    {
        let results: Vec<&ScanResult> = results.into_iter().collect();
        if let Some(r) = results.iter().find(|r| r.status == ScanStatus::Unknown) {
            return Err(DbError::Unfinished(r.port));
        }
        if results.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let mut ids = Vec::with_capacity(results.len());

        {
            let mut stmt = tx.prepare(
                "INSERT INTO port_scans (timestamp, host, port, status, response_time_ms, error_message, protocol_info)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;

            for r in results {
                let protocol_info = match &r.protocol_info {
                    Some(info) => Some(serde_json::to_string(info)?),
                    None => None,
                };
                stmt.execute(params![
                    format_db_time(r.timestamp),
                    r.host,
                    r.port,
                    r.status.as_str(),
                    r.response_time_ms.map(|ms| ms as i64),
                    r.error_message,
                    protocol_info,
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }

        tx.commit()?;
        Ok(ids)
    }

    /// Most recent results first, optionally filtered by host and port.
    pub fn recent(
        &self,
        limit: usize,
        host: Option<&str>,
        port: Option<u16>,
    ) -> Result<Vec<ScanRecord>, DbError> {
        let mut args = Vec::new();
        let mut sql = format!("{} WHERE 1=1", SELECT_SCANS);
        push_filters(&mut sql, &mut args, host, port);
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");
        args.push(SqlValue::Integer(limit as i64));

        self.query_scans(&sql, args)
    }

    /// Results with `start <= timestamp <= end`, ascending by timestamp.
    pub fn range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        host: Option<&str>,
        port: Option<u16>,
    ) -> Result<Vec<ScanRecord>, DbError> {
        let mut args = vec![
            SqlValue::Text(format_db_time(start)),
            SqlValue::Text(format_db_time(end)),
        ];
        let mut sql = format!("{} WHERE timestamp BETWEEN ? AND ?", SELECT_SCANS);
        push_filters(&mut sql, &mut args, host, port);
        sql.push_str(" ORDER BY timestamp ASC, id ASC");

        self.query_scans(&sql, args)
    }

    fn query_scans(&self, sql: &str, args: Vec<SqlValue>) -> Result<Vec<ScanRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let records = stmt
            .query_map(params_from_iter(args.iter()), scan_record_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(records)
    }

    // --- Aggregates ---

    /// Aggregates over the 24 hours before now.
    pub fn stats_24h(&self, host: Option<&str>) -> Result<Stats24h, DbError> {
        let end = Utc::now();
        self.stats_between(end - ChronoDuration::hours(24), end, host)
    }

    fn stats_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        host: Option<&str>,
    ) -> Result<Stats24h, DbError> {
        let mut args = vec![
            SqlValue::Text(format_db_time(start)),
            SqlValue::Text(format_db_time(end)),
        ];
        let mut sql = String::from(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'OPEN' THEN 1 ELSE 0 END), 0),
                    COUNT(DISTINCT CASE WHEN status IN ('CLOSED', 'TIMEOUT') THEN port END),
                    AVG(CASE WHEN status = 'OPEN' THEN response_time_ms END)
             FROM port_scans WHERE timestamp BETWEEN ? AND ?",
        );
        push_filters(&mut sql, &mut args, host, None);

        let conn = self.conn();
        let (total, open, blocked, avg): (i64, i64, i64, Option<f64>) =
            conn.query_row(&sql, params_from_iter(args.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;

        Ok(Stats24h {
            total_scans: total,
            successful_scans: open,
            success_rate: percent(open as u64, total as u64),
            blocked_ports: blocked,
            avg_response_ms: avg.unwrap_or(0.0),
        })
    }

    /// Summarize the last `hours` of results for `host`.
    pub fn history_summary(&self, hours: u32, host: &str) -> Result<HistorySummary, DbError> {
        let end = Utc::now();
        let start = window_start(end, ChronoDuration::try_hours(hours as i64));
        let records = self.range(start, end, Some(host), None)?;
        Ok(summarize(&records))
    }

    // --- Retention ---

    /// Delete results older than `days_to_keep` days and reclaim the space.
    ///
    /// Returns the number of rows removed.
    pub fn retention_prune(&self, days_to_keep: u32) -> Result<usize, DbError> {
        let cutoff = window_start(Utc::now(), ChronoDuration::try_days(days_to_keep as i64));
        self.delete_scans_before(cutoff)
    }

    /// Delete results with a timestamp before `cutoff` and vacuum.
    pub fn delete_scans_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM port_scans WHERE timestamp < ?1",
            params![format_db_time(cutoff)],
        )?;
        conn.execute_batch("VACUUM")?;
        Ok(removed)
    }

    // --- Configuration ---

    /// Read the key-value configuration. Values are decoded as JSON, falling
    /// back to the raw string.
    pub fn get_configuration(&self) -> Result<BTreeMap<String, Value>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key, value FROM configuration")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .map(|(key, raw)| {
                let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                (key, value)
            })
            .collect())
    }

    /// Write configuration entries. Strings are stored as-is, everything else
    /// as JSON. Existing keys are overwritten.
    pub fn save_configuration(&self, config: &BTreeMap<String, Value>) -> Result<(), DbError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO configuration (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )?;
            for (key, value) in config {
                let raw = match value {
                    Value::String(s) => s.clone(),
                    other => serde_json::to_string(other)?,
                };
                stmt.execute(params![key, raw])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    // --- Exports ---

    /// Write the last `days` of results as CSV. Returns the number of data rows.
    pub fn export_csv<W: Write>(&self, writer: W, days: u32) -> Result<usize, DbError> {
        let end = Utc::now();
        let start = window_start(end, ChronoDuration::try_days(days as i64));
        let records = self.range(start, end, None, None)?;

        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(EXPORT_FIELDS)?;
        for record in &records {
            let r = &record.result;
            wtr.write_record([
                r.timestamp.to_rfc3339(),
                r.host.clone(),
                r.port.to_string(),
                r.status.to_string(),
                r.response_time_ms.map(|ms| ms.to_string()).unwrap_or_default(),
                r.error_message.clone().unwrap_or_default(),
            ])?;
        }
        wtr.flush()?;
        Ok(records.len())
    }

    /// Plain-text evidence report for `host` over the last `days`.
    pub fn evidence_report(&self, host: &str, days: u32) -> Result<String, DbError> {
        self.evidence_report_at(host, days, Utc::now())
    }

    /// Evidence report as of `now`; identical ledgers give identical text.
    pub fn evidence_report_at(
        &self,
        host: &str,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<String, DbError> {
        let start = window_start(now, ChronoDuration::try_days(days as i64));
        let records = self.range(start, now, Some(host), None)?;
        Ok(render_report(host, days, start, now, &records))
    }

    // --- Status ---

    /// Ledger size and coverage.
    pub fn database_stats(&self) -> Result<DatabaseStats, DbError> {
        let conn = self.conn();
        let (total, earliest, latest, hosts, ports): (i64, Option<String>, Option<String>, i64, i64) =
            conn.query_row(
                "SELECT COUNT(*), MIN(timestamp), MAX(timestamp), COUNT(DISTINCT host), COUNT(DISTINCT port) FROM port_scans",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;

        Ok(DatabaseStats {
            total_records: total,
            earliest_record: earliest.as_deref().and_then(parse_db_time),
            latest_record: latest.as_deref().and_then(parse_db_time),
            unique_hosts: hosts,
            unique_ports: ports,
            size_bytes: page_count * page_size,
        })
    }
}

fn push_filters(sql: &mut String, args: &mut Vec<SqlValue>, host: Option<&str>, port: Option<u16>) {
    if let Some(host) = host {
        sql.push_str(" AND host = ?");
        args.push(SqlValue::Text(host.to_string()));
    }
    if let Some(port) = port {
        sql.push_str(" AND port = ?");
        args.push(SqlValue::Integer(port as i64));
    }
}

fn scan_record_from_row(row: &Row<'_>) -> SqlResult<ScanRecord> {
    let time_str: String = row.get(1)?;
    let status_str: String = row.get(4)?;
    let status = status_str.parse::<ScanStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into())
    })?;
    let timestamp = parse_db_time(&time_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("invalid timestamp: {}", time_str).into(),
        )
    })?;
    let protocol_info: Option<String> = row.get(7)?;
    let created_at: Option<String> = row.get(8)?;

    Ok(ScanRecord {
        id: row.get(0)?,
        created_at: created_at.as_deref().and_then(parse_db_time),
        result: ScanResult {
            host: row.get(2)?,
            port: row.get(3)?,
            status,
            response_time_ms: row.get::<_, Option<i64>>(5)?.map(|ms| ms.max(0) as u64),
            timestamp,
            error_message: row.get(6)?,
            protocol_info: protocol_info.and_then(|s| serde_json::from_str(&s).ok()),
        },
    })
}

fn summarize(records: &[ScanRecord]) -> HistorySummary {
    if records.is_empty() {
        return HistorySummary::default();
    }

    let mut sessions = BTreeSet::new();
    let mut open = 0u64;
    let mut open_times = Vec::new();
    let mut per_port: BTreeMap<u16, (u64, u64)> = BTreeMap::new();

    for record in records {
        let r = &record.result;
        sessions.insert(r.timestamp.format("%Y-%m-%d %H:%M").to_string());

        if r.status == ScanStatus::Open {
            open += 1;
            if let Some(ms) = r.response_time_ms {
                open_times.push(ms);
            }
        }

        let entry = per_port.entry(r.port).or_default();
        entry.0 += 1;
        if r.status.is_blocked() {
            entry.1 += 1;
        }
    }

    let blocked_ports = per_port
        .into_iter()
        .filter(|&(_, (total, blocked))| blocked as f64 / total as f64 > SUMMARY_BLOCK_THRESHOLD)
        .map(|(port, (total, blocked))| BlockedPort {
            port,
            block_rate: percent(blocked, total),
            total_attempts: total,
        })
        .collect();

    HistorySummary {
        total_scans: records.len() as u64,
        unique_scan_sessions: sessions.len() as u64,
        success_rate: percent(open, records.len() as u64),
        avg_response_ms: mean(&open_times),
        blocked_ports,
    }
}

fn render_report(
    host: &str,
    days: u32,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
    records: &[ScanRecord],
) -> String {
    let mut lines = vec![
        "Port Monitoring Evidence Report".to_string(),
        format!("Generated: {}", now.format("%Y-%m-%d %H:%M:%S UTC")),
        format!(
            "Period: {} to {}",
            start.format("%Y-%m-%d"),
            now.format("%Y-%m-%d")
        ),
        format!("Target Server: {}", host),
        String::new(),
        "SUMMARY:".to_string(),
        format!("Total Scans: {}", records.len()),
        format!("Monitoring Period: {} days", days),
        String::new(),
        "PORT ANALYSIS:".to_string(),
    ];

    // (total, open) per port
    let mut per_port: BTreeMap<u16, (u64, u64)> = BTreeMap::new();
    // (total, blocked) per UTC hour of day
    let mut per_hour: BTreeMap<u32, (u64, u64)> = BTreeMap::new();

    for record in records {
        let r = &record.result;
        let port = per_port.entry(r.port).or_default();
        port.0 += 1;
        if r.status == ScanStatus::Open {
            port.1 += 1;
        }

        let hour = per_hour.entry(r.timestamp.hour()).or_default();
        hour.0 += 1;
        if r.status.is_blocked() {
            hour.1 += 1;
        }
    }

    if per_port.is_empty() {
        lines.push("No scans recorded in this period.".to_string());
    }
    for (port, (total, open)) in &per_port {
        lines.push(format!(
            "Port {} ({}): {:.1}% success rate ({}/{} successful)",
            port,
            port_description(*port),
            percent(*open, *total),
            open,
            total
        ));
    }

    lines.push(String::new());
    lines.push("TIME-BASED BLOCKING ANALYSIS:".to_string());
    lines.push("(Hours when ports were consistently blocked)".to_string());

    for (hour, (total, blocked)) in &per_hour {
        let rate = percent(*blocked, *total);
        if rate > REPORT_HOURLY_BLOCK_THRESHOLD {
            lines.push(format!(
                "Hour {:02}:00 - {:.1}% blocking rate ({}/{} attempts blocked)",
                hour, rate, blocked, total
            ));
        }
    }

    lines.join("\n")
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn mean(values: &[u64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<u64>() as f64 / values.len() as f64
    }
}

fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
/// Start of a window of length `span` ending at `end`. Spans reaching past the
/// earliest representable time start there instead.
fn window_start(end: DateTime<Utc>, span: Option<ChronoDuration>) -> DateTime<Utc> {
    span.and_then(|span| end.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    // Try various formats
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Try ISO 8601
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
