//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Connectivity outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScanStatus {
    Open,
    Closed,
    Timeout,
    Error,
    /// Placeholder while a probe is in flight. Never persisted.
    Unknown,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Open => "OPEN",
            ScanStatus::Closed => "CLOSED",
            ScanStatus::Timeout => "TIMEOUT",
            ScanStatus::Error => "ERROR",
            ScanStatus::Unknown => "UNKNOWN",
        }
    }

    /// CLOSED and TIMEOUT both count as a blocked attempt.
    pub fn is_blocked(&self) -> bool {
        matches!(self, ScanStatus::Closed | ScanStatus::Timeout)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(ScanStatus::Open),
            "CLOSED" => Ok(ScanStatus::Closed),
            "TIMEOUT" => Ok(ScanStatus::Timeout),
            "ERROR" => Ok(ScanStatus::Error),
            "UNKNOWN" => Ok(ScanStatus::Unknown),
            other => Err(format!("unknown scan status: {}", other)),
        }
    }
}

/// Outcome of a protocol-level handshake on an open port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HandshakeResult {
    Success,
    Failed,
}

/// Protocol handshake details recorded next to the connectivity status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInfo {
    pub protocol: String,
    pub result: HandshakeResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProtocolInfo {
    pub fn success(protocol: &str, server_response: impl Into<String>) -> Self {
        Self {
            protocol: protocol.to_string(),
            result: HandshakeResult::Success,
            server_response: Some(server_response.into()),
            status_code: None,
            server_header: None,
            error: None,
        }
    }

    pub fn failed(protocol: &str, error: impl Into<String>) -> Self {
        Self {
            protocol: protocol.to_string(),
            result: HandshakeResult::Failed,
            server_response: None,
            status_code: None,
            server_header: None,
            error: Some(error.into()),
        }
    }
}

/// A single probe result. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub host: String,
    pub port: u16,
    pub status: ScanStatus,
    /// Only meaningful for OPEN, CLOSED and TIMEOUT.
    pub response_time_ms: Option<u64>,
    /// Capture time of the probe (start of invocation).
    pub timestamp: DateTime<Utc>,
    pub error_message: Option<String>,
    pub protocol_info: Option<ProtocolInfo>,
}

impl ScanResult {
    /// An ERROR result for `port`, used when a probe fails outside the prober.
    pub fn error(host: &str, port: u16, message: impl Into<String>) -> Self {
        Self {
            host: host.to_string(),
            port,
            status: ScanStatus::Error,
            response_time_ms: None,
            timestamp: Utc::now(),
            error_message: Some(message.into()),
            protocol_info: None,
        }
    }
}

/// The order-normalized results of one orchestration run against one host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanBatch {
    host: String,
    results: Vec<ScanResult>,
}

impl ScanBatch {
    /// Build a batch, sorting results ascending by port.
    pub fn new(host: impl Into<String>, mut results: Vec<ScanResult>) -> Self {
        results.sort_by_key(|r| r.port);
        Self {
            host: host.into(),
            results,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn results(&self) -> &[ScanResult] {
        &self.results
    }

    pub fn ports(&self) -> Vec<u16> {
        self.results.iter().map(|r| r.port).collect()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == ScanStatus::Open)
            .count()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScanResult> {
        self.results.iter()
    }
}

impl<'a> IntoIterator for &'a ScanBatch {
    type Item = &'a ScanResult;
    type IntoIter = std::slice::Iter<'a, ScanResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

/// A persisted scan result with its ledger metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ScanRecord {
    pub id: i64,
    /// Insertion time assigned by the database.
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub result: ScanResult,
}

/// Aggregates over the trailing 24 hours.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats24h {
    pub total_scans: i64,
    pub successful_scans: i64,
    /// Percentage of OPEN results, 0 when there are none.
    pub success_rate: f64,
    /// Distinct ports seen CLOSED or TIMEOUT at least once.
    pub blocked_ports: i64,
    /// Mean response time of OPEN results in milliseconds.
    pub avg_response_ms: f64,
}

/// A port whose blocked fraction exceeded the summary threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockedPort {
    pub port: u16,
    pub block_rate: f64,
    pub total_attempts: u64,
}

/// Summary of scan history over a trailing window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistorySummary {
    pub total_scans: u64,
    /// Results grouped by the minute they were captured in.
    pub unique_scan_sessions: u64,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub blocked_ports: Vec<BlockedPort>,
}

/// Ledger statistics for housekeeping displays.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_records: i64,
    pub earliest_record: Option<DateTime<Utc>>,
    pub latest_record: Option<DateTime<Utc>>,
    pub unique_hosts: i64,
    pub unique_ports: i64,
    pub size_bytes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(port: u16, status: ScanStatus) -> ScanResult {
        ScanResult {
            host: "mail.example.net".to_string(),
            port,
            status,
            response_time_ms: Some(10),
            timestamp: Utc::now(),
            error_message: None,
            protocol_info: None,
        }
    }

    #[test]
    fn test_batch_sorts_by_port() {
        let batch = ScanBatch::new(
            "mail.example.net",
            vec![
                result(587, ScanStatus::Open),
                result(25, ScanStatus::Closed),
                result(443, ScanStatus::Open),
            ],
        );
        assert_eq!(batch.ports(), vec![25, 443, 587]);
        assert_eq!(batch.open_count(), 2);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ScanStatus::Open,
            ScanStatus::Closed,
            ScanStatus::Timeout,
            ScanStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<ScanStatus>().unwrap(), status);
        }
        assert!("FILTERED".parse::<ScanStatus>().is_err());
    }

    #[test]
    fn test_protocol_info_json_omits_empty_fields() {
        let info = ProtocolInfo::failed("SMTP", "connection reset");
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(
            json,
            r#"{"protocol":"SMTP","result":"FAILED","error":"connection reset"}"#
        );
    }
}
