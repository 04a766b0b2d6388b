//! Configuration module for PortWatch.
//!
//! Process settings come from environment variables with sensible defaults.
//! The monitoring configuration (host, interval, ports) lives in the store's
//! key-value table and is edited at runtime.

use crate::probe::default_ports;

use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Store keys for the monitoring configuration.
pub const KEY_SERVER: &str = "server";
pub const KEY_INTERVAL: &str = "interval";
pub const KEY_PORTS: &str = "ports";

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the SQLite database file (default: "port_monitor.db")
    pub db_path: String,
    /// Per-probe connect and handshake timeout (default: 10s)
    pub probe_timeout: Duration,
    /// Concurrent probes per batch (default: 10)
    pub max_workers: usize,
    /// Days of scan history kept by the retention task (default: 30)
    pub retention_days: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "port_monitor.db".to_string(),
            probe_timeout: Duration::from_secs(10),
            max_workers: 10,
            retention_days: 30,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORTWATCH_DB_PATH`: Database file path (default: "port_monitor.db")
    /// - `PORTWATCH_PROBE_TIMEOUT`: Probe timeout in seconds (default: 10)
    /// - `PORTWATCH_MAX_WORKERS`: Concurrent probes per batch (default: 10)
    /// - `PORTWATCH_RETENTION_DAYS`: Days of history to keep (default: 30)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(db_path) = env::var("PORTWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(secs) = env::var("PORTWATCH_PROBE_TIMEOUT") {
            match secs.parse::<u64>() {
                Ok(secs) if secs > 0 => cfg.probe_timeout = Duration::from_secs(secs),
                _ => tracing::warn!("Ignoring invalid PORTWATCH_PROBE_TIMEOUT={}", secs),
            }
        }

        if let Ok(workers) = env::var("PORTWATCH_MAX_WORKERS") {
            match workers.parse::<usize>() {
                Ok(n) if n > 0 => cfg.max_workers = n,
                _ => tracing::warn!("Ignoring invalid PORTWATCH_MAX_WORKERS={}", workers),
            }
        }

        if let Ok(days) = env::var("PORTWATCH_RETENTION_DAYS") {
            match days.parse::<u32>() {
                Ok(n) if n > 0 => cfg.retention_days = n,
                _ => tracing::warn!("Ignoring invalid PORTWATCH_RETENTION_DAYS={}", days),
            }
        }

        cfg
    }
}

/// Monitoring configuration validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("host must not be empty")]
    EmptyHost,
    #[error("scan interval must be at least 1 minute, got {0}")]
    InvalidInterval(u32),
    #[error("at least one port is required")]
    NoPorts,
    #[error("port {0} is out of range 1-65535")]
    InvalidPort(u16),
}

/// What to monitor and how often.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub host: String,
    /// Nominal minutes between scans, before jitter.
    pub scan_interval: u32,
    pub ports: Vec<u16>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            host: "mail.comcast.net".to_string(),
            scan_interval: 60,
            ports: default_ports(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.scan_interval < 1 {
            return Err(ConfigError::InvalidInterval(self.scan_interval));
        }
        if self.ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        if let Some(&port) = self.ports.iter().find(|&&p| p == 0) {
            return Err(ConfigError::InvalidPort(port));
        }
        Ok(())
    }

    /// Build from a stored key-value record. Missing or malformed fields keep
    /// their defaults.
    pub fn from_record(record: &BTreeMap<String, Value>) -> Self {
        let mut cfg = Self::default();

        if let Some(value) = record.get(KEY_SERVER) {
            match value.as_str() {
                Some(host) if !host.trim().is_empty() => cfg.host = host.to_string(),
                _ => tracing::warn!("Ignoring stored server value {}", value),
            }
        }

        if let Some(value) = record.get(KEY_INTERVAL) {
            match value.as_u64().and_then(|n| u32::try_from(n).ok()) {
                Some(n) if n >= 1 => cfg.scan_interval = n,
                _ => tracing::warn!("Ignoring stored interval value {}", value),
            }
        }

        if let Some(value) = record.get(KEY_PORTS) {
            match serde_json::from_value::<Vec<u16>>(value.clone()) {
                Ok(ports) if !ports.is_empty() && !ports.contains(&0) => cfg.ports = ports,
                _ => tracing::warn!("Ignoring stored ports value {}", value),
            }
        }

        cfg
    }

    /// Key-value form written to the store.
    pub fn to_record(&self) -> BTreeMap<String, Value> {
        let mut record = BTreeMap::new();
        record.insert(KEY_SERVER.to_string(), Value::from(self.host.clone()));
        record.insert(KEY_INTERVAL.to_string(), Value::from(self.scan_interval));
        record.insert(KEY_PORTS.to_string(), Value::from(self.ports.clone()));
        record
    }
}
