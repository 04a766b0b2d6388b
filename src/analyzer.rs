//! Blocking-pattern heuristic over a single batch.

use crate::db::ScanBatch;
use crate::probe::email_ports;

/// Blocked mail ports in one batch needed to raise an advisory.
pub const BLOCKED_MAIL_PORT_THRESHOLD: usize = 3;

/// Inspect a batch for a mail-port blocking signature.
///
/// Counts mail ports that came back CLOSED or TIMEOUT and returns an advisory
/// when the count reaches [`BLOCKED_MAIL_PORT_THRESHOLD`]. Keeps no state
/// between calls.
pub fn analyze(batch: &ScanBatch) -> Option<String> {
    let mail_ports = email_ports();
    let blocked: Vec<_> = batch
        .iter()
        .filter(|r| r.status.is_blocked() && mail_ports.contains(&r.port))
        .collect();

    if blocked.len() < BLOCKED_MAIL_PORT_THRESHOLD {
        return None;
    }

    let at = blocked
        .iter()
        .map(|r| r.timestamp)
        .max()
        .unwrap_or_else(chrono::Utc::now);

    Some(format!(
        "POTENTIAL BLOCKING DETECTED at {}: {} email ports blocked",
        at.format("%Y-%m-%d %H:%M:%S UTC"),
        blocked.len()
    ))
}
