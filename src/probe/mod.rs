//! Probe module for port monitoring.
//!
//! A probe is one TCP connect against a single (host, port) pair plus, for known
//! mail and web ports, a short protocol handshake. Expected network outcomes
//! (refusal, timeout, DNS failure) are folded into the returned [`ScanResult`];
//! nothing here returns an error to the caller.

mod http;
mod mail;

pub use http::*;
pub use mail::*;

use crate::db::{ProtocolInfo, ScanResult, ScanStatus};

use chrono::Utc;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::error::Elapsed;

/// Handshake error types. Recorded inside `protocol_info`, never returned from a probe.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("connection closed by server")]
    Closed,
}

/// Protocol families with a handshake check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Smtp,
    SmtpTls,
    SmtpStartTls,
    Pop3,
    Pop3Tls,
    Imap,
    ImapTls,
    Http,
    Https,
}

impl Protocol {
    /// The handshake to run for a well-known port, if any.
    pub fn for_port(port: u16) -> Option<Self> {
        match port {
            25 => Some(Protocol::Smtp),
            465 => Some(Protocol::SmtpTls),
            587 => Some(Protocol::SmtpStartTls),
            110 => Some(Protocol::Pop3),
            995 => Some(Protocol::Pop3Tls),
            143 => Some(Protocol::Imap),
            993 => Some(Protocol::ImapTls),
            80 => Some(Protocol::Http),
            443 => Some(Protocol::Https),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Smtp | Protocol::SmtpTls | Protocol::SmtpStartTls => "SMTP",
            Protocol::Pop3 | Protocol::Pop3Tls => "POP3",
            Protocol::Imap | Protocol::ImapTls => "IMAP",
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
        }
    }

    pub fn is_web(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }
}

/// Ports monitored when nothing else is configured.
pub fn default_ports() -> Vec<u16> {
    vec![25, 465, 587, 110, 995, 143, 993, 80, 443]
}

/// Mail submission and retrieval ports.
pub fn email_ports() -> Vec<u16> {
    vec![25, 465, 587, 110, 995, 143, 993]
}

pub fn web_ports() -> Vec<u16> {
    vec![80, 443]
}

/// Human-readable description of a port.
pub fn port_description(port: u16) -> String {
    let known = match port {
        25 => "SMTP (Simple Mail Transfer Protocol)",
        465 => "SMTP over SSL/TLS",
        587 => "SMTP with STARTTLS",
        110 => "POP3 (Post Office Protocol v3)",
        995 => "POP3 over SSL/TLS",
        143 => "IMAP (Internet Message Access Protocol)",
        993 => "IMAP over SSL/TLS",
        80 => "HTTP (Hypertext Transfer Protocol)",
        443 => "HTTPS (HTTP over SSL/TLS)",
        _ => return format!("Custom port {}", port),
    };
    known.to_string()
}

/// Result of the connect phase, before it is folded into a `ScanResult`.
#[derive(Debug)]
enum ConnectOutcome<S = TcpStream> {
    Connected(S, u64),
    Refused(u64),
    TimedOut,
    Unresolved(String),
    Failed(String),
}

/// Probe a single port, running the handshake its well-known protocol implies.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> ScanResult {
    probe_as(host, port, timeout, Protocol::for_port(port)).await
}

/// Probe a single port with an explicit handshake choice.
pub async fn probe_as(
    host: &str,
    port: u16,
    timeout: Duration,
    protocol: Option<Protocol>,
) -> ScanResult {
    let mut result = ScanResult {
        host: host.to_string(),
        port,
        status: ScanStatus::Unknown,
        response_time_ms: None,
        timestamp: Utc::now(),
        error_message: None,
        protocol_info: None,
    };

    let outcome = connect(host, port, timeout).await;
    if let Some(stream) = record_outcome(&mut result, outcome, timeout) {
        if let Some(protocol) = protocol {
            result.protocol_info = Some(run_handshake(protocol, host, port, stream, timeout).await);
        }
    }

    result
}

/// Fold a connect outcome into `result`, handing back the stream when connected.
fn record_outcome<S>(result: &mut ScanResult, outcome: ConnectOutcome<S>, timeout: Duration) -> Option<S> {
    match outcome {
        ConnectOutcome::Connected(stream, elapsed_ms) => {
            result.status = ScanStatus::Open;
            result.response_time_ms = Some(elapsed_ms);
            return Some(stream);
        }
        ConnectOutcome::Refused(elapsed_ms) => {
            result.status = ScanStatus::Closed;
            result.response_time_ms = Some(elapsed_ms);
        }
        ConnectOutcome::TimedOut => {
            result.status = ScanStatus::Timeout;
            result.response_time_ms = Some(timeout.as_millis() as u64);
            result.error_message = Some("Connection timeout".to_string());
        }
        ConnectOutcome::Unresolved(e) => {
            result.status = ScanStatus::Error;
            result.error_message = Some(format!("DNS resolution failed: {}", e));
        }
        ConnectOutcome::Failed(e) => {
            result.status = ScanStatus::Error;
            result.error_message = Some(e);
        }
    }
    None
}

/// Check that `host` resolves to at least one address.
pub async fn resolve_host(host: &str, timeout: Duration) -> Result<Vec<SocketAddr>, String> {
    let lookup = tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0))).await;
    let addrs: Vec<SocketAddr> = match lookup {
        Ok(Ok(addrs)) => addrs.collect(),
        Ok(Err(e)) => return Err(e.to_string()),
        Err(_) => return Err(format!("lookup timed out after {:?}", timeout)),
    };
    if addrs.is_empty() {
        return Err(format!("no addresses found for {}", host));
    }
    Ok(addrs)
}

async fn connect(host: &str, port: u16, timeout: Duration) -> ConnectOutcome {
    let start = Instant::now();

    let addrs: Vec<SocketAddr> = match resolve_host(host, timeout).await {
        Ok(addrs) => addrs
            .into_iter()
            .map(|a| SocketAddr::new(a.ip(), port))
            .collect(),
        Err(e) => return ConnectOutcome::Unresolved(e),
    };

    let attempt = tokio::time::timeout(timeout, TcpStream::connect(&addrs[..])).await;
    classify_connect(attempt, elapsed_ms(start))
}

fn classify_connect<S>(attempt: Result<std::io::Result<S>, Elapsed>, elapsed_ms: u64) -> ConnectOutcome<S> {
    match attempt {
        Ok(Ok(stream)) => ConnectOutcome::Connected(stream, elapsed_ms),
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => ConnectOutcome::Refused(elapsed_ms),
        Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => ConnectOutcome::TimedOut,
        Ok(Err(e)) => ConnectOutcome::Failed(e.to_string()),
        Err(_) => ConnectOutcome::TimedOut,
    }
}

async fn run_handshake(
    protocol: Protocol,
    host: &str,
    port: u16,
    stream: TcpStream,
    timeout: Duration,
) -> ProtocolInfo {
    let exchange = async {
        if protocol.is_web() {
            drop(stream);
            run_http_head(protocol, host, port, timeout).await
        } else {
            run_mail_handshake(protocol, host, stream).await
        }
    };

    let outcome = match tokio::time::timeout(timeout, exchange).await {
        Ok(outcome) => outcome,
        Err(_) => Err(HandshakeError::Timeout(timeout)),
    };

    match outcome {
        Ok(info) => info,
        Err(e) => {
            tracing::debug!("{} handshake failed on {}:{}: {}", protocol.name(), host, port, e);
            ProtocolInfo::failed(protocol.name(), e.to_string())
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
