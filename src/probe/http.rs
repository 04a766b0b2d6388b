//! HTTP handshake implementation.

use super::{HandshakeError, Protocol};
use crate::db::{HandshakeResult, ProtocolInfo};

use std::time::Duration;

/// Send an HTTP HEAD request to `host:port`, following redirects.
///
/// Records the final status code and the `Server` header ("Unknown" when absent).
pub async fn run_http_head(
    protocol: Protocol,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<ProtocolInfo, HandshakeError> {
    let url = head_url(protocol, host, port);

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?;

    let response = client.head(&url).send().await.map_err(|e| {
        if e.is_timeout() {
            HandshakeError::Timeout(timeout)
        } else {
            HandshakeError::Http(e)
        }
    })?;

    let server_header = response
        .headers()
        .get(reqwest::header::SERVER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("Unknown")
        .to_string();

    Ok(ProtocolInfo {
        protocol: protocol.name().to_string(),
        result: HandshakeResult::Success,
        server_response: None,
        status_code: Some(response.status().as_u16()),
        server_header: Some(server_header),
        error: None,
    })
}

fn head_url(protocol: Protocol, host: &str, port: u16) -> String {
    let scheme = if protocol == Protocol::Https { "https" } else { "http" };
    if host.contains(':') && !host.starts_with('[') {
        format!("{}://[{}]:{}", scheme, host, port)
    } else {
        format!("{}://{}:{}", scheme, host, port)
    }
}
