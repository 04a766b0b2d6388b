//! Mail protocol handshakes: SMTP, POP3 and IMAP, plain or over TLS.

use super::{HandshakeError, Protocol};
use crate::db::ProtocolInfo;

use regex::Regex;
use std::sync::OnceLock;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;

const EHLO_NAME: &str = "portwatch.local";

/// A parsed SMTP reply, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl SmtpReply {
    fn text(&self) -> String {
        format!("{} {}", self.code, self.lines.join(" | "))
    }

    fn expect_code(self, code: u16) -> Result<Self, HandshakeError> {
        if self.code == code {
            Ok(self)
        } else {
            Err(HandshakeError::UnexpectedReply(self.text()))
        }
    }
}

/// Run the mail handshake for `protocol` over an already connected stream.
pub async fn run_mail_handshake(
    protocol: Protocol,
    host: &str,
    stream: TcpStream,
) -> Result<ProtocolInfo, HandshakeError> {
    let response = match protocol {
        Protocol::Smtp => smtp_exchange(stream).await?,
        Protocol::SmtpTls => smtp_exchange(tls_connect(host, stream).await?).await?,
        Protocol::SmtpStartTls => smtp_starttls_exchange(host, stream).await?,
        Protocol::Pop3 => pop3_exchange(stream).await?,
        Protocol::Pop3Tls => pop3_exchange(tls_connect(host, stream).await?).await?,
        Protocol::Imap => imap_exchange(stream).await?,
        Protocol::ImapTls => imap_exchange(tls_connect(host, stream).await?).await?,
        Protocol::Http | Protocol::Https => {
            return Err(HandshakeError::UnexpectedReply(format!(
                "{} is not a mail protocol",
                protocol.name()
            )))
        }
    };

    Ok(ProtocolInfo::success(protocol.name(), response))
}

/// Wrap a connected stream in TLS.
///
/// Reachability only: certificate trust is not evaluated.
async fn tls_connect<S>(host: &str, stream: S) -> Result<TlsStream<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    Ok(connector.connect(host, stream).await?)
}

/// Greeting, EHLO, QUIT. Returns the server greeting.
pub async fn smtp_exchange<S>(stream: S) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = BufReader::new(stream);
    let greeting = read_smtp_reply(&mut conn).await?.expect_code(220)?;
    smtp_command(&mut conn, &format!("EHLO {}", EHLO_NAME))
        .await?
        .expect_code(250)?;
    send_line(&mut conn, "QUIT").await?;
    Ok(greeting.text())
}

/// Greeting, EHLO, STARTTLS, then EHLO again inside TLS.
pub async fn smtp_starttls_exchange<S>(host: &str, stream: S) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = BufReader::new(stream);
    let greeting = read_smtp_reply(&mut conn).await?.expect_code(220)?;
    smtp_command(&mut conn, &format!("EHLO {}", EHLO_NAME))
        .await?
        .expect_code(250)?;
    smtp_command(&mut conn, "STARTTLS").await?.expect_code(220)?;

    let tls = tls_connect(host, conn.into_inner()).await?;
    let mut conn = BufReader::new(tls);
    smtp_command(&mut conn, &format!("EHLO {}", EHLO_NAME))
        .await?
        .expect_code(250)?;
    send_line(&mut conn, "QUIT").await?;
    Ok(greeting.text())
}

/// Read the `+OK` greeting and sign off.
pub async fn pop3_exchange<S>(stream: S) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = BufReader::new(stream);
    let greeting = read_line(&mut conn).await?;
    if !greeting.starts_with("+OK") {
        return Err(HandshakeError::UnexpectedReply(greeting));
    }
    send_line(&mut conn, "QUIT").await?;
    Ok(greeting)
}

/// Read the `* OK` (or `* PREAUTH`) greeting and log out.
pub async fn imap_exchange<S>(stream: S) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = BufReader::new(stream);
    let greeting = read_line(&mut conn).await?;
    if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
        return Err(HandshakeError::UnexpectedReply(greeting));
    }
    send_line(&mut conn, "a001 LOGOUT").await?;
    Ok(greeting)
}

async fn smtp_command<S>(conn: &mut BufReader<S>, command: &str) -> Result<SmtpReply, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_line(conn, command).await?;
    read_smtp_reply(conn).await
}

/// Read one SMTP reply, following `NNN-` continuation lines.
pub async fn read_smtp_reply<R>(reader: &mut R) -> Result<SmtpReply, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^(\d{3})([ -]?)(.*)$").unwrap());

    let mut lines = Vec::new();
    loop {
        let line = read_line(reader).await?;
        let caps = re
            .captures(&line)
            .ok_or_else(|| HandshakeError::UnexpectedReply(line.clone()))?;
        let code: u16 = caps[1]
            .parse()
            .map_err(|_| HandshakeError::UnexpectedReply(line.clone()))?;
        lines.push(caps[3].to_string());

        if &caps[2] != "-" {
            return Ok(SmtpReply { code, lines });
        }
    }
}

async fn read_line<R>(reader: &mut R) -> Result<String, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(HandshakeError::Closed);
    }
    Ok(line.trim_end().to_string())
}

async fn send_line<W>(writer: &mut W, line: &str) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    /// Play the server side of a line-based exchange: for each step, optionally
    /// wait for one client line, then write the reply.
    async fn scripted_server(server: DuplexStream, script: Vec<(bool, &'static str)>) -> Vec<String> {
        let mut conn = BufReader::new(server);
        let mut received = Vec::new();
        for (await_line, reply) in script {
            if await_line {
                match read_line(&mut conn).await {
                    Ok(line) => received.push(line),
                    Err(_) => break,
                }
            }
            if conn.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
        if let Ok(line) = read_line(&mut conn).await {
            received.push(line);
        }
        received
    }

    #[tokio::test]
    async fn test_smtp_exchange() {
        let (client, server) = duplex(1024);
        let server = tokio::spawn(scripted_server(
            server,
            vec![
                (false, "220 mx.example.net ESMTP ready\r\n"),
                (true, "250-mx.example.net\r\n250-SIZE 1000000\r\n250 HELP\r\n"),
            ],
        ));

        let greeting = smtp_exchange(client).await.unwrap();
        assert_eq!(greeting, "220 mx.example.net ESMTP ready");

        let received = server.await.unwrap();
        assert_eq!(received, vec!["EHLO portwatch.local", "QUIT"]);
    }

    #[tokio::test]
    async fn test_smtp_rejecting_greeting() {
        let (client, server) = duplex(1024);
        tokio::spawn(scripted_server(
            server,
            vec![(false, "554 no SMTP service here\r\n")],
        ));

        let err = smtp_exchange(client).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedReply(ref r) if r.starts_with("554")));
    }

    #[tokio::test]
    async fn test_smtp_connection_dropped() {
        let (client, server) = duplex(1024);
        drop(server);
        assert!(matches!(
            smtp_exchange(client).await.unwrap_err(),
            HandshakeError::Closed
        ));
    }

    #[tokio::test]
    async fn test_multiline_reply() {
        let data: &[u8] = b"250-first\r\n250-second\r\n250 last\r\n";
        let mut reader = BufReader::new(data);
        let reply = read_smtp_reply(&mut reader).await.unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.lines, vec!["first", "second", "last"]);
    }

    #[tokio::test]
    async fn test_imap_exchange() {
        let (client, server) = duplex(1024);
        let server = tokio::spawn(scripted_server(
            server,
            vec![(false, "* OK [CAPABILITY IMAP4rev1] ready\r\n")],
        ));

        let greeting = imap_exchange(client).await.unwrap();
        assert_eq!(greeting, "* OK [CAPABILITY IMAP4rev1] ready");
        assert_eq!(server.await.unwrap(), vec!["a001 LOGOUT"]);
    }

    #[tokio::test]
    async fn test_pop3_rejects_err_greeting() {
        let (client, server) = duplex(1024);
        tokio::spawn(scripted_server(server, vec![(false, "-ERR busy\r\n")]));
        assert!(pop3_exchange(client).await.is_err());
    }
}
