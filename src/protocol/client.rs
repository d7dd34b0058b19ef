//! Client side of the handshake

use super::{read_head, HandshakeMessage, ProtocolError, DEFAULT_HEADER_LIMIT};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Upgrade request used when no payload is configured
pub const DEFAULT_PAYLOAD: &str = "GET / HTTP/1.1[crlf]Host: [host][crlf]Connection: Upgrade[crlf]\
User-Agent: Mozilla/5.0[crlf]Upgrade: websocket[crlf]User: change-me[crlf]Password: change-me[crlf][crlf]";

/// Intermediary response bodies larger than this are not skipped
const MAX_SKIPPED_BODY: u64 = 1024 * 1024;

/// Handshake payload with substitution tokens.
///
/// `[crlf]`, `[lf]` and `[cr]` become line endings, `[host]` the configured
/// host, and `[split]` separates chunks that are written one by one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadTemplate {
    raw: String,
}

impl PayloadTemplate {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// Substitute every token except `[split]`
    pub fn render(&self, host: &str) -> String {
        self.raw
            .replace("[crlf]", "\r\n")
            .replace("[lf]", "\n")
            .replace("[cr]", "\r")
            .replace("[host]", host)
    }

    /// Rendered chunks in send order, empty ones dropped
    pub fn chunks(&self, host: &str) -> Vec<String> {
        self.render(host)
            .split("[split]")
            .filter(|chunk| !chunk.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Default for PayloadTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_PAYLOAD)
    }
}

/// Client handshake driver
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    template: PayloadTemplate,
    host: String,
    header_limit: usize,
    timeout: Duration,
}

impl ClientHandshake {
    pub fn new(template: PayloadTemplate, host: impl Into<String>) -> Self {
        Self {
            template,
            host: host.into(),
            header_limit: DEFAULT_HEADER_LIMIT,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header_limit(mut self, limit: usize) -> Self {
        self.header_limit = limit;
        self
    }

    /// Send the payload and wait for the tunnel's `101`.
    ///
    /// `4xx`/`5xx` heads fail with `HandshakeRejected` carrying the status
    /// line. `2xx` heads come from intermediaries and are skipped together
    /// with their body. Returns the `101` head; the bytes after it are left
    /// in `io` for the session.
    pub async fn run<S>(&self, io: &mut S) -> Result<HandshakeMessage, ProtocolError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin,
    {
        tokio::time::timeout(self.timeout, self.exchange(io))
            .await
            .unwrap_or_else(|_| Err(ProtocolError::timed_out()))
    }

    async fn exchange<S>(&self, io: &mut S) -> Result<HandshakeMessage, ProtocolError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin,
    {
        for chunk in self.template.chunks(&self.host) {
            io.write_all(chunk.as_bytes()).await?;
            io.flush().await?;
        }

        loop {
            let head = read_head(io, self.header_limit).await?;
            let Some(status) = head.status_code() else {
                debug!("Ignoring unrecognised response: {}", head.start_line());
                continue;
            };

            match status {
                101 => {
                    info!("{}", head.start_line());
                    return Ok(head);
                }
                400..=599 => {
                    return Err(ProtocolError::HandshakeRejected(head.start_line().to_string()))
                }
                200..=299 => {
                    debug!("Skipping intermediary response: {}", head.start_line());
                    skip_body(io, &head).await?;
                }
                _ => debug!("Ignoring response: {}", head.start_line()),
            }
        }
    }
}

async fn skip_body<S>(io: &mut S, head: &HandshakeMessage) -> Result<(), ProtocolError>
where
    S: AsyncBufRead + Unpin,
{
    let length = match head.header("content-length") {
        Some(value) => value
            .parse::<u64>()
            .map_err(|_| ProtocolError::MalformedHeader(format!("bad content-length: {}", value)))?,
        None => return Ok(()),
    };
    if length > MAX_SKIPPED_BODY {
        return Err(ProtocolError::MalformedHeader(format!(
            "intermediary body too large: {}",
            length
        )));
    }

    let skipped = tokio::io::copy(&mut (&mut *io).take(length), &mut tokio::io::sink()).await?;
    if skipped < length {
        return Err(ProtocolError::HandshakeIo(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed inside response body",
        )));
    }
    Ok(())
}
