//! Bounded reader for HTTP-shaped heads

use super::ProtocolError;
use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// A request or response head: start line plus headers.
///
/// Header names are stored lower-cased; a repeated header keeps its last
/// value.
#[derive(Debug, Clone, Default)]
pub struct HandshakeMessage {
    start_line: String,
    lines: Vec<String>,
    headers: HashMap<String, String>,
    size: usize,
}

impl HandshakeMessage {
    /// Request line, or status line for responses
    pub fn start_line(&self) -> &str {
        &self.start_line
    }

    /// Look up a header by name, ignoring case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether `needle` occurs in the start line or any header line, ignoring ASCII case
    pub fn contains(&self, needle: &str) -> bool {
        let needle = needle.to_ascii_lowercase();
        std::iter::once(&self.start_line)
            .chain(self.lines.iter())
            .any(|line| line.to_ascii_lowercase().contains(&needle))
    }

    /// Status code of a response head
    pub fn status_code(&self) -> Option<u16> {
        let mut parts = self.start_line.split_whitespace();
        let version = parts.next()?;
        if !version.starts_with("HTTP/") {
            return None;
        }
        parts.next()?.parse().ok()
    }

    /// Bytes consumed from the connection, blank line included
    pub fn size(&self) -> usize {
        self.size
    }

    fn push_line(&mut self, line: String) {
        if self.start_line.is_empty() {
            self.start_line = line;
            return;
        }

        if let Some((name, value)) = line.split_once(':') {
            self.headers
                .insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
        self.lines.push(line);
    }
}

/// Read one head, line by line, stopping at the first empty line.
///
/// Never consumes bytes past the terminating blank line, so whatever the
/// peer sends next stays in `reader`. Fails with `HeaderTooLarge` once more
/// than `limit` bytes were needed.
pub async fn read_head<R>(reader: &mut R, limit: usize) -> Result<HandshakeMessage, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut message = HandshakeMessage::default();
    let mut line = Vec::new();

    loop {
        let remaining = limit.saturating_sub(message.size) as u64;
        line.clear();

        let n = (&mut *reader)
            .take(remaining + 1)
            .read_until(b'\n', &mut line)
            .await?;

        message.size += n;
        if message.size > limit {
            return Err(ProtocolError::HeaderTooLarge(limit));
        }
        if n == 0 || line.last() != Some(&b'\n') {
            return Err(ProtocolError::HandshakeIo(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside header",
            )));
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(&['\r', '\n'][..]);

        if text.is_empty() {
            if message.start_line.is_empty() {
                return Err(ProtocolError::MalformedHeader("empty start line".into()));
            }
            return Ok(message);
        }

        message.push_line(text.to_string());
    }
}
