//! Crafted responses written by the server

use super::ProtocolError;
use crate::admission::AdmissionStatus;
use std::fmt::Write as _;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// A response head with an optional short body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u16,
    reason: &'static str,
    headers: Vec<(&'static str, String)>,
    body: String,
}

impl Response {
    fn new(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn body(mut self, content_type: &'static str, body: impl Into<String>) -> Self {
        self.body = body.into();
        let length = self.body.len().to_string();
        self.header("Content-Type", content_type)
            .header("Content-Length", length)
    }

    fn rejection(status: u16, reason: &'static str, server_name: &str) -> Self {
        Self::new(status, reason)
            .header("Server", server_name)
            .body("text/plain", reason)
            .header("Connection", "close")
    }

    /// `101` handing the connection over to the session
    pub fn switching_protocols() -> Self {
        Self::new(101, "Switching Protocols")
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
    }

    /// Answer to the status probe
    pub fn status(status: AdmissionStatus, server_name: &str) -> Self {
        Self::new(200, "OK")
            .header("Server", server_name)
            .body("application/json", status.to_json())
            .header("Connection", "close")
    }

    pub fn bad_request(server_name: &str) -> Self {
        Self::rejection(400, "Bad Request", server_name)
    }

    pub fn invalid_payload(server_name: &str) -> Self {
        Self::rejection(403, "Invalid Payload", server_name)
    }

    pub fn invalid_credentials(server_name: &str) -> Self {
        Self::rejection(403, "Invalid Credentials", server_name)
    }

    pub fn server_full(server_name: &str) -> Self {
        Self::rejection(503, "Server Full", server_name)
    }

    /// Rejection matching a server-side handshake failure
    pub fn for_error(err: &ProtocolError, server_name: &str) -> Option<Self> {
        match err {
            ProtocolError::HeaderTooLarge(_)
            | ProtocolError::MalformedHeader(_)
            | ProtocolError::HandshakeIo(_) => Some(Self::bad_request(server_name)),
            ProtocolError::InvalidPayload => Some(Self::invalid_payload(server_name)),
            ProtocolError::AuthFailed => Some(Self::invalid_credentials(server_name)),
            ProtocolError::AdmissionDenied { .. } => Some(Self::server_full(server_name)),
            ProtocolError::HandshakeRejected(_) => None,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in &self.headers {
            let _ = write!(head, "{}: {}\r\n", name, value);
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(self.body.as_bytes());
        bytes
    }

    /// Write and flush
    pub async fn write_to<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await
    }
}
