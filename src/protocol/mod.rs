//! Handshake protocol
//!
//! Every physical connection starts with an exchange shaped like an HTTP
//! WebSocket upgrade. The server reads one request head, answers the status
//! probe, checks the upgrade marker and credentials, asks admission control
//! for a slot and replies `101`. From then on the raw bytes belong to the
//! multiplexed session.
//!
//! The client renders a payload template, sends it in chunks and reads
//! response heads until it sees the tunnel's own `101`.

mod client;
mod request;
mod response;
mod server;

pub use client::{ClientHandshake, PayloadTemplate, DEFAULT_PAYLOAD};
pub use request::{read_head, HandshakeMessage};
pub use response::Response;
pub use server::{HandshakeSettings, Outcome, ServerHandshake};

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Handshake errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Header exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Handshake I/O error: {0}")]
    HandshakeIo(#[from] io::Error),

    #[error("Missing or invalid upgrade header")]
    InvalidPayload,

    #[error("Invalid credentials")]
    AuthFailed,

    #[error("Server full ({current}/{max})")]
    AdmissionDenied { current: usize, max: usize },

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),
}

impl ProtocolError {
    pub(crate) fn timed_out() -> Self {
        ProtocolError::HandshakeIo(io::Error::new(
            io::ErrorKind::TimedOut,
            "handshake deadline exceeded",
        ))
    }

    /// Whether the handshake ran out of time
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::HandshakeIo(e) if e.kind() == io::ErrorKind::TimedOut)
    }
}

/// Default limit on the size of one request or response head
pub const DEFAULT_HEADER_LIMIT: usize = 8192;

/// Unauthenticated status probe, matched anywhere in the request head
pub const STATUS_PROBE: &str = "GET /users";

/// Default `Server:` header on crafted responses
pub const DEFAULT_SERVER_NAME: &str = "nginx";

/// The user/password pair every client must present
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Exact, case-sensitive comparison of both values
    pub fn matches(&self, user: &str, password: &str) -> bool {
        self.user == user && self.password == password
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() || self.password.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_are_exact() {
        let creds = Credentials::new("sung", "Secret.1");
        assert!(creds.matches("sung", "Secret.1"));
        assert!(!creds.matches("sung", "secret.1"));
        assert!(!creds.matches("Sung", "Secret.1"));
        assert!(!creds.matches("sung", "Secret.1 "));
    }

    #[test]
    fn test_empty_credentials() {
        assert!(Credentials::default().is_empty());
        assert!(Credentials::new("user", "").is_empty());
        assert!(!Credentials::new("user", "pw").is_empty());
    }

    #[test]
    fn test_timeout_detection() {
        assert!(ProtocolError::timed_out().is_timeout());
        assert!(!ProtocolError::AuthFailed.is_timeout());
    }
}
