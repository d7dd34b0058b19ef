//! Transport layer - physical TCP connections
//!
//! Provides:
//! - Listener binding with address reuse
//! - Dialing with a connect timeout
//! - Socket tuning (no delay, TCP keep-alive)

mod tcp;

pub use tcp::{bind, connect, tune};

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection to {0} failed: {1}")]
    ConnectionFailed(String, io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection to {0} timed out")]
    Timeout(String),
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Dial timeout
    pub connect_timeout: Duration,
    /// Disable Nagle on every socket
    pub nodelay: bool,
    /// Idle time before TCP keep-alive probes; `None` leaves the OS default
    pub keepalive: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
            keepalive: Some(Duration::from_secs(30)),
        }
    }
}

impl TransportConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
