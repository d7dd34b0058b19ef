//! # Upgrade Tunnel
//!
//! A tunnel that looks like an HTTP WebSocket upgrade from the outside and
//! carries many multiplexed connections to a SOCKS service on the inside.
//!
//! ## Features
//!
//! - **Camouflaged handshake**: an HTTP-shaped upgrade request with header credentials
//! - **Unauthenticated status probe** (`GET /users`) reporting session usage
//! - **Admission control** bounding concurrent sessions
//! - **smux v1 compatible multiplexing** with keep-alive based dead peer detection
//! - **Graceful shutdown** that lets active sessions drain
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Bridge Engine                     │
//! │     (accept loops, per-stream target bridging)       │
//! ├─────────────────────────────────────────────────────┤
//! │                  Multiplexing Layer                  │
//! │          (sessions, streams, keep-alive)             │
//! ├─────────────────────────────────────────────────────┤
//! │                  Handshake Protocol                  │
//! │     (upgrade disguise, credentials, admission)       │
//! ├─────────────────────────────────────────────────────┤
//! │                   Transport Layer                    │
//! │                 (TCP, socket tuning)                 │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod admission;
pub mod bridge;
pub mod config;
pub mod protocol;
pub mod shutdown;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
