//! Tunnel layer - multiplexed streams over one physical connection
//!
//! Provides:
//! - Frame encoding/decoding (smux v1 wire format)
//! - Session management with keep-alive based dead peer detection
//! - Logical streams usable as ordinary `AsyncRead + AsyncWrite` values
//!
//! The rest of the crate only talks to the [`MuxTransport`] and [`MuxSession`]
//! traits, so the session implementation can be swapped or faked in tests.

mod frame;
mod multiplexer;
mod stream;

pub use frame::{Command, Frame, FrameCodec, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
pub use multiplexer::{SmuxSession, SmuxTransport};
pub use stream::{MuxStream, StreamState};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Session closed")]
    SessionClosed,

    #[error("Stream closed")]
    StreamClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which end of the physical connection a session sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the connection; opens odd stream IDs
    Client,
    /// Accepted the connection; opens even stream IDs
    Server,
}

impl Role {
    /// First stream ID this side hands out
    pub fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Session tuning. Window and keep-alive sizes are deployment parameters.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Interval between NOP frames
    pub keepalive_interval: Duration,
    /// Close the session when nothing was received for this long
    pub keepalive_timeout: Duration,
    /// Largest PSH payload; bigger writes are split
    pub max_frame_size: usize,
    /// Per-stream inbound queue depth, in frames
    pub stream_queue: usize,
    /// Remotely opened streams waiting for `accept_stream`
    pub accept_backlog: usize,
    /// Outbound frame queue depth shared by all streams
    pub send_queue: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(30),
            max_frame_size: 32 * 1024,
            stream_queue: 64,
            accept_backlog: 1024,
            send_queue: 256,
        }
    }
}

/// A live multiplexed session bound to one physical connection
#[async_trait]
pub trait MuxSession: Send + Sync + 'static {
    /// Logical stream type produced by this session
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the peer to open a stream
    async fn accept_stream(&self) -> Result<Self::Stream, TunnelError>;

    /// Open a new stream towards the peer
    async fn open_stream(&self) -> Result<Self::Stream, TunnelError>;

    /// Tear the session down. Calling it again is a no-op.
    fn close(&self);

    /// Whether the session has been torn down, locally or by a fault
    fn is_closed(&self) -> bool;

    /// Resolve once the session is torn down
    async fn closed(&self);
}

/// Factory turning an upgraded physical connection into a session
pub trait MuxTransport: Send + Sync + 'static {
    type Session: MuxSession;

    /// Start a session over `io`
    fn open_session<IO>(&self, io: IO, role: Role) -> Result<Self::Session, TunnelError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static;
}
