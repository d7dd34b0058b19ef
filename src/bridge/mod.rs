//! Bridge engine - wiring streams to their targets
//!
//! Provides:
//! - A buffer pool shared by all copy loops
//! - The bidirectional pump used for every stream/target pair
//! - The server engine (handshake, session, SOCKS target per stream)
//! - The client engine (local listener, stream per local connection, reconnect)

mod client;
mod pool;
mod pump;
mod server;

pub use client::{serve_local, TunnelClient};
pub use pool::{BufferLease, BufferPool};
pub use pump::{bridge, BridgeStats};
pub use server::{serve_session, Target, TunnelServer};
