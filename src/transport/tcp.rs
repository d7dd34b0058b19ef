//! TCP helpers shared by server and client

use super::{TransportConfig, TransportError};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::net::SocketAddr;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::debug;

/// Listen backlog for public and local listeners
const LISTEN_BACKLOG: i32 = 1024;

/// Bind a listener with `SO_REUSEADDR` so restarts don't trip over TIME_WAIT
pub async fn bind(addr: &str) -> Result<TcpListener, TransportError> {
    let addr = resolve(addr).await?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(not(windows))]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(TcpListener::from_std(socket.into())?)
}

/// Dial `addr`, bounded by the configured timeout, and tune the socket
pub async fn connect(addr: &str, config: &TransportConfig) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout(addr.to_string()))?
        .map_err(|e| TransportError::ConnectionFailed(addr.to_string(), e))?;

    tune(&stream, config);
    Ok(stream)
}

/// Apply no-delay and keep-alive settings. Failures are logged and ignored.
pub fn tune(stream: &TcpStream, config: &TransportConfig) {
    if config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
    }

    if let Some(idle) = config.keepalive {
        let keepalive = TcpKeepalive::new().with_time(idle);
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            debug!("Failed to enable TCP keep-alive: {}", e);
        }
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, TransportError> {
    lookup_host(addr)
        .await
        .map_err(|_| TransportError::InvalidAddress(addr.to_string()))?
        .next()
        .ok_or_else(|| TransportError::InvalidAddress(addr.to_string()))
}
