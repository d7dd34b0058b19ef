//! Server side bridge engine
//!
//! One task per accepted connection runs the handshake and, once upgraded,
//! the session. Each stream the client opens gets its own task that dials
//! the SOCKS target and pumps bytes until either side closes.

use super::{bridge, BufferPool};
use crate::admission::{AdmissionController, AdmissionGuard};
use crate::config::ServerConfig;
use crate::protocol::{Outcome, ProtocolError, ServerHandshake};
use crate::shutdown::Shutdown;
use crate::transport::{self, TransportConfig, TransportError};
use crate::tunnel::{MuxConfig, MuxSession, MuxTransport, Role, SmuxTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Pause after a failed accept so errors like EMFILE don't spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Where decoded streams go
#[derive(Debug, Clone)]
pub struct Target {
    addr: String,
    transport: TransportConfig,
}

impl Target {
    pub fn new(addr: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            addr: addr.into(),
            transport,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn dial(&self) -> Result<TcpStream, TransportError> {
        transport::connect(&self.addr, &self.transport).await
    }
}

/// Public tunnel endpoint
pub struct TunnelServer<T: MuxTransport = SmuxTransport> {
    handshake: ServerHandshake,
    transport: T,
    target: Arc<Target>,
    socket: TransportConfig,
    pool: Arc<BufferPool>,
    shutdown: Shutdown,
}

impl TunnelServer<SmuxTransport> {
    /// Build a server from validated configuration
    pub fn from_config(config: &ServerConfig, shutdown: Shutdown) -> crate::Result<Self> {
        config.validate()?;

        let handshake = ServerHandshake::new(
            config.handshake_settings(),
            AdmissionController::new(config.max_connections),
        );
        let transport = SmuxTransport::new(MuxConfig::from(&config.mux));
        let target = Target::new(config.socks_target.clone(), config.target_transport());

        Ok(Self::new(
            handshake,
            transport,
            target,
            BufferPool::new(config.buffer_size),
            shutdown,
        ))
    }
}

impl<T: MuxTransport> TunnelServer<T> {
    pub fn new(
        handshake: ServerHandshake,
        transport: T,
        target: Target,
        pool: Arc<BufferPool>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            handshake,
            transport,
            target: Arc::new(target),
            socket: TransportConfig::default(),
            pool,
            shutdown,
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        self.handshake.admission()
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Accept connections until shutdown is triggered.
    ///
    /// Returns once the listener is closed. Sessions already running keep
    /// going; use [`Shutdown::drain`] to wait for them.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> crate::Result<()> {
        let token = self.shutdown.token();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Listener closed, no longer accepting connections");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("New connection from {}", peer);

                            let server = Arc::clone(&self);
                            let span = info_span!("conn", %peer);
                            self.shutdown.spawn(
                                async move {
                                    if let Err(e) = server.handle_connection(stream, peer).await {
                                        debug!("Connection ended: {}", e);
                                    }
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        drop(listener);
        Ok(())
    }

    /// Handshake, then serve the session until it ends
    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> crate::Result<()> {
        transport::tune(&stream, &self.socket);
        let mut io = BufReader::new(stream);

        let guard = match self.handshake.run(&mut io).await {
            Ok(Outcome::Status) => {
                debug!("Served status probe");
                return Ok(());
            }
            Ok(Outcome::Upgraded(guard)) => guard,
            Err(e) => {
                log_rejection(&e);
                return Err(e.into());
            }
        };

        let status = self.admission().status();
        info!(
            "Session from {} established ({}/{})",
            peer, status.current, status.max
        );

        // A failure here drops the guard, which frees the slot
        let session = self.transport.open_session(io, Role::Server)?;
        serve_session(session, guard, Arc::clone(&self.target), Arc::clone(&self.pool)).await;

        let status = self.admission().status();
        info!(
            "Session from {} closed ({}/{})",
            peer, status.current, status.max
        );
        Ok(())
    }
}

fn log_rejection(err: &ProtocolError) {
    match err {
        ProtocolError::AuthFailed => warn!("Rejected: invalid credentials"),
        ProtocolError::AdmissionDenied { current, max } => {
            warn!("Rejected: server full ({}/{})", current, max)
        }
        ProtocolError::InvalidPayload => debug!("Rejected: missing upgrade header"),
        other => debug!("Handshake failed: {}", other),
    }
}

/// Accept streams until the session ends, bridging each to the target.
///
/// Returns after every stream task has finished; the admission slot is
/// released exactly once, here.
pub async fn serve_session<S: MuxSession>(
    session: S,
    guard: AdmissionGuard,
    target: Arc<Target>,
    pool: Arc<BufferPool>,
) {
    let mut streams = JoinSet::new();

    loop {
        tokio::select! {
            accepted = session.accept_stream() => {
                match accepted {
                    Ok(stream) => {
                        streams.spawn(bridge_stream(stream, Arc::clone(&target), Arc::clone(&pool)));
                    }
                    Err(e) => {
                        debug!("Session ended: {}", e);
                        break;
                    }
                }
            }
            Some(joined) = streams.join_next(), if !streams.is_empty() => reap(joined),
        }
    }

    session.close();
    while let Some(joined) = streams.join_next().await {
        reap(joined);
    }

    guard.release();
}

/// Bridge one stream to a fresh target connection
async fn bridge_stream<St>(stream: St, target: Arc<Target>, pool: Arc<BufferPool>)
where
    St: AsyncRead + AsyncWrite + Unpin + Send,
{
    let upstream = match target.dial().await {
        Ok(upstream) => upstream,
        Err(e) => {
            // Dropping the stream closes it; the session carries on
            warn!("Failed to reach {}: {}", target.addr(), e);
            return;
        }
    };

    let stats = bridge(stream, upstream, &pool).await;
    trace!(
        "Stream closed: {} bytes up, {} bytes down",
        stats.a_to_b,
        stats.b_to_a
    );
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Stream task panicked: {}", e);
        }
    }
}
