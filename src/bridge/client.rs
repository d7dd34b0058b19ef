//! Client side bridge engine
//!
//! Each attempt binds the local listener, dials the tunnel server, runs the
//! handshake and opens a session. Every local connection then gets a fresh
//! stream on that session. When the session dies the listener goes with it
//! and the next attempt starts after a short delay.

use super::{bridge, BufferPool};
use crate::config::ClientConfig;
use crate::protocol::ClientHandshake;
use crate::shutdown::Shutdown;
use crate::transport::{self, TransportConfig};
use crate::tunnel::{MuxConfig, MuxSession, MuxTransport, Role, SmuxTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Local proxy in front of the tunnel
pub struct TunnelClient<T: MuxTransport = SmuxTransport> {
    server: String,
    local_listen: String,
    server_transport: TransportConfig,
    handshake: ClientHandshake,
    transport: T,
    pool: Arc<BufferPool>,
    max_failures: u32,
    reconnect_delay: Duration,
    shutdown: Shutdown,
}

impl TunnelClient<SmuxTransport> {
    /// Build a client from validated configuration
    pub fn from_config(config: &ClientConfig, shutdown: Shutdown) -> crate::Result<Self> {
        config.validate()?;

        Ok(Self {
            server: config.server.clone(),
            local_listen: config.local_listen.clone(),
            server_transport: config.server_transport(),
            handshake: config.handshake(),
            transport: SmuxTransport::new(MuxConfig::from(&config.mux)),
            pool: BufferPool::new(config.buffer_size),
            max_failures: config.max_failures,
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
            shutdown,
        })
    }
}

impl<T: MuxTransport> TunnelClient<T> {
    /// Keep a tunnel up until shutdown or too many consecutive failures
    pub async fn run(&self) -> crate::Result<()> {
        let mut failures = 0u32;

        while !self.shutdown.is_triggered() {
            match self.connect_and_serve().await {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    warn!("Tunnel attempt {} failed: {}", failures, e);
                    if self.max_failures != 0 && failures >= self.max_failures {
                        error!("Giving up after {} consecutive failures", failures);
                        return Err(e);
                    }
                }
            }

            if self.shutdown.is_triggered() {
                break;
            }
            info!("Reconnecting in {:?}", self.reconnect_delay);
            tokio::select! {
                _ = self.shutdown.triggered() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!("Client stopped");
        Ok(())
    }

    /// One attempt: listener, dial, handshake, session. `Ok` means a session
    /// was established, however it ended.
    async fn connect_and_serve(&self) -> crate::Result<()> {
        let listener = transport::bind(&self.local_listen).await?;

        info!("Connecting to {}", self.server);
        let stream = tokio::select! {
            _ = self.shutdown.triggered() => return Ok(()),
            stream = transport::connect(&self.server, &self.server_transport) => stream?,
        };

        let mut io = BufReader::new(stream);
        tokio::select! {
            _ = self.shutdown.triggered() => return Ok(()),
            head = self.handshake.run(&mut io) => head?,
        };
        info!("Handshake complete");

        let session = self.transport.open_session(io, Role::Client)?;
        info!("Local proxy listening on {}", self.local_listen);

        serve_local(listener, &session, &self.pool, &self.shutdown.token()).await;
        Ok(())
    }
}

/// Bridge local connections into `session` until it closes, a stream can't
/// be opened, or `stop` fires. Consumes and closes the listener.
pub async fn serve_local<S: MuxSession>(
    listener: TcpListener,
    session: &S,
    pool: &Arc<BufferPool>,
    stop: &CancellationToken,
) {
    let socket_config = TransportConfig::default();
    let mut bridges = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = session.closed() => {
                info!("Tunnel session closed");
                break;
            }
            accept_result = listener.accept() => {
                let (socket, peer) = match accept_result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Local accept error: {}", e);
                        continue;
                    }
                };
                debug!("Local connection from {}", peer);
                transport::tune(&socket, &socket_config);

                let stream = match session.open_stream().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Failed to open stream: {}", e);
                        break;
                    }
                };

                let pool = Arc::clone(pool);
                bridges.spawn(async move {
                    bridge(socket, stream, &pool).await;
                });
            }
            Some(joined) = bridges.join_next(), if !bridges.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Bridge task panicked: {}", e);
                    }
                }
            }
        }
    }

    drop(listener);
    session.close();
    while bridges.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PayloadTemplate;
    use crate::tunnel::SmuxSession;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn quiet_mux() -> MuxConfig {
        MuxConfig {
            keepalive_interval: Duration::from_secs(3600),
            keepalive_timeout: Duration::from_secs(3600),
            ..MuxConfig::default()
        }
    }

    /// Echo every stream the remote side accepts
    fn spawn_echo_peer(remote: SmuxSession) -> Arc<SmuxSession> {
        let remote = Arc::new(remote);
        let peer = Arc::clone(&remote);
        tokio::spawn(async move {
            while let Ok(stream) = peer.accept_stream().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = tokio::io::split(stream);
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                    let _ = w.shutdown().await;
                });
            }
        });
        remote
    }

    #[tokio::test]
    async fn test_local_connections_ride_the_session() {
        let (a, b) = duplex(64 * 1024);
        let local = SmuxSession::new(a, Role::Client, quiet_mux());
        let _remote = spawn_echo_peer(SmuxSession::new(b, Role::Server, quiet_mux()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = CancellationToken::new();
        let pool = BufferPool::new(512);

        let serving = {
            let stop = stop.clone();
            tokio::spawn(async move { serve_local(listener, &local, &pool, &stop).await })
        };

        for msg in [&b"first"[..], &b"second connection"[..]] {
            let mut socket = TcpStream::connect(addr).await.unwrap();
            socket.write_all(msg).await.unwrap();
            let mut buf = vec![0u8; msg.len()];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, msg);
        }

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .expect("serve_local should stop")
            .unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_dead_session_tears_down_listener() {
        let (a, b) = duplex(64 * 1024);
        let local = SmuxSession::new(a, Role::Client, quiet_mux());
        let remote = spawn_echo_peer(SmuxSession::new(b, Role::Server, quiet_mux()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = BufferPool::new(512);

        let serving = tokio::spawn(async move {
            serve_local(listener, &local, &pool, &CancellationToken::new()).await
        });

        remote.close();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .expect("serve_local should notice the closed session")
            .unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    fn unreachable_client(max_failures: u32, shutdown: Shutdown) -> TunnelClient {
        TunnelClient {
            server: "127.0.0.1:1".to_string(),
            local_listen: "127.0.0.1:0".to_string(),
            server_transport: TransportConfig::default()
                .with_connect_timeout(Duration::from_millis(500)),
            handshake: ClientHandshake::new(PayloadTemplate::default(), "example.com"),
            transport: SmuxTransport::default(),
            pool: BufferPool::new(64),
            max_failures,
            reconnect_delay: Duration::from_millis(10),
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_max_failures() {
        let client = unreachable_client(2, Shutdown::new());
        let result = tokio::time::timeout(Duration::from_secs(10), client.run())
            .await
            .expect("client should give up");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_reconnecting() {
        let shutdown = Shutdown::new();
        let mut client = unreachable_client(0, shutdown.clone());
        client.reconnect_delay = Duration::from_secs(3600);

        let running = tokio::spawn(async move { client.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("client should stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
