//! Stream multiplexer for the tunnel
//!
//! Manages multiple logical streams over a single physical connection.
//! Each session runs three tasks:
//! - a reader that decodes frames and routes them to streams
//! - a writer that batches queued frames onto the connection
//! - a keep-alive ticker that sends NOPs and detects a silent peer
//!
//! All three share one cancellation token; whichever notices a fault first
//! cancels it and the others wind down.

use super::{
    Command, Frame, FrameCodec, MuxConfig, MuxSession, MuxStream, MuxTransport, Role, TunnelError,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// State shared between a session handle, its tasks and its streams
pub(super) struct Shared {
    config: MuxConfig,
    /// Inbound data channels of live streams
    streams: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    /// Outbound frame queue drained by the writer task
    frame_tx: mpsc::Sender<Frame>,
    next_stream_id: AtomicU32,
    token: CancellationToken,
    /// Set by the reader on every frame, cleared by the keep-alive check
    activity: AtomicBool,
    /// Reader is parked on a full stream queue; the peer is not silent
    blocked: AtomicBool,
}

impl Shared {
    /// Register a stream ID and build its handle
    fn register(self: &Arc<Self>, stream_id: u32) -> MuxStream {
        let (data_tx, data_rx) = mpsc::channel(self.config.stream_queue.max(1));
        self.streams.lock().insert(stream_id, data_tx);

        MuxStream::new(
            stream_id,
            data_rx,
            self.frame_tx.clone(),
            Arc::clone(self),
            self.config.max_frame_size,
        )
    }

    /// Forget a stream; its reader sees EOF once queued data is drained
    pub(super) fn unregister(&self, stream_id: u32) {
        self.streams.lock().remove(&stream_id);
    }

    /// Queue a frame from a synchronous context (stream drop)
    pub(super) fn send_detached(&self, frame: Frame) {
        match self.frame_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let frame_tx = self.frame_tx.clone();
                    handle.spawn(async move {
                        let _ = frame_tx.send(frame).await;
                    });
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Handle SYN from the peer
    fn accept_remote(self: &Arc<Self>, stream_id: u32, accept_tx: &mpsc::Sender<MuxStream>) {
        if self.streams.lock().contains_key(&stream_id) {
            debug!("Ignoring SYN for stream {} already in use", stream_id);
            return;
        }

        let stream = self.register(stream_id);
        match accept_tx.try_send(stream) {
            Ok(()) => trace!("Peer opened stream {}", stream_id),
            Err(TrySendError::Full(stream)) => {
                // Dropping the handle answers with FIN
                warn!("Accept backlog full, refusing stream {}", stream_id);
                drop(stream);
            }
            Err(TrySendError::Closed(stream)) => drop(stream),
        }
    }

    fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }
}

/// smux v1 compatible session
pub struct SmuxSession {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

impl SmuxSession {
    /// Start a session over `io`. Must be called inside a tokio runtime.
    pub fn new<IO>(io: IO, role: Role, config: MuxConfig) -> Self
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (frame_tx, frame_rx) = mpsc::channel(config.send_queue.max(1));
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let codec = FrameCodec::new(config.max_frame_size);

        let shared = Arc::new(Shared {
            config,
            streams: Mutex::new(HashMap::new()),
            frame_tx,
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            token: CancellationToken::new(),
            activity: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
        });

        tokio::spawn(recv_loop(
            Arc::clone(&shared),
            FramedRead::new(read_half, codec.clone()),
            accept_tx,
        ));
        tokio::spawn(send_loop(
            shared.token.clone(),
            FramedWrite::new(write_half, codec),
            frame_rx,
        ));
        tokio::spawn(keepalive_loop(Arc::clone(&shared)));

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Get number of live streams
    pub fn stream_count(&self) -> usize {
        self.shared.stream_count()
    }
}

impl Drop for SmuxSession {
    fn drop(&mut self) {
        self.shared.token.cancel();
    }
}

#[async_trait]
impl MuxSession for SmuxSession {
    type Stream = MuxStream;

    async fn accept_stream(&self) -> Result<MuxStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.shared.token.cancelled() => Err(TunnelError::SessionClosed),
            stream = accept_rx.recv() => stream.ok_or(TunnelError::SessionClosed),
        }
    }

    async fn open_stream(&self) -> Result<MuxStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let stream_id = self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.shared.register(stream_id);

        tokio::select! {
            _ = self.shared.token.cancelled() => Err(TunnelError::SessionClosed),
            sent = self.shared.frame_tx.send(Frame::syn(stream_id)) => {
                sent.map_err(|_| TunnelError::SessionClosed)?;
                trace!("Opened stream {}", stream_id);
                Ok(stream)
            }
        }
    }

    fn close(&self) {
        self.shared.token.cancel();
    }

    fn is_closed(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    async fn closed(&self) {
        self.shared.token.cancelled().await
    }
}

/// Transport producing [`SmuxSession`]s
#[derive(Debug, Clone, Default)]
pub struct SmuxTransport {
    config: MuxConfig,
}

impl SmuxTransport {
    pub fn new(config: MuxConfig) -> Self {
        Self { config }
    }
}

impl MuxTransport for SmuxTransport {
    type Session = SmuxSession;

    fn open_session<IO>(&self, io: IO, role: Role) -> Result<SmuxSession, TunnelError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tokio::runtime::Handle::try_current().map_err(|e| {
            TunnelError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        Ok(SmuxSession::new(io, role, self.config.clone()))
    }
}

/// Decode frames and route them to streams
async fn recv_loop<R>(
    shared: Arc<Shared>,
    mut frames: FramedRead<R, FrameCodec>,
    accept_tx: mpsc::Sender<MuxStream>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = shared.token.cancelled() => break,
            next = frames.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!("Session read failed: {}", e);
                break;
            }
            None => {
                debug!("Peer closed the session");
                break;
            }
        };

        shared.activity.store(true, Ordering::Relaxed);

        match frame.cmd {
            Command::Nop => {}
            Command::Syn => shared.accept_remote(frame.stream_id, &accept_tx),
            Command::Fin => {
                trace!("Peer closed stream {}", frame.stream_id);
                shared.unregister(frame.stream_id);
            }
            Command::Psh => {
                let stream_id = frame.stream_id;
                let data_tx = shared.streams.lock().get(&stream_id).cloned();

                let Some(data_tx) = data_tx else {
                    trace!("Dropping data for unknown stream {}", stream_id);
                    continue;
                };

                let delivered = match data_tx.try_send(frame.payload) {
                    Ok(()) => true,
                    Err(TrySendError::Closed(_)) => false,
                    Err(TrySendError::Full(payload)) => {
                        // Backpressure from a slow reader stalls the whole session
                        shared.blocked.store(true, Ordering::Relaxed);
                        let sent = tokio::select! {
                            _ = shared.token.cancelled() => None,
                            sent = data_tx.send(payload) => Some(sent.is_ok()),
                        };
                        shared.blocked.store(false, Ordering::Relaxed);
                        shared.activity.store(true, Ordering::Relaxed);
                        match sent {
                            Some(delivered) => delivered,
                            None => break,
                        }
                    }
                };
                if !delivered {
                    // Local handle is gone; its drop already queued FIN
                    shared.unregister(stream_id);
                }
            }
        }
    }

    shared.token.cancel();
    shared.streams.lock().clear();
}

/// Write queued frames, batching whatever is already waiting
async fn send_loop<W>(
    token: CancellationToken,
    mut sink: FramedWrite<W, FrameCodec>,
    mut frame_rx: mpsc::Receiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = frame_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = token.cancelled() => break,
            written = write_batch(&mut sink, &mut frame_rx, frame) => written,
        };
        if let Err(e) = written {
            debug!("Session write failed: {}", e);
            break;
        }
    }

    token.cancel();
    frame_rx.close();
    let _ = sink.get_mut().shutdown().await;
}

async fn write_batch<W>(
    sink: &mut FramedWrite<W, FrameCodec>,
    frame_rx: &mut mpsc::Receiver<Frame>,
    first: Frame,
) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    sink.feed(first).await?;
    while let Ok(frame) = frame_rx.try_recv() {
        sink.feed(frame).await?;
    }
    sink.flush().await
}

fn ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Send NOPs and close the session when the peer goes silent
async fn keepalive_loop(shared: Arc<Shared>) {
    let timeout = shared.config.keepalive_timeout;
    let mut ping = ticker(shared.config.keepalive_interval);
    let mut check = ticker(timeout);

    loop {
        tokio::select! {
            _ = shared.token.cancelled() => break,
            _ = tick(&mut ping) => {
                // A full queue already carries traffic, so skipping is fine
                let _ = shared.frame_tx.try_send(Frame::nop());
            }
            _ = tick(&mut check) => {
                let heard = shared.activity.swap(false, Ordering::Relaxed);
                if !heard && !shared.blocked.load(Ordering::Relaxed) {
                    warn!("No frames from peer for {:?}, closing session", timeout);
                    shared.token.cancel();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    fn quiet_config() -> MuxConfig {
        MuxConfig {
            keepalive_interval: Duration::from_secs(3600),
            keepalive_timeout: Duration::from_secs(3600),
            ..MuxConfig::default()
        }
    }

    fn session_pair(config: MuxConfig) -> (SmuxSession, SmuxSession) {
        let (a, b) = duplex(256 * 1024);
        (
            SmuxSession::new(a, Role::Client, config.clone()),
            SmuxSession::new(b, Role::Server, config),
        )
    }

    #[test]
    fn test_stream_id_parity() {
        assert_eq!(Role::Client.first_stream_id(), 1);
        assert_eq!(Role::Server.first_stream_id(), 2);
    }

    #[tokio::test]
    async fn test_open_accept_roundtrip() {
        let (client, server) = session_pair(quiet_config());

        let mut outbound = client.open_stream().await.unwrap();
        let mut inbound = server.accept_stream().await.unwrap();
        assert_eq!(outbound.id(), 1);
        assert_eq!(inbound.id(), 1);

        outbound.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        inbound.write_all(b"pong").await.unwrap();
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        let second = client.open_stream().await.unwrap();
        assert_eq!(second.id(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_delivers_eof() {
        let (client, server) = session_pair(quiet_config());

        let mut outbound = client.open_stream().await.unwrap();
        let mut inbound = server.accept_stream().await.unwrap();

        outbound.write_all(b"last words").await.unwrap();
        outbound.shutdown().await.unwrap();
        // Second shutdown is a no-op
        outbound.shutdown().await.unwrap();
        assert!(outbound.state().local_closed());

        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last words");

        // Writing after our own FIN fails, reading the other way still works
        assert!(outbound.write_all(b"x").await.is_err());
        inbound.write_all(b"reply").await.unwrap();
        drop(inbound);

        let mut reply = Vec::new();
        outbound.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"reply");
    }

    #[tokio::test]
    async fn test_large_write_is_split_and_reassembled() {
        let config = MuxConfig {
            max_frame_size: 1024,
            ..quiet_config()
        };
        let (client, server) = session_pair(config);

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let mut outbound = client.open_stream().await.unwrap();
        let mut inbound = server.accept_stream().await.unwrap();

        let writer = tokio::spawn(async move {
            outbound.write_all(&payload).await.unwrap();
            outbound.shutdown().await.unwrap();
            outbound
        });

        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), expected.len());
        assert_eq!(received, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_reaches_peer() {
        let (client, server) = session_pair(quiet_config());

        let mut stream = client.open_stream().await.unwrap();
        let mut peer_stream = server.accept_stream().await.unwrap();

        client.close();
        client.close();
        assert!(client.is_closed());
        assert!(matches!(
            client.open_stream().await,
            Err(TunnelError::SessionClosed)
        ));

        tokio::time::timeout(Duration::from_secs(5), server.closed())
            .await
            .expect("peer should notice the closed connection");
        assert!(matches!(
            server.accept_stream().await,
            Err(TunnelError::SessionClosed)
        ));

        let mut buf = Vec::new();
        peer_stream.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        // Writes on a dead session surface as I/O errors, not panics
        let _ = stream.write_all(b"late").await;
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_hits_keepalive_timeout() {
        let (local, _silent_peer) = duplex(1024);
        let config = MuxConfig {
            keepalive_interval: Duration::from_millis(20),
            keepalive_timeout: Duration::from_millis(100),
            ..MuxConfig::default()
        };
        let session = SmuxSession::new(local, Role::Client, config);

        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .expect("session should close after keepalive timeout");
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_full_backlog_refuses_with_fin() {
        let (local, remote) = duplex(64 * 1024);
        let config = MuxConfig {
            accept_backlog: 1,
            ..quiet_config()
        };
        let session = SmuxSession::new(local, Role::Server, config);

        let (remote_read, remote_write) = tokio::io::split(remote);
        let mut peer_rx = FramedRead::new(remote_read, FrameCodec::new(1024));
        let mut peer_tx = FramedWrite::new(remote_write, FrameCodec::new(1024));

        peer_tx.send(Frame::syn(1)).await.unwrap();
        peer_tx.send(Frame::syn(3)).await.unwrap();
        // Data for a stream nobody knows is dropped without killing the session
        peer_tx
            .send(Frame::psh(99, Bytes::from_static(b"stray")))
            .await
            .unwrap();

        let refused = peer_rx.next().await.unwrap().unwrap();
        assert_eq!(refused, Frame::fin(3));

        let accepted = session.accept_stream().await.unwrap();
        assert_eq!(accepted.id(), 1);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_slow_reader_does_not_trip_keepalive() {
        let config = MuxConfig {
            keepalive_interval: Duration::from_millis(20),
            keepalive_timeout: Duration::from_millis(100),
            stream_queue: 1,
            ..MuxConfig::default()
        };
        let (client, server) = session_pair(config);

        let mut outbound = client.open_stream().await.unwrap();
        let mut stalled = server.accept_stream().await.unwrap();
        for chunk in 0..4u8 {
            outbound.write_all(&[chunk; 1000]).await.unwrap();
        }

        // Nobody reads `stalled` for several keep-alive timeouts
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!server.is_closed());
        assert!(!client.is_closed());

        let mut received = vec![0u8; 4000];
        stalled.read_exact(&mut received).await.unwrap();
        assert!(received.chunks(1000).enumerate().all(|(i, c)| c.iter().all(|&b| b == i as u8)));

        let mut next = client.open_stream().await.unwrap();
        let mut accepted = server.accept_stream().await.unwrap();
        next.write_all(b"after the stall").await.unwrap();
        let mut buf = [0u8; 15];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"after the stall");
        assert_eq!(server.stream_count(), 2);
    }

    #[tokio::test]
    async fn test_remote_fin_for_dropped_stream_is_harmless() {
        let (client, server) = session_pair(quiet_config());

        let outbound = client.open_stream().await.unwrap();
        let inbound = server.accept_stream().await.unwrap();

        drop(inbound);
        drop(outbound);

        let mut next = client.open_stream().await.unwrap();
        let mut accepted = server.accept_stream().await.unwrap();
        next.write_all(b"still alive").await.unwrap();
        let mut buf = [0u8; 11];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still alive");
    }
}
