//! Multiplexed stream implementation

use super::multiplexer::Shared;
use super::Frame;
use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is open and active
    Open,
    /// Local side has sent FIN
    HalfClosedLocal,
    /// Remote side has sent FIN (or the session went away)
    HalfClosedRemote,
    /// Stream is fully closed
    Closed,
}

impl StreamState {
    fn close_local(self) -> Self {
        match self {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        }
    }

    fn close_remote(self) -> Self {
        match self {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        }
    }

    /// Whether FIN has already gone out for this stream
    pub fn local_closed(self) -> bool {
        matches!(self, StreamState::HalfClosedLocal | StreamState::Closed)
    }

    /// Whether the peer will send no more data
    pub fn remote_closed(self) -> bool {
        matches!(self, StreamState::HalfClosedRemote | StreamState::Closed)
    }
}

/// A logical stream within a session.
///
/// Reads yield the PSH payloads the peer sent, in order, and EOF after the
/// peer's FIN. `shutdown` sends FIN; dropping the stream sends FIN if
/// `shutdown` never ran.
pub struct MuxStream {
    id: u32,
    state: StreamState,
    inbound: mpsc::Receiver<Bytes>,
    pending: Bytes,
    outbound: PollSender<Frame>,
    session: Arc<Shared>,
    max_frame_size: usize,
}

impl MuxStream {
    pub(super) fn new(
        id: u32,
        inbound: mpsc::Receiver<Bytes>,
        outbound: mpsc::Sender<Frame>,
        session: Arc<Shared>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            id,
            state: StreamState::Open,
            inbound,
            pending: Bytes::new(),
            outbound: PollSender::new(outbound),
            session,
            max_frame_size: max_frame_size.max(1),
        }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Get current state
    pub fn state(&self) -> StreamState {
        self.state
    }
}

fn session_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "session closed")
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.state.remote_closed() {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.inbound.poll_recv(cx)) {
                Some(data) => this.pending = data,
                None => {
                    this.state = this.state.close_remote();
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.state.local_closed() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(this.outbound.poll_reserve(cx)).map_err(|_| session_gone())?;

        let n = buf.len().min(this.max_frame_size);
        let frame = Frame::psh(this.id, Bytes::copy_from_slice(&buf[..n]));
        this.outbound.send_item(frame).map_err(|_| session_gone())?;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Queued frames are flushed by the session writer
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.state.local_closed() {
            return Poll::Ready(Ok(()));
        }

        // A dead session has nothing left to notify, so closing still succeeds
        if ready!(this.outbound.poll_reserve(cx)).is_ok() {
            let _ = this.outbound.send_item(Frame::fin(this.id));
        }
        this.state = this.state.close_local();

        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.session.unregister(self.id);
        if !self.state.local_closed() {
            self.outbound.abort_send();
            self.session.send_detached(Frame::fin(self.id));
        }
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}
