//! Bidirectional byte pump between a stream and its target

use super::pool::BufferPool;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Bytes moved by one bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

impl BridgeStats {
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

/// Copy `a` to `b` and `b` to `a` until one direction ends.
///
/// The first direction to stop (EOF or error) stops the other one too; both
/// ends are shut down before this returns. Errors are normal peer behaviour
/// here and only show up in the trace log.
pub async fn bridge<A, B>(a: A, b: B, pool: &Arc<BufferPool>) -> BridgeStats
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let done = CancellationToken::new();

    let (a_to_b, b_to_a) = tokio::join!(
        pump(&mut a_read, &mut b_write, pool, &done),
        pump(&mut b_read, &mut a_write, pool, &done),
    );

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    BridgeStats { a_to_b, b_to_a }
}

/// One direction. Returns the number of bytes written.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    pool: &Arc<BufferPool>,
    done: &CancellationToken,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lease = pool.lease();
    let mut copied = 0u64;

    let result = tokio::select! {
        _ = done.cancelled() => Ok(()),
        result = copy_until_eof(reader, writer, lease.as_mut_slice(), &mut copied) => result,
    };
    done.cancel();

    if let Err(e) = result {
        trace!("Bridge direction ended with error after {} bytes: {}", copied, e);
    }
    copied
}

async fn copy_until_eof<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    /// Push `payload` through a bridge and collect what arrives on the far side
    async fn roundtrip(payload: Vec<u8>, buffer_size: usize) -> (Vec<u8>, BridgeStats) {
        let pool = BufferPool::new(buffer_size);
        let (mut near, bridge_a) = duplex(4096);
        let (bridge_b, mut far) = duplex(4096);

        let task = tokio::spawn(async move { bridge(bridge_a, bridge_b, &pool).await });

        let writer = tokio::spawn(async move {
            near.write_all(&payload).await.unwrap();
            near.shutdown().await.unwrap();
            near
        });

        let mut received = Vec::new();
        far.read_to_end(&mut received).await.unwrap();

        let stats = task.await.unwrap();
        writer.await.unwrap();
        (received, stats)
    }

    #[tokio::test]
    async fn test_bridge_preserves_bytes() {
        let buffer_size = 512;
        for len in [0, 1, buffer_size - 1, buffer_size, buffer_size + 1, buffer_size * 7 + 3] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
            let (received, stats) = roundtrip(payload.clone(), buffer_size).await;
            assert_eq!(received, payload, "payload of {} bytes", len);
            assert_eq!(stats.a_to_b, len as u64);
        }
    }

    #[tokio::test]
    async fn test_first_direction_to_finish_closes_both() {
        let pool = BufferPool::new(64);
        let (mut near, bridge_a) = duplex(1024);
        let (bridge_b, mut far) = duplex(1024);

        let task = tokio::spawn(async move { bridge(bridge_a, bridge_b, &pool).await });

        far.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // Closing one side ends the whole bridge even though `far` never closes
        drop(near);
        let stats = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("bridge should finish")
            .unwrap();
        assert_eq!(stats.b_to_a, 5);
        assert_eq!(stats.total(), 5);

        let mut rest = Vec::new();
        far.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_buffers_return_to_pool() {
        let pool = BufferPool::new(128);
        let (received, _) = {
            let (mut near, bridge_a) = duplex(1024);
            let (bridge_b, mut far) = duplex(1024);
            let bridge_pool = Arc::clone(&pool);
            let task = tokio::spawn(async move { bridge(bridge_a, bridge_b, &bridge_pool).await });

            near.write_all(b"abc").await.unwrap();
            near.shutdown().await.unwrap();
            let mut received = Vec::new();
            far.read_to_end(&mut received).await.unwrap();
            (received, task.await.unwrap())
        };

        assert_eq!(received, b"abc");
        assert_eq!(pool.available(), 2);
    }
}
