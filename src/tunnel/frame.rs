//! Frame encoding/decoding for the multiplexed session
//!
//! Frame format (smux v1, little endian):
//! ```text
//! +---------+---------+-------------------+
//! | Version |   Cmd   |   Length (2B LE)  |
//! +---------+---------+-------------------+
//! |          Stream ID (4B LE)            |
//! +---------------------------------------+
//! |               Payload                 |
//! +---------------------------------------+
//! ```

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 8;

/// Protocol version carried in every header
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload a single frame can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Frame commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Stream open
    Syn = 0x00,
    /// Stream close
    Fin = 0x01,
    /// Data push
    Psh = 0x02,
    /// Keep-alive, no stream
    Nop = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Command::Syn),
            0x01 => Ok(Command::Fin),
            0x02 => Ok(Command::Psh),
            0x03 => Ok(Command::Nop),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown command: {}",
                value
            ))),
        }
    }
}

/// A session frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command
    pub cmd: Command,
    /// Stream ID (0 for session-level frames)
    pub stream_id: u32,
    /// Payload data (only PSH carries one)
    pub payload: Bytes,
}

impl Frame {
    /// Create a stream open frame
    pub fn syn(stream_id: u32) -> Self {
        Self {
            cmd: Command::Syn,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a stream close frame
    pub fn fin(stream_id: u32) -> Self {
        Self {
            cmd: Command::Fin,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a data frame
    pub fn psh(stream_id: u32, payload: Bytes) -> Self {
        Self {
            cmd: Command::Psh,
            stream_id,
            payload,
        }
    }

    /// Create a keep-alive frame
    pub fn nop() -> Self {
        Self {
            cmd: Command::Nop,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    /// Encode frame into `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), TunnelError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
        }

        dst.reserve(FRAME_HEADER_SIZE + payload_len);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(self.cmd as u8);
        dst.put_u16_le(payload_len as u16);
        dst.put_u32_le(self.stream_id);
        dst.extend_from_slice(&self.payload);

        Ok(())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decode frame from bytes, consuming it from `buf` once complete
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at header before consuming anything
        let version = buf[0];
        if version != PROTOCOL_VERSION {
            return Err(TunnelError::UnsupportedVersion(version));
        }
        let cmd = Command::try_from(buf[1])?;
        let payload_len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        let stream_id = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

        let total_len = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            cmd,
            stream_id,
            payload,
        }))
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Codec used to drive `FramedRead`/`FramedWrite` over the physical connection
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_PAYLOAD_SIZE),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TunnelError> {
        Frame::decode(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TunnelError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TunnelError> {
        if frame.payload.len() > self.max_frame_size {
            return Err(TunnelError::FrameTooLarge(
                frame.payload.len(),
                self.max_frame_size,
            ));
        }
        frame.encode_into(dst)
    }
}
