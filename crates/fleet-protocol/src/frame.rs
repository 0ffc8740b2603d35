//! Frame types and the length-delimited wire codec.
//!
//! Every frame is preceded by a big-endian `u32` length covering the rest
//! of the frame:
//!
//! ```text
//! | len: u32 | kind: u8 | sent_at_ms: u64 | channel_len: u16 | channel | payload |
//! ```
//!
//! The same layout is used on the QUIC bidirectional stream and on the
//! TCP+TLS fallback stream.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

/// Maximum encoded frame size (16 MiB), excluding the length prefix.
/// Guards against unbounded allocation from a corrupt length prefix.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX_LEN: usize = 4;

/// kind + sent_at_ms + channel_len
const HEADER_LEN: usize = 1 + 8 + 2;

/// Discriminates control frames from channel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameKind {
    Hello,
    HelloAck,
    Data,
    Ping,
    Pong,
    Goodbye,
}

impl FrameKind {
    pub fn code(&self) -> u8 {
        match self {
            Self::Hello => 0x01,
            Self::HelloAck => 0x02,
            Self::Data => 0x03,
            Self::Ping => 0x04,
            Self::Pong => 0x05,
            Self::Goodbye => 0x06,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::HelloAck),
            0x03 => Some(Self::Data),
            0x04 => Some(Self::Ping),
            0x05 => Some(Self::Pong),
            0x06 => Some(Self::Goodbye),
            _ => None,
        }
    }
}

/// One discrete unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Channel name; empty for control frames.
    pub channel: String,
    /// Opaque payload bytes.
    pub payload: Bytes,
    /// Sender wall-clock time in milliseconds since the Unix epoch.
    pub sent_at_ms: u64,
}

/// Body of `HELLO` and `HELLO_ACK` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub version: String,
    pub node_id: String,
}

impl Frame {
    /// A channel data frame stamped with the current time.
    pub fn data(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Data,
            channel: channel.into(),
            payload: payload.into(),
            sent_at_ms: now_ms(),
        }
    }

    /// A control frame with no channel and no payload.
    pub fn control(kind: FrameKind) -> Self {
        Self {
            kind,
            channel: String::new(),
            payload: Bytes::new(),
            sent_at_ms: now_ms(),
        }
    }

    pub fn ping() -> Self {
        Self::control(FrameKind::Ping)
    }

    /// A pong echoing the probe's timestamp so the prober can compute RTT.
    pub fn pong(probe: &Frame) -> Self {
        Self {
            kind: FrameKind::Pong,
            channel: String::new(),
            payload: Bytes::new(),
            sent_at_ms: probe.sent_at_ms,
        }
    }

    pub fn hello(kind: FrameKind, hello: &Hello) -> Result<Self, FrameError> {
        let body = serde_json::to_vec(hello)?;
        Ok(Self {
            kind,
            channel: String::new(),
            payload: Bytes::from(body),
            sent_at_ms: now_ms(),
        })
    }

    /// Parse the body of a `HELLO` / `HELLO_ACK` frame.
    pub fn parse_hello(&self) -> Result<Hello, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Size of the encoded frame including the length prefix.
    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_LEN + HEADER_LEN + self.channel.len() + self.payload.len()
    }

    /// Check that the frame fits the wire format without encoding it.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.channel.len() > u16::MAX as usize {
            return Err(FrameError::ChannelTooLong(self.channel.len()));
        }
        let body_len = HEADER_LEN + self.channel.len() + self.payload.len();
        if body_len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                len: body_len,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(())
    }

    /// Append the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        self.validate()?;
        let body_len = HEADER_LEN + self.channel.len() + self.payload.len();

        buf.reserve(LENGTH_PREFIX_LEN + body_len);
        buf.put_u32(body_len as u32);
        buf.put_u8(self.kind.code());
        buf.put_u64(self.sent_at_ms);
        buf.put_u16(self.channel.len() as u16);
        buf.put_slice(self.channel.as_bytes());
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(Some((frame, bytes_consumed)))` when a whole frame is
/// available, `Ok(None)` when more bytes are needed, and `Err` on
/// malformed data.
pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < LENGTH_PREFIX_LEN {
        return Ok(None);
    }
    let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    check_body_len(body_len)?;

    let total = LENGTH_PREFIX_LEN + body_len;
    if buf.len() < total {
        return Ok(None);
    }

    let frame = parse_body(&buf[LENGTH_PREFIX_LEN..total])?;
    Ok(Some((frame, total)))
}

/// Read one frame from an async byte stream.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new frame starts.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let body_len = u32::from_be_bytes(prefix) as usize;
    check_body_len(body_len)?;

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    parse_body(&body).map(Some)
}

/// Encode and write one frame, then flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let encoded = frame.encode()?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn check_body_len(body_len: usize) -> Result<(), FrameError> {
    if body_len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            len: body_len,
            max: MAX_FRAME_SIZE,
        });
    }
    if body_len < HEADER_LEN {
        return Err(FrameError::Truncated("header"));
    }
    Ok(())
}

fn parse_body(mut body: &[u8]) -> Result<Frame, FrameError> {
    let code = body.get_u8();
    let kind = FrameKind::from_code(code).ok_or(FrameError::UnknownKind(code))?;
    let sent_at_ms = body.get_u64();
    let channel_len = body.get_u16() as usize;

    if body.remaining() < channel_len {
        return Err(FrameError::Truncated("channel"));
    }
    let channel = std::str::from_utf8(&body[..channel_len])
        .map_err(|_| FrameError::InvalidChannel)?
        .to_owned();
    body.advance(channel_len);

    Ok(Frame {
        kind,
        channel,
        payload: Bytes::copy_from_slice(body),
        sent_at_ms,
    })
}
