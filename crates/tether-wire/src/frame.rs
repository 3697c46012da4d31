//! Frame codec.
//!
//! Every frame starts with a fixed 16-byte big-endian header:
//!
//! ```text
//! 0..4   magic "msnb"
//! 4      protocol version
//! 5..9   total frame length (header + body)
//! 9      message kind
//! 10     serialization id
//! 11     compression id
//! 12..16 sequence number
//! 16..   body: serialized, then compressed
//! ```
//!
//! Heartbeat frames carry no body. Header violations are [`RpcError::Protocol`]
//! and leave the stream unusable; body failures are codec errors local to the
//! frame.

use crate::plugin::PluginRegistry;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tether_types::error::{RpcError, RpcResult};
use tether_types::message::{Request, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// First four bytes of every frame.
pub const MAGIC: [u8; 4] = *b"msnb";

/// Only version this codec speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size.
pub const HEADER_LEN: usize = 16;

/// Default upper bound on a whole frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Magic + version + length: enough to size the rest of the frame.
const PREFIX_LEN: usize = 9;

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Request = 1,
    Response = 2,
    HeartbeatPing = 3,
    HeartbeatPong = 4,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::HeartbeatPing),
            4 => Some(Self::HeartbeatPong),
            _ => None,
        }
    }

    pub fn is_heartbeat(self) -> bool {
        matches!(self, Self::HeartbeatPing | Self::HeartbeatPong)
    }

    /// Body type carried by this kind, `None` for heartbeats.
    pub fn body_kind(self) -> Option<BodyKind> {
        match self {
            Self::Request => Some(BodyKind::Request),
            Self::Response => Some(BodyKind::Response),
            Self::HeartbeatPing | Self::HeartbeatPong => None,
        }
    }
}

/// Decoded frame body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Request(Request),
    Response(Response),
}

/// Which body type a serializer should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Request,
    Response,
}

/// One frame, before encoding or after decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub serialization: u8,
    pub compression: u8,
    /// Assigned by the encoder; informational on decoded frames.
    pub sequence: u32,
    pub body: Option<Body>,
}

impl Message {
    pub fn request(request: Request, serialization: u8, compression: u8) -> Self {
        Self::new(
            MessageKind::Request,
            serialization,
            compression,
            Some(Body::Request(request)),
        )
    }

    pub fn response(response: Response, serialization: u8, compression: u8) -> Self {
        Self::new(
            MessageKind::Response,
            serialization,
            compression,
            Some(Body::Response(response)),
        )
    }

    pub fn ping(serialization: u8, compression: u8) -> Self {
        Self::new(MessageKind::HeartbeatPing, serialization, compression, None)
    }

    pub fn pong(serialization: u8, compression: u8) -> Self {
        Self::new(MessageKind::HeartbeatPong, serialization, compression, None)
    }

    fn new(kind: MessageKind, serialization: u8, compression: u8, body: Option<Body>) -> Self {
        Self {
            kind,
            serialization,
            compression,
            sequence: 0,
            body,
        }
    }
}

/// Parsed fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: MessageKind,
    pub serialization: u8,
    pub compression: u8,
    pub sequence: u32,
}

impl FrameHeader {
    /// Parse and validate the header at the start of `frame`.
    pub fn parse(frame: &[u8]) -> RpcResult<Self> {
        if frame.len() < HEADER_LEN {
            return Err(RpcError::Protocol(format!(
                "frame of {} bytes is shorter than the {HEADER_LEN}-byte header",
                frame.len()
            )));
        }
        check_prefix(&frame[..PREFIX_LEN])?;
        let length = u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]);
        let kind = MessageKind::from_u8(frame[9])
            .ok_or_else(|| RpcError::Protocol(format!("unknown message kind {}", frame[9])))?;
        Ok(Self {
            length,
            kind,
            serialization: frame[10],
            compression: frame[11],
            sequence: u32::from_be_bytes([frame[12], frame[13], frame[14], frame[15]]),
        })
    }
}

fn check_prefix(prefix: &[u8]) -> RpcResult<()> {
    if prefix[..4] != MAGIC {
        return Err(RpcError::Protocol(format!(
            "bad magic {:02x?}",
            &prefix[..4]
        )));
    }
    if prefix[4] != PROTOCOL_VERSION {
        return Err(RpcError::Protocol(format!(
            "unsupported protocol version {} (expected {PROTOCOL_VERSION})",
            prefix[4]
        )));
    }
    Ok(())
}

/// Encoder/decoder for tether frames.
///
/// Shared behind an `Arc` by every connection of a client or server; the
/// sequence counter is process-wide for that codec.
pub struct FrameCodec {
    plugins: Arc<PluginRegistry>,
    max_frame_size: usize,
    sequence: AtomicU32,
}

impl FrameCodec {
    pub fn new(plugins: Arc<PluginRegistry>, max_frame_size: usize) -> Self {
        Self {
            plugins,
            max_frame_size,
            sequence: AtomicU32::new(0),
        }
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a message into one complete frame, stamping a fresh sequence number.
    pub fn encode(&self, msg: &Message) -> RpcResult<Bytes> {
        let body = match &msg.body {
            Some(body) => {
                let serializer = self.plugins.load_serializer(msg.serialization)?;
                let compressor = self.plugins.load_compress(msg.compression)?;
                compressor.compress(&serializer.serialize(body)?)?
            }
            None => Vec::new(),
        };

        let total = HEADER_LEN + body.len();
        if total > self.max_frame_size {
            return Err(RpcError::Protocol(format!(
                "frame of {total} bytes exceeds max {}",
                self.max_frame_size
            )));
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut buf = BytesMut::with_capacity(total);
        buf.put_slice(&MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u32(total as u32);
        buf.put_u8(msg.kind as u8);
        buf.put_u8(msg.serialization);
        buf.put_u8(msg.compression);
        buf.put_u32(sequence);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode one complete frame.
    ///
    /// The length field must match the slice; a heartbeat frame's body, if
    /// any, is ignored.
    pub fn decode_frame(&self, frame: &[u8]) -> RpcResult<Message> {
        let header = FrameHeader::parse(frame)?;
        if header.length as usize != frame.len() {
            return Err(RpcError::Protocol(format!(
                "length field says {} bytes, frame has {}",
                header.length,
                frame.len()
            )));
        }

        let body = match header.kind.body_kind() {
            None => None,
            Some(kind) => {
                let raw = &frame[HEADER_LEN..];
                if raw.is_empty() {
                    return Err(RpcError::Codec(format!("{kind:?} frame without a body")));
                }
                let compressor = self.plugins.load_compress(header.compression)?;
                let serializer = self.plugins.load_serializer(header.serialization)?;
                Some(serializer.deserialize(&compressor.decompress(raw)?, kind)?)
            }
        };

        Ok(Message {
            kind: header.kind,
            serialization: header.serialization,
            compression: header.compression,
            sequence: header.sequence,
            body,
        })
    }

    /// Best-effort correlation id of a frame whose body failed to decode.
    ///
    /// Needs a valid header and both codecs from it registered; `None` means
    /// the failure cannot be tied to a call.
    pub fn recover_request_id(&self, frame: &[u8]) -> Option<String> {
        let header = FrameHeader::parse(frame).ok()?;
        header.kind.body_kind()?;
        let raw = frame.get(HEADER_LEN..)?;
        let compressor = self.plugins.load_compress(header.compression).ok()?;
        let serializer = self.plugins.load_serializer(header.serialization).ok()?;
        serializer.request_id(&compressor.decompress(raw).ok()?)
    }

    /// Read exactly one frame off a stream without decoding its body.
    ///
    /// A clean EOF between frames is [`RpcError::ChannelClosed`].
    pub async fn read_frame<R>(&self, reader: &mut R) -> RpcResult<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; PREFIX_LEN];
        match reader.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(RpcError::ChannelClosed("peer closed the connection".into()));
            }
            Err(e) => return Err(e.into()),
        }
        check_prefix(&prefix)?;

        let len = u32::from_be_bytes([prefix[5], prefix[6], prefix[7], prefix[8]]) as usize;
        if len < HEADER_LEN {
            return Err(RpcError::Protocol(format!(
                "length field {len} is shorter than the {HEADER_LEN}-byte header"
            )));
        }
        if len > self.max_frame_size {
            return Err(RpcError::Protocol(format!(
                "frame of {len} bytes exceeds max {}",
                self.max_frame_size
            )));
        }

        let mut frame = BytesMut::zeroed(len);
        frame[..PREFIX_LEN].copy_from_slice(&prefix);
        reader.read_exact(&mut frame[PREFIX_LEN..]).await?;
        Ok(frame.freeze())
    }

    /// Encode and write one message, then flush.
    pub async fn write_message<W>(&self, writer: &mut W, msg: &Message) -> RpcResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.encode(msg)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}
