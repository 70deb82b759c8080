//! Length-prefixed frame codec for calls and replies.

use std::io::{self, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use tern_core::wire::{self, PING_CALL_ID};
use tern_core::{ConnectionHeader, ReplyStatus, TransportError};

/// Default maximum frame size (64 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// A frame read by the server after negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// A call with its still-encoded parameter.
    Call {
        /// Call id chosen by the client
        id: i32,
        /// Encoded parameter bytes
        param: Bytes,
    },
    /// A heartbeat; carries nothing and gets no reply.
    Ping,
}

/// A reply read by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Call the reply belongs to, or `-1` for connection-level replies
    pub call_id: i32,
    /// What the server reported
    pub outcome: ReplyOutcome,
}

/// Body of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Encoded result value.
    Success(Bytes),
    /// The call failed; the connection stays up.
    Error {
        /// Error class reported by the server
        class: String,
        /// Error message reported by the server
        message: String,
    },
    /// The call failed and the server is closing the connection.
    Fatal {
        /// Error class reported by the server
        class: String,
        /// Error message reported by the server
        message: String,
    },
}

/// Frame codec for both directions of a connection.
///
/// The server side decodes incrementally from a `BytesMut` that the reader
/// fills from a non-blocking socket; the client side reads replies with
/// blocking `Read` calls on its own receiver thread.
///
/// ## Example
///
/// ```rust
/// use bytes::BytesMut;
/// use tern_codec::{FrameCodec, ServerFrame};
///
/// let codec = FrameCodec::new();
/// let mut buf = BytesMut::new();
///
/// codec.encode_call(7, b"hello", &mut buf).unwrap();
/// codec.encode_ping(&mut buf);
///
/// let call = codec.decode_call(&mut buf).unwrap().unwrap();
/// assert!(matches!(call, ServerFrame::Call { id: 7, .. }));
/// assert_eq!(codec.decode_call(&mut buf).unwrap(), Some(ServerFrame::Ping));
/// ```
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new codec with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom maximum frame size.
    #[inline]
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Get the maximum frame size.
    #[inline]
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn check_len(&self, len: i32) -> Result<usize, TransportError> {
        let len = usize::try_from(len)
            .map_err(|_| TransportError::Protocol(format!("negative frame length {len}")))?;
        if len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        Ok(len)
    }

    /// Decode the connection header once it is complete.
    pub fn decode_header(
        &self,
        src: &mut BytesMut,
    ) -> Result<Option<ConnectionHeader>, TransportError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = self.check_len(i32::from_be_bytes([src[0], src[1], src[2], src[3]]))?;
        let total_len = 4 + len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let body = src.split_to(len);
        ConnectionHeader::decode_body(&body).map(Some)
    }

    /// Decode the next call frame or heartbeat.
    #[inline]
    pub fn decode_call(&self, src: &mut BytesMut) -> Result<Option<ServerFrame>, TransportError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let raw = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if raw == PING_CALL_ID {
            src.advance(4);
            return Ok(Some(ServerFrame::Ping));
        }

        let len = self.check_len(raw)?;
        if len < 4 {
            return Err(TransportError::Protocol(format!(
                "call frame of {len} bytes has no call id"
            )));
        }

        let total_len = 4 + len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let id = src.get_i32();
        let param = src.split_to(len - 4).freeze();
        Ok(Some(ServerFrame::Call { id, param }))
    }

    /// Encode a call frame.
    pub fn encode_call(&self, id: i32, param: &[u8], dst: &mut BytesMut) -> Result<(), TransportError> {
        let len = 4 + param.len();
        if len > self.max_frame_size || len > i32::MAX as usize {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        dst.reserve(4 + len);
        dst.put_i32(len as i32);
        dst.put_i32(id);
        dst.put_slice(param);
        Ok(())
    }

    /// Encode a heartbeat.
    #[inline]
    pub fn encode_ping(&self, dst: &mut BytesMut) {
        dst.put_i32(PING_CALL_ID);
    }

    /// Encode a success reply.
    pub fn encode_success(
        &self,
        id: i32,
        result: &[u8],
        dst: &mut BytesMut,
    ) -> Result<(), TransportError> {
        let len = result.len();
        if len > self.max_frame_size || len > i32::MAX as usize {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        dst.reserve(12 + len);
        dst.put_i32(id);
        dst.put_i32(ReplyStatus::Success as i32);
        dst.put_i32(len as i32);
        dst.put_slice(result);
        Ok(())
    }

    /// Encode an error or fatal reply.
    pub fn encode_failure(
        &self,
        id: i32,
        status: ReplyStatus,
        class: &str,
        message: &str,
        dst: &mut BytesMut,
    ) {
        wire::put_failure_reply(dst, id, status, class, message);
    }

    /// Read one reply, blocking until it is complete.
    pub fn read_reply<R: Read>(&self, reader: &mut R) -> Result<Reply, TransportError> {
        let call_id = read_i32(reader)?;
        let status = read_i32(reader)?;
        let status = ReplyStatus::from_i32(status)
            .ok_or_else(|| TransportError::Protocol(format!("unknown reply status {status}")))?;

        let outcome = match status {
            ReplyStatus::Success => {
                let len = self.check_len(read_i32(reader)?)?;
                ReplyOutcome::Success(self.read_exact_bytes(reader, len)?)
            }
            ReplyStatus::Error => {
                let (class, message) = self.read_class_and_message(reader)?;
                ReplyOutcome::Error { class, message }
            }
            ReplyStatus::Fatal => {
                let (class, message) = self.read_class_and_message(reader)?;
                ReplyOutcome::Fatal { class, message }
            }
        };

        Ok(Reply { call_id, outcome })
    }

    fn read_class_and_message<R: Read>(
        &self,
        reader: &mut R,
    ) -> Result<(String, String), TransportError> {
        let class = self.read_string(reader)?;
        let message = self.read_string(reader)?;
        Ok((class, message))
    }

    fn read_string<R: Read>(&self, reader: &mut R) -> Result<String, TransportError> {
        let raw = read_i32(reader)?;
        if raw == -1 {
            return Ok(String::new());
        }
        let len = self.check_len(raw)?;
        let bytes = self.read_exact_bytes(reader, len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| TransportError::Protocol(format!("reply string is not utf-8: {e}")))
    }

    fn read_exact_bytes<R: Read>(&self, reader: &mut R, len: usize) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::zeroed(len);
        reader.read_exact(&mut buf).map_err(map_eof)?;
        Ok(buf.freeze())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32, TransportError> {
    let mut raw = [0u8; 4];
    reader.read_exact(&mut raw).map_err(map_eof)?;
    Ok(i32::from_be_bytes(raw))
}

fn map_eof(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        TransportError::ConnectionClosed
    } else {
        TransportError::from(e)
    }
}
