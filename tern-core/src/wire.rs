//! The versioned wire contract.
//!
//! Everything in this module is a frozen byte layout: old clients parse the
//! version-mismatch reply with hard-coded readers, so none of it may change
//! shape between protocol generations. All integers are big-endian and a
//! string is an `i32` byte length followed by UTF-8 bytes (`-1` for absent).
//!
//! ```text
//! client -> server
//!   +--------+---------+------+   +-------------+------------------------+
//!   | "hrpc" | version | kind |   | len (i32)   | protocol, identity     |  once
//!   +--------+---------+------+   +-------------+------------------------+
//!   +-------------+---------------+------------------+
//!   | len (i32)   | call id (i32) | parameter bytes  |                         repeated
//!   +-------------+---------------+------------------+
//!
//! server -> client
//!   +---------------+--------------+------------------------------------+
//!   | call id (i32) | status (i32) | len + result | class, message      |  repeated
//!   +---------------+--------------+------------------------------------+
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::error::TransportError;

/// Connection magic sent before anything else.
pub const MAGIC: [u8; 4] = *b"hrpc";

/// Protocol version spoken by this implementation.
pub const CURRENT_VERSION: u8 = 5;

/// Last version that expects the two-field legacy mismatch reply.
pub const LEGACY_REPLY_VERSION: u8 = 2;

/// Bytes in the fixed connection preamble.
pub const PREAMBLE_LEN: usize = 6;

/// Frame length value that marks a heartbeat instead of a call.
pub const PING_CALL_ID: i32 = -1;

/// Call id used for replies that do not belong to any call.
pub const NO_CALL_ID: i32 = -1;

/// Error class older clients map onto their version-mismatch exception.
pub const VERSION_MISMATCH_CLASS: &str = "org.apache.hadoop.ipc.RPC$VersionMismatch";

/// Serialization kind negotiated in the preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SerializationKind {
    /// Opaque binary values produced by a `Codec`.
    Binary = 0x50,
}

impl SerializationKind {
    /// Parse the preamble byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x50 => Some(Self::Binary),
            _ => None,
        }
    }

    /// Byte sent on the wire.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// The fixed six-byte connection preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    /// Protocol version announced by the client
    pub version: u8,
    /// Raw serialization-kind byte
    pub kind: u8,
}

impl Preamble {
    /// Preamble for the current version and the given kind.
    #[must_use]
    pub const fn current(kind: SerializationKind) -> Self {
        Self {
            version: CURRENT_VERSION,
            kind: kind.as_byte(),
        }
    }

    /// Serialize to the six wire bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; PREAMBLE_LEN] {
        [
            MAGIC[0],
            MAGIC[1],
            MAGIC[2],
            MAGIC[3],
            self.version,
            self.kind,
        ]
    }

    /// Parse the six wire bytes, rejecting a bad magic.
    pub fn parse(bytes: &[u8; PREAMBLE_LEN]) -> Result<Self, TransportError> {
        if bytes[..4] != MAGIC {
            return Err(TransportError::Protocol(format!(
                "bad connection magic {:02x?}",
                &bytes[..4]
            )));
        }
        Ok(Self {
            version: bytes[4],
            kind: bytes[5],
        })
    }

    /// Check if the server can talk to this client.
    #[must_use]
    pub fn is_supported_version(&self) -> bool {
        self.version == CURRENT_VERSION
    }
}

/// Negotiation header sent once, right after the preamble.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ConnectionHeader {
    /// Protocol the client wants to talk
    pub protocol: Option<String>,
    /// Identity the calls are made on behalf of
    pub identity: Option<String>,
}

impl ConnectionHeader {
    /// Create a header.
    #[must_use]
    pub fn new(protocol: Option<String>, identity: Option<String>) -> Self {
        Self { protocol, identity }
    }

    /// Write the length-prefixed header.
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut body = BytesMut::new();
        put_opt_string(&mut body, self.protocol.as_deref());
        put_opt_string(&mut body, self.identity.as_deref());
        dst.reserve(4 + body.len());
        dst.put_i32(body.len() as i32);
        dst.put_slice(&body);
    }

    /// Parse the header body (without its length prefix).
    pub fn decode_body(mut body: &[u8]) -> Result<Self, TransportError> {
        let protocol = get_opt_string(&mut body)?;
        let identity = get_opt_string(&mut body)?;
        if body.has_remaining() {
            return Err(TransportError::Protocol(format!(
                "{} trailing bytes in connection header",
                body.remaining()
            )));
        }
        Ok(Self { protocol, identity })
    }
}

/// Outcome marker carried by every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReplyStatus {
    /// The call returned a value
    Success = 0,
    /// The call failed; the connection is still usable
    Error = 1,
    /// The call failed and the server is closing the connection
    Fatal = -1,
}

impl ReplyStatus {
    /// Parse the wire value.
    #[must_use]
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::Error),
            -1 => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// Write a length-prefixed string.
pub fn put_string(dst: &mut BytesMut, value: &str) {
    dst.reserve(4 + value.len());
    dst.put_i32(value.len() as i32);
    dst.put_slice(value.as_bytes());
}

/// Write an optional string, absent as length `-1`.
pub fn put_opt_string(dst: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(value) => put_string(dst, value),
        None => dst.put_i32(-1),
    }
}

/// Read an optional string written by [`put_opt_string`].
pub fn get_opt_string(src: &mut &[u8]) -> Result<Option<String>, TransportError> {
    if src.remaining() < 4 {
        return Err(TransportError::Protocol("truncated string length".into()));
    }
    let len = src.get_i32();
    if len == -1 {
        return Ok(None);
    }
    let len = usize::try_from(len)
        .map_err(|_| TransportError::Protocol(format!("negative string length {len}")))?;
    if src.remaining() < len {
        return Err(TransportError::Protocol(format!(
            "string of {len} bytes truncated to {}",
            src.remaining()
        )));
    }
    let value = std::str::from_utf8(&src[..len])
        .map_err(|e| TransportError::Protocol(format!("string is not utf-8: {e}")))?
        .to_string();
    src.advance(len);
    Ok(Some(value))
}

/// Read a string that must be present.
pub fn get_string(src: &mut &[u8]) -> Result<String, TransportError> {
    get_opt_string(src)?.ok_or_else(|| TransportError::Protocol("missing string".into()))
}

/// Write a failure reply in the current shape.
pub fn put_failure_reply(
    dst: &mut BytesMut,
    call_id: i32,
    status: ReplyStatus,
    class: &str,
    message: &str,
) {
    dst.reserve(16 + class.len() + message.len());
    dst.put_i32(call_id);
    dst.put_i32(status as i32);
    put_string(dst, class);
    put_string(dst, message);
}

/// Message explaining why a client version was refused.
#[must_use]
pub fn version_mismatch_message(client_version: u8) -> String {
    format!(
        "Server IPC version {CURRENT_VERSION} cannot communicate with client version {client_version}"
    )
}

/// Write the version-mismatch reply in the shape `client_version` can parse.
///
/// Version 2 clients read `call id, bool error` before the two strings;
/// everything newer reads the regular fatal reply with call id `-1`.
pub fn put_version_mismatch(dst: &mut BytesMut, client_version: u8) {
    let message = version_mismatch_message(client_version);
    if client_version == LEGACY_REPLY_VERSION {
        dst.put_i32(0);
        dst.put_u8(1);
        put_string(dst, VERSION_MISMATCH_CLASS);
        put_string(dst, &message);
    } else {
        put_failure_reply(
            dst,
            NO_CALL_ID,
            ReplyStatus::Fatal,
            VERSION_MISMATCH_CLASS,
            &message,
        );
    }
}
