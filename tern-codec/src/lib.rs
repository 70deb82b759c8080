//! # tern-codec
//!
//! Framing and value encoding for the tern IPC transport.
//!
//! This crate provides:
//! - `FrameCodec` - Incremental decoder for the connection header and call
//!   frames, encoders for calls, heartbeats and replies, and a blocking
//!   reply reader for the client
//! - `Codec` - The parameter/result serialization boundary, with `I64Codec`,
//!   `BytesCodec` and `StringCodec` implementations; `CodecExt` reports a
//!   panicking codec as a `CodecError`
//!
//! ## Call Frame Format
//!
//! ```text
//! +----------------+----------------+---------------------+
//! | Length (4 BE)  | Call id (4 BE) | Param (Length - 4)  |
//! +----------------+----------------+---------------------+
//! ```
//!
//! A length of `-1` with nothing after it is a heartbeat.

mod codec;
mod frame;

pub use codec::{BytesCodec, Codec, CodecExt, I64Codec, StringCodec};
pub use frame::{FrameCodec, Reply, ReplyOutcome, ServerFrame, DEFAULT_MAX_FRAME_SIZE};
