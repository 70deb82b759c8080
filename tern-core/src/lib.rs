//! # tern-core
//!
//! Core types, traits, and error definitions for the tern IPC transport.
//!
//! This crate provides:
//! - Error types (`IpcError`, `TransportError`, `CodecError`, `DispatchError`)
//! - The frozen wire contract (`wire`): preamble, connection header, reply
//!   status and the legacy version-mismatch reply
//! - Per-call server context (`CallContext`)
//! - The client socket factory seam (`SocketFactory`, `SocketOptions`)

mod context;
mod error;
mod transport;
pub mod wire;

pub use context::CallContext;
pub use error::{panic_message, CodecError, DispatchError, IpcError, TransportError};
pub use transport::{DefaultSocketFactory, SocketFactory, SocketOptions};
pub use wire::{ConnectionHeader, Preamble, ReplyStatus, SerializationKind};
