//! # Tern
//!
//! Blocking RPC transport that speaks the Hadoop IPC wire protocol.
//!
//! Tern provides:
//! - **A staged server**: listener, readers, a bounded call queue, handlers
//!   and a responder, with backpressure from the handlers all the way back
//!   to accept
//! - **A pooled client**: one multiplexed connection per address, protocol
//!   and identity, with heartbeats, call timeouts and eviction on failure
//! - **Legacy compatibility**: older clients are turned away with the exact
//!   version-mismatch reply they know how to report
//! - **Pluggable values**: parameters and results go through a [`Codec`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tern::prelude::*;
//!
//! let server = Server::bind(
//!     ServerConfig::default().handler_count(4),
//!     I64Codec,
//!     I64Codec,
//!     |_ctx: &CallContext, value: i64| Ok::<_, DispatchError>(value * 2),
//! )?;
//! server.start()?;
//!
//! let client = Client::new(ClientConfig::default(), I64Codec, I64Codec);
//! let doubled = client.call(&21, server.local_addr(), None, None, Duration::from_secs(5))?;
//! assert_eq!(doubled, 42);
//! # Ok::<(), IpcError>(())
//! ```
//!
//! ## Architecture
//!
//! Tern is composed of several crates:
//!
//! - [`tern-core`] - Error types, call context, socket factory and the wire contract
//! - [`tern-codec`] - Frame codec plus the value codecs
//! - [`tern-transport`] - Client, connection cache and the server pipeline

// Re-export core types
pub use tern_core::{
    CallContext, CodecError, DefaultSocketFactory, DispatchError, IpcError, SocketFactory,
    SocketOptions, TransportError,
};

// Re-export the wire contract
pub use tern_core::wire;
pub use tern_core::{ConnectionHeader, Preamble, ReplyStatus, SerializationKind};

// Re-export codecs
pub use tern_codec::{
    BytesCodec, Codec, CodecExt, FrameCodec, I64Codec, Reply, ReplyOutcome, ServerFrame, StringCodec,
    DEFAULT_MAX_FRAME_SIZE,
};

// Re-export transport
pub use tern_transport::{
    CallHandler, CallOutcome, Client, ClientConfig, ConnectionId, ConnectionPool, Multiplexer,
    PendingCall, PoolEntry, Server, ServerConfig,
};

/// Prelude module for convenient imports.
///
/// ```rust
/// use tern::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CallContext, Client, ClientConfig, Codec, DispatchError, I64Codec, IpcError, Server,
        ServerConfig, StringCodec,
    };
}

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
