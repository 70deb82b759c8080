//! # tern-transport
//!
//! Client and server halves of the tern IPC transport.
//!
//! This crate provides:
//! - `Client` - Blocking client with a per-address connection cache
//! - `Server` - Multi-stage server (listener, readers, handlers, responder)
//! - `ConnectionPool` - Keyed cache that never stores a failed connection
//! - `Multiplexer` - Call id allocation and reply correlation
//!
//! ## Threading Note
//!
//! Everything here runs on plain OS threads. Servers own one listener, a
//! configurable number of readers and handlers, one responder and one idle
//! scanner. Clients run one receiver thread per cached connection, and the
//! calling thread blocks in [`PendingCall::wait`].
//!
//! Sockets are multiplexed with `mio`, so only Unix targets are supported.

mod client;
mod connection;
mod mux;
mod pool;
mod server;

pub use client::{Client, ClientConfig, PendingCall};
pub use connection::ConnectionId;
pub use mux::{CallOutcome, Multiplexer};
pub use pool::{ConnectionPool, PoolEntry};
pub use server::{CallHandler, Server, ServerConfig};
