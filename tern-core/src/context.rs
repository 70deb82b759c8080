//! Per-call context handed to server-side handlers.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Information about the call being dispatched.
///
/// Built by the reader that decoded the call and passed by reference to the
/// handler. It carries what the connection negotiated (`protocol`,
/// `identity`) next to what the call itself carried (`call_id`).
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Call id chosen by the client, unique per connection.
    pub call_id: i32,

    /// Protocol named in the connection header.
    pub protocol: Option<String>,

    /// Identity named in the connection header.
    pub identity: Option<String>,

    /// Remote address of the connection.
    pub peer: SocketAddr,

    /// When the reader finished decoding the call.
    pub received: Instant,
}

impl CallContext {
    /// Create a context for a freshly decoded call.
    #[must_use]
    pub fn new(
        call_id: i32,
        protocol: Option<String>,
        identity: Option<String>,
        peer: SocketAddr,
    ) -> Self {
        Self {
            call_id,
            protocol,
            identity,
            peer,
            received: Instant::now(),
        }
    }

    /// Time the call spent between decode and now.
    #[must_use]
    pub fn queued_for(&self) -> Duration {
        self.received.elapsed()
    }
}
