//! Error types for the tern IPC transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Main error type surfaced to callers of the client and server.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IpcError {
    /// The socket factory, connect, or header negotiation failed.
    #[error("failed to set up connection to {addr}: {source}")]
    ConnectionSetup {
        /// Destination of the connection attempt
        addr: SocketAddr,
        /// Underlying cause
        #[source]
        source: TransportError,
    },

    /// Socket I/O failed on an established connection.
    #[error("transport error on connection to {addr}: {source}")]
    Transport {
        /// Remote end of the failed connection
        addr: SocketAddr,
        /// Underlying cause
        #[source]
        source: TransportError,
    },

    /// A parameter or result could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The caller stopped waiting for a reply.
    #[error("call {call_id} to {addr} timed out after {timeout:?}")]
    Timeout {
        /// Remote end of the connection carrying the call
        addr: SocketAddr,
        /// Call id that was abandoned
        call_id: i32,
        /// How long the caller waited
        timeout: Duration,
    },

    /// The server refused the protocol version.
    #[error("version mismatch: {0}")]
    VersionMismatch(String),

    /// The server reported a failure for this call.
    #[error("remote error {class}: {message}")]
    Remote {
        /// Error class reported by the server
        class: String,
        /// Human-readable message reported by the server
        message: String,
        /// Whether the server closed the connection after reporting it
        fatal: bool,
    },

    /// The server could not bind its socket or start its threads.
    #[error("failed to start server on {addr}: {source}")]
    ServerStartup {
        /// Address the server was binding or bound to
        addr: SocketAddr,
        /// Underlying cause
        #[source]
        source: TransportError,
    },

    /// The client or server has been stopped.
    #[error("stopped")]
    Stopped,

    /// The request was malformed before anything was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Transport-level errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// IO error from the underlying socket
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// Connection was closed unexpectedly
    #[error("connection closed")]
    ConnectionClosed,

    /// Protocol violation
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Frame size exceeds maximum allowed
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Declared frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Connection reclaimed after sitting idle
    #[error("connection idle")]
    Idle,
}

/// Codec errors raised at the parameter/result boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    /// Encoding a value failed
    #[error("encode failed: {0}")]
    Encode(String),

    /// Decoding a value failed
    #[error("decode failed: {0}")]
    Decode(String),

    /// Input ended before the value was complete
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes present
        available: usize,
    },

    /// Input continued after the value ended
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}

/// Failure returned by a registered call handler.
///
/// Sent to the caller as an error reply; never treated as a transport fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class}: {message}")]
pub struct DispatchError {
    /// Error class name shown to the caller
    pub class: String,
    /// Human-readable message
    pub message: String,
}

impl DispatchError {
    /// Create a dispatch error with a generic class.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            class: "DispatchError".to_string(),
            message: message.into(),
        }
    }

    /// Create a dispatch error with an explicit class.
    #[must_use]
    pub fn with_class(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    /// Wrap any error, using its type name as the class.
    #[must_use]
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        Self {
            class: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Text carried by a caught panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}

impl IpcError {
    /// Wrap a setup failure for `addr`.
    #[must_use]
    pub fn setup(addr: SocketAddr, source: impl Into<TransportError>) -> Self {
        Self::ConnectionSetup {
            addr,
            source: source.into(),
        }
    }

    /// Wrap a bind or thread-spawn failure for a server on `addr`.
    #[must_use]
    pub fn startup(addr: SocketAddr, source: impl Into<TransportError>) -> Self {
        Self::ServerStartup {
            addr,
            source: source.into(),
        }
    }

    /// Wrap an I/O failure on an established connection to `addr`.
    #[must_use]
    pub fn transport(addr: SocketAddr, source: impl Into<TransportError>) -> Self {
        Self::Transport {
            addr,
            source: source.into(),
        }
    }

    /// Remote address the error is attributed to, when known.
    #[must_use]
    pub fn addr(&self) -> Option<SocketAddr> {
        match self {
            Self::ConnectionSetup { addr, .. }
            | Self::Transport { addr, .. }
            | Self::ServerStartup { addr, .. }
            | Self::Timeout { addr, .. } => Some(*addr),
            _ => None,
        }
    }

    /// Check if this error means the connection it occurred on is unusable.
    ///
    /// Timeouts, codec faults and non-fatal remote errors are scoped to one
    /// call; everything else tears the connection down.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Self::ConnectionSetup { .. } | Self::Transport { .. } | Self::VersionMismatch(_) => {
                true
            }
            Self::Remote { fatal, .. } => *fatal,
            Self::Codec(_)
            | Self::Timeout { .. }
            | Self::ServerStartup { .. }
            | Self::Stopped
            | Self::InvalidRequest(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_setup_error_names_address_and_cause() {
        let addr: SocketAddr = "127.0.0.1:10".parse().unwrap();
        let cause = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "Injected fault");
        let err = IpcError::setup(addr, cause);

        let message = err.to_string();
        assert!(message.contains("127.0.0.1:10"));
        assert!(message.contains("Injected fault"));

        let source = err.source().expect("setup error keeps its cause");
        assert!(message.contains(&source.to_string()));
    }

    #[test]
    fn test_connection_fatal() {
        let addr: SocketAddr = "127.0.0.1:10".parse().unwrap();
        assert!(IpcError::transport(addr, TransportError::ConnectionClosed).is_connection_fatal());
        assert!(IpcError::VersionMismatch("old".into()).is_connection_fatal());
        assert!(!IpcError::Codec(CodecError::Decode("bad".into())).is_connection_fatal());
        assert!(!IpcError::Timeout {
            addr,
            call_id: 1,
            timeout: Duration::from_millis(5)
        }
        .is_connection_fatal());
        assert!(IpcError::Remote {
            class: "X".into(),
            message: "y".into(),
            fatal: true
        }
        .is_connection_fatal());
    }

    #[test]
    fn test_dispatch_error_from_error() {
        let io = std::io::Error::other("disk on fire");
        let err = DispatchError::from_error(&io);
        assert!(err.class.contains("Error"));
        assert_eq!(err.message, "disk on fire");
        assert!(err.to_string().ends_with(": disk on fire"));
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("{} {}", "two", "words")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "two words");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(7u32)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "panicked with a non-string payload");
    }
}
