//! Socket creation seam used by the client.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Options applied to every freshly connected client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Enable TCP nodelay.
    pub nodelay: bool,

    /// Read timeout; the client uses it as its heartbeat tick.
    pub read_timeout: Option<Duration>,

    /// Write timeout for individual operations.
    pub write_timeout: Option<Duration>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: false,
            read_timeout: Some(Duration::from_secs(60)),
            write_timeout: None,
        }
    }
}

impl SocketOptions {
    /// Create options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable TCP nodelay.
    #[must_use]
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }
}

/// Produces connected sockets for the client.
///
/// Swapping the factory lets tests inject faults at connect or
/// configuration time, and lets deployments route through something other
/// than a plain TCP connect.
pub trait SocketFactory: Send + Sync + std::fmt::Debug + 'static {
    /// Open a connection to `addr`. A zero `timeout` means no limit.
    fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream>;

    /// Apply `options` to a connected socket.
    fn configure(&self, stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
        stream.set_nodelay(options.nodelay)?;
        stream.set_read_timeout(options.read_timeout)?;
        stream.set_write_timeout(options.write_timeout)?;
        Ok(())
    }
}

/// Plain blocking TCP connect.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSocketFactory;

impl SocketFactory for DefaultSocketFactory {
    fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
        if timeout.is_zero() {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, timeout)
        }
    }
}
