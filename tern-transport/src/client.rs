//! Blocking RPC client with a shared connection cache.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam::channel::{Receiver, RecvTimeoutError};

use tern_codec::{Codec, CodecExt, DEFAULT_MAX_FRAME_SIZE};
use tern_core::{DefaultSocketFactory, IpcError, SocketFactory, TransportError};

use crate::connection::{ClientConnection, ClientPool, ConnectionId};
use crate::mux::CallOutcome;

/// Configuration for the client and the connections it opens.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Time between heartbeats on a connection that is still in use.
    ///
    /// A heartbeat is a one-way frame: the server never answers it, so a
    /// dead peer shows up as a failed write or read rather than a missing
    /// reply. Zero turns heartbeats off; idle connections still close
    /// after `max_idle`.
    pub ping_interval: Duration,

    /// Send heartbeats while the connection is in use.
    pub ping: bool,

    /// A connection with no pending calls is closed after this long.
    ///
    /// Checked on its own timer, whatever `ping_interval` is. Zero closes
    /// an unused connection at the first heartbeat tick, and never when
    /// heartbeats are off too.
    pub max_idle: Duration,

    /// Enable TCP nodelay.
    pub tcp_nodelay: bool,

    /// Connection timeout; zero means no limit.
    pub connect_timeout: Duration,

    /// Extra connect attempts after the first one fails.
    pub max_connect_retries: u32,

    /// Pause between connect attempts.
    pub connect_retry_interval: Duration,

    /// Maximum frame size in bytes.
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(60),
            ping: true,
            max_idle: Duration::from_secs(10),
            tcp_nodelay: true,
            connect_timeout: Duration::from_secs(20),
            max_connect_retries: 0,
            connect_retry_interval: Duration::from_secs(1),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    /// Create a new client configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Enable or disable heartbeats.
    #[must_use]
    pub fn ping(mut self, enabled: bool) -> Self {
        self.ping = enabled;
        self
    }

    /// Set the idle time after which unused connections close.
    #[must_use]
    pub fn max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Enable or disable TCP nodelay.
    #[must_use]
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the number of connect retries.
    #[must_use]
    pub fn max_connect_retries(mut self, retries: u32) -> Self {
        self.max_connect_retries = retries;
        self
    }

    /// Set the pause between connect attempts.
    #[must_use]
    pub fn connect_retry_interval(mut self, interval: Duration) -> Self {
        self.connect_retry_interval = interval;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

/// A call that has been written and is waiting for its reply.
pub struct PendingCall<R: Codec> {
    call_id: i32,
    conn: Arc<ClientConnection>,
    receiver: Receiver<CallOutcome>,
    codec: Arc<R>,
}

impl<R: Codec> PendingCall<R> {
    /// Call id assigned on the connection.
    #[must_use]
    pub fn call_id(&self) -> i32 {
        self.call_id
    }

    /// Remote address the call was sent to.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.conn.addr()
    }

    /// Block until the reply arrives or `timeout` elapses.
    ///
    /// A zero `timeout` waits without limit. Timing out abandons only this
    /// call; the connection stays cached for other callers.
    pub fn wait(self, timeout: Duration) -> Result<R::Item, IpcError> {
        let outcome = if timeout.is_zero() {
            self.receiver.recv().unwrap_or_else(|_| Err(self.disconnected()))
        } else {
            match self.receiver.recv_timeout(timeout) {
                Ok(outcome) => outcome,
                Err(RecvTimeoutError::Timeout) => {
                    if self.conn.cancel(self.call_id) {
                        return Err(IpcError::Timeout {
                            addr: self.addr(),
                            call_id: self.call_id,
                            timeout,
                        });
                    }
                    // Lost the race with the receiver; the outcome is queued.
                    self.receiver
                        .try_recv()
                        .unwrap_or_else(|_| Err(self.disconnected()))
                }
                Err(RecvTimeoutError::Disconnected) => Err(self.disconnected()),
            }
        };

        let result = outcome?;
        Ok(self.codec.decode_guarded(&result)?)
    }

    fn disconnected(&self) -> IpcError {
        IpcError::transport(self.addr(), TransportError::ConnectionClosed)
    }
}

impl<R: Codec> std::fmt::Debug for PendingCall<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("call_id", &self.call_id)
            .field("addr", &self.addr())
            .finish_non_exhaustive()
    }
}

/// RPC client.
///
/// Calls to the same address, protocol and identity are multiplexed over
/// one cached connection. Connections are created on first use, closed
/// after sitting idle, and evicted as soon as they fail, so a broken
/// connection is never handed to a later call.
///
/// ## Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use tern_codec::I64Codec;
/// use tern_transport::{Client, ClientConfig};
///
/// let client = Client::new(ClientConfig::default(), I64Codec, I64Codec);
/// let addr = "127.0.0.1:9000".parse().unwrap();
///
/// let value = client
///     .call(&42, addr, Some("echo"), None, Duration::from_secs(5))
///     .unwrap();
/// assert_eq!(value, 42);
/// ```
pub struct Client<P: Codec, R: Codec> {
    config: ClientConfig,
    param_codec: P,
    result_codec: Arc<R>,
    factory: Arc<dyn SocketFactory>,
    pool: Arc<ClientPool>,
    stopped: AtomicBool,
}

impl<P: Codec, R: Codec> Client<P, R> {
    /// Create a client that opens plain TCP connections.
    #[must_use]
    pub fn new(config: ClientConfig, param_codec: P, result_codec: R) -> Self {
        Self::with_socket_factory(config, param_codec, result_codec, DefaultSocketFactory)
    }

    /// Create a client that opens connections through `factory`.
    #[must_use]
    pub fn with_socket_factory(
        config: ClientConfig,
        param_codec: P,
        result_codec: R,
        factory: impl SocketFactory,
    ) -> Self {
        Self {
            config,
            param_codec,
            result_codec: Arc::new(result_codec),
            factory: Arc::new(factory),
            pool: Arc::new(ClientPool::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Get the client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Make a call and block until its reply or `timeout`.
    pub fn call(
        &self,
        param: &P::Item,
        addr: SocketAddr,
        protocol: Option<&str>,
        identity: Option<&str>,
        timeout: Duration,
    ) -> Result<R::Item, IpcError> {
        self.send(param, addr, protocol, identity)?.wait(timeout)
    }

    /// Write a call and return a handle to wait on.
    pub fn send(
        &self,
        param: &P::Item,
        addr: SocketAddr,
        protocol: Option<&str>,
        identity: Option<&str>,
    ) -> Result<PendingCall<R>, IpcError> {
        if self.is_stopped() {
            return Err(IpcError::Stopped);
        }

        // Encoded up front so a codec fault never touches a connection.
        let mut encoded = BytesMut::new();
        self.param_codec.encode_guarded(param, &mut encoded)?;

        let id = ConnectionId::new(addr, protocol, identity, &self.config);
        loop {
            let conn = self.pool.get_or_connect(&id, || {
                ClientConnection::open(
                    id.clone(),
                    self.factory.as_ref(),
                    &self.config,
                    Arc::downgrade(&self.pool),
                )
            })?;

            match conn.send(&encoded)? {
                Some((call_id, receiver)) => {
                    return Ok(PendingCall {
                        call_id,
                        conn,
                        receiver,
                        codec: self.result_codec.clone(),
                    });
                }
                None => {
                    // Closed underneath us before the frame went out.
                    self.pool.evict(conn.id(), &conn);
                }
            }
        }
    }

    /// Make one call per `(params[i], addrs[i])` pair and wait for all.
    ///
    /// Every call is written before any reply is awaited, and `timeout`
    /// bounds the whole batch. Element `i` of the result is the outcome of
    /// `params[i]`.
    pub fn call_parallel(
        &self,
        params: &[P::Item],
        addrs: &[SocketAddr],
        protocol: Option<&str>,
        identity: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<Result<R::Item, IpcError>>, IpcError> {
        if params.len() != addrs.len() {
            return Err(IpcError::InvalidRequest(format!(
                "{} parameters for {} addresses",
                params.len(),
                addrs.len()
            )));
        }
        if self.is_stopped() {
            return Err(IpcError::Stopped);
        }

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let pending: Vec<_> = params
            .iter()
            .zip(addrs)
            .map(|(param, addr)| self.send(param, *addr, protocol, identity))
            .collect();

        Ok(pending
            .into_iter()
            .map(|call| {
                let remaining = match deadline {
                    Some(deadline) => deadline
                        .saturating_duration_since(Instant::now())
                        .max(Duration::from_micros(1)),
                    None => Duration::ZERO,
                };
                call?.wait(remaining)
            })
            .collect())
    }

    /// Number of live cached connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.pool.len()
    }

    /// Check if the client has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Close every connection and fail pending calls with `Stopped`.
    ///
    /// Idempotent; also run on drop.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let conns = self.pool.close_all();
        tracing::debug!(connections = conns.len(), "Stopping client");
        for conn in &conns {
            conn.shutdown(&IpcError::Stopped);
        }
        for conn in &conns {
            conn.join();
        }
    }
}

impl<P: Codec, R: Codec> Drop for Client<P, R> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<P: Codec, R: Codec> std::fmt::Debug for Client<P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("connections", &self.pool.len())
            .finish_non_exhaustive()
    }
}
