//! A pooled client connection and its receiver thread.

use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use crossbeam::channel::Receiver;
use parking_lot::Mutex;

use tern_codec::{FrameCodec, Reply, ReplyOutcome};
use tern_core::wire::{NO_CALL_ID, VERSION_MISMATCH_CLASS};
use tern_core::{
    ConnectionHeader, IpcError, Preamble, SerializationKind, SocketFactory, SocketOptions,
    TransportError,
};

use crate::client::ClientConfig;
use crate::mux::{CallOutcome, Multiplexer};
use crate::pool::{ConnectionPool, PoolEntry};

pub(crate) type ClientPool = ConnectionPool<ConnectionId, ClientConnection>;

/// Identity of a cached client connection.
///
/// Two calls share a connection only if they target the same address with
/// the same protocol and identity, and were made under the same
/// connection-affecting settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    /// Remote address
    pub addr: SocketAddr,
    /// Protocol named in the connection header
    pub protocol: Option<String>,
    /// Identity named in the connection header
    pub identity: Option<String>,
    ping_interval: Duration,
    ping: bool,
    max_idle: Duration,
    tcp_nodelay: bool,
    max_frame_size: usize,
}

impl ConnectionId {
    /// Build the id for calls to `addr` under `config`.
    #[must_use]
    pub fn new(
        addr: SocketAddr,
        protocol: Option<&str>,
        identity: Option<&str>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            addr,
            protocol: protocol.map(str::to_owned),
            identity: identity.map(str::to_owned),
            ping_interval: config.ping_interval,
            ping: config.ping,
            max_idle: config.max_idle,
            tcp_nodelay: config.tcp_nodelay,
            max_frame_size: config.max_frame_size,
        }
    }

    /// Read timeout of the receiver: the sooner of the ping interval and
    /// the idle limit, ignoring whichever is zero.
    fn tick(&self) -> Option<Duration> {
        [self.ping_interval, self.max_idle]
            .into_iter()
            .filter(|d| !d.is_zero())
            .min()
    }

    fn pings(&self) -> bool {
        self.ping && !self.ping_interval.is_zero()
    }
}

/// One established connection shared by every caller with the same
/// [`ConnectionId`].
pub(crate) struct ClientConnection {
    id: ConnectionId,
    stream: TcpStream,
    // Serializes frame writes; the buffer is reused between them.
    write_buf: Mutex<BytesMut>,
    mux: Multiplexer,
    codec: FrameCodec,
    closed: AtomicBool,
    created: Instant,
    last_activity_ms: AtomicU64,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl ClientConnection {
    /// Connect, negotiate, and start the receiver thread.
    ///
    /// Every failure before the connection is returned is a setup fault
    /// naming the destination address.
    pub(crate) fn open(
        id: ConnectionId,
        factory: &dyn SocketFactory,
        config: &ClientConfig,
        pool: Weak<ClientPool>,
    ) -> Result<Arc<Self>, IpcError> {
        let addr = id.addr;
        let setup = |e: io::Error| IpcError::setup(addr, e);

        let stream = connect_with_retries(factory, config, addr)?;

        let options = SocketOptions::new()
            .nodelay(id.tcp_nodelay)
            .read_timeout(id.tick());
        factory.configure(&stream, &options).map_err(setup)?;

        let mut hello = BytesMut::new();
        hello.put_slice(&Preamble::current(SerializationKind::Binary).to_bytes());
        ConnectionHeader::new(id.protocol.clone(), id.identity.clone()).encode(&mut hello);
        (&stream).write_all(&hello).map_err(setup)?;

        let read_half = stream.try_clone().map_err(setup)?;
        let conn = Arc::new(Self {
            codec: FrameCodec::with_max_frame_size(id.max_frame_size),
            id,
            stream,
            write_buf: Mutex::new(BytesMut::new()),
            mux: Multiplexer::new(),
            closed: AtomicBool::new(false),
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            receiver: Mutex::new(None),
        });

        let handle = thread::Builder::new()
            .name(format!("tern-client-{addr}"))
            .spawn({
                let conn = conn.clone();
                move || conn.receive_loop(read_half, pool)
            })
            .map_err(setup)?;
        *conn.receiver.lock() = Some(handle);

        tracing::debug!(connection = %addr, "Connected");
        Ok(conn)
    }

    pub(crate) fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.id.addr
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write one call frame.
    ///
    /// Returns `Ok(None)` when the connection closed before anything was
    /// written; the caller may retry on a fresh connection.
    pub(crate) fn send(
        &self,
        param: &[u8],
    ) -> Result<Option<(i32, Receiver<CallOutcome>)>, IpcError> {
        let (call_id, receiver) = self.mux.register();

        let mut buf = self.write_buf.lock();
        if self.is_closed() {
            drop(buf);
            self.mux.cancel(call_id);
            return Ok(None);
        }

        buf.clear();
        if let Err(e) = self.codec.encode_call(call_id, param, &mut buf) {
            drop(buf);
            self.mux.cancel(call_id);
            return Err(IpcError::InvalidRequest(e.to_string()));
        }

        if let Err(e) = (&self.stream).write_all(&buf) {
            drop(buf);
            self.mux.cancel(call_id);
            let err = IpcError::transport(self.addr(), e);
            self.shutdown(&err);
            return Err(err);
        }
        drop(buf);

        self.touch();
        Ok(Some((call_id, receiver)))
    }

    /// Stop waiting for `call_id`.
    pub(crate) fn cancel(&self, call_id: i32) -> bool {
        self.mux.cancel(call_id)
    }

    /// Close the socket and fail every pending call with `error`.
    pub(crate) fn shutdown(&self, error: &IpcError) {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        let failed = self.mux.cancel_all(error);
        if first {
            tracing::debug!(connection = %self.addr(), failed, %error, "Closing connection");
        }
    }

    /// Wait for the receiver thread to exit.
    pub(crate) fn join(&self) {
        let handle = self.receiver.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// Mark the connection closed if nothing is pending and it has been
    /// quiet for `max_idle`.
    fn close_if_idle(&self) -> bool {
        // Holding the write lock keeps a concurrent send from slipping in.
        let _buf = self.write_buf.lock();
        if self.mux.has_pending() || self.idle_for() < self.id.max_idle {
            return false;
        }
        self.closed.store(true, Ordering::SeqCst);
        true
    }

    fn send_ping(&self) -> io::Result<()> {
        let mut buf = self.write_buf.lock();
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed",
            ));
        }
        buf.clear();
        self.codec.encode_ping(&mut buf);
        (&self.stream).write_all(&buf)
    }

    fn receive_loop(self: Arc<Self>, read_half: TcpStream, pool: Weak<ClientPool>) {
        let addr = self.addr();
        let mut reader = BufReader::new(PingingStream {
            conn: &self,
            stream: read_half,
            tick: self.id.tick().unwrap_or_default(),
            last_ping: Instant::now(),
            idle: false,
        });

        let error = loop {
            match self.codec.read_reply(&mut reader) {
                Ok(reply) => {
                    self.touch();
                    if let Some(error) = self.route(reply) {
                        break error;
                    }
                }
                Err(_) if reader.get_ref().idle => {
                    tracing::debug!(connection = %addr, "Closing idle connection");
                    break IpcError::transport(addr, TransportError::Idle);
                }
                Err(e) => break IpcError::transport(addr, e),
            }
        };
        drop(reader);

        self.shutdown(&error);
        if let Some(pool) = pool.upgrade() {
            pool.evict(&self.id, &self);
        }
    }

    /// Deliver a reply; returns the error to close with for fatal replies.
    fn route(&self, reply: Reply) -> Option<IpcError> {
        let call_id = reply.call_id;
        match reply.outcome {
            ReplyOutcome::Success(result) => {
                self.mux.dispatch(call_id, result);
                None
            }
            ReplyOutcome::Error { class, message } => {
                self.mux.dispatch_error(
                    call_id,
                    IpcError::Remote {
                        class,
                        message,
                        fatal: false,
                    },
                );
                None
            }
            ReplyOutcome::Fatal { class, message } => {
                // Refuse new calls before the failed caller wakes up and retries.
                self.closed.store(true, Ordering::SeqCst);
                tracing::debug!(connection = %self.addr(), call_id, %class, "Fatal reply from server");
                if class == VERSION_MISMATCH_CLASS {
                    return Some(IpcError::VersionMismatch(message));
                }
                let reason = format!("server closed connection after {class}: {message}");
                if call_id != NO_CALL_ID {
                    self.mux.dispatch_error(
                        call_id,
                        IpcError::Remote {
                            class,
                            message,
                            fatal: true,
                        },
                    );
                }
                Some(IpcError::transport(
                    self.addr(),
                    TransportError::Protocol(reason),
                ))
            }
        }
    }
}

impl PoolEntry for ClientConnection {
    fn is_open(&self) -> bool {
        !self.is_closed()
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn connect_with_retries(
    factory: &dyn SocketFactory,
    config: &ClientConfig,
    addr: SocketAddr,
) -> Result<TcpStream, IpcError> {
    let mut attempt = 0;
    loop {
        match factory.connect(addr, config.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < config.max_connect_retries => {
                attempt += 1;
                tracing::info!(connection = %addr, attempt, error = %e, "Retrying connect");
                thread::sleep(config.connect_retry_interval);
            }
            Err(e) => return Err(IpcError::setup(addr, e)),
        }
    }
}

/// Read half of a connection that turns read timeouts into heartbeats.
///
/// The socket read timeout is the shorter of the ping interval and the idle
/// limit. Each time it expires the connection either closes itself as idle
/// or, while it is still in use, sends a heartbeat once a ping interval has
/// passed since the last one, and keeps reading.
struct PingingStream<'a> {
    conn: &'a ClientConnection,
    stream: TcpStream,
    tick: Duration,
    last_ping: Instant,
    idle: bool,
}

impl PingingStream<'_> {
    fn ping_due(&self) -> bool {
        // Half a tick of slack for timeouts that fire slightly early.
        self.conn.id.pings()
            && self.last_ping.elapsed() + self.tick / 2 >= self.conn.id.ping_interval
    }
}

impl Read for PingingStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    if self.conn.is_closed() {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "connection closed",
                        ));
                    }
                    if self.conn.close_if_idle() {
                        self.idle = true;
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "connection idle"));
                    }
                    if self.ping_due() {
                        self.conn.send_ping()?;
                        self.last_ping = Instant::now();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }
}
