//! Multi-stage blocking RPC server.
//!
//! ```text
//!             +----------+   bounded    +----------+   bounded    +----------+          +-----------+
//! accept ---> | listener | -----------> | reader i | -----------> | handlers | -------> | responder | ---> write
//!             +----------+  per reader  +----------+  call queue  +----------+          +-----------+
//!                                             ^                                               |
//!                                             +------------------ close ----------------------+
//! ```
//!
//! One listener accepts sockets and validates the preamble. Readers decode
//! calls from the connections they own and push them into a single bounded
//! call queue. Handler threads run the registered [`CallHandler`] and hand
//! encoded replies to the responder, which writes them in call order for
//! each connection. An idle scanner reclaims connections that have gone
//! quiet. Every queue between stages is bounded, so a slow handler pool
//! pushes back all the way to accept.

mod call_queue;
mod connection;
mod handler;
mod idle;
mod listener;
mod reader;
mod responder;

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use mio::Waker;
use parking_lot::Mutex;

use tern_codec::{Codec, DEFAULT_MAX_FRAME_SIZE};
use tern_core::{CallContext, DispatchError, IpcError};

use call_queue::Call;
use connection::{ConnectionState, Registry};
use handler::Handler;
use idle::IdleScanner;
use listener::Listener;
use reader::{Reader, ReaderHandle};
use responder::{Responder, ResponderHandle, ResponderParts};

/// Configuration for the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,

    /// Number of handler threads.
    pub handler_count: usize,

    /// Number of reader threads.
    pub reader_count: usize,

    /// Accepted connections each reader may have waiting for adoption.
    pub reader_queue_size: usize,

    /// Capacity of the call queue; `None` means 100 per handler.
    pub call_queue_size: Option<usize>,

    /// Enable TCP nodelay on accepted sockets.
    pub tcp_nodelay: bool,

    /// Maximum frame size in bytes.
    pub max_frame_size: usize,

    /// Time allowed to complete the preamble.
    pub negotiation_timeout: Duration,

    /// Idle time after which a connection without outstanding calls may be
    /// reclaimed.
    pub max_idle: Duration,

    /// How often the idle scanner runs.
    pub idle_scan_interval: Duration,

    /// Maximum connections closed per idle scan.
    pub kill_max: usize,

    /// Idle scans only run while more connections than this are open.
    pub idle_threshold: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            handler_count: num_cpus::get(),
            reader_count: 1,
            reader_queue_size: 100,
            call_queue_size: None,
            tcp_nodelay: true,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            negotiation_timeout: Duration::from_secs(10),
            max_idle: Duration::from_secs(20),
            idle_scan_interval: Duration::from_secs(10),
            kill_max: 10,
            idle_threshold: 4000,
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    #[must_use]
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the number of handler threads.
    #[must_use]
    pub fn handler_count(mut self, count: usize) -> Self {
        self.handler_count = count;
        self
    }

    /// Set the number of reader threads.
    #[must_use]
    pub fn reader_count(mut self, count: usize) -> Self {
        self.reader_count = count;
        self
    }

    /// Set the per-reader connection queue size.
    #[must_use]
    pub fn reader_queue_size(mut self, size: usize) -> Self {
        self.reader_queue_size = size;
        self
    }

    /// Set the call queue capacity.
    #[must_use]
    pub fn call_queue_size(mut self, size: usize) -> Self {
        self.call_queue_size = Some(size);
        self
    }

    /// Enable or disable TCP nodelay.
    #[must_use]
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the preamble deadline.
    #[must_use]
    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Set the idle time before a connection may be reclaimed.
    #[must_use]
    pub fn max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Set the idle scan interval.
    #[must_use]
    pub fn idle_scan_interval(mut self, interval: Duration) -> Self {
        self.idle_scan_interval = interval;
        self
    }

    /// Set the maximum connections closed per idle scan.
    #[must_use]
    pub fn kill_max(mut self, kill_max: usize) -> Self {
        self.kill_max = kill_max;
        self
    }

    /// Set the open-connection count idle scans start at.
    #[must_use]
    pub fn idle_threshold(mut self, threshold: usize) -> Self {
        self.idle_threshold = threshold;
        self
    }

    fn effective_call_queue_size(&self) -> usize {
        self.call_queue_size
            .unwrap_or(self.handler_count.max(1) * 100)
            .max(1)
    }
}

/// Handles decoded calls on the server's handler threads.
///
/// Any closure `Fn(&CallContext, P) -> Result<R, DispatchError>` is a
/// handler.
pub trait CallHandler<P, R>: Send + Sync + 'static {
    /// Handle one call.
    fn call(&self, ctx: &CallContext, param: P) -> Result<R, DispatchError>;
}

impl<P, R, F> CallHandler<P, R> for F
where
    F: Fn(&CallContext, P) -> Result<R, DispatchError> + Send + Sync + 'static,
{
    fn call(&self, ctx: &CallContext, param: P) -> Result<R, DispatchError> {
        self(ctx, param)
    }
}

/// State every pipeline thread can reach.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Registry,
    pub(crate) readers: Vec<ReaderHandle>,
    pub(crate) responder: ResponderHandle,
    // Never carries a message; disconnects when the server stops.
    pub(crate) shutdown: Receiver<()>,
    running: AtomicBool,
}

impl Shared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Close a connection everywhere it lives.
    ///
    /// The first caller wins; the owning reader and the responder drop their
    /// descriptors when they see the notification.
    pub(crate) fn close_connection(&self, id: u64, reason: &'static str) {
        self.close_where(id, reason, |_| true);
    }

    /// Close a connection only if it is still idle: nothing outstanding and
    /// quiet for longer than `max_idle`. Returns whether it was closed.
    pub(crate) fn close_if_idle(&self, id: u64, max_idle: Duration) -> bool {
        self.close_where(id, "idle", |state| {
            state.outstanding() == 0 && state.idle_for() > max_idle
        })
    }

    fn close_where(
        &self,
        id: u64,
        reason: &'static str,
        still: impl Fn(&ConnectionState) -> bool,
    ) -> bool {
        let Some(state) = self.registry.get(id) else {
            return false;
        };
        // A call decoded since the connection was picked keeps it open.
        if !still(&*state) || !state.mark_closed() {
            return false;
        }
        self.registry.remove(id);
        if let Some(reader) = self.readers.get(state.reader) {
            reader.close(id);
        }
        self.responder.close(id);
        tracing::debug!(connection = id, peer = %state.peer, reason, "Closing connection");
        true
    }
}

#[cfg(test)]
impl Shared {
    /// Shared state with no threads behind it; the sender keeps it running.
    pub(crate) fn detached(config: ServerConfig) -> (Arc<Self>, Sender<()>) {
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);
        let readers = (0..config.reader_count.max(1))
            .map(|index| reader::ReaderParts::new(index, 1).map(|p| p.handle()))
            .collect::<std::io::Result<Vec<_>>>()
            .unwrap();
        let shared = Self {
            registry: Registry::new(readers.len()),
            readers,
            responder: ResponderParts::new().unwrap().handle(),
            shutdown: shutdown_rx,
            running: AtomicBool::new(true),
            config,
        };
        (Arc::new(shared), shutdown_tx)
    }
}

struct Stages<P: Codec, R: Codec> {
    listener: Listener,
    readers: Vec<Reader<P>>,
    handlers: Vec<Handler<P, R>>,
    responder: Responder,
    idle: IdleScanner,
}

/// RPC server.
///
/// ## Example
///
/// ```rust,no_run
/// use tern_codec::I64Codec;
/// use tern_core::{CallContext, DispatchError};
/// use tern_transport::{Server, ServerConfig};
///
/// let server = Server::bind(
///     ServerConfig::default().handler_count(4),
///     I64Codec,
///     I64Codec,
///     |_ctx: &CallContext, value: i64| Ok::<_, DispatchError>(value),
/// )
/// .unwrap();
/// server.start().unwrap();
/// println!("listening on {}", server.local_addr());
/// server.stop();
/// ```
pub struct Server<P: Codec, R: Codec> {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    calls: Receiver<Call<P::Item>>,
    listener_waker: Arc<Waker>,
    stages: Mutex<Option<Stages<P, R>>>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<P: Codec, R: Codec> Server<P, R> {
    /// Bind the listening socket and build every stage without starting
    /// any thread.
    pub fn bind<H>(
        config: ServerConfig,
        param_codec: P,
        result_codec: R,
        handler: H,
    ) -> Result<Self, IpcError>
    where
        H: CallHandler<P::Item, R::Item>,
    {
        let bind_addr = config.bind_addr;
        let startup = |e: std::io::Error| IpcError::startup(bind_addr, e);

        let socket = TcpListener::bind(bind_addr).map_err(startup)?;
        socket.set_nonblocking(true).map_err(startup)?;
        let local_addr = socket.local_addr().map_err(startup)?;

        let reader_count = config.reader_count.max(1);
        let handler_count = config.handler_count.max(1);
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let (call_tx, call_rx) = channel::bounded(config.effective_call_queue_size());

        let responder = ResponderParts::new().map_err(startup)?;
        let mut reader_parts = Vec::with_capacity(reader_count);
        for index in 0..reader_count {
            reader_parts.push(reader::ReaderParts::new(index, config.reader_queue_size).map_err(startup)?);
        }

        let shared = Arc::new(Shared {
            registry: Registry::new(reader_count),
            readers: reader_parts.iter().map(|p| p.handle()).collect(),
            responder: responder.handle(),
            shutdown: shutdown_rx,
            running: AtomicBool::new(true),
            config,
        });

        let listener = Listener::new(
            socket,
            reader_parts.iter().map(|p| p.queue_sender()).collect(),
            shared.clone(),
        )
        .map_err(startup)?;
        let listener_waker = listener.waker();

        let param_codec = Arc::new(param_codec);
        let result_codec = Arc::new(result_codec);
        let handler: Arc<dyn CallHandler<P::Item, R::Item>> = Arc::new(handler);

        let readers = reader_parts
            .into_iter()
            .map(|parts| Reader::new(parts, call_tx.clone(), param_codec.clone(), shared.clone()))
            .collect();
        let handlers = (0..handler_count)
            .map(|index| {
                Handler::new(
                    index,
                    call_rx.clone(),
                    handler.clone(),
                    result_codec.clone(),
                    shared.clone(),
                )
            })
            .collect();

        Ok(Self {
            stages: Mutex::new(Some(Stages {
                listener,
                readers,
                handlers,
                responder: Responder::new(responder, shared.clone()),
                idle: IdleScanner::new(shared.clone()),
            })),
            shared,
            local_addr,
            calls: call_rx,
            listener_waker,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            threads: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Start every pipeline thread. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), IpcError> {
        let Some(stages) = self.stages.lock().take() else {
            return Ok(());
        };

        if let Err(e) = self.spawn_all(stages) {
            self.stop();
            return Err(IpcError::startup(self.local_addr, e));
        }

        tracing::debug!(
            addr = %self.local_addr,
            readers = self.shared.readers.len(),
            handlers = self.shared.config.handler_count.max(1),
            "Server started"
        );
        Ok(())
    }

    fn spawn_all(&self, stages: Stages<P, R>) -> std::io::Result<()> {
        let mut threads = self.threads.lock();

        threads.push(spawn("tern-responder".into(), move || stages.responder.run())?);
        for handler in stages.handlers {
            threads.push(spawn(format!("tern-handler-{}", handler.index()), move || handler.run())?);
        }
        for reader in stages.readers {
            threads.push(spawn(format!("tern-reader-{}", reader.index()), move || reader.run())?);
        }
        let idle = stages.idle;
        threads.push(spawn("tern-idle".into(), move || idle.run())?);
        let listener = stages.listener;
        threads.push(spawn("tern-listener".into(), move || listener.run())?);
        Ok(())
    }

    /// Stop the server and wait for every thread to exit.
    ///
    /// Connections are closed without draining; calls already inside a
    /// handler run to completion first. Idempotent; also run on drop.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.running.store(false, Ordering::SeqCst);
        drop(self.shutdown_tx.lock().take());
        let _ = self.listener_waker.wake();
        for reader in &self.shared.readers {
            reader.wake();
        }
        self.shared.responder.wake();

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("Server thread panicked");
            }
        }

        // Stages never started still own sockets.
        drop(self.stages.lock().take());
        while self.calls.try_recv().is_ok() {}
        self.shared.responder.discard_backlog();
        for state in self.shared.registry.drain() {
            state.mark_closed();
        }
        tracing::debug!(addr = %self.local_addr, "Server stopped");
    }

    /// Address the server is listening on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections accepted and not yet closed.
    ///
    /// Includes connections still waiting in a reader queue or held by a
    /// listener blocked on a full one.
    #[must_use]
    pub fn num_open_connections(&self) -> usize {
        self.shared.registry.len()
    }

    /// Calls waiting in the call queue.
    #[must_use]
    pub fn call_queue_len(&self) -> usize {
        self.calls.len()
    }

    /// Get the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

impl<P: Codec, R: Codec> Drop for Server<P, R> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<P: Codec, R: Codec> std::fmt::Debug for Server<P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("open_connections", &self.num_open_connections())
            .field("call_queue_len", &self.call_queue_len())
            .finish_non_exhaustive()
    }
}

fn spawn<F>(name: String, f: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name).spawn(f)
}

/// Helper function to check CPU count.
mod num_cpus {
    pub fn get() -> usize {
        std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4)
    }
}
