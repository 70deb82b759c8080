//! The listener thread: accepts sockets and validates the preamble.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use crossbeam::channel::Sender;
use crossbeam::select;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use tern_core::wire::{self, PREAMBLE_LEN};
use tern_core::{Preamble, SerializationKind};

use super::reader::Accepted;
use super::Shared;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_PENDING: usize = 2;

enum Phase {
    /// Waiting for the six preamble bytes.
    Preamble { buf: [u8; PREAMBLE_LEN], filled: usize },
    /// Writing the version-mismatch reply.
    Rejecting { reply: BytesMut, written: usize },
    /// Write side shut; discarding input until the client hangs up.
    Draining,
}

struct Pending {
    stream: TcpStream,
    peer: SocketAddr,
    phase: Phase,
    deadline: Instant,
}

enum Step {
    Wait,
    Accept,
    Drop(&'static str),
}

/// The listener thread.
pub(crate) struct Listener {
    socket: TcpListener,
    poll: Poll,
    waker: Arc<Waker>,
    readers: Vec<Sender<Accepted>>,
    pending: HashMap<Token, Pending>,
    next_token: usize,
    shared: Arc<Shared>,
}

impl Listener {
    pub(crate) fn new(
        socket: TcpListener,
        readers: Vec<Sender<Accepted>>,
        shared: Arc<Shared>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        poll.registry().register(
            &mut SourceFd(&socket.as_raw_fd()),
            LISTENER,
            Interest::READABLE,
        )?;
        Ok(Self {
            socket,
            poll,
            waker,
            readers,
            pending: HashMap::new(),
            next_token: FIRST_PENDING,
            shared,
        })
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(128);
        loop {
            let timeout = self
                .pending
                .values()
                .map(|p| p.deadline)
                .min()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %e, "Listener poll failed");
                break;
            }
            if !self.shared.is_running() {
                break;
            }

            let mut shutdown = false;
            for event in events.iter() {
                match event.token() {
                    LISTENER => shutdown |= !self.accept_ready(),
                    WAKER => {}
                    token => shutdown |= !self.advance(token),
                }
                if shutdown {
                    break;
                }
            }
            if shutdown {
                break;
            }
            self.expire();
        }
        tracing::debug!("Listener exiting");
    }

    /// Accept every queued socket. Returns `false` once the server stops.
    fn accept_ready(&mut self) -> bool {
        loop {
            match self.socket.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.track(stream, peer) {
                        tracing::warn!(peer = %peer, error = %e, "Failed to set up accepted socket");
                        continue;
                    }
                    let token = Token(self.next_token - 1);
                    if !self.advance(token) {
                        return false;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    return true;
                }
            }
        }
    }

    fn track(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(self.shared.config.tcp_nodelay)?;

        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(
            &mut SourceFd(&stream.as_raw_fd()),
            token,
            Interest::READABLE,
        )?;

        tracing::trace!(peer = %peer, "Accepted socket");
        self.pending.insert(
            token,
            Pending {
                stream,
                peer,
                phase: Phase::Preamble {
                    buf: [0; PREAMBLE_LEN],
                    filled: 0,
                },
                deadline: Instant::now() + self.shared.config.negotiation_timeout,
            },
        );
        Ok(())
    }

    /// Drive one pending socket. Returns `false` once the server stops.
    fn advance(&mut self, token: Token) -> bool {
        let Some(pending) = self.pending.get_mut(&token) else {
            return true;
        };

        match step(pending) {
            Step::Wait => {
                if matches!(pending.phase, Phase::Rejecting { .. }) {
                    // Wait for room to write the rest of the mismatch reply.
                    let _ = self.poll.registry().reregister(
                        &mut SourceFd(&pending.stream.as_raw_fd()),
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    );
                }
                true
            }
            Step::Drop(reason) => {
                if let Some(pending) = self.forget(token) {
                    tracing::debug!(peer = %pending.peer, reason, "Dropping socket");
                }
                true
            }
            Step::Accept => match self.forget(token) {
                Some(pending) => self.hand_off(pending),
                None => true,
            },
        }
    }

    fn forget(&mut self, token: Token) -> Option<Pending> {
        let pending = self.pending.remove(&token)?;
        let _ = self
            .poll
            .registry()
            .deregister(&mut SourceFd(&pending.stream.as_raw_fd()));
        Some(pending)
    }

    /// Register a negotiated socket and queue it on its reader.
    ///
    /// Blocks while that reader's queue is full. Returns `false` once the
    /// server stops.
    fn hand_off(&mut self, pending: Pending) -> bool {
        let Pending { stream, peer, .. } = pending;
        let write_half = match stream.try_clone() {
            Ok(write_half) => write_half,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Failed to clone accepted socket");
                return true;
            }
        };

        let state = self.shared.registry.insert(peer);
        let reader = state.reader;
        tracing::debug!(connection = state.id, peer = %peer, reader, "Accepted connection");
        self.shared.responder.register(state.clone(), write_half);

        let accepted = Accepted { state, stream };
        select! {
            send(self.readers[reader], accepted) -> sent => {
                if sent.is_err() {
                    return false;
                }
            }
            recv(self.shared.shutdown) -> _ => return false,
        }
        self.shared.readers[reader].wake();
        true
    }

    fn expire(&mut self) {
        let now = Instant::now();
        let expired: Vec<Token> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(pending) = self.forget(token) {
                tracing::debug!(peer = %pending.peer, "Negotiation timed out");
            }
        }
    }
}

/// Advance a pending socket as far as its buffered bytes allow.
fn step(pending: &mut Pending) -> Step {
    loop {
        match &mut pending.phase {
            Phase::Preamble { buf, filled } => {
                while *filled < PREAMBLE_LEN {
                    match pending.stream.read(&mut buf[*filled..]) {
                        Ok(0) => return Step::Drop("closed during preamble"),
                        Ok(n) => *filled += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Wait,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => return Step::Drop("read failed during preamble"),
                    }
                }

                let preamble = match Preamble::parse(buf) {
                    Ok(preamble) => preamble,
                    Err(_) => return Step::Drop("bad magic"),
                };
                if !preamble.is_supported_version() {
                    tracing::debug!(
                        peer = %pending.peer,
                        version = preamble.version,
                        "Rejecting client version"
                    );
                    let mut reply = BytesMut::new();
                    wire::put_version_mismatch(&mut reply, preamble.version);
                    pending.phase = Phase::Rejecting { reply, written: 0 };
                    continue;
                }
                if SerializationKind::from_byte(preamble.kind).is_none() {
                    return Step::Drop("unsupported serialization kind");
                }
                return Step::Accept;
            }
            Phase::Rejecting { reply, written } => {
                while *written < reply.len() {
                    match pending.stream.write(&reply[*written..]) {
                        Ok(0) => return Step::Drop("write returned zero"),
                        Ok(n) => *written += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Wait,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => return Step::Drop("write failed during rejection"),
                    }
                }
                // Half-close so the client reads the reply instead of a reset.
                let _ = pending.stream.shutdown(Shutdown::Write);
                pending.phase = Phase::Draining;
            }
            Phase::Draining => {
                let mut scratch = [0u8; 512];
                loop {
                    match pending.stream.read(&mut scratch) {
                        Ok(0) => return Step::Drop("rejected client hung up"),
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Wait,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => return Step::Drop("read failed while draining"),
                    }
                }
            }
        }
    }
}
