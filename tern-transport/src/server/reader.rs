//! Reader threads: decode calls from the connections they own.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use tern_codec::{Codec, CodecExt, FrameCodec, ServerFrame};
use tern_core::{CallContext, ConnectionHeader, DispatchError, ReplyStatus};

use super::call_queue::{Call, CallSender, Reply};
use super::connection::ConnectionState;
use super::Shared;

const WAKER: Token = Token(usize::MAX);
const READ_CHUNK: usize = 8 * 1024;

/// A connection handed from the listener to a reader.
pub(crate) struct Accepted {
    pub(crate) state: Arc<ConnectionState>,
    pub(crate) stream: TcpStream,
}

pub(crate) enum ReaderCommand {
    Close(u64),
}

/// Cloneable way into one reader thread.
#[derive(Clone)]
pub(crate) struct ReaderHandle {
    commands: Sender<ReaderCommand>,
    waker: Arc<Waker>,
}

impl ReaderHandle {
    pub(crate) fn close(&self, id: u64) {
        if self.commands.send(ReaderCommand::Close(id)).is_ok() {
            self.wake();
        }
    }

    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "Failed to wake reader");
        }
    }
}

/// Poll, queue and channels created before the rest of the server exists.
pub(crate) struct ReaderParts {
    index: usize,
    poll: Poll,
    handle: ReaderHandle,
    commands: Receiver<ReaderCommand>,
    queue_tx: Sender<Accepted>,
    queue_rx: Receiver<Accepted>,
}

impl ReaderParts {
    pub(crate) fn new(index: usize, queue_size: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (commands_tx, commands_rx) = channel::unbounded();
        let (queue_tx, queue_rx) = channel::bounded(queue_size.max(1));
        Ok(Self {
            index,
            poll,
            handle: ReaderHandle {
                commands: commands_tx,
                waker,
            },
            commands: commands_rx,
            queue_tx,
            queue_rx,
        })
    }

    pub(crate) fn handle(&self) -> ReaderHandle {
        self.handle.clone()
    }

    pub(crate) fn queue_sender(&self) -> Sender<Accepted> {
        self.queue_tx.clone()
    }
}

struct Inbound {
    state: Arc<ConnectionState>,
    stream: TcpStream,
    buf: BytesMut,
    header: Option<ConnectionHeader>,
    next_seq: u64,
    eof: bool,
    queued: bool,
}

enum Serviced {
    /// A call was dispatched; more may be buffered.
    Again,
    /// Nothing more until the socket is readable again.
    Idle,
    /// The reader no longer owns the connection.
    Gone,
    /// The server is stopping.
    Shutdown,
}

/// One reader thread.
pub(crate) struct Reader<P: Codec> {
    index: usize,
    poll: Poll,
    incoming: Receiver<Accepted>,
    commands: Receiver<ReaderCommand>,
    calls: CallSender<P::Item>,
    param_codec: Arc<P>,
    frames: FrameCodec,
    conns: HashMap<u64, Inbound>,
    ready: VecDeque<u64>,
    shared: Arc<Shared>,
}

impl<P: Codec> Reader<P> {
    pub(crate) fn new(
        parts: ReaderParts,
        calls: CallSender<P::Item>,
        param_codec: Arc<P>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            index: parts.index,
            poll: parts.poll,
            incoming: parts.queue_rx,
            commands: parts.commands,
            calls,
            param_codec,
            frames: FrameCodec::with_max_frame_size(shared.config.max_frame_size),
            conns: HashMap::new(),
            ready: VecDeque::new(),
            shared,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(256);
        'outer: loop {
            // Keep turning while some connection still has buffered work.
            let timeout = (!self.ready.is_empty()).then_some(Duration::ZERO);
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(reader = self.index, error = %e, "Reader poll failed");
                break;
            }
            if !self.shared.is_running() {
                break;
            }

            for event in events.iter() {
                if event.token() != WAKER {
                    self.mark_ready(event.token().0 as u64);
                }
            }
            while let Ok(accepted) = self.incoming.try_recv() {
                self.adopt(accepted);
            }
            while let Ok(ReaderCommand::Close(id)) = self.commands.try_recv() {
                self.release(id);
            }

            // One frame per ready connection per round.
            for _ in 0..self.ready.len() {
                let Some(id) = self.ready.pop_front() else {
                    break;
                };
                match self.service(id) {
                    Serviced::Again => self.ready.push_back(id),
                    Serviced::Idle => {
                        if let Some(conn) = self.conns.get_mut(&id) {
                            conn.queued = false;
                        }
                    }
                    Serviced::Gone => {}
                    Serviced::Shutdown => break 'outer,
                }
            }
        }

        let ids: Vec<u64> = self.conns.keys().copied().collect();
        for id in ids {
            self.release(id);
        }
        while self.incoming.try_recv().is_ok() {}
    }

    fn mark_ready(&mut self, id: u64) {
        if let Some(conn) = self.conns.get_mut(&id) {
            if !conn.queued {
                conn.queued = true;
                self.ready.push_back(id);
            }
        }
    }

    fn adopt(&mut self, accepted: Accepted) {
        let Accepted { state, stream } = accepted;
        let id = state.id;
        if state.is_closed() {
            self.shared.registry.reader_released(self.index);
            return;
        }

        let fd = stream.as_raw_fd();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), Token(id as usize), Interest::READABLE)
        {
            tracing::warn!(reader = self.index, connection = id, error = %e, "Failed to register connection");
            self.shared.registry.reader_released(self.index);
            self.shared.close_connection(id, "reader registration failed");
            return;
        }

        tracing::trace!(reader = self.index, connection = id, peer = %state.peer, "Adopted connection");
        self.conns.insert(
            id,
            Inbound {
                state,
                stream,
                buf: BytesMut::with_capacity(READ_CHUNK),
                header: None,
                next_seq: 0,
                eof: false,
                queued: false,
            },
        );
        // Bytes may have arrived before registration.
        self.mark_ready(id);
    }

    /// Drop the reader's descriptor for `id`.
    fn release(&mut self, id: u64) {
        if let Some(conn) = self.conns.remove(&id) {
            let fd = conn.stream.as_raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            self.shared.registry.reader_released(self.index);
        }
    }

    fn close(&mut self, id: u64, reason: &'static str) -> Serviced {
        self.release(id);
        self.shared.close_connection(id, reason);
        Serviced::Gone
    }

    fn service(&mut self, id: u64) -> Serviced {
        loop {
            let Some(conn) = self.conns.get_mut(&id) else {
                return Serviced::Gone;
            };
            if conn.state.is_closed() {
                self.release(id);
                return Serviced::Gone;
            }

            if conn.header.is_none() {
                match self.frames.decode_header(&mut conn.buf) {
                    Ok(Some(header)) => {
                        tracing::debug!(
                            connection = id,
                            peer = %conn.state.peer,
                            protocol = ?header.protocol,
                            "Connection negotiated"
                        );
                        conn.header = Some(header);
                        conn.state.touch();
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(connection = id, error = %e, "Bad connection header");
                        return self.close(id, "bad connection header");
                    }
                }
            } else {
                match self.frames.decode_call(&mut conn.buf) {
                    Ok(Some(ServerFrame::Ping)) => {
                        conn.state.touch();
                        continue;
                    }
                    Ok(Some(ServerFrame::Call { id: call_id, param })) => {
                        conn.state.touch();
                        return self.dispatch(id, call_id, &param);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(connection = id, error = %e, "Bad call frame");
                        return self.close(id, "bad call frame");
                    }
                }
            }

            if conn.eof {
                return self.close(id, "end of stream");
            }

            let start = conn.buf.len();
            conn.buf.resize(start + READ_CHUNK, 0);
            let read = conn.stream.read(&mut conn.buf[start..]);
            match read {
                Ok(n) => {
                    conn.buf.truncate(start + n);
                    if n == 0 {
                        conn.eof = true;
                    }
                }
                Err(e) => {
                    conn.buf.truncate(start);
                    match e.kind() {
                        io::ErrorKind::WouldBlock => return Serviced::Idle,
                        io::ErrorKind::Interrupted => {}
                        _ => {
                            tracing::debug!(connection = id, error = %e, "Read failed");
                            return self.close(id, "read failed");
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, id: u64, call_id: i32, param: &[u8]) -> Serviced {
        let Some(conn) = self.conns.get_mut(&id) else {
            return Serviced::Gone;
        };
        let seq = conn.next_seq;
        conn.next_seq += 1;
        conn.state.call_started();

        let param = match self.param_codec.decode_guarded(param) {
            Ok(param) => param,
            Err(e) => {
                tracing::warn!(connection = id, call_id, error = %e, "Unable to read call parameters");
                let class = DispatchError::from_error(&e).class;
                let mut frame = BytesMut::new();
                self.frames.encode_failure(
                    call_id,
                    ReplyStatus::Fatal,
                    &class,
                    &format!("IPC server unable to read call parameters: {e}"),
                    &mut frame,
                );
                // Stop reading; the responder closes once the reply is out.
                self.release(id);
                self.shared.responder.reply(Reply {
                    conn: id,
                    seq,
                    frame: frame.freeze(),
                    close_after: true,
                });
                return Serviced::Gone;
            }
        };

        let header = conn.header.clone().unwrap_or_default();
        let call = Call {
            conn: conn.state.clone(),
            seq,
            ctx: CallContext::new(call_id, header.protocol, header.identity, conn.state.peer),
            param,
        };

        // Blocks while the call queue is full.
        select! {
            send(self.calls, call) -> sent => {
                if sent.is_err() {
                    return Serviced::Shutdown;
                }
            }
            recv(self.shared.shutdown) -> _ => return Serviced::Shutdown,
        }
        Serviced::Again
    }
}
