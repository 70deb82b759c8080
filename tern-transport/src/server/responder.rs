//! Writes replies back to clients, in call order per connection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use tern_codec::{Codec, CodecExt, FrameCodec};
use tern_core::{DispatchError, ReplyStatus};

use super::call_queue::Reply;
use super::connection::ConnectionState;
use super::Shared;

const WAKER: Token = Token(usize::MAX);

pub(crate) enum ResponderEvent {
    Register {
        state: Arc<ConnectionState>,
        stream: TcpStream,
    },
    Reply(Reply),
    Close(u64),
}

/// Cloneable way into the responder thread.
#[derive(Clone)]
pub(crate) struct ResponderHandle {
    events: Sender<ResponderEvent>,
    backlog: Receiver<ResponderEvent>,
    waker: Arc<Waker>,
}

impl ResponderHandle {
    fn send(&self, event: ResponderEvent) {
        // Only fails once the responder is gone, and then nothing is written anyway
        if self.events.send(event).is_ok() {
            self.wake();
        }
    }

    pub(crate) fn register(&self, state: Arc<ConnectionState>, stream: TcpStream) {
        self.send(ResponderEvent::Register { state, stream });
    }

    pub(crate) fn reply(&self, reply: Reply) {
        self.send(ResponderEvent::Reply(reply));
    }

    pub(crate) fn close(&self, id: u64) {
        self.send(ResponderEvent::Close(id));
    }

    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "Failed to wake responder");
        }
    }

    /// Drop events the responder never got to, releasing their sockets.
    pub(crate) fn discard_backlog(&self) {
        while self.backlog.try_recv().is_ok() {}
    }
}

/// Poll and channel created before the rest of the server exists.
pub(crate) struct ResponderParts {
    poll: Poll,
    handle: ResponderHandle,
    events: Receiver<ResponderEvent>,
}

impl ResponderParts {
    pub(crate) fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = channel::unbounded();
        Ok(Self {
            poll,
            handle: ResponderHandle {
                events: tx,
                backlog: rx.clone(),
                waker,
            },
            events: rx,
        })
    }

    pub(crate) fn handle(&self) -> ResponderHandle {
        self.handle.clone()
    }
}

/// Encode a handler outcome as a reply frame.
///
/// A result the codec cannot encode turns into an error reply; the
/// connection is unaffected.
pub(crate) fn encode_reply<R: Codec>(
    frames: &FrameCodec,
    result_codec: &R,
    call_id: i32,
    outcome: Result<R::Item, DispatchError>,
) -> Bytes {
    let mut frame = bytes::BytesMut::new();
    match outcome {
        Ok(value) => {
            let mut body = bytes::BytesMut::new();
            let encoded = result_codec
                .encode_guarded(&value, &mut body)
                .map_err(|e| DispatchError::from_error(&e))
                .and_then(|()| {
                    frames
                        .encode_success(call_id, &body, &mut frame)
                        .map_err(|e| DispatchError::from_error(&e))
                });
            if let Err(err) = encoded {
                tracing::warn!(call_id, error = %err.message, "Failed to serialize call response");
                frame.clear();
                frames.encode_failure(
                    call_id,
                    ReplyStatus::Error,
                    &err.class,
                    &format!("Error serializing call response: {}", err.message),
                    &mut frame,
                );
            }
        }
        Err(err) => {
            frames.encode_failure(call_id, ReplyStatus::Error, &err.class, &err.message, &mut frame);
        }
    }
    frame.freeze()
}

/// Restores call order for replies that finish out of order.
#[derive(Debug, Default)]
struct ReorderBuffer {
    next_seq: u64,
    parked: BTreeMap<u64, (Bytes, bool)>,
}

impl ReorderBuffer {
    /// Accept the reply for `seq` and move everything now in order to `ready`.
    fn push(&mut self, seq: u64, frame: Bytes, close_after: bool, ready: &mut VecDeque<(Bytes, bool)>) {
        self.parked.insert(seq, (frame, close_after));
        while let Some(entry) = self.parked.remove(&self.next_seq) {
            ready.push_back(entry);
            self.next_seq += 1;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flushed {
    Drained,
    Blocked,
    Close,
}

/// Replies of one connection waiting to be written.
#[derive(Debug, Default)]
struct PendingWrites {
    order: ReorderBuffer,
    ready: VecDeque<(Bytes, bool)>,
    // Bytes of the front frame already written.
    written: usize,
}

impl PendingWrites {
    fn push(&mut self, reply: Reply) {
        self.order
            .push(reply.seq, reply.frame, reply.close_after, &mut self.ready);
    }

    /// Write as much as the socket takes; `on_written` runs per whole frame.
    fn flush<W: Write>(&mut self, out: &mut W, mut on_written: impl FnMut()) -> io::Result<Flushed> {
        while let Some((frame, close_after)) = self.ready.front() {
            match out.write(&frame[self.written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.written += n;
                    if self.written == frame.len() {
                        let close_after = *close_after;
                        self.ready.pop_front();
                        self.written = 0;
                        on_written();
                        if close_after {
                            return Ok(Flushed::Close);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flushed::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(Flushed::Drained)
    }
}

struct Outbound {
    state: Arc<ConnectionState>,
    stream: TcpStream,
    writes: PendingWrites,
}

/// The responder thread.
pub(crate) struct Responder {
    poll: Poll,
    events: Receiver<ResponderEvent>,
    conns: HashMap<u64, Outbound>,
    shared: Arc<Shared>,
}

impl Responder {
    pub(crate) fn new(parts: ResponderParts, shared: Arc<Shared>) -> Self {
        Self {
            poll: parts.poll,
            events: parts.events,
            conns: HashMap::new(),
            shared,
        }
    }

    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(256);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %e, "Responder poll failed");
                break;
            }
            if !self.shared.is_running() {
                break;
            }

            for event in events.iter() {
                if event.token() != WAKER {
                    self.flush(event.token().0 as u64);
                }
            }
            while let Ok(event) = self.events.try_recv() {
                self.handle(event);
            }
        }

        self.conns.clear();
        while self.events.try_recv().is_ok() {}
    }

    fn handle(&mut self, event: ResponderEvent) {
        match event {
            ResponderEvent::Register { state, stream } => {
                let id = state.id;
                if state.is_closed() {
                    return;
                }
                let fd = stream.as_raw_fd();
                if let Err(e) =
                    self.poll
                        .registry()
                        .register(&mut SourceFd(&fd), Token(id as usize), Interest::WRITABLE)
                {
                    tracing::warn!(connection = id, error = %e, "Failed to register connection for writing");
                    self.shared.close_connection(id, "responder registration failed");
                    return;
                }
                self.conns.insert(
                    id,
                    Outbound {
                        state,
                        stream,
                        writes: PendingWrites::default(),
                    },
                );
            }
            ResponderEvent::Reply(reply) => {
                let id = reply.conn;
                match self.conns.get_mut(&id) {
                    Some(out) => {
                        out.writes.push(reply);
                        self.flush(id);
                    }
                    None => tracing::trace!(connection = id, "Dropping reply for closed connection"),
                }
            }
            ResponderEvent::Close(id) => self.remove(id),
        }
    }

    fn flush(&mut self, id: u64) {
        let Some(out) = self.conns.get_mut(&id) else {
            return;
        };
        let state = out.state.clone();
        let result = out.writes.flush(&mut &out.stream, || {
            state.reply_written();
            state.touch();
        });

        match result {
            Ok(Flushed::Drained | Flushed::Blocked) => {}
            Ok(Flushed::Close) => {
                self.shared.close_connection(id, "fatal reply written");
                self.remove(id);
            }
            Err(e) => {
                tracing::warn!(connection = id, peer = %state.peer, error = %e, "Failed to write reply");
                self.shared.close_connection(id, "write failed");
                self.remove(id);
            }
        }
    }

    fn remove(&mut self, id: u64) {
        if let Some(out) = self.conns.remove(&id) {
            let fd = out.stream.as_raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_codec::I64Codec;
    use tern_core::CodecError;

    fn reply(seq: u64, frame: &'static [u8], close_after: bool) -> Reply {
        Reply {
            conn: 1,
            seq,
            frame: Bytes::from_static(frame),
            close_after,
        }
    }

    /// Accepts at most `chunk` bytes per write.
    struct Trickle {
        out: Vec<u8>,
        chunk: usize,
        budget: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.chunk).min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_replies_written_in_call_order() {
        let mut writes = PendingWrites::default();
        writes.push(reply(2, b"cc", false));
        writes.push(reply(1, b"bb", false));
        assert!(writes.ready.is_empty());

        writes.push(reply(0, b"aa", false));
        assert_eq!(writes.ready.len(), 3);

        let mut out = Trickle {
            out: Vec::new(),
            chunk: 64,
            budget: usize::MAX,
        };
        let mut written = 0;
        assert_eq!(writes.flush(&mut out, || written += 1).unwrap(), Flushed::Drained);
        assert_eq!(out.out, b"aabbcc");
        assert_eq!(written, 3);
    }

    #[test]
    fn test_partial_writes_resume() {
        let mut writes = PendingWrites::default();
        writes.push(reply(0, b"hello", false));
        writes.push(reply(1, b"world", false));

        let mut out = Trickle {
            out: Vec::new(),
            chunk: 3,
            budget: 7,
        };
        let mut written = 0;
        assert_eq!(writes.flush(&mut out, || written += 1).unwrap(), Flushed::Blocked);
        assert_eq!(written, 1);
        assert_eq!(writes.written, 2);

        out.budget = usize::MAX;
        assert_eq!(writes.flush(&mut out, || written += 1).unwrap(), Flushed::Drained);
        assert_eq!(out.out, b"helloworld");
        assert_eq!(written, 2);
    }

    #[test]
    fn test_close_after_stops_flush() {
        let mut writes = PendingWrites::default();
        writes.push(reply(0, b"ok", false));
        writes.push(reply(1, b"fatal", true));
        writes.push(reply(2, b"never", false));

        let mut out = Trickle {
            out: Vec::new(),
            chunk: 64,
            budget: usize::MAX,
        };
        assert_eq!(writes.flush(&mut out, || {}).unwrap(), Flushed::Close);
        assert_eq!(out.out, b"okfatal");
    }

    #[test]
    fn test_encode_reply_success() {
        let frames = FrameCodec::new();
        let frame = encode_reply(&frames, &I64Codec, 3, Ok(7));

        let reply = frames.read_reply(&mut &frame[..]).unwrap();
        assert_eq!(reply.call_id, 3);
        assert_eq!(
            reply.outcome,
            tern_codec::ReplyOutcome::Success(Bytes::copy_from_slice(&7i64.to_be_bytes()))
        );
    }

    #[test]
    fn test_encode_reply_dispatch_error() {
        let frames = FrameCodec::new();
        let frame = encode_reply::<I64Codec>(
            &frames,
            &I64Codec,
            4,
            Err(DispatchError::with_class("NotFound", "no such key")),
        );

        let reply = frames.read_reply(&mut &frame[..]).unwrap();
        assert_eq!(
            reply.outcome,
            tern_codec::ReplyOutcome::Error {
                class: "NotFound".into(),
                message: "no such key".into()
            }
        );
    }

    struct BrokenResults;

    impl Codec for BrokenResults {
        type Item = i64;

        fn encode(&self, _item: &i64, _dst: &mut bytes::BytesMut) -> Result<(), CodecError> {
            Err(CodecError::Encode("Injected fault".into()))
        }

        fn decode(&self, _src: &[u8]) -> Result<i64, CodecError> {
            Err(CodecError::Decode("unused".into()))
        }
    }

    #[test]
    fn test_encode_reply_result_fault() {
        let frames = FrameCodec::new();
        let frame = encode_reply(&frames, &BrokenResults, 5, Ok(1));

        let reply = frames.read_reply(&mut &frame[..]).unwrap();
        match reply.outcome {
            tern_codec::ReplyOutcome::Error { message, .. } => {
                assert!(message.starts_with("Error serializing call response: "));
                assert!(message.contains("Injected fault"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    struct PanickingResults;

    impl Codec for PanickingResults {
        type Item = i64;

        fn encode(&self, _item: &i64, dst: &mut bytes::BytesMut) -> Result<(), CodecError> {
            dst.extend_from_slice(b"partial");
            panic!("Injected fault");
        }

        fn decode(&self, _src: &[u8]) -> Result<i64, CodecError> {
            Err(CodecError::Decode("unused".into()))
        }
    }

    #[test]
    fn test_encode_reply_result_panic() {
        let frames = FrameCodec::new();
        let frame = encode_reply(&frames, &PanickingResults, 6, Ok(1));

        // One well-formed error reply and nothing of the partial encoding.
        let mut rest = &frame[..];
        let reply = frames.read_reply(&mut rest).unwrap();
        assert!(rest.is_empty());
        assert_eq!(reply.call_id, 6);
        match reply.outcome {
            tern_codec::ReplyOutcome::Error { message, .. } => {
                assert!(message.starts_with("Error serializing call response: "));
                assert!(message.contains("Injected fault"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
