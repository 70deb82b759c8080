//! Handler threads: run the registered [`CallHandler`] on queued calls.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam::select;

use tern_codec::{Codec, FrameCodec};
use tern_core::{panic_message, DispatchError};

use super::call_queue::{CallReceiver, Reply};
use super::responder::encode_reply;
use super::{CallHandler, Shared};

/// One handler thread.
pub(crate) struct Handler<P: Codec, R: Codec> {
    index: usize,
    calls: CallReceiver<P::Item>,
    handler: Arc<dyn CallHandler<P::Item, R::Item>>,
    result_codec: Arc<R>,
    frames: FrameCodec,
    shared: Arc<Shared>,
}

impl<P: Codec, R: Codec> Handler<P, R> {
    pub(crate) fn new(
        index: usize,
        calls: CallReceiver<P::Item>,
        handler: Arc<dyn CallHandler<P::Item, R::Item>>,
        result_codec: Arc<R>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            index,
            calls,
            handler,
            result_codec,
            frames: FrameCodec::with_max_frame_size(shared.config.max_frame_size),
            shared,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn run(self) {
        loop {
            let call = select! {
                recv(self.calls) -> call => match call {
                    Ok(call) => call,
                    Err(_) => break,
                },
                recv(self.shared.shutdown) -> _ => break,
            };

            if call.conn.is_closed() {
                tracing::trace!(
                    handler = self.index,
                    call_id = call.ctx.call_id,
                    "Skipping call for closed connection"
                );
                continue;
            }

            let call_id = call.ctx.call_id;
            let waited = call.ctx.queued_for();
            tracing::trace!(handler = self.index, call_id, ?waited, "Handling call");

            let ctx = &call.ctx;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handler.call(ctx, call.param)))
                .unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(handler = self.index, call_id, %message, "Call handler panicked");
                    Err(DispatchError::with_class("Panic", message))
                });
            if let Err(err) = &outcome {
                tracing::debug!(call_id, class = %err.class, error = %err.message, "Call failed");
            }

            let frame = encode_reply(&self.frames, self.result_codec.as_ref(), call_id, outcome);
            self.shared.responder.reply(Reply {
                conn: call.conn.id,
                seq: call.seq,
                frame,
                close_after: false,
            });
        }
        tracing::debug!(handler = self.index, "Handler exiting");
    }
}
