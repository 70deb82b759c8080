//! Items carried between the readers and the handlers.

use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender};

use tern_core::CallContext;

use super::connection::ConnectionState;

/// A decoded call waiting for a handler.
pub(crate) struct Call<P> {
    pub(crate) conn: Arc<ConnectionState>,
    /// Position of the call on its connection; replies are written in this order.
    pub(crate) seq: u64,
    pub(crate) ctx: CallContext,
    pub(crate) param: P,
}

/// An encoded reply waiting for the responder.
#[derive(Debug)]
pub(crate) struct Reply {
    pub(crate) conn: u64,
    pub(crate) seq: u64,
    pub(crate) frame: Bytes,
    /// Close the connection once this reply is written.
    pub(crate) close_after: bool,
}

pub(crate) type CallSender<P> = Sender<Call<P>>;
pub(crate) type CallReceiver<P> = Receiver<Call<P>>;
