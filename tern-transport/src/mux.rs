//! Call/reply multiplexing over a single client connection.

use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use tern_core::IpcError;

/// Outcome delivered to a waiting caller.
pub type CallOutcome = Result<Bytes, IpcError>;

/// Multiplexer for correlating calls with replies.
///
/// Many callers share one connection. Each call is registered under an id
/// that is unique among the calls still waiting on that connection, and the
/// receiver thread routes replies back by id.
///
/// ## Example
///
/// ```rust
/// use bytes::Bytes;
/// use tern_transport::Multiplexer;
///
/// let mux = Multiplexer::new();
///
/// // Register a pending call
/// let (id, receiver) = mux.register();
///
/// // The receiver thread dispatches the reply
/// mux.dispatch(id, Bytes::from_static(b"done"));
///
/// assert_eq!(receiver.recv().unwrap().unwrap(), Bytes::from_static(b"done"));
/// ```
pub struct Multiplexer {
    pending: DashMap<i32, Sender<CallOutcome>>,
    next_id: AtomicI32,
}

impl Multiplexer {
    /// Create a new multiplexer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicI32::new(0),
        }
    }

    /// Register a new pending call.
    ///
    /// Returns the call id and a receiver for the outcome. Ids wrap around
    /// and skip negatives (reserved on the wire) and ids still pending.
    pub fn register(&self) -> (i32, Receiver<CallOutcome>) {
        let (tx, rx) = channel::bounded(1);
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id < 0 {
                // Only one thread resets the counter after the wrap.
                let _ = self
                    .next_id
                    .compare_exchange(id.wrapping_add(1), 0, Ordering::Relaxed, Ordering::Relaxed);
                continue;
            }
            if let Entry::Vacant(slot) = self.pending.entry(id) {
                slot.insert(tx);
                return (id, rx);
            }
        }
    }

    /// Dispatch a reply to a pending call.
    ///
    /// Returns `true` if the reply was delivered, `false` if no pending call
    /// with that id was found (e.g., its caller timed out).
    pub fn dispatch(&self, call_id: i32, reply: Bytes) -> bool {
        if let Some((_, sender)) = self.pending.remove(&call_id) {
            // Ignore send errors - receiver may have been dropped
            let _ = sender.send(Ok(reply));
            true
        } else {
            tracing::warn!(call_id, "No pending call found for reply");
            false
        }
    }

    /// Dispatch an error to a pending call.
    pub fn dispatch_error(&self, call_id: i32, error: IpcError) -> bool {
        if let Some((_, sender)) = self.pending.remove(&call_id) {
            let _ = sender.send(Err(error));
            true
        } else {
            tracing::warn!(call_id, "No pending call found for error reply");
            false
        }
    }

    /// Forget a pending call without delivering anything.
    ///
    /// Called when the caller stops waiting; a reply arriving later is
    /// dropped by [`dispatch`](Self::dispatch).
    pub fn cancel(&self, call_id: i32) -> bool {
        self.pending.remove(&call_id).is_some()
    }

    /// Fail every pending call with `error` (e.g., on connection close).
    pub fn cancel_all(&self, error: &IpcError) -> usize {
        // Collect keys first to avoid holding shard locks while sending
        let keys: Vec<i32> = self.pending.iter().map(|e| *e.key()).collect();

        let mut failed = 0;
        for id in keys {
            if let Some((_, sender)) = self.pending.remove(&id) {
                let _ = sender.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Get the number of pending calls.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if there are any pending calls.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use tern_core::TransportError;

    fn closed() -> IpcError {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        IpcError::transport(addr, TransportError::ConnectionClosed)
    }

    #[test]
    fn test_register_and_dispatch() {
        let mux = Multiplexer::new();

        let (id, rx) = mux.register();
        assert!(mux.has_pending());
        assert_eq!(mux.pending_count(), 1);

        assert!(mux.dispatch(id, Bytes::from_static(b"ok")));
        assert!(!mux.has_pending());

        let result = rx.try_recv().unwrap();
        assert_eq!(result.unwrap(), Bytes::from_static(b"ok"));
    }

    #[test]
    fn test_dispatch_unknown_id() {
        let mux = Multiplexer::new();

        // Dispatching to unknown ID should return false
        assert!(!mux.dispatch(999, Bytes::new()));
    }

    #[test]
    fn test_cancel_drops_late_reply() {
        let mux = Multiplexer::new();

        let (id, rx) = mux.register();
        assert!(mux.cancel(id));
        assert!(!mux.dispatch(id, Bytes::from_static(b"late")));

        // Sender gone, nothing delivered
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_all() {
        let mux = Multiplexer::new();

        let (_id1, rx1) = mux.register();
        let (_id2, rx2) = mux.register();
        let (_id3, rx3) = mux.register();

        assert_eq!(mux.pending_count(), 3);
        assert_eq!(mux.cancel_all(&closed()), 3);
        assert_eq!(mux.pending_count(), 0);

        for rx in [rx1, rx2, rx3] {
            let result = rx.try_recv().unwrap();
            assert!(matches!(result, Err(IpcError::Transport { .. })));
        }
    }

    #[test]
    fn test_unique_ids() {
        let mux = Multiplexer::new();

        let (id1, _rx1) = mux.register();
        let (id2, _rx2) = mux.register();
        let (id3, _rx3) = mux.register();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_ids_wrap_past_pending() {
        let mux = Multiplexer::new();
        let (zero, _rx0) = mux.register();
        assert_eq!(zero, 0);

        mux.next_id.store(i32::MAX, Ordering::Relaxed);
        let (max, _rx_max) = mux.register();
        assert_eq!(max, i32::MAX);

        // 0 is still pending, so the wrap lands on 1
        let (wrapped, _rx_wrapped) = mux.register();
        assert_eq!(wrapped, 1);
    }
}
