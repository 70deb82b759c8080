//! Connection caching for RPC clients.

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use tern_core::IpcError;

/// A cached connection the pool can ask about liveness.
pub trait PoolEntry: Send + Sync + 'static {
    /// Check if the connection can still carry calls.
    fn is_open(&self) -> bool;
}

struct Slot<C> {
    conn: Option<Arc<C>>,
    // Set once the slot has left the map; holders must look it up again.
    detached: bool,
}

impl<C> Default for Slot<C> {
    fn default() -> Self {
        Self {
            conn: None,
            detached: false,
        }
    }
}

/// Connection cache keyed by connection identity.
///
/// Every key owns a slot with its own lock. Creating a connection happens
/// under that lock, so concurrent callers for the same key share one
/// connection instead of racing to open several, while callers for other
/// keys are not held up. A connection only becomes visible once it is fully
/// established; a failed attempt leaves nothing behind.
///
/// ## Example
///
/// ```rust
/// use std::sync::Arc;
/// use tern_transport::{ConnectionPool, PoolEntry};
///
/// struct Conn;
/// impl PoolEntry for Conn {
///     fn is_open(&self) -> bool {
///         true
///     }
/// }
///
/// let pool: ConnectionPool<&str, Conn> = ConnectionPool::new();
/// let first = pool.get_or_connect(&"a", || Ok(Arc::new(Conn))).unwrap();
/// let second = pool.get_or_connect(&"a", || unreachable!()).unwrap();
/// assert!(Arc::ptr_eq(&first, &second));
/// ```
pub struct ConnectionPool<K, C> {
    slots: DashMap<K, Arc<Mutex<Slot<C>>>>,
    open: AtomicUsize,
    closed: AtomicBool,
}

impl<K, C> ConnectionPool<K, C>
where
    K: Eq + Hash + Clone,
    C: PoolEntry,
{
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            open: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the cached connection for `key`, or create one with `connect`.
    ///
    /// `connect` runs with the key's slot locked and must not call back into
    /// the pool for the same key.
    pub fn get_or_connect<F>(&self, key: &K, connect: F) -> Result<Arc<C>, IpcError>
    where
        F: FnOnce() -> Result<Arc<C>, IpcError>,
    {
        let (slot, mut guard) = loop {
            if self.is_closed() {
                return Err(IpcError::Stopped);
            }

            let slot = self
                .slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
                .clone();
            let guard = slot.lock_arc();
            if guard.detached {
                continue;
            }
            // close_all flips the flag before it visits slots
            if self.is_closed() {
                return Err(IpcError::Stopped);
            }
            if let Some(conn) = guard.conn.as_ref().filter(|c| c.is_open()) {
                return Ok(conn.clone());
            }
            break (slot, guard);
        };

        if guard.conn.take().is_some() {
            self.open.fetch_sub(1, Ordering::AcqRel);
        }

        match connect() {
            Ok(conn) => {
                guard.conn = Some(conn.clone());
                self.open.fetch_add(1, Ordering::AcqRel);
                Ok(conn)
            }
            Err(e) => {
                guard.detached = true;
                self.slots.remove_if(key, |_, s| Arc::ptr_eq(s, &slot));
                Err(e)
            }
        }
    }

    /// Drop `conn` from the cache if it is still the one cached for `key`.
    pub fn evict(&self, key: &K, conn: &Arc<C>) -> bool {
        let Some(slot) = self.slots.get(key).map(|s| s.value().clone()) else {
            return false;
        };

        let mut guard = slot.lock();
        match guard.conn.as_ref() {
            Some(cached) if Arc::ptr_eq(cached, conn) => {}
            _ => return false,
        }

        guard.conn = None;
        guard.detached = true;
        self.open.fetch_sub(1, Ordering::AcqRel);
        self.slots.remove_if(key, |_, s| Arc::ptr_eq(s, &slot));
        true
    }

    /// Close the pool and hand back every cached connection.
    ///
    /// The caller is responsible for shutting the returned connections down.
    pub fn close_all(&self) -> Vec<Arc<C>> {
        self.closed.store(true, Ordering::SeqCst);

        let slots: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut conns = Vec::with_capacity(slots.len());
        for slot in slots {
            let mut guard = slot.lock();
            guard.detached = true;
            if let Some(conn) = guard.conn.take() {
                self.open.fetch_sub(1, Ordering::AcqRel);
                conns.push(conn);
            }
        }
        self.slots.clear();
        conns
    }

    /// Number of cached connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// Check if no connection is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<K, C> Default for ConnectionPool<K, C>
where
    K: Eq + Hash + Clone,
    C: PoolEntry,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use tern_core::TransportError;

    struct TestConn {
        id: usize,
        open: AtomicBool,
    }

    impl TestConn {
        fn new(id: usize) -> Arc<Self> {
            Arc::new(Self {
                id,
                open: AtomicBool::new(true),
            })
        }
    }

    impl PoolEntry for TestConn {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    fn refused() -> IpcError {
        let addr: SocketAddr = "127.0.0.1:10".parse().unwrap();
        IpcError::setup(addr, TransportError::ConnectionClosed)
    }

    #[test]
    fn test_pool_reuse() {
        let pool: ConnectionPool<u32, TestConn> = ConnectionPool::new();

        let first = pool.get_or_connect(&1, || Ok(TestConn::new(1))).unwrap();
        let second = pool.get_or_connect(&1, || Ok(TestConn::new(2))).unwrap();

        assert_eq!(first.id, second.id); // Should be same connection
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_keys_are_isolated() {
        let pool: ConnectionPool<u32, TestConn> = ConnectionPool::new();

        let a = pool.get_or_connect(&1, || Ok(TestConn::new(1))).unwrap();
        let b = pool.get_or_connect(&2, || Ok(TestConn::new(2))).unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_failed_connect_is_not_cached() {
        let pool: ConnectionPool<u32, TestConn> = ConnectionPool::new();

        let result = pool.get_or_connect(&1, || Err(refused()));
        assert!(matches!(result, Err(IpcError::ConnectionSetup { .. })));
        assert!(pool.is_empty());
        assert!(pool.slots.is_empty());

        let conn = pool.get_or_connect(&1, || Ok(TestConn::new(7))).unwrap();
        assert_eq!(conn.id, 7);
    }

    #[test]
    fn test_closed_connection_is_replaced() {
        let pool: ConnectionPool<u32, TestConn> = ConnectionPool::new();

        let first = pool.get_or_connect(&1, || Ok(TestConn::new(1))).unwrap();
        first.open.store(false, Ordering::SeqCst);

        let second = pool.get_or_connect(&1, || Ok(TestConn::new(2))).unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_evict_only_matching_connection() {
        let pool: ConnectionPool<u32, TestConn> = ConnectionPool::new();

        let stale = TestConn::new(0);
        let cached = pool.get_or_connect(&1, || Ok(TestConn::new(1))).unwrap();

        assert!(!pool.evict(&1, &stale));
        assert_eq!(pool.len(), 1);

        assert!(pool.evict(&1, &cached));
        assert!(pool.is_empty());
        assert!(!pool.evict(&1, &cached));
    }

    #[test]
    fn test_concurrent_callers_share_one_connect() {
        let pool: Arc<ConnectionPool<u32, TestConn>> = Arc::new(ConnectionPool::new());
        let connects = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let connects = connects.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    pool.get_or_connect(&1, || {
                        let n = connects.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        Ok(TestConn::new(n))
                    })
                    .unwrap()
                    .id
                })
            })
            .collect();

        let ids: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert!(ids.iter().all(|&id| id == 0));
    }

    #[test]
    fn test_close_all() {
        let pool: ConnectionPool<u32, TestConn> = ConnectionPool::new();

        pool.get_or_connect(&1, || Ok(TestConn::new(1))).unwrap();
        pool.get_or_connect(&2, || Ok(TestConn::new(2))).unwrap();

        let conns = pool.close_all();
        assert_eq!(conns.len(), 2);
        assert!(pool.is_empty());
        assert!(pool.is_closed());

        let result = pool.get_or_connect(&1, || Ok(TestConn::new(3)));
        assert!(matches!(result, Err(IpcError::Stopped)));
    }
}
