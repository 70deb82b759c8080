//! Server-side connection bookkeeping shared by every pipeline stage.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Shared state of one accepted connection.
///
/// The socket itself is owned by the reader and the responder (each holds
/// its own descriptor); this is what the other stages need to agree on.
#[derive(Debug)]
pub(crate) struct ConnectionState {
    pub(crate) id: u64,
    pub(crate) peer: SocketAddr,
    pub(crate) reader: usize,
    closed: AtomicBool,
    // Calls decoded but whose replies are not yet fully written.
    outstanding: AtomicUsize,
    epoch: Instant,
    last_activity_ms: AtomicU64,
}

impl ConnectionState {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flip the closed flag; returns `true` for the caller that flipped it.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    pub(crate) fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms());
        self.epoch.elapsed().saturating_sub(last)
    }

    pub(crate) fn call_started(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn reply_written(&self) {
        // Saturating: a close may race with the last write
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// Every open connection of a server, plus per-reader load counters.
#[derive(Debug)]
pub(crate) struct Registry {
    conns: DashMap<u64, Arc<ConnectionState>>,
    next_id: AtomicU64,
    epoch: Instant,
    reader_loads: Vec<AtomicUsize>,
}

impl Registry {
    pub(crate) fn new(readers: usize) -> Self {
        Self {
            conns: DashMap::new(),
            next_id: AtomicU64::new(1),
            epoch: Instant::now(),
            reader_loads: (0..readers).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Register a freshly accepted connection on the least-loaded reader.
    pub(crate) fn insert(&self, peer: SocketAddr) -> Arc<ConnectionState> {
        let reader = self.least_loaded_reader();
        self.reader_loads[reader].fetch_add(1, Ordering::AcqRel);

        let state = Arc::new(ConnectionState {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            peer,
            reader,
            closed: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            epoch: self.epoch,
            last_activity_ms: AtomicU64::new(0),
        });
        state.touch();
        self.conns.insert(state.id, state.clone());
        state
    }

    pub(crate) fn get(&self, id: u64) -> Option<Arc<ConnectionState>> {
        self.conns.get(&id).map(|s| s.value().clone())
    }

    pub(crate) fn remove(&self, id: u64) -> Option<Arc<ConnectionState>> {
        self.conns.remove(&id).map(|(_, state)| state)
    }

    /// Called by a reader once it no longer owns a connection.
    pub(crate) fn reader_released(&self, reader: usize) {
        let _ = self.reader_loads[reader].fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| n.checked_sub(1),
        );
    }

    pub(crate) fn reader_load(&self, reader: usize) -> usize {
        self.reader_loads[reader].load(Ordering::Acquire)
    }

    fn least_loaded_reader(&self) -> usize {
        // min_by_key keeps the first minimum, so ties go to the lowest index
        (0..self.reader_loads.len())
            .min_by_key(|&i| self.reader_load(i))
            .unwrap_or(0)
    }

    pub(crate) fn len(&self) -> usize {
        self.conns.len()
    }

    /// Connections with nothing outstanding and idle longer than `max_idle`,
    /// oldest activity first, at most `limit` of them.
    pub(crate) fn idle_candidates(&self, max_idle: Duration, limit: usize) -> Vec<Arc<ConnectionState>> {
        let mut idle: Vec<_> = self
            .conns
            .iter()
            .filter(|e| {
                let state = e.value();
                !state.is_closed() && state.outstanding() == 0 && state.idle_for() > max_idle
            })
            .map(|e| e.value().clone())
            .collect();
        idle.sort_by_key(|state| state.last_activity_ms());
        idle.truncate(limit);
        idle
    }

    pub(crate) fn drain(&self) -> Vec<Arc<ConnectionState>> {
        let ids: Vec<u64> = self.conns.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[test]
    fn test_insert_picks_least_loaded_reader() {
        let registry = Registry::new(3);

        let a = registry.insert(peer());
        let b = registry.insert(peer());
        let c = registry.insert(peer());
        assert_eq!((a.reader, b.reader, c.reader), (0, 1, 2));

        registry.reader_released(1);
        let d = registry.insert(peer());
        assert_eq!(d.reader, 1);

        // All tied again, lowest index wins
        let e = registry.insert(peer());
        assert_eq!(e.reader, 0);
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = Registry::new(1);
        let a = registry.insert(peer());
        let b = registry.insert(peer());
        assert_ne!(a.id, b.id);
        assert!(registry.get(a.id).is_some());
        assert!(registry.remove(a.id).is_some());
        assert!(registry.get(a.id).is_none());
    }

    #[test]
    fn test_mark_closed_once() {
        let registry = Registry::new(1);
        let state = registry.insert(peer());
        assert!(state.mark_closed());
        assert!(!state.mark_closed());
        assert!(state.is_closed());
    }

    #[test]
    fn test_outstanding_never_underflows() {
        let registry = Registry::new(1);
        let state = registry.insert(peer());
        state.call_started();
        state.reply_written();
        state.reply_written();
        assert_eq!(state.outstanding(), 0);
    }

    #[test]
    fn test_idle_candidates_oldest_first() {
        let registry = Registry::new(1);
        let oldest = registry.insert(peer());
        thread::sleep(Duration::from_millis(30));
        let middle = registry.insert(peer());
        thread::sleep(Duration::from_millis(30));
        let busy = registry.insert(peer());
        busy.call_started();
        thread::sleep(Duration::from_millis(30));
        let fresh = registry.insert(peer());

        let idle = registry.idle_candidates(Duration::from_millis(20), 10);
        let ids: Vec<u64> = idle.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![oldest.id, middle.id]);
        assert!(!ids.contains(&fresh.id));

        let limited = registry.idle_candidates(Duration::from_millis(20), 1);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, oldest.id);
    }
}
