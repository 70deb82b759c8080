//! Periodically reclaims connections that have gone quiet.

use std::sync::Arc;

use crossbeam::select;

use super::Shared;

pub(crate) struct IdleScanner {
    shared: Arc<Shared>,
}

impl IdleScanner {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn run(self) {
        let interval = self.shared.config.idle_scan_interval;
        loop {
            select! {
                recv(self.shared.shutdown) -> _ => break,
                default(interval) => {}
            }
            if !self.shared.is_running() {
                break;
            }
            self.scan();
        }
        tracing::debug!("Idle scanner exiting");
    }

    /// Close up to `kill_max` idle connections, oldest first.
    ///
    /// Does nothing while the server holds no more than `idle_threshold`
    /// connections.
    fn scan(&self) -> usize {
        let config = &self.shared.config;
        let open = self.shared.registry.len();
        if open <= config.idle_threshold {
            return 0;
        }

        let idle = self
            .shared
            .registry
            .idle_candidates(config.max_idle, config.kill_max);
        let closed = idle
            .iter()
            .filter(|state| self.shared.close_if_idle(state.id, config.max_idle))
            .count();
        if closed > 0 {
            tracing::debug!(open, closed, "Closed idle connections");
        }
        closed
    }
}
