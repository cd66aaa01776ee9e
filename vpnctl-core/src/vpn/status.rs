//! Session state fan-out
//!
//! Every state the session enters is broadcast to all subscribers in
//! order. Each subscriber has its own bounded buffer; a subscriber that
//! falls behind loses its oldest states and is told how many it missed,
//! and never slows the session down.

use crate::vpn::state::SessionState;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::warn;

/// Default per-subscriber buffer
pub const DEFAULT_STATUS_BUFFER: usize = 32;

/// Broadcasts session states to any number of subscribers
#[derive(Clone)]
pub struct StatusPublisher {
    updates: broadcast::Sender<SessionState>,
    current: Arc<watch::Sender<SessionState>>,
}

impl StatusPublisher {
    pub fn new(buffer: usize) -> Self {
        let (updates, _) = broadcast::channel(buffer.max(1));
        let (current, _) = watch::channel(SessionState::Disconnected);
        Self {
            updates,
            current: Arc::new(current),
        }
    }

    /// Record and broadcast a new state
    pub(crate) fn publish(&self, state: SessionState) {
        self.current.send_replace(state.clone());
        // No subscribers is fine
        let _ = self.updates.send(state);
    }

    /// Stream of every state published from now on
    pub fn subscribe(&self) -> StatusStream {
        StatusStream {
            updates: self.updates.subscribe(),
            missed: 0,
        }
    }

    /// Most recently published state
    pub fn current(&self) -> SessionState {
        self.current.borrow().clone()
    }

    /// Receiver that only ever holds the latest state
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.current.subscribe()
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_BUFFER)
    }
}

/// One subscriber's view of the state sequence
pub struct StatusStream {
    updates: broadcast::Receiver<SessionState>,
    missed: u64,
}

impl StatusStream {
    /// Next state in publication order; `None` once the session is gone
    ///
    /// States dropped because this subscriber lagged are skipped.
    pub async fn next(&mut self) -> Option<SessionState> {
        loop {
            match self.updates.recv().await {
                Ok(state) => return Some(state),
                Err(broadcast::error::RecvError::Lagged(n)) => self.lagged(n),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered state without waiting
    pub fn try_next(&mut self) -> Option<SessionState> {
        loop {
            match self.updates.try_recv() {
                Ok(state) => return Some(state),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.lagged(n),
                Err(_) => return None,
            }
        }
    }

    /// Total number of states this subscriber lost to lagging
    pub fn missed(&self) -> u64 {
        self.missed
    }

    fn lagged(&mut self, n: u64) {
        warn!(missed = n, "Status subscriber lagged, oldest states dropped");
        self.missed += n;
    }
}
