//! Query event hub shared by every database binding.
//!
//! [`QueryBus`] delivers each [`QueryEvent`] synchronously to the attached
//! [`QueryListener`]s, in emission order, before the issuing call returns.
//! A `tokio::sync::broadcast` tap is available for asynchronous observers
//! that only need a best-effort copy (see [`crate::trace`]).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use querylens_core::query::{QueryEvent, QueryListener};
use tokio::sync::broadcast;

/// Default buffer capacity for the broadcast tap.
const DEFAULT_CAPACITY: usize = 1024;

/// Handle returned by [`QueryBus::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct QueryBus {
    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn QueryListener>)>>,
    next_id: AtomicU64,
    tap: broadcast::Sender<QueryEvent>,
}

impl QueryBus {
    pub fn new(capacity: usize) -> Self {
        let (tap, _) = broadcast::channel(capacity);
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            tap,
        }
    }

    /// Attach a listener. It receives every event emitted from now on.
    pub fn subscribe(&self, listener: Arc<dyn QueryListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Detach a listener. Returns `false` if it was not attached.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver an event to every attached listener, then to the tap.
    pub fn emit(&self, event: QueryEvent) {
        // Snapshot so listeners may (un)subscribe from inside a callback.
        let listeners: Vec<Arc<dyn QueryListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in &listeners {
            listener.on_query(&event);
        }

        // Ignore the SendError: it only means nobody is tapping.
        let _ = self.tap.send(event);
    }

    /// Receive a best-effort copy of every emitted event.
    pub fn tap(&self) -> broadcast::Receiver<QueryEvent> {
        self.tap.subscribe()
    }
}

impl Default for QueryBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
