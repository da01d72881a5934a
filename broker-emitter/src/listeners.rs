//! Local listener bookkeeping
//!
//! A standalone observer registry: event name -> ordered list of handlers.
//! It knows nothing about the broker; the [`Emitter`](crate::Emitter) decides
//! when broker subscriptions follow changes here.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use broker_client::Message;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::EmitterError;

/// Handler invoked with every message delivered for an event
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Handler invoked with errors reported by the emitter
pub type ErrorHandler = Arc<dyn Fn(&EmitterError) + Send + Sync>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a registered listener
///
/// Returned when a listener is added and used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

struct Entry {
    id: ListenerId,
    handler: Handler,
}

/// Event name -> ordered handlers
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<String, Vec<Entry>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `event`, returning its new id
    pub fn add(&self, event: &str, handler: Handler) -> ListenerId {
        let id = ListenerId::next();
        self.insert(event, id, handler);
        id
    }

    /// Append a handler under a pre-allocated id
    pub(crate) fn insert(&self, event: &str, id: ListenerId, handler: Handler) {
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push(Entry { id, handler });
    }

    /// Remove one handler. Returns `false` if it was not registered.
    pub fn remove(&self, event: &str, id: ListenerId) -> bool {
        let removed = match self.listeners.get_mut(event) {
            Some(mut entries) => {
                let before = entries.len();
                entries.retain(|e| e.id != id);
                entries.len() != before
            }
            None => false,
        };
        self.listeners.remove_if(event, |_, entries| entries.is_empty());
        removed
    }

    /// Remove every handler for `event`, returning how many were removed
    pub fn clear_event(&self, event: &str) -> usize {
        self.listeners
            .remove(event)
            .map_or(0, |(_, entries)| entries.len())
    }

    /// Remove every handler, returning the events that had any
    pub fn clear(&self) -> Vec<String> {
        let events = self.event_names();
        for event in &events {
            self.listeners.remove(event);
        }
        events
    }

    /// Snapshot of the handlers for `event`, in registration order
    pub fn handlers(&self, event: &str) -> Vec<Handler> {
        self.listeners
            .get(event)
            .map(|entries| entries.iter().map(|e| Arc::clone(&e.handler)).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, |entries| entries.len())
    }

    pub fn contains(&self, event: &str, id: ListenerId) -> bool {
        self.listeners
            .get(event)
            .is_some_and(|entries| entries.iter().any(|e| e.id == id))
    }

    /// Events with at least one handler, sorted
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .listeners
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.iter().all(|entry| entry.value().is_empty())
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("events", &self.event_names())
            .finish()
    }
}

/// Listeners for errors the emitter cannot return to a caller
#[derive(Default)]
pub struct ErrorListeners {
    handlers: RwLock<Vec<(ListenerId, ErrorHandler)>>,
}

impl ErrorListeners {
    pub fn add(&self, handler: ErrorHandler) -> ListenerId {
        let id = ListenerId::next();
        self.handlers.write().push((id, handler));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Deliver `error` to every error listener
    ///
    /// Unhandled errors are logged. A panicking error listener is logged and
    /// skipped.
    pub fn report(&self, error: &EmitterError) {
        let handlers: Vec<ErrorHandler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        if handlers.is_empty() {
            tracing::error!("Unhandled emitter error: {}", error);
            return;
        }

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
                tracing::error!("Error listener panicked while handling: {}", error);
            }
        }
    }
}

impl std::fmt::Debug for ErrorListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorListeners")
            .field("count", &self.len())
            .finish()
    }
}
