use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`](Self::subscribe) creates a new receiver that
/// gets every event published after the subscription was created. Clones
/// share the same subscriber list.
pub struct EventBus<T> {
    inner: Arc<Mutex<Vec<flume::Sender<T>>>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn senders(&self) -> MutexGuard<'_, Vec<flume::Sender<T>>> {
        self.inner.lock().unwrap_or_else(|e| {
            warn!("event bus lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<T> {
        let (tx, rx) = flume::unbounded();
        self.senders().push(tx);
        rx
    }

    /// Publish an event to all current subscribers.
    ///
    /// Subscribers whose receivers have been dropped are pruned.
    pub fn publish(&self, event: T) {
        self.senders().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.lock().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("EventBus")
            .field("subscribers", &count)
            .finish()
    }
}
