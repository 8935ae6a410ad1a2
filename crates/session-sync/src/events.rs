//! Synchronous in-order notification.
//!
//! Listeners run on the thread that changed the state, in subscription order, at the
//! moment of the change. Nothing is buffered: a late subscriber has to read current
//! state through the corresponding getter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

pub type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

type SharedListener<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Emitter<T> {
    inner: Arc<EmitterInner<T>>,
}

struct EmitterInner<T> {
    listeners: Mutex<Vec<(u64, SharedListener<T>)>>,
    next_id: AtomicU64,
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        let weak: Weak<EmitterInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().retain(|(existing, _)| *existing != id);
            }
        })
    }

    /// Deliver `event` to every current listener. The listener list is copied first,
    /// so a listener may subscribe or unsubscribe without deadlocking.
    pub fn fire(&self, event: &T) {
        let listeners: Vec<SharedListener<T>> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Handle for one listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the listener registered for as long as the emitter lives.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
