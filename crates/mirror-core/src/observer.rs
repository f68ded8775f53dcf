//! Explicit publish/subscribe registry.
//!
//! The cache and the session each own an [`ObserverSet`]. Callbacks are
//! invoked synchronously after a mutation has been committed and after every
//! internal lock has been released, so a callback may call back into the
//! cache or the session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Handle returned by [`ObserverSet::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct ObserverSet<T> {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverId, Callback<T>)>>,
}

impl<T> Default for ObserverSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObserverSet<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn register<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.observers
            .write()
            .expect("observer lock poisoned")
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write().expect("observer lock poisoned");
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Invoke every registered callback with `value`, in registration order.
    pub fn notify(&self, value: &T) {
        // Snapshot first so callbacks can register or unregister observers.
        let callbacks: Vec<Callback<T>> = self
            .observers
            .read()
            .expect("observer lock poisoned")
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.read().expect("observer lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
