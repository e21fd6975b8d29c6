//! Ordered observer list.
//!
//! Commands, devices and transports all need "call these functions when my
//! state changes". [`CallbackList`] is the one type that does this; it is
//! embedded by value wherever observers are needed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A registered observer. Receives the object whose state changed.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`CallbackList::add`], used to remove the observer again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Observers called in registration order.
///
/// Firing works on a snapshot, so an observer may add or remove observers
/// (including itself) while the list is being fired.
pub struct CallbackList<T: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(CallbackId, Callback<T>)>>,
}

impl<T: ?Sized> CallbackList<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer; returns its id.
    pub fn add<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.add_shared(Arc::new(callback))
    }

    /// Register an already shared observer; returns its id.
    pub fn add_shared(&self, callback: Callback<T>) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, callback));
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn remove(&self, id: CallbackId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Remove every observer.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if no observers are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Call every observer with `arg`, in registration order.
    pub fn fire(&self, arg: &T) {
        let snapshot: Vec<Callback<T>> = self
            .entries
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in snapshot {
            callback(arg);
        }
    }
}

impl<T: ?Sized> Default for CallbackList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> std::fmt::Debug for CallbackList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackList")
            .field("len", &self.len())
            .finish()
    }
}
