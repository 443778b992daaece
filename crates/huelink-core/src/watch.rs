// ── Watcher lists ──
//
// Callback registries used by the hub (stream-wide events) and by each
// resource (its own updates). Delivery snapshots the list and runs the
// callbacks outside the lock, in registration order. Cancelled entries
// are pruned on the next delivery pass.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Filter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Cancels one registered watcher.
///
/// Dropping the handle does not cancel the watcher.
#[derive(Debug, Clone)]
pub struct WatchHandle {
    id: u64,
    active: Arc<AtomicBool>,
}

impl WatchHandle {
    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Entry<T> {
    key: Option<String>,
    active: Arc<AtomicBool>,
    filter: Option<Filter<T>>,
    callback: Callback<T>,
}

impl<T> Entry<T> {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

pub struct WatcherList<T> {
    entries: Mutex<Vec<Arc<Entry<T>>>>,
    next_id: AtomicU64,
}

impl<T> Default for WatcherList<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> std::fmt::Debug for WatcherList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherList")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> WatcherList<T> {
    /// Register a callback for every event.
    pub fn watch(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> WatchHandle {
        self.register(None, None, Arc::new(callback))
    }

    /// Register a callback for events accepted by `filter`.
    pub fn watch_filtered(
        &self,
        filter: impl Fn(&T) -> bool + Send + Sync + 'static,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> WatchHandle {
        self.register(None, Some(Arc::new(filter)), Arc::new(callback))
    }

    /// Register a callback under `key`, cancelling any earlier watcher with that key.
    pub fn watch_keyed(
        &self,
        key: impl Into<String>,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> WatchHandle {
        self.register(Some(key.into()), None, Arc::new(callback))
    }

    fn register(
        &self,
        key: Option<String>,
        filter: Option<Filter<T>>,
        callback: Callback<T>,
    ) -> WatchHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let entry = Arc::new(Entry {
            key,
            active: Arc::clone(&active),
            filter,
            callback,
        });

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = &entry.key {
            for old in entries.iter().filter(|e| e.key.as_ref() == Some(key)) {
                old.active.store(false, Ordering::SeqCst);
            }
        }
        entries.push(entry);

        WatchHandle { id, active }
    }

    /// Deliver `event` to every active watcher, in registration order.
    ///
    /// A panicking callback is logged and does not stop delivery.
    pub fn notify(&self, event: &T) {
        let snapshot: Vec<Arc<Entry<T>>> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.retain(|e| e.is_active());
            entries.clone()
        };

        for entry in snapshot {
            if !entry.is_active() {
                continue;
            }
            if entry.filter.as_ref().is_some_and(|accepts| !accepts(event)) {
                continue;
            }
            let callback = &entry.callback;
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::error!(key = ?entry.key, "watcher panicked");
            }
        }
    }

    /// Number of registered watchers that have not been cancelled.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.is_active())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
