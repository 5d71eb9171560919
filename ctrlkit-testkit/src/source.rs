use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ctrlkit::{EventHandler, Informer, Notification};
use parking_lot::Mutex;

/// In-memory event source.
///
/// Starts unsynced; call [`mark_synced`](Self::mark_synced) to release a
/// controller waiting on it. Notifications are delivered synchronously to
/// every registered handler.
pub struct FakeSource<T> {
    handlers: Mutex<Vec<Arc<dyn EventHandler<T>>>>,
    synced: AtomicBool,
    reject_handlers: AtomicBool,
    delivered: AtomicUsize,
}

impl<T: Clone + Send + Sync + 'static> FakeSource<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            synced: AtomicBool::new(false),
            reject_handlers: AtomicBool::new(false),
            delivered: AtomicUsize::new(0),
        }
    }

    /// A source that reports synced from the start.
    pub fn synced() -> Self {
        let source = Self::new();
        source.mark_synced();
        source
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    /// Make future `add_event_handler` calls fail.
    pub fn reject_handlers(&self) {
        self.reject_handlers.store(true, Ordering::SeqCst);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Notifications delivered so far, counted once per handler.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn emit(&self, notification: Notification<T>) {
        let handlers = self.handlers.lock().clone();
        for handler in handlers {
            handler.on_notification(notification.clone());
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn add(&self, obj: T) {
        self.emit(Notification::Added(obj));
    }

    pub fn update(&self, old: T, new: T) {
        self.emit(Notification::Updated { old, new });
    }

    pub fn delete(&self, obj: T) {
        self.emit(Notification::Deleted(obj));
    }

    pub fn delete_final_state_unknown(&self, obj: T) {
        self.emit(Notification::DeletedFinalStateUnknown(obj));
    }
}

impl<T: Clone + Send + Sync + 'static> Default for FakeSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync> Informer<T> for FakeSource<T> {
    fn add_event_handler(&self, handler: Arc<dyn EventHandler<T>>) -> anyhow::Result<()> {
        if self.reject_handlers.load(Ordering::SeqCst) {
            anyhow::bail!("fake source rejects handlers");
        }
        self.handlers.lock().push(handler);
        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}
