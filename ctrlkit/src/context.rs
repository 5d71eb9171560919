use std::fmt;
use std::sync::Arc;

use crate::events::Recorder;
use crate::queue::WorkQueue;
use crate::rate_limit::RateLimiter;
use crate::source::{EventFilter, EventHandler, QueueKeyHandler, QueueKeysFn};

/// Handle passed to every sync invocation.
///
/// Cloning is cheap: clones share the queue and recorder. Use
/// [`with_queue_key`](Self::with_queue_key) to derive a context for a
/// different key.
#[derive(Clone)]
pub struct SyncContext {
    name: Arc<str>,
    queue: Arc<WorkQueue>,
    queue_key: String,
    recorder: Arc<dyn Recorder>,
}

impl SyncContext {
    /// Create a context with a fresh queue using the default rate limiter.
    ///
    /// The recorder is scoped to `<component>-<lowercased name>`.
    pub fn new(name: &str, recorder: &dyn Recorder) -> Self {
        Self::from_parts(name, Arc::new(WorkQueue::new(name)), recorder)
    }

    /// Create a context with a fresh queue using `rate_limiter`.
    pub fn with_rate_limiter(
        name: &str,
        recorder: &dyn Recorder,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self::from_parts(
            name,
            Arc::new(WorkQueue::with_rate_limiter(name, rate_limiter)),
            recorder,
        )
    }

    /// Create a context around an existing queue.
    pub fn from_parts(name: &str, queue: Arc<WorkQueue>, recorder: &dyn Recorder) -> Self {
        Self {
            name: Arc::from(name),
            queue,
            queue_key: String::new(),
            recorder: recorder.with_component_suffix(&name.to_lowercase()),
        }
    }

    /// Controller name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The controller's queue, for manual requeues.
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// The key this sync was triggered for. Empty outside of a sync.
    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    /// A copy of this context bound to `key`.
    #[must_use]
    pub fn with_queue_key(&self, key: impl Into<String>) -> Self {
        Self {
            queue_key: key.into(),
            ..self.clone()
        }
    }

    /// The controller's event recorder.
    pub fn recorder(&self) -> &Arc<dyn Recorder> {
        &self.recorder
    }

    /// Handler mapping source notifications to queue keys.
    pub fn event_handler<T>(
        &self,
        queue_keys: QueueKeysFn<T>,
        filter: Option<EventFilter<T>>,
    ) -> Arc<dyn EventHandler<T>>
    where
        T: Send + Sync + 'static,
    {
        Arc::new(QueueKeyHandler::new(self.clone(), queue_keys, filter))
    }

    pub(crate) fn enqueue_keys<I>(&self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        for key in keys {
            self.queue.add(key);
        }
    }
}

impl fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncContext")
            .field("name", &self.name)
            .field("queue_key", &self.queue_key)
            .field("queue", &self.queue)
            .field("recorder", &self.recorder.component_name())
            .finish()
    }
}
