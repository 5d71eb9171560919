use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::rate_limit::{default_controller_rate_limiter, RateLimiter};

/// Deduplicating, rate-limited queue of work keys.
///
/// A key is either pending, processing, or both (dirty while processing).
/// At most one caller holds a given key between [`get`](Self::get) and
/// [`done`](Self::done); adding it again in that window schedules exactly one
/// more round once `done` is called.
pub struct WorkQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limiter: Arc<dyn RateLimiter>,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    delayed: HashMap<String, Instant>,
    shutting_down: bool,
}

impl QueueState {
    fn insert(&mut self, key: &str) -> bool {
        if self.shutting_down || self.dirty.contains(key) {
            return false;
        }
        self.dirty.insert(key.to_string());
        if self.processing.contains(key) {
            return false;
        }
        self.queue.push_back(key.to_string());
        true
    }

    /// Move due delayed keys into the queue. Returns the next deadline, if any.
    fn promote_due(&mut self, now: Instant) -> Option<Instant> {
        if self.delayed.is_empty() {
            return None;
        }

        let mut due: Vec<(String, Instant)> = Vec::new();
        let mut next: Option<Instant> = None;
        for (key, ready_at) in &self.delayed {
            if *ready_at <= now {
                due.push((key.clone(), *ready_at));
            } else {
                next = Some(next.map_or(*ready_at, |n| n.min(*ready_at)));
            }
        }

        // Promote in ready order so earlier retries keep their place.
        due.sort_by_key(|(_, ready_at)| *ready_at);
        for (key, _) in due {
            self.delayed.remove(&key);
            self.insert(&key);
        }
        next
    }
}

impl WorkQueue {
    /// Create a queue using the default controller rate limiter.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, Arc::new(default_controller_rate_limiter()))
    }

    /// Create a queue with a custom rate limiter.
    pub fn with_rate_limiter(name: impl Into<String>, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            rate_limiter,
        }
    }

    /// Queue name, used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add `key` unless it is already pending. Ignored after shutdown.
    pub fn add(&self, key: impl AsRef<str>) {
        let key = key.as_ref();
        let (added, depth) = {
            let mut state = self.state.lock();
            let added = state.insert(key);
            (added, state.queue.len())
        };
        if added {
            tracing::trace!(queue = %self.name, key, "work key added");
            self.record_depth(depth);
            self.notify.notify_waiters();
        }
    }

    /// Add `key` once `delay` has elapsed. An earlier pending deadline for the
    /// same key is kept.
    pub fn add_after(&self, key: impl AsRef<str>, delay: Duration) {
        let key = key.as_ref();
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let ready_at = Instant::now() + delay;
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state
                .delayed
                .entry(key.to_string())
                .and_modify(|existing| *existing = (*existing).min(ready_at))
                .or_insert(ready_at);
        }
        tracing::trace!(queue = %self.name, key, ?delay, "work key delayed");
        self.notify.notify_waiters();
    }

    /// Add `key` after the delay chosen by the rate limiter.
    pub fn add_rate_limited(&self, key: impl AsRef<str>) {
        let key = key.as_ref();
        let delay = self.rate_limiter.when(key);
        self.add_after(key, delay);
    }

    /// Clear the backoff history of `key`. A pending entry is left alone.
    pub fn forget(&self, key: impl AsRef<str>) {
        self.rate_limiter.forget(key.as_ref());
    }

    /// Failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: impl AsRef<str>) -> u32 {
        self.rate_limiter.num_requeues(key.as_ref())
    }

    /// Wait for the next key and mark it as processing.
    ///
    /// Returns `None` once the queue is shut down and every pending key has
    /// been handed out. This future is cancel safe: a key is only removed
    /// from the queue in the poll that returns it.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.state.lock();
                let next = if state.shutting_down {
                    None
                } else {
                    state.promote_due(Instant::now())
                };

                if let Some(key) = state.queue.pop_front() {
                    state.processing.insert(key.clone());
                    state.dirty.remove(&key);
                    let depth = state.queue.len();
                    drop(state);
                    self.record_depth(depth);
                    return Some(key);
                }

                if state.shutting_down {
                    return None;
                }
                next
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `key` after processing. If it was added again meanwhile it is
    /// queued immediately.
    pub fn done(&self, key: impl AsRef<str>) {
        let key = key.as_ref();
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                Some(state.queue.len())
            } else {
                None
            }
        };
        if let Some(depth) = requeued {
            self.record_depth(depth);
            self.notify.notify_waiters();
        }
    }

    /// Stop accepting keys and wake every waiter. Delayed keys are dropped;
    /// keys already pending are still handed out by [`get`](Self::get).
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
            state.delayed.clear();
        }
        tracing::debug!(queue = %self.name, "work queue shutting down");
        self.notify.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no key is ready to be handed out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[allow(unused_variables)]
    fn record_depth(&self, depth: usize) {
        #[cfg(feature = "metrics")]
        crate::metrics::set_queue_depth(&self.name, depth as f64);
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("WorkQueue");
        debug.field("name", &self.name);
        match self.state.try_lock() {
            Some(state) => {
                debug
                    .field("pending", &state.queue.len())
                    .field("processing", &state.processing.len())
                    .field("delayed", &state.delayed.len())
                    .field("shutting_down", &state.shutting_down);
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::ItemExponentialRateLimiter;
    use tokio::time::timeout;

    fn fast_queue() -> WorkQueue {
        WorkQueue::with_rate_limiter(
            "test",
            Arc::new(ItemExponentialRateLimiter::new(
                Duration::from_millis(10),
                Duration::from_millis(80),
            )),
        )
    }

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let queue = fast_queue();
        for _ in 0..5 {
            queue.add("a");
        }
        queue.add("b");
        queue.add("a");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_once_after_done() {
        let queue = fast_queue();
        queue.add("a");
        let key = queue.get().await.unwrap();

        queue.add("a");
        queue.add("a");
        assert_eq!(queue.len(), 0, "processing key must not be handed out twice");

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        queue.done("a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let queue = Arc::new(fast_queue());
        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.get().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add("late");

        let key = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(key.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_rate_limited_key_arrives_after_backoff() {
        let queue = fast_queue();
        let started = Instant::now();
        queue.add_rate_limited("retry");
        assert!(queue.is_empty());

        let key = timeout(Duration::from_secs(1), queue.get()).await.unwrap();
        assert_eq!(key.as_deref(), Some("retry"));
        assert!(started.elapsed() >= Duration::from_millis(10));
        assert_eq!(queue.num_requeues("retry"), 1);

        queue.forget("retry");
        assert_eq!(queue.num_requeues("retry"), 0);
    }

    #[tokio::test]
    async fn test_add_after_keeps_earliest_deadline() {
        let queue = fast_queue();
        queue.add_after("k", Duration::from_secs(30));
        queue.add_after("k", Duration::from_millis(5));

        let key = timeout(Duration::from_secs(1), queue.get()).await.unwrap();
        assert_eq!(key.as_deref(), Some("k"));
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_then_signals() {
        let queue = fast_queue();
        queue.add("a");
        queue.add("b");
        queue.add_after("delayed", Duration::from_millis(1));
        queue.shut_down();
        queue.add("c");

        assert!(queue.is_shutting_down());
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
        assert_eq!(queue.get().await, None);
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_getters() {
        let queue = Arc::new(fast_queue());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.get().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shut_down();

        for waiter in waiters {
            let key = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
            assert_eq!(key, None);
        }
    }

    #[tokio::test]
    async fn test_dirty_key_requeued_on_done_during_shutdown() {
        let queue = fast_queue();
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.add("a");
        queue.shut_down();

        queue.done(&key);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_cancelled_get_loses_nothing() {
        let queue = fast_queue();
        let result = timeout(Duration::from_millis(10), queue.get()).await;
        assert!(result.is_err());

        queue.add("kept");
        assert_eq!(queue.get().await.as_deref(), Some("kept"));
    }
}
