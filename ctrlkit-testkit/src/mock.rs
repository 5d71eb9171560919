use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ctrlkit::{CancellationToken, Reconciler, SyncContext, SyntheticRequeue};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// What a [`RecordingReconciler`] does when called.
#[derive(Clone, Debug, Default)]
pub enum SyncOutcome {
    #[default]
    Succeed,
    Fail(String),
    Requeue,
    Panic(String),
}

#[derive(Clone, Debug)]
pub struct SyncRecord {
    pub key: String,
    pub at: Instant,
}

/// Reconciler that records each call and returns a scripted outcome.
///
/// Clones share state, so a test can keep one handle and hand another to
/// the controller.
#[derive(Clone, Default)]
pub struct RecordingReconciler {
    state: Arc<Mutex<RecorderState>>,
    called: Arc<Notify>,
}

#[derive(Default)]
struct RecorderState {
    calls: Vec<SyncRecord>,
    default_outcome: SyncOutcome,
    outcomes: HashMap<String, SyncOutcome>,
    delay: Duration,
    in_flight: HashSet<String>,
    overlaps: Vec<String>,
}

impl RecordingReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(outcome: SyncOutcome) -> Self {
        let reconciler = Self::new();
        reconciler.set_outcome(outcome);
        reconciler
    }

    /// Outcome for keys without a specific outcome.
    pub fn set_outcome(&self, outcome: SyncOutcome) {
        self.state.lock().default_outcome = outcome;
    }

    pub fn set_outcome_for(&self, key: impl Into<String>, outcome: SyncOutcome) {
        self.state.lock().outcomes.insert(key.into(), outcome);
    }

    /// Sleep this long inside every sync.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    pub fn calls(&self) -> Vec<SyncRecord> {
        self.state.lock().calls.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().calls.iter().map(|call| call.key.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.state.lock().calls.iter().filter(|call| call.key == key).count()
    }

    /// Keys that were synced while a sync of the same key was running.
    pub fn overlapping_keys(&self) -> Vec<String> {
        self.state.lock().overlaps.clone()
    }

    pub fn assert_sync_count_eq(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(actual, expected, "Expected {expected} syncs, got {actual}");
    }

    /// Wait until at least `count` calls were recorded. Returns `false` on
    /// timeout.
    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.called.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.call_count() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.call_count() >= count;
            }
        }
    }

    /// Wait until `key` was synced at least `count` times.
    pub async fn wait_for_key(&self, key: &str, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.called.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.calls_for(key) >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.calls_for(key) >= count;
            }
        }
    }

    pub fn clear(&self) {
        self.state.lock().calls.clear();
    }
}

#[async_trait]
impl Reconciler for RecordingReconciler {
    async fn sync(&self, _token: CancellationToken, ctx: SyncContext) -> anyhow::Result<()> {
        let key = ctx.queue_key().to_string();
        let (outcome, delay) = {
            let mut state = self.state.lock();
            if !state.in_flight.insert(key.clone()) {
                state.overlaps.push(key.clone());
            }
            let outcome = state
                .outcomes
                .get(&key)
                .cloned()
                .unwrap_or_else(|| state.default_outcome.clone());
            (outcome, state.delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut state = self.state.lock();
            state.in_flight.remove(&key);
            state.calls.push(SyncRecord {
                key: key.clone(),
                at: Instant::now(),
            });
        }
        self.called.notify_waiters();

        match outcome {
            SyncOutcome::Succeed => Ok(()),
            SyncOutcome::Fail(message) => Err(anyhow::anyhow!(message)),
            SyncOutcome::Requeue => Err(SyntheticRequeue.into()),
            SyncOutcome::Panic(message) => panic!("{message}"),
        }
    }
}
