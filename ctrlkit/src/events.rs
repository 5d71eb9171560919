use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Sink for user-visible diagnostic events.
///
/// Recorders never fail; a sink that cannot deliver an event drops it.
pub trait Recorder: Send + Sync + fmt::Debug {
    /// Component name attached to every event from this recorder.
    fn component_name(&self) -> &str;

    /// A recorder for a different component sharing the same sink.
    fn for_component(&self, component: &str) -> Arc<dyn Recorder>;

    /// A recorder for `<component>-<suffix>`.
    fn with_component_suffix(&self, suffix: &str) -> Arc<dyn Recorder> {
        self.for_component(&format!("{}-{}", self.component_name(), suffix))
    }

    /// Record a normal event.
    fn event(&self, reason: &str, message: &str);

    /// Record a warning event.
    fn warning(&self, reason: &str, message: &str);
}

/// Severity of a recorded event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

/// An event captured by [`InMemoryRecorder`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub component: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Recorder that emits events as `tracing` records.
#[derive(Clone, Debug)]
pub struct TracingRecorder {
    component: String,
}

impl TracingRecorder {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }
}

impl Recorder for TracingRecorder {
    fn component_name(&self) -> &str {
        &self.component
    }

    fn for_component(&self, component: &str) -> Arc<dyn Recorder> {
        Arc::new(Self::new(component))
    }

    fn event(&self, reason: &str, message: &str) {
        tracing::info!(component = %self.component, reason, "{message}");
    }

    fn warning(&self, reason: &str, message: &str) {
        tracing::warn!(component = %self.component, reason, "{message}");
    }
}

/// Recorder that keeps every event in memory.
///
/// Recorders derived with [`for_component`](Recorder::for_component) share
/// the same buffer, so a test can hand a controller one recorder and read
/// everything back from it.
#[derive(Clone, Debug)]
pub struct InMemoryRecorder {
    component: String,
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl InMemoryRecorder {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot of all recorded events, oldest first.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Events whose reason equals `reason`.
    pub fn events_with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.reason == reason)
            .cloned()
            .collect()
    }

    fn push(&self, event_type: EventType, reason: &str, message: &str) {
        self.events.lock().push(RecordedEvent {
            component: self.component.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }
}

impl Recorder for InMemoryRecorder {
    fn component_name(&self) -> &str {
        &self.component
    }

    fn for_component(&self, component: &str) -> Arc<dyn Recorder> {
        Arc::new(Self {
            component: component.to_string(),
            events: Arc::clone(&self.events),
        })
    }

    fn event(&self, reason: &str, message: &str) {
        self.push(EventType::Normal, reason, message);
    }

    fn warning(&self, reason: &str, message: &str) {
        self.push(EventType::Warning, reason, message);
    }
}
