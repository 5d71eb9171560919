//! Tracing and telemetry instrumentation for controllers.
//!
//! Helpers for creating tracing spans and recording metrics around sync
//! invocations. All functions work with and without the `metrics` feature.
//!
//! # Example
//!
//! ```ignore
//! use ctrlkit::telemetry::{instrument_sync, record_sync_end, record_sync_start};
//!
//! let timer = record_sync_start(key);
//! let result = instrument_sync("my-controller", key, reconcile(key)).await;
//! record_sync_end(timer, "my-controller", if result.is_ok() { "success" } else { "error" });
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info_span, Instrument, Span};

/// Span wrapping a single sync invocation.
#[must_use]
pub fn controller_sync_span(controller: impl AsRef<str>, key: impl AsRef<str>) -> Span {
    info_span!(
        "ctrlkit.sync",
        controller = %controller.as_ref(),
        key = %key.as_ref(),
    )
}

/// Span covering the lifetime of one worker.
#[must_use]
pub fn controller_worker_span(controller: impl AsRef<str>, worker: usize) -> Span {
    info_span!(
        "ctrlkit.worker",
        controller = %controller.as_ref(),
        worker = worker,
    )
}

/// Attach a sync span to `future`.
pub fn instrument_sync<F>(
    controller: impl AsRef<str>,
    key: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(controller_sync_span(controller, key))
}

/// Count a sync outcome (`success`, `error` or `requeue`).
pub fn record_sync(controller: impl AsRef<str>, result: impl AsRef<str>) {
    tracing::trace!(
        controller = %controller.as_ref(),
        result = %result.as_ref(),
        "sync finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_sync(controller.as_ref(), result.as_ref());
}

/// Count a rate-limited requeue.
pub fn record_requeue(controller: impl AsRef<str>, reason: impl AsRef<str>) {
    tracing::debug!(
        controller = %controller.as_ref(),
        reason = %reason.as_ref(),
        "key requeued with backoff"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_requeue(controller.as_ref(), reason.as_ref());
}

/// Count a recovered panic.
pub fn record_panic(controller: impl AsRef<str>) {
    tracing::warn!(controller = %controller.as_ref(), "panic in controller task");

    #[cfg(feature = "metrics")]
    crate::metrics::record_panic(controller.as_ref());
}

/// Observe how long a sync took.
pub fn observe_sync_duration(controller: impl AsRef<str>, duration: Duration) {
    #[cfg(feature = "metrics")]
    crate::metrics::observe_sync_duration(controller.as_ref(), duration.as_secs_f64());
    #[cfg(not(feature = "metrics"))]
    let _ = (controller, duration);
}

/// Start timing a sync of `key`.
pub fn record_sync_start(key: impl AsRef<str>) -> SyncTimingHandle {
    SyncTimingHandle {
        key: key.as_ref().to_string(),
        start: Instant::now(),
    }
}

/// Finish timing a sync and record its outcome.
pub fn record_sync_end(handle: SyncTimingHandle, controller: impl AsRef<str>, result: impl AsRef<str>) {
    observe_sync_duration(controller.as_ref(), handle.elapsed());
    record_sync(controller, result);
}

/// Timing handle returned by [`record_sync_start`].
#[derive(Debug)]
pub struct SyncTimingHandle {
    key: String,
    start: Instant,
}

impl SyncTimingHandle {
    /// Key being synced.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Time since the sync started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
