//! ctrlkit - reconciliation controllers on tokio.
//!
//! A controller runs a user-supplied, idempotent sync function for work keys
//! delivered by event sources, periodic resyncs and cron schedules. The
//! engine deduplicates keys, retries failures with backoff, waits for its
//! sources to be ready before starting, and drains its workers on shutdown.
//!
//! # Core Concepts
//!
//! - **Work queue**: [`WorkQueue`] hands each key to at most one worker at a
//!   time; a key added while in flight is processed once more afterwards.
//!
//! - **Sync**: the [`Reconciler`] receives a [`SyncContext`] carrying the key,
//!   the queue and a [`Recorder`]. Returning an error retries the key with
//!   backoff; returning [`SyntheticRequeue`] retries it without reporting.
//!
//! - **Sources**: anything implementing [`Informer`] can feed the queue
//!   through the builder's `with_source*` methods and gates startup via
//!   [`Informer::has_synced`].
//!
//! - **Controller**: [`ControllerBuilder`] wires the pieces together and
//!   [`Controller::run`] drives them until a [`CancellationToken`] fires.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use ctrlkit::*;
//!
//! let controller = Controller::builder()
//!     .with_sync(|_token, ctx: SyncContext| async move {
//!         tracing::info!(key = ctx.queue_key(), "reconciling");
//!         Ok(())
//!     })
//!     .resync_every(Duration::from_secs(60))
//!     .build("example", &TracingRecorder::new("operator"))?;
//!
//! let shutdown = CancellationToken::new();
//! controller.run(shutdown, 2).await?;
//! ```

/// Engine configuration.
///
/// [`ControllerConfig`] holds readiness, restart and backoff settings;
/// [`RateLimiterConfig`] describes the queue's retry policy.
pub mod config;

/// The per-sync handle, [`SyncContext`].
pub mod context;

/// Error types, the [`SyntheticRequeue`] marker and [`PanicPayload`].
pub mod error;

/// Diagnostic event recording.
///
/// The [`Recorder`] trait with [`TracingRecorder`] and [`InMemoryRecorder`].
pub mod events;

#[cfg(feature = "metrics")]
/// Prometheus metrics, enabled by the `metrics` feature.
pub mod metrics;

/// The deduplicating, rate-limited [`WorkQueue`].
pub mod queue;

/// Retry delay policies used by the work queue.
pub mod rate_limit;

/// Controller construction and execution.
///
/// - [`Controller`] - the runnable engine
/// - [`ControllerBuilder`] - configuration, finalized by `build`
/// - [`Reconciler`] and [`PostStartHook`] - user logic
pub mod runtime;

/// Cron and periodic resync triggers.
pub mod schedule;

/// Event source plumbing: [`Informer`], [`Notification`] and key mapping.
pub mod source;

/// Tracing spans and metric helpers.
pub mod telemetry;

pub use config::*;
pub use context::*;
pub use error::*;
pub use events::*;
pub use queue::*;
pub use rate_limit::*;
pub use runtime::*;
pub use schedule::ResyncSchedule;
pub use source::*;

pub use tokio_util::sync::CancellationToken;
