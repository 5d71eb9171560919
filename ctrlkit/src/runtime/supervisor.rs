use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ControllerConfig, FatalPolicy};
use crate::context::SyncContext;
use crate::error::{ControllerError, PanicPayload};
use crate::schedule::{self, ResyncSchedule, ScheduledJob};
use crate::source::ReadinessProbe;
use crate::telemetry;

use super::builder::ControllerBuilder;
use super::worker;

/// The user's reconciliation logic.
///
/// `sync` must be idempotent: the engine guarantees at-least-once delivery
/// per key, not exactly-once. Closures of the shape
/// `Fn(CancellationToken, SyncContext) -> impl Future<Output = anyhow::Result<()>>`
/// implement this trait.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Reconcile the key carried by `ctx`.
    async fn sync(&self, token: CancellationToken, ctx: SyncContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Reconciler for F
where
    F: Fn(CancellationToken, SyncContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn sync(&self, token: CancellationToken, ctx: SyncContext) -> anyhow::Result<()> {
        (self)(token, ctx).await
    }
}

/// A long-running task started next to the workers, e.g. a custom trigger.
///
/// Hooks receive the controller's shutdown token and must return once it is
/// cancelled; `run` waits for them before returning.
#[async_trait]
pub trait PostStartHook: Send + Sync {
    async fn run(&self, token: CancellationToken, ctx: SyncContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> PostStartHook for F
where
    F: Fn(CancellationToken, SyncContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, token: CancellationToken, ctx: SyncContext) -> anyhow::Result<()> {
        (self)(token, ctx).await
    }
}

/// Called after every sync that did not request a synthetic requeue, with
/// the error if there was one. Returning `Err` panics the worker.
pub type SyncErrorHandler = Arc<dyn Fn(Option<&anyhow::Error>) -> anyhow::Result<()> + Send + Sync>;

/// Receives panics recovered from workers and post-start hooks.
pub type SyncPanicHandler = Arc<dyn Fn(PanicPayload) -> anyhow::Result<()> + Send + Sync>;

pub(crate) struct ControllerInner {
    pub(crate) name: Arc<str>,
    pub(crate) reconciler: Arc<dyn Reconciler>,
    pub(crate) sync_context: SyncContext,
    pub(crate) resync_every: Duration,
    pub(crate) resync_schedules: Vec<ResyncSchedule>,
    pub(crate) readiness_probes: Vec<ReadinessProbe>,
    pub(crate) post_start_hooks: Vec<Arc<dyn PostStartHook>>,
    pub(crate) error_handler: Option<SyncErrorHandler>,
    pub(crate) panic_handler: Option<SyncPanicHandler>,
    pub(crate) config: ControllerConfig,
}

impl ControllerInner {
    /// Hand a recovered panic to the panic handler, or keep unwinding when
    /// there is none.
    pub(crate) fn recover(&self, payload: Box<dyn Any + Send>) {
        let Some(handler) = &self.panic_handler else {
            resume_unwind(payload);
        };

        let payload = PanicPayload::from_panic(payload);
        let rendered = payload.to_string();
        if let Err(err) = handler(payload) {
            tracing::warn!(
                controller = %self.name,
                error = %format!("{err:#}"),
                panic = %rendered,
                "detected panic in controller but the panic handler failed"
            );
        }
    }
}

/// A runnable controller.
///
/// Created with [`ControllerBuilder`]; immutable afterwards. Cloning is cheap
/// and shares the queue.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = &self.inner;
        f.debug_struct("Controller")
            .field("name", &inner.name)
            .field("queue", inner.sync_context.queue())
            .field("resync_every", &inner.resync_every)
            .field("resync_schedules", &inner.resync_schedules)
            .field("readiness_probes", &inner.readiness_probes.len())
            .field("post_start_hooks", &inner.post_start_hooks.len())
            .field("error_handler_set", &inner.error_handler.is_some())
            .field("panic_handler_set", &inner.panic_handler.is_some())
            .field("config", &inner.config)
            .finish()
    }
}

impl Controller {
    /// Start describing a controller.
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::new()
    }

    pub(crate) fn new(inner: ControllerInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Controller name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The context handed to sync invocations (with an empty queue key).
    pub fn sync_context(&self) -> &SyncContext {
        &self.inner.sync_context
    }

    /// Invoke the reconciler directly, bypassing the queue and all handlers.
    pub async fn sync(&self, shutdown: CancellationToken, ctx: SyncContext) -> anyhow::Result<()> {
        self.inner.reconciler.sync(shutdown, ctx).await
    }

    /// Run the controller until `shutdown` is cancelled.
    ///
    /// Waits for every readiness probe, then starts `workers` workers, the
    /// cron and periodic triggers and the post-start hooks. On shutdown the
    /// queue is shut down, hooks are joined, then workers. A panic in a
    /// worker or hook with no panic handler configured is resumed on the
    /// task calling `run`.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::ReadinessTimeout`] when readiness times out
    /// under [`FatalPolicy::Return`]. Under the default
    /// [`FatalPolicy::Exit`] the process exits instead.
    pub async fn run(&self, shutdown: CancellationToken, workers: usize) -> Result<(), ControllerError> {
        let inner = &self.inner;

        if !self.wait_for_readiness(&shutdown).await? {
            tracing::info!(controller = %inner.name, "shutdown requested before sources were ready");
            return Ok(());
        }

        let queue = Arc::clone(inner.sync_context.queue());
        let queue_token = CancellationToken::new();
        let trigger_token = CancellationToken::new();
        let job = ScheduledJob::new(Arc::clone(&inner.name), Arc::clone(&queue));

        let mut worker_tasks = JoinSet::new();
        for index in 1..=workers {
            tracing::info!(controller = %inner.name, worker = index, "starting worker");
            worker_tasks.spawn(worker::run_worker(
                Arc::clone(inner),
                index,
                queue_token.clone(),
            ));
        }

        let mut cron_tasks = JoinSet::new();
        for schedule in &inner.resync_schedules {
            tracing::debug!(controller = %inner.name, %schedule, "starting scheduled resync");
            cron_tasks.spawn(schedule::run_cron(
                schedule.clone(),
                job.clone(),
                trigger_token.clone(),
            ));
        }

        if !inner.resync_every.is_zero() {
            if inner.resync_every < inner.config.resync_warning_floor() {
                inner.sync_context.recorder().warning(
                    "FastControllerResync",
                    &format!(
                        "Controller {:?} resync interval is set to {} which might lead to client request throttling",
                        inner.name,
                        humantime::format_duration(inner.resync_every)
                    ),
                );
            }
            worker_tasks.spawn(schedule::run_periodic(
                inner.resync_every,
                job,
                shutdown.clone(),
            ));
        }

        let mut hook_tasks = JoinSet::new();
        for hook in &inner.post_start_hooks {
            let hook = Arc::clone(hook);
            let token = shutdown.clone();
            let ctx = inner.sync_context.clone();
            let name = Arc::clone(&inner.name);
            hook_tasks.spawn(async move {
                match AssertUnwindSafe(hook.run(token, ctx)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(controller = %name, error = %format!("{err:#}"), "post start hook failed");
                    }
                    Err(payload) => {
                        telemetry::record_panic(&name);
                        resume_unwind(payload);
                    }
                }
            });
        }

        tracing::info!(controller = %inner.name, workers, "controller started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = worker_tasks.join_next(), if !worker_tasks.is_empty() => {
                    self.on_task_exit(joined);
                }
                Some(joined) = hook_tasks.join_next(), if !hook_tasks.is_empty() => {
                    self.on_task_exit(joined);
                }
            }
        }

        tracing::info!(controller = %inner.name, "shutting down");
        queue.shut_down();
        queue_token.cancel();
        trigger_token.cancel();

        while let Some(joined) = hook_tasks.join_next().await {
            self.on_task_exit(joined);
        }
        if !inner.post_start_hooks.is_empty() {
            tracing::info!(controller = %inner.name, "all post start hooks have been terminated");
        }

        while let Some(joined) = cron_tasks.join_next().await {
            self.on_task_exit(joined);
        }

        while let Some(joined) = worker_tasks.join_next().await {
            self.on_task_exit(joined);
        }
        tracing::info!(controller = %inner.name, "all workers have been terminated");

        Ok(())
    }

    fn on_task_exit(&self, joined: Result<(), JoinError>) {
        match joined {
            Ok(()) => {}
            Err(err) if err.is_panic() => self.inner.recover(err.into_panic()),
            Err(err) => {
                tracing::debug!(controller = %self.inner.name, error = %err, "controller task cancelled");
            }
        }
    }

    /// Poll readiness probes. `Ok(false)` means shutdown won the race.
    async fn wait_for_readiness(&self, shutdown: &CancellationToken) -> Result<bool, ControllerError> {
        let inner = &self.inner;
        if inner.readiness_probes.is_empty() {
            return Ok(true);
        }

        tracing::info!(controller = %inner.name, "waiting for sources to sync");
        let timeout = inner.config.readiness_timeout();
        let deadline = Instant::now() + timeout;
        let mut poll = tokio::time::interval(inner.config.readiness_poll_interval());
        let all_ready = || inner.readiness_probes.iter().all(|probe| probe());

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(false),
                _ = tokio::time::sleep_until(deadline) => break,
                _ = poll.tick() => {
                    if all_ready() {
                        tracing::info!(controller = %inner.name, "sources are synced");
                        return Ok(true);
                    }
                }
            }
        }

        if shutdown.is_cancelled() {
            return Ok(false);
        }
        // Readiness reached by the deadline still counts.
        if all_ready() {
            tracing::info!(controller = %inner.name, "sources are synced");
            return Ok(true);
        }

        let err = ControllerError::ReadinessTimeout {
            controller: inner.name.to_string(),
            timeout,
        };
        match inner.config.fatal_policy {
            FatalPolicy::Exit => {
                tracing::error!(controller = %inner.name, error = %err, "controller cannot start");
                std::process::exit(1);
            }
            FatalPolicy::Return => Err(err),
        }
    }
}
