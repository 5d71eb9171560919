use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::context::SyncContext;
use crate::error::{ControllerError, PanicPayload};
use crate::events::Recorder;
use crate::schedule::parse_schedules;
use crate::source::{
    default_queue_keys, names_filter, EventFilter, Informer, QueueKeysFn, ReadinessProbe,
};

use super::supervisor::{
    Controller, ControllerInner, PostStartHook, Reconciler, SyncErrorHandler, SyncPanicHandler,
};

type SourceRegistration =
    Box<dyn FnOnce(&SyncContext) -> anyhow::Result<ReadinessProbe> + Send>;

/// Builder for a [`Controller`].
///
/// Every setter records configuration only; event handlers are registered
/// with their sources and schedules are parsed when [`build`](Self::build)
/// is called.
///
/// # Example
///
/// ```ignore
/// use ctrlkit::*;
///
/// let controller = Controller::builder()
///     .with_sync(|_token, ctx: SyncContext| async move {
///         tracing::info!(key = ctx.queue_key(), "reconciling");
///         Ok(())
///     })
///     .with_source_keys(pods, Arc::new(|pod: &Pod| vec![pod.key()]))
///     .resync_every(Duration::from_secs(300))
///     .resync_schedule(["0 3 * * *"])
///     .build("pod-janitor", &TracingRecorder::new("operator"))?;
/// ```
pub struct ControllerBuilder {
    reconciler: Option<Arc<dyn Reconciler>>,
    sync_context: Option<SyncContext>,
    config: ControllerConfig,
    sources: Vec<SourceRegistration>,
    readiness_probes: Vec<ReadinessProbe>,
    resync_every: Duration,
    resync_schedules: Vec<String>,
    post_start_hooks: Vec<Arc<dyn PostStartHook>>,
    error_handler: Option<SyncErrorHandler>,
    panic_handler: Option<SyncPanicHandler>,
}

impl fmt::Debug for ControllerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerBuilder")
            .field("reconciler_set", &self.reconciler.is_some())
            .field("sync_context", &self.sync_context)
            .field("config", &self.config)
            .field("sources", &self.sources.len())
            .field("readiness_probes", &self.readiness_probes.len())
            .field("resync_every", &self.resync_every)
            .field("resync_schedules", &self.resync_schedules)
            .field("post_start_hooks", &self.post_start_hooks.len())
            .field("error_handler_set", &self.error_handler.is_some())
            .field("panic_handler_set", &self.panic_handler.is_some())
            .finish()
    }
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            reconciler: None,
            sync_context: None,
            config: ControllerConfig::default(),
            sources: Vec::new(),
            readiness_probes: Vec::new(),
            resync_every: Duration::ZERO,
            resync_schedules: Vec::new(),
            post_start_hooks: Vec::new(),
            error_handler: None,
            panic_handler: None,
        }
    }

    /// Set the sync function.
    pub fn with_sync<F, Fut>(mut self, sync: F) -> Self
    where
        F: Fn(CancellationToken, SyncContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.reconciler = Some(Arc::new(sync));
        self
    }

    /// Set the sync logic from a [`Reconciler`] implementation.
    pub fn with_reconciler<R>(mut self, reconciler: R) -> Self
    where
        R: Reconciler + 'static,
    {
        self.reconciler = Some(Arc::new(reconciler));
        self
    }

    /// Use an existing context instead of creating one in `build`.
    ///
    /// Handy in tests that want to inspect the queue or recorder.
    pub fn with_sync_context(mut self, ctx: SyncContext) -> Self {
        self.sync_context = Some(ctx);
        self
    }

    /// Set engine configuration.
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Trigger a sync of [`DEFAULT_QUEUE_KEY`](crate::source::DEFAULT_QUEUE_KEY)
    /// on every notification from `source`.
    pub fn with_source<T, I>(self, source: Arc<I>) -> Self
    where
        T: Send + Sync + 'static,
        I: Informer<T> + ?Sized + 'static,
    {
        self.register_source(source, default_queue_keys(), None)
    }

    /// Like [`with_source`](Self::with_source), ignoring objects rejected by
    /// `filter`.
    pub fn with_filtered_source<T, I>(self, source: Arc<I>, filter: EventFilter<T>) -> Self
    where
        T: Send + Sync + 'static,
        I: Informer<T> + ?Sized + 'static,
    {
        self.register_source(source, default_queue_keys(), Some(filter))
    }

    /// Trigger a sync of every key `queue_keys` returns for a notified object.
    pub fn with_source_keys<T, I>(self, source: Arc<I>, queue_keys: QueueKeysFn<T>) -> Self
    where
        T: Send + Sync + 'static,
        I: Informer<T> + ?Sized + 'static,
    {
        self.register_source(source, queue_keys, None)
    }

    /// Combination of [`with_source_keys`](Self::with_source_keys) and
    /// [`with_filtered_source`](Self::with_filtered_source).
    pub fn with_filtered_source_keys<T, I>(
        self,
        source: Arc<I>,
        queue_keys: QueueKeysFn<T>,
        filter: EventFilter<T>,
    ) -> Self
    where
        T: Send + Sync + 'static,
        I: Informer<T> + ?Sized + 'static,
    {
        self.register_source(source, queue_keys, Some(filter))
    }

    /// Trigger the default key only for objects whose name is in `names`.
    pub fn with_named_source<T, I, F, N, S>(self, source: Arc<I>, names: N, name_of: F) -> Self
    where
        T: Send + Sync + 'static,
        I: Informer<T> + ?Sized + 'static,
        F: Fn(&T) -> &str + Send + Sync + 'static,
        N: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let filter = names_filter(names, name_of);
        self.register_source(source, default_queue_keys(), Some(filter))
    }

    /// Wait for `source` to sync before starting workers, without
    /// registering a handler. Its existing handlers are expected to enqueue
    /// keys themselves.
    pub fn with_bare_source<T, I>(mut self, source: Arc<I>) -> Self
    where
        I: Informer<T> + ?Sized + 'static,
    {
        self.readiness_probes
            .push(Arc::new(move || source.has_synced()));
        self
    }

    /// Add a readiness probe that must return `true` before workers start.
    pub fn with_readiness_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.readiness_probes.push(Arc::new(probe));
        self
    }

    /// Enqueue the default key every `interval`, starting immediately.
    /// Zero disables periodic resync.
    pub fn resync_every(mut self, interval: Duration) -> Self {
        self.resync_every = interval;
        self
    }

    /// Enqueue the default key on each cron schedule.
    ///
    /// See [`crate::schedule`] for the accepted syntax. Invalid expressions
    /// make [`build`](Self::build) fail.
    pub fn resync_schedule<I, S>(mut self, schedules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resync_schedules
            .extend(schedules.into_iter().map(Into::into));
        self
    }

    /// Run `hook` alongside the workers.
    pub fn with_post_start_hook<F, Fut>(self, hook: F) -> Self
    where
        F: Fn(CancellationToken, SyncContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.with_hook(hook)
    }

    /// Run a [`PostStartHook`] implementation alongside the workers.
    pub fn with_hook<H>(mut self, hook: H) -> Self
    where
        H: PostStartHook + 'static,
    {
        self.post_start_hooks.push(Arc::new(hook));
        self
    }

    /// Observe the outcome of every sync. A returned error panics the worker.
    pub fn with_sync_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<&anyhow::Error>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Recover panics from workers and hooks instead of propagating them.
    pub fn with_sync_panic_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(PanicPayload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.panic_handler = Some(Arc::new(handler));
        self
    }

    /// Finalize the controller.
    ///
    /// # Errors
    ///
    /// - [`ControllerError::MissingSync`] if no sync function was set
    /// - [`ControllerError::InvalidSchedules`] listing every bad schedule
    /// - [`ControllerError::SourceRegistration`] if a source rejects its
    ///   handler
    pub fn build(self, name: &str, recorder: &dyn Recorder) -> Result<Controller, ControllerError> {
        let reconciler = self.reconciler.ok_or_else(|| ControllerError::MissingSync {
            controller: name.to_string(),
        })?;

        let sync_context = match self.sync_context {
            Some(ctx) => ctx,
            None => SyncContext::with_rate_limiter(
                name,
                recorder,
                Arc::new(self.config.rate_limiter.build()),
            ),
        };

        let resync_schedules = parse_schedules(name, &self.resync_schedules)?;

        let mut readiness_probes = Vec::with_capacity(self.sources.len() + self.readiness_probes.len());
        for register in self.sources {
            let probe = register(&sync_context).map_err(|source| {
                ControllerError::SourceRegistration {
                    controller: name.to_string(),
                    source,
                }
            })?;
            readiness_probes.push(probe);
        }
        readiness_probes.extend(self.readiness_probes);

        tracing::debug!(
            controller = name,
            sources = readiness_probes.len(),
            schedules = resync_schedules.len(),
            "controller built"
        );

        Ok(Controller::new(ControllerInner {
            name: Arc::from(name),
            reconciler,
            sync_context,
            resync_every: self.resync_every,
            resync_schedules,
            readiness_probes,
            post_start_hooks: self.post_start_hooks,
            error_handler: self.error_handler,
            panic_handler: self.panic_handler,
            config: self.config,
        }))
    }

    fn register_source<T, I>(
        mut self,
        source: Arc<I>,
        queue_keys: QueueKeysFn<T>,
        filter: Option<EventFilter<T>>,
    ) -> Self
    where
        T: Send + Sync + 'static,
        I: Informer<T> + ?Sized + 'static,
    {
        self.sources.push(Box::new(move |ctx: &SyncContext| {
            source.add_event_handler(ctx.event_handler(queue_keys, filter))?;
            let probe: ReadinessProbe = Arc::new(move || source.has_synced());
            Ok(probe)
        }));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryRecorder;
    use crate::source::{EventHandler, Notification};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct StubSource {
        handlers: Mutex<Vec<Arc<dyn EventHandler<String>>>>,
        synced: AtomicBool,
        reject: bool,
    }

    impl Informer<String> for StubSource {
        fn add_event_handler(&self, handler: Arc<dyn EventHandler<String>>) -> anyhow::Result<()> {
            anyhow::ensure!(!self.reject, "source is closed");
            self.handlers.lock().push(handler);
            Ok(())
        }

        fn has_synced(&self) -> bool {
            self.synced.load(Ordering::SeqCst)
        }
    }

    impl StubSource {
        fn emit(&self, notification: Notification<String>) {
            for handler in self.handlers.lock().iter() {
                handler.on_notification(notification.clone());
            }
        }
    }

    fn noop() -> ControllerBuilder {
        ControllerBuilder::new().with_sync(|_token, _ctx| async { Ok(()) })
    }

    #[test]
    fn test_build_without_sync_fails() {
        let err = ControllerBuilder::new()
            .build("empty", &InMemoryRecorder::new("test"))
            .unwrap_err();
        assert!(matches!(err, ControllerError::MissingSync { ref controller } if controller == "empty"));
        assert!(err.to_string().contains("with_sync()"));
    }

    #[test]
    fn test_invalid_schedules_fail_before_sources_register() {
        let source = Arc::new(StubSource::default());
        let err = noop()
            .with_source(Arc::clone(&source))
            .resync_schedule(["@hourly", "bogus", "@every nope"])
            .build("sched", &InMemoryRecorder::new("test"))
            .unwrap_err();

        match err {
            ControllerError::InvalidSchedules { errors, .. } => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(source.handlers.lock().is_empty());
    }

    #[test]
    fn test_rejected_handler_fails_build() {
        let source = Arc::new(StubSource {
            reject: true,
            ..StubSource::default()
        });
        let err = noop()
            .with_source(source)
            .build("closed", &InMemoryRecorder::new("test"))
            .unwrap_err();
        assert!(matches!(err, ControllerError::SourceRegistration { .. }));
    }

    #[tokio::test]
    async fn test_sources_feed_queue_and_readiness() {
        let keyed = Arc::new(StubSource::default());
        let named = Arc::new(StubSource::default());
        let bare = Arc::new(StubSource::default());

        let controller = noop()
            .with_source_keys(Arc::clone(&keyed), Arc::new(|s: &String| vec![format!("ns/{s}")]))
            .with_named_source(Arc::clone(&named), ["wanted"], |s: &String| s.as_str())
            .with_bare_source(Arc::clone(&bare))
            .build("sources", &InMemoryRecorder::new("test"))
            .unwrap();

        keyed.emit(Notification::Added("a".to_string()));
        named.emit(Notification::Added("ignored".to_string()));
        named.emit(Notification::Deleted("wanted".to_string()));
        assert!(bare.handlers.lock().is_empty());

        let queue = controller.sync_context().queue();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await.as_deref(), Some("key"));
    }

    #[test]
    fn test_custom_sync_context_is_used() {
        let recorder = InMemoryRecorder::new("operator");
        let ctx = SyncContext::new("custom", &recorder);
        let controller = noop()
            .with_sync_context(ctx.clone())
            .build("custom", &InMemoryRecorder::new("ignored"))
            .unwrap();
        assert!(Arc::ptr_eq(controller.sync_context().queue(), ctx.queue()));
        assert_eq!(controller.sync_context().recorder().component_name(), "operator-custom");
    }
}
