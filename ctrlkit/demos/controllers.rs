//! Runs a handful of controllers side by side until Ctrl-C.
//!
//! - `simple` resyncs every second and records a warning event per sync
//! - `error-handling` fails on even attempts and is retried with backoff
//! - `scheduled` is driven by an `@every` cron schedule and counts its runs
//! - `objects` syncs keys delivered by an in-memory source
//!
//! ```bash
//! RUST_LOG=info,ctrlkit=debug cargo run --example controllers
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ctrlkit::*;
use ctrlkit_testkit::{FakeSource, TestObject};
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Fails every other attempt, so each resync is retried once.
#[derive(Default)]
struct ErrorHandling {
    attempts: AtomicU64,
}

#[async_trait]
impl Reconciler for ErrorHandling {
    async fn sync(&self, _token: CancellationToken, ctx: SyncContext) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt % 2 == 0 {
            anyhow::bail!("attempt {attempt} is even, will retry until odd");
        }
        ctx.recorder()
            .warning("OddAttempt", &format!("attempt {attempt} succeeded"));
        Ok(())
    }
}

fn simple(recorder: &dyn Recorder) -> Result<Controller, ControllerError> {
    Controller::builder()
        .with_sync(|_token, ctx: SyncContext| async move {
            ctx.recorder().warning("SimpleReconciled", "reconciling done");
            Ok(())
        })
        .resync_every(Duration::from_secs(1))
        .build("simple", recorder)
}

fn error_handling(recorder: &dyn Recorder) -> Result<Controller, ControllerError> {
    Controller::builder()
        .with_reconciler(ErrorHandling::default())
        .with_sync_error_handler(|err| {
            if let Some(err) = err {
                tracing::info!(error = %err, "error handler observed a failed sync");
            }
            Ok(())
        })
        .resync_schedule(["@every 5s"])
        .build("error-handling", recorder)
}

fn scheduled(recorder: &dyn Recorder) -> Result<Controller, ControllerError> {
    let runs = Arc::new(AtomicU64::new(0));
    Controller::builder()
        .with_sync(move |_token, ctx: SyncContext| {
            let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                tracing::info!(controller = ctx.name(), run, "scheduled sync");
                Ok(())
            }
        })
        .resync_schedule(["@every 2s", "*/1 * * * *"])
        .build("scheduled", recorder)
}

fn objects(
    recorder: &dyn Recorder,
    source: &Arc<FakeSource<TestObject>>,
) -> Result<Controller, ControllerError> {
    Controller::builder()
        .with_sync(|_token, ctx: SyncContext| async move {
            tracing::info!(key = ctx.queue_key(), "object reconciled");
            Ok(())
        })
        .with_source_keys(Arc::clone(source), TestObject::queue_keys())
        .with_post_start_hook(|token: CancellationToken, ctx: SyncContext| async move {
            ctx.recorder().event("ObjectsStarted", "post start hook running");
            token.cancelled().await;
            Ok(())
        })
        .build("objects", recorder)
}

/// Feed the source with objects until shutdown.
async fn produce(source: Arc<FakeSource<TestObject>>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_millis(750));
    let mut generation = 0_u64;
    // Readiness is reported after a short delay, like a cache warming up.
    tokio::time::sleep(Duration::from_millis(500)).await;
    source.mark_synced();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tick.tick() => {
                generation += 1;
                let obj = TestObject::new("demo", format!("object-{}", generation % 3));
                if generation % 5 == 0 {
                    source.delete(obj);
                } else {
                    source.add(obj);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let recorder = TracingRecorder::new("demo-operator");
    let source = Arc::new(FakeSource::new());

    let controllers = vec![
        simple(&recorder)?,
        error_handling(&recorder)?,
        scheduled(&recorder)?,
        objects(&recorder, &source)?,
    ];

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for controller in controllers {
        let shutdown = shutdown.clone();
        tasks.spawn(async move { controller.run(shutdown, 1).await });
    }
    tokio::spawn(produce(Arc::clone(&source), shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    shutdown.cancel();

    while let Some(joined) = tasks.join_next().await {
        joined??;
    }
    tracing::info!("all controllers stopped");
    Ok(())
}
