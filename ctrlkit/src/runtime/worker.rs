use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level};

use crate::context::SyncContext;
use crate::error::is_synthetic_requeue;
use crate::queue::WorkQueue;
use crate::source::DEFAULT_QUEUE_KEY;
use crate::telemetry;

use super::supervisor::ControllerInner;

/// Marks a key done when dropped, including while unwinding from a panic.
struct ProcessingGuard<'a> {
    queue: &'a WorkQueue,
    key: &'a str,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

/// Worker loop: process keys until `token` is cancelled or the queue is
/// drained after shutdown.
///
/// A panic ends the current iteration. With a panic handler the worker
/// restarts after the configured restart period; without one the panic
/// escapes the task.
pub(crate) async fn run_worker(controller: Arc<ControllerInner>, index: usize, token: CancellationToken) {
    let span = telemetry::controller_worker_span(&controller.name, index);

    async {
        loop {
            let iteration = AssertUnwindSafe(process_until_stopped(&controller, &token))
                .catch_unwind()
                .await;

            let payload = match iteration {
                Ok(()) => break,
                Err(payload) => payload,
            };

            telemetry::record_panic(&controller.name);
            if controller.panic_handler.is_none() {
                resume_unwind(payload);
            }
            controller.recover(payload);

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(controller.config.worker_restart_period()) => {
                    tracing::debug!(controller = %controller.name, worker = index, "restarting worker after panic");
                }
            }
        }
        tracing::info!(controller = %controller.name, worker = index, "shutting down worker");
    }
    .instrument(span)
    .await;
}

async fn process_until_stopped(controller: &ControllerInner, token: &CancellationToken) {
    let queue = controller.sync_context.queue();
    loop {
        let key = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            key = queue.get() => key,
        };
        let Some(key) = key else {
            return;
        };
        process_next_work_item(controller, token, key).await;
    }
}

async fn process_next_work_item(controller: &ControllerInner, token: &CancellationToken, key: String) {
    let queue = controller.sync_context.queue();
    let _guard = ProcessingGuard {
        queue,
        key: &key,
    };

    let timer = telemetry::record_sync_start(&key);
    let ctx = controller.sync_context.with_queue_key(key.as_str());
    let result = reconcile(controller, token.clone(), ctx).await;

    match result {
        Ok(()) => {
            telemetry::record_sync_end(timer, &controller.name, "success");
            queue.forget(&key);
        }
        Err(err) if is_synthetic_requeue(&err) => {
            telemetry::record_sync_end(timer, &controller.name, "requeue");
            tracing::trace!(controller = %controller.name, key = %key, "controller requested synthetic requeue");
            telemetry::record_requeue(&controller.name, "synthetic");
            queue.add_rate_limited(&key);
        }
        Err(err) => {
            telemetry::record_sync_end(timer, &controller.name, "error");
            if key != DEFAULT_QUEUE_KEY || tracing::enabled!(Level::DEBUG) {
                tracing::error!(
                    controller = %controller.name,
                    key = %key,
                    error = %format!("{err:#}"),
                    "controller failed to sync key"
                );
            } else {
                tracing::error!(
                    controller = %controller.name,
                    error = %format!("{err:#}"),
                    "reconciliation failed"
                );
            }
            telemetry::record_requeue(&controller.name, "error");
            queue.add_rate_limited(&key);
        }
    }
}

/// Run the reconciler for one key and apply the error handler.
///
/// The handler is skipped for synthetic requeues and otherwise sees every
/// outcome, including success. A failing handler panics with its error.
pub(crate) async fn reconcile(
    controller: &ControllerInner,
    token: CancellationToken,
    ctx: SyncContext,
) -> anyhow::Result<()> {
    let key = ctx.queue_key().to_string();
    let result = telemetry::instrument_sync(
        &controller.name,
        &key,
        controller.reconciler.sync(token, ctx),
    )
    .await;

    if matches!(&result, Err(err) if is_synthetic_requeue(err)) {
        return result;
    }

    if let Some(handler) = &controller.error_handler {
        if let Err(handler_err) = handler(result.as_ref().err()) {
            tracing::error!(
                controller = %controller.name,
                key = %key,
                error = %format!("{handler_err:#}"),
                "sync error handler failed"
            );
            std::panic::panic_any(handler_err);
        }
    }

    result
}
