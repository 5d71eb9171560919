//! Event sources and the default mapping from notifications to work keys.
//!
//! Sources themselves live outside this crate; they are consumed through the
//! [`Informer`] trait. A controller registers one [`EventHandler`] per
//! source and polls [`Informer::has_synced`] before starting its workers.

use std::collections::HashSet;
use std::sync::Arc;

use crate::context::SyncContext;

/// Queue key used by periodic and cron triggers and by sources registered
/// without a key function.
pub const DEFAULT_QUEUE_KEY: &str = "key";

/// A change observed by an event source.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification<T> {
    /// The object was created or first observed.
    Added(T),
    /// The object changed.
    Updated {
        /// Previous state.
        old: T,
        /// Current state.
        new: T,
    },
    /// The object was deleted.
    Deleted(T),
    /// The deletion was missed; `T` is the last state known to the source.
    DeletedFinalStateUnknown(T),
}

/// Receives notifications from a source.
pub trait EventHandler<T>: Send + Sync {
    fn on_notification(&self, notification: Notification<T>);
}

/// An event source: something that delivers notifications and knows when
/// its initial listing is complete.
pub trait Informer<T>: Send + Sync {
    /// Register `handler` for all future notifications.
    fn add_event_handler(&self, handler: Arc<dyn EventHandler<T>>) -> anyhow::Result<()>;

    /// Whether the initial state has been delivered.
    fn has_synced(&self) -> bool;
}

/// Readiness check polled before workers start.
pub type ReadinessProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Maps an object to the queue keys it should trigger.
pub type QueueKeysFn<T> = Arc<dyn Fn(&T) -> Vec<String> + Send + Sync>;

/// Decides whether an object is interesting to the controller.
pub type EventFilter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Key function that maps every object to [`DEFAULT_QUEUE_KEY`].
pub fn default_queue_keys<T: 'static>() -> QueueKeysFn<T> {
    Arc::new(|_: &T| vec![DEFAULT_QUEUE_KEY.to_string()])
}

/// Filter accepting objects whose name (as extracted by `name_of`) is one of
/// `names`.
pub fn names_filter<T, F, I, S>(names: I, name_of: F) -> EventFilter<T>
where
    T: 'static,
    F: Fn(&T) -> &str + Send + Sync + 'static,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let names: HashSet<String> = names.into_iter().map(Into::into).collect();
    Arc::new(move |obj: &T| names.contains(name_of(obj)))
}

/// The default handler: filter, extract keys, enqueue.
pub struct QueueKeyHandler<T> {
    ctx: SyncContext,
    queue_keys: QueueKeysFn<T>,
    filter: Option<EventFilter<T>>,
}

impl<T> QueueKeyHandler<T> {
    pub fn new(ctx: SyncContext, queue_keys: QueueKeysFn<T>, filter: Option<EventFilter<T>>) -> Self {
        Self {
            ctx,
            queue_keys,
            filter,
        }
    }

    fn passes(&self, obj: &T) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(obj))
    }

    fn enqueue(&self, obj: &T) {
        self.ctx.enqueue_keys((self.queue_keys)(obj));
    }
}

impl<T: Send + Sync> EventHandler<T> for QueueKeyHandler<T> {
    fn on_notification(&self, notification: Notification<T>) {
        match notification {
            Notification::Added(obj)
            | Notification::Deleted(obj)
            | Notification::DeletedFinalStateUnknown(obj) => {
                if self.passes(&obj) {
                    self.enqueue(&obj);
                }
            }
            // An update that leaves the filter behaves like an add or delete
            // of whichever side still matches.
            Notification::Updated { old, new } => {
                if self.passes(&new) {
                    self.enqueue(&new);
                } else if self.passes(&old) {
                    self.enqueue(&old);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryRecorder;

    #[derive(Clone, Debug, PartialEq)]
    struct Obj {
        namespace: &'static str,
        name: &'static str,
    }

    fn obj(namespace: &'static str, name: &'static str) -> Obj {
        Obj { namespace, name }
    }

    fn ctx() -> SyncContext {
        SyncContext::new("test", &InMemoryRecorder::new("test"))
    }

    async fn drain(ctx: &SyncContext) -> Vec<String> {
        let mut keys = Vec::new();
        while !ctx.queue().is_empty() {
            let key = ctx.queue().get().await.unwrap();
            ctx.queue().done(&key);
            keys.push(key);
        }
        keys
    }

    #[tokio::test]
    async fn test_default_keys_collapse_to_sentinel() {
        let ctx = ctx();
        let handler = ctx.event_handler(default_queue_keys::<Obj>(), None);
        handler.on_notification(Notification::Added(obj("a", "one")));
        handler.on_notification(Notification::Deleted(obj("b", "two")));
        assert_eq!(drain(&ctx).await, vec![DEFAULT_QUEUE_KEY.to_string()]);
    }

    #[tokio::test]
    async fn test_custom_keys_and_tombstones() {
        let ctx = ctx();
        let keys: QueueKeysFn<Obj> =
            Arc::new(|o: &Obj| vec![format!("{}/{}", o.namespace, o.name)]);
        let handler = ctx.event_handler(keys, None);
        handler.on_notification(Notification::Added(obj("a", "one")));
        handler.on_notification(Notification::DeletedFinalStateUnknown(obj("b", "two")));
        assert_eq!(drain(&ctx).await, vec!["a/one".to_string(), "b/two".to_string()]);
    }

    #[tokio::test]
    async fn test_filtered_updates_follow_matching_side() {
        let ctx = ctx();
        let keys: QueueKeysFn<Obj> = Arc::new(|o: &Obj| vec![o.name.to_string()]);
        let filter = names_filter(["wanted"], |o: &Obj| o.name);
        let handler = ctx.event_handler(keys, Some(filter));

        handler.on_notification(Notification::Added(obj("x", "ignored")));
        assert!(drain(&ctx).await.is_empty());

        handler.on_notification(Notification::Updated {
            old: obj("x", "wanted"),
            new: obj("x", "renamed"),
        });
        assert_eq!(drain(&ctx).await, vec!["wanted".to_string()]);

        handler.on_notification(Notification::Updated {
            old: obj("x", "other"),
            new: obj("x", "wanted"),
        });
        assert_eq!(drain(&ctx).await, vec!["wanted".to_string()]);

        handler.on_notification(Notification::Updated {
            old: obj("x", "a"),
            new: obj("x", "b"),
        });
        assert!(drain(&ctx).await.is_empty());
    }
}
