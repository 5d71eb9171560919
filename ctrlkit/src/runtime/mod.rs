/// Builder producing runnable controllers.
pub mod builder;
/// The controller engine: readiness gate, triggers, hooks and shutdown.
pub mod supervisor;
/// Worker loop and the reconcile wrapper.
mod worker;

pub use builder::ControllerBuilder;
pub use supervisor::{
    Controller, PostStartHook, Reconciler, SyncErrorHandler, SyncPanicHandler,
};
