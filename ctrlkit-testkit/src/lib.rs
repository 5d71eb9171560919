//! Test doubles for ctrlkit controllers.
//!
//! - [`FakeSource`] - an in-memory [`Informer`](ctrlkit::Informer) whose
//!   notifications and sync state are driven by the test
//! - [`RecordingReconciler`] - a reconciler that records every call and
//!   returns scripted outcomes
//! - [`TestObject`] - a namespaced object for sources to carry

mod mock;
mod object;
mod source;

pub use mock::*;
pub use object::*;
pub use source::*;
