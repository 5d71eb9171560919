use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Returned from a sync function to force a retry with backoff without
/// reporting an error.
///
/// The engine recognises it anywhere in the error chain, so it can be wrapped
/// with `anyhow::Context` and still be treated as a requeue request. The error
/// handler is never invoked for it.
///
/// ```ignore
/// if !dependency_ready {
///     return Err(SyntheticRequeue.into());
/// }
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Error)]
#[error("synthetic requeue request")]
pub struct SyntheticRequeue;

/// Whether `err` (or any error it wraps) is a [`SyntheticRequeue`].
pub fn is_synthetic_requeue(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<SyntheticRequeue>())
}

/// Errors surfaced by controller construction and startup.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// `build` was called before a sync function was set.
    #[error("with_sync() must be used before calling build() in {controller:?}")]
    MissingSync {
        /// Controller name.
        controller: String,
    },

    /// One or more resync schedules failed to parse.
    #[error("failed to parse controller schedules for {controller:?}: {}", join_errors(.errors))]
    InvalidSchedules {
        /// Controller name.
        controller: String,
        /// Every parse failure, in declaration order.
        errors: Vec<ScheduleError>,
    },

    /// An event source refused the controller's event handler.
    #[error("failed to register event handler for {controller:?}: {source}")]
    SourceRegistration {
        /// Controller name.
        controller: String,
        /// Error returned by the source.
        #[source]
        source: anyhow::Error,
    },

    /// Readiness probes did not all report ready before the timeout.
    #[error("unable to sync caches for {controller} within {timeout:?}")]
    ReadinessTimeout {
        /// Controller name.
        controller: String,
        /// The configured readiness timeout.
        timeout: Duration,
    },
}

/// A cron or `@every` expression that could not be parsed.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Rejected by the cron parser.
    #[error("{expression:?}: {message}")]
    Cron {
        /// The expression as supplied.
        expression: String,
        /// Parser message.
        message: String,
    },

    /// `@every` with a malformed or zero duration.
    #[error("{expression:?}: invalid @every interval: {message}")]
    Interval {
        /// The expression as supplied.
        expression: String,
        /// Parser message.
        message: String,
    },
}

fn join_errors(errors: &[ScheduleError]) -> String {
    match errors {
        [single] => single.to_string(),
        many => format!(
            "[{}]",
            many.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// A panic recovered from a worker or post-start hook.
///
/// The raw panic payload is classified once so handlers can match on it
/// instead of downcasting `Box<dyn Any>` themselves.
pub enum PanicPayload {
    /// The task panicked with an `anyhow::Error` value, e.g. an escalated
    /// error handler failure.
    Error(anyhow::Error),
    /// The task panicked with a message (`panic!("...")`).
    Message {
        /// The panic message.
        message: String,
        /// Backtrace captured where the panic was recovered; honours
        /// `RUST_BACKTRACE`.
        backtrace: Backtrace,
    },
    /// Any other payload type.
    Unknown,
}

impl PanicPayload {
    /// Classify a payload obtained from `catch_unwind` or a `JoinError`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<anyhow::Error>() {
            Ok(err) => return Self::Error(*err),
            Err(other) => other,
        };
        let payload = match payload.downcast::<String>() {
            Ok(message) => return Self::message(*message),
            Err(other) => other,
        };
        match payload.downcast::<&'static str>() {
            Ok(message) => Self::message((*message).to_string()),
            Err(_) => Self::Unknown,
        }
    }

    fn message(message: String) -> Self {
        Self::Message {
            message,
            backtrace: Backtrace::capture(),
        }
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(err) => f.debug_tuple("Error").field(err).finish(),
            Self::Message { message, .. } => f
                .debug_struct("Message")
                .field("message", message)
                .finish_non_exhaustive(),
            Self::Unknown => f.write_str("Unknown"),
        }
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(err) => write!(f, "{err:#}"),
            Self::Message { message, .. } => f.write_str(message),
            Self::Unknown => f.write_str("panic with unknown payload"),
        }
    }
}
