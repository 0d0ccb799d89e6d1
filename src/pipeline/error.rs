//! Fault isolation for user-supplied callbacks.
//!
//! Observers, interruption handlers and sinks are foreign code running on audio
//! or polling threads. A panic in one of them must not take the thread down.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// A callback that failed while being invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackFault {
    /// The callback panicked; carries the panic message.
    Panicked(String),
}

impl fmt::Display for CallbackFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackFault::Panicked(msg) => write!(f, "callback panicked: {}", msg),
        }
    }
}

impl std::error::Error for CallbackFault {}

/// Trait for reporting callback faults.
pub trait ErrorReporter: Send + Sync {
    /// Reports a fault raised by the callback registered under `source`.
    fn report(&self, source: &str, fault: &CallbackFault);
}

/// Reporter that logs faults with `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, source: &str, fault: &CallbackFault) {
        tracing::error!(source, "{}", fault);
    }
}

/// Shared default reporter.
pub fn log_reporter() -> Arc<dyn ErrorReporter> {
    Arc::new(LogReporter)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("unknown panic")
        .to_string()
}

/// Runs `f`, converting a panic into a reported [`CallbackFault`].
///
/// Returns `None` if `f` panicked.
pub fn invoke_guarded<R>(
    reporter: &dyn ErrorReporter,
    source: &str,
    f: impl FnOnce() -> R,
) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            reporter.report(source, &CallbackFault::Panicked(panic_message(&*payload)));
            None
        }
    }
}
