//! Host-provided seams: where callbacks run, how timers fire and how cancelation is signalled.
//!
//! The engine never spawns threads or owns a clock of its own. Everything that depends on the
//! surrounding runtime is reached through the traits in this module.

use std::sync::Arc;
use std::time::Duration;

/// Work posted to an [`ExecutionContext`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere a callback can be scheduled to run.
pub trait ExecutionContext: Send + Sync {
    /// Queues `job` to run on this context at some later point.
    fn post(&self, job: Job);

    /// Whether work bound for this context may simply run on the calling thread instead of
    /// being posted.
    fn should_continue_immediately(&self) -> bool {
        false
    }
}

/// Runs everything inline on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SynchronousContext;

impl SynchronousContext {
    pub fn shared() -> Arc<dyn ExecutionContext> {
        Arc::new(SynchronousContext)
    }
}

impl ExecutionContext for SynchronousContext {
    fn post(&self, job: Job) {
        job();
    }

    fn should_continue_immediately(&self) -> bool {
        true
    }
}

/// A cooperative cancelation signal.
pub trait CancelationToken {
    fn is_cancelation_requested(&self) -> bool;

    /// Tokens that can never fire let [`Promise::with_cancelation`](crate::Promise::with_cancelation)
    /// skip registration entirely.
    fn can_be_canceled(&self) -> bool {
        true
    }

    /// Runs `callback` once cancelation is requested. Tokens that are already canceled may run
    /// it immediately.
    fn register(&self, callback: Job) -> Box<dyn Registration>;
}

/// A callback registered with a [`CancelationToken`].
pub trait Registration: Send {
    /// Drops the callback if it has not run yet.
    fn unregister(&self);
}

/// Schedules one-shot timer callbacks.
pub trait TimerFactory {
    fn schedule_once(&self, delay: Duration, callback: Job) -> Box<dyn TimerHandle>;
}

pub trait TimerHandle: Send {
    /// Prevents the callback from running if it has not fired yet.
    fn cancel(&self);
}
