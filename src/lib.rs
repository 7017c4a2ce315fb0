//! A pooled promise state machine with typed continuations.
//!
//! An [`Engine`] hands out [`Promise`]s. A promise is a move-only handle to an outcome that is
//! either resolved with a value, rejected with a [`RejectReason`], or canceled. Callbacks are
//! chained with [`then`](Promise::then), [`catch`](Promise::catch),
//! [`continue_with`](Promise::continue_with), [`finally`](Promise::finally) and their `_wait`
//! variants, which adopt a promise returned by the callback.
//!
//! Pending promises are backed by pooled nodes that are recycled once their outcome has been
//! handed on. Rejections that nobody observes are reported to the engine's [`RejectionSink`].
//!
//! ```
//! use promise_engine::{Engine, Fault};
//! use std::thread;
//!
//! let engine = Engine::default();
//! let (deferred, promise) = engine.new_pending::<u32>();
//!
//! let result = promise
//!     .then(|v| if v > 10 { Ok(v) } else { Err(Fault::reject("too small")) })
//!     .catch_any(|_| Ok(10));
//!
//! thread::spawn(move || deferred.resolve(3));
//! assert_eq!(result.wait().into_result().unwrap(), 10);
//! ```

mod config;
mod context;
mod continuation;
mod deferred;
mod dispatch;
mod engine;
mod error;
mod future;
mod node;
mod pool;
mod preserve;
mod promise;
mod reject;
mod sync_wait;
#[cfg(test)]
mod test_util;
mod util;

pub use config::Config;
pub use context::{
    CancelationToken, ExecutionContext, Job, Registration, SynchronousContext, TimerFactory,
    TimerHandle,
};
pub use deferred::Deferred;
pub use engine::Engine;
pub use error::{Fault, PromiseError, Rejection};
pub use future::PromiseFuture;
pub use node::{Outcome, State};
pub use pool::PoolStats;
pub use preserve::Preserved;
pub use promise::Promise;
pub use reject::{RejectContainer, RejectReason, RejectionSink, TracingSink};
