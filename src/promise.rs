use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::context::{CancelationToken, ExecutionContext, TimerFactory};
use crate::continuation;
use crate::dispatch::{
    self, Catch, CatchCancelation, ContinueWith, Finally, FinallyWait, Immediate, Nested, Then,
};
use crate::engine::Engine;
use crate::error::{Fault, PromiseError};
use crate::node::{NodeRef, Outcome, State};
use crate::preserve::Preserved;
use crate::reject::RejectReason;
use crate::sync_wait;

/// A handle to the eventual outcome of some operation.
///
/// A `Promise` is a move-only, single-consumer handle: every chaining method takes `self` and
/// returns a new promise, so a handle can be awaited at most once. Use
/// [`preserve`](Self::preserve) to share an outcome between several consumers.
///
/// Dropping a promise without consuming it forgets it. If it is later rejected and nobody else
/// observed the rejection, the engine's [`RejectionSink`](crate::RejectionSink) hears about it.
///
/// # Examples
///
/// ```
/// use promise_engine::{Engine, Fault};
///
/// let engine = Engine::default();
/// let (deferred, promise) = engine.new_pending::<u32>();
///
/// let recovered = promise
///     .then(|v| Ok(v + 1))
///     .catch(|msg: &String| {
///         assert_eq!(msg, "boom");
///         Ok(0)
///     });
///
/// deferred.reject(String::from("boom"));
/// assert_eq!(recovered.wait().into_result().unwrap(), 0);
/// ```
#[must_use = "dropping a promise forgets it; unhandled rejections are reported"]
pub struct Promise<T: Send + 'static> {
    engine: Engine,
    // Only `None` once `into_parts` has taken the handle apart.
    source: Option<Source<T>>,
}

/// Where a promise's outcome comes from. Promises whose outcome is known up front carry it
/// inline instead of occupying a node.
pub(crate) enum Source<T> {
    Settled(Outcome<T>),
    Node(NodeRef<T>),
}

impl<T: Send + 'static> Promise<T> {
    pub(crate) fn settled(engine: Engine, outcome: Outcome<T>) -> Self {
        Self {
            engine,
            source: Some(Source::Settled(outcome)),
        }
    }

    pub(crate) fn from_node(engine: Engine, node: NodeRef<T>) -> Self {
        Self {
            engine,
            source: Some(Source::Node(node)),
        }
    }

    /// Takes the handle apart without running its `Drop` impl.
    pub(crate) fn into_parts(mut self) -> (Engine, Source<T>) {
        match self.source.take() {
            Some(source) => (self.engine.clone(), source),
            None => unreachable!("a promise handle is taken apart only once"),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The current state of the promise. A handle whose node was already disposed reports
    /// `Pending`.
    pub fn state(&self) -> State {
        match &self.source {
            Some(Source::Settled(outcome)) => outcome.state(),
            Some(Source::Node(node)) => node.state(),
            None => State::Pending,
        }
    }

    /// Runs `on_resolved` with the resolved value. Rejection and cancelation pass through.
    pub fn then<U, F>(self, on_resolved: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<U, Fault> + Send + 'static,
    {
        dispatch::dispatch(self, Then::<F, Immediate>::new(on_resolved))
    }

    /// Like [`then`](Self::then), but the callback returns a promise the result adopts.
    pub fn then_wait<U, F>(self, on_resolved: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<Promise<U>, Fault> + Send + 'static,
    {
        dispatch::dispatch(self, Then::<F, Nested>::new(on_resolved))
    }

    /// Handles rejections whose reason is an `R`.
    ///
    /// Other reasons and cancelation pass through untouched. Returning
    /// [`Fault::Rethrow`] rejects with the very same reason.
    pub fn catch<R, F>(self, on_rejected: F) -> Promise<T>
    where
        R: Any,
        F: FnOnce(&R) -> Result<T, Fault> + Send + 'static,
    {
        dispatch::dispatch(self, Catch::<R, F, Immediate>::new(on_rejected))
    }

    pub fn catch_wait<R, F>(self, on_rejected: F) -> Promise<T>
    where
        R: Any,
        F: FnOnce(&R) -> Result<Promise<T>, Fault> + Send + 'static,
    {
        dispatch::dispatch(self, Catch::<R, F, Nested>::new(on_rejected))
    }

    /// Handles every rejection.
    pub fn catch_any<F>(self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(&RejectReason) -> Result<T, Fault> + Send + 'static,
    {
        self.catch::<RejectReason, F>(on_rejected)
    }

    pub fn catch_cancelation<F>(self, on_canceled: F) -> Promise<T>
    where
        F: FnOnce() -> Result<T, Fault> + Send + 'static,
    {
        dispatch::dispatch(self, CatchCancelation::<F, Immediate>::new(on_canceled))
    }

    pub fn catch_cancelation_wait<F>(self, on_canceled: F) -> Promise<T>
    where
        F: FnOnce() -> Result<Promise<T>, Fault> + Send + 'static,
    {
        dispatch::dispatch(self, CatchCancelation::<F, Nested>::new(on_canceled))
    }

    /// Runs `f` with the outcome, whatever it is. The source's rejection counts as observed.
    pub fn continue_with<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> Result<U, Fault> + Send + 'static,
    {
        dispatch::dispatch(self, ContinueWith::<F, Immediate>::new(f))
    }

    pub fn continue_with_wait<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> Result<Promise<U>, Fault> + Send + 'static,
    {
        dispatch::dispatch(self, ContinueWith::<F, Nested>::new(f))
    }

    /// Runs `on_finally` on every outcome and then passes the original outcome on.
    ///
    /// If the callback fails, its fault replaces the original outcome, and an original
    /// rejection is reported as unhandled.
    pub fn finally<F>(self, on_finally: F) -> Promise<T>
    where
        F: FnOnce() -> Result<(), Fault> + Send + 'static,
    {
        dispatch::dispatch(self, Finally::new(on_finally))
    }

    /// Like [`finally`](Self::finally); the original outcome is held until the returned
    /// promise settles and is replaced if that promise is rejected or canceled.
    pub fn finally_wait<F>(self, on_finally: F) -> Promise<T>
    where
        F: FnOnce() -> Result<Promise<()>, Fault> + Send + 'static,
    {
        dispatch::dispatch(self, FinallyWait::new(on_finally))
    }

    /// Completes the returned promise on `context` instead of the completing thread.
    pub fn wait_async(self, context: Arc<dyn ExecutionContext>) -> Promise<T> {
        continuation::wait_async(self, context)
    }

    /// Rejects with [`PromiseError::Timeout`] unless this promise settles in time.
    ///
    /// `None` never times out. An outcome that is already known always wins.
    pub fn wait_async_timeout(self, timeout: Option<Duration>, timers: &dyn TimerFactory) -> Promise<T> {
        continuation::wait_async_timeout(self, timeout, timers)
    }

    /// Cancels the returned promise if `token` fires first.
    pub fn with_cancelation(self, token: &dyn CancelationToken) -> Promise<T> {
        continuation::with_cancelation(self, token)
    }

    /// Converts the handle into one that can be duplicated.
    pub fn preserve(self) -> Preserved<T>
    where
        T: Clone,
    {
        Preserved::new(self)
    }

    /// Gives up on the outcome without observing it.
    pub fn forget(self) {
        drop(self);
    }

    /// Blocks the calling thread until the promise settles.
    pub fn wait(self) -> Outcome<T> {
        let engine = self.engine.clone();
        // Only a deadline can end a wait without an outcome.
        self.wait_for(None).unwrap_or_else(|| {
            Outcome::Rejected(engine.reject_container(RejectReason::from(PromiseError::Timeout)))
        })
    }

    /// Blocks for at most `timeout`. Returns `None` if the promise did not settle in time; its
    /// outcome is then dropped once it arrives.
    pub fn try_wait(self, timeout: Duration) -> Option<Outcome<T>> {
        self.wait_for(Some(timeout))
    }

    fn wait_for(self, timeout: Option<Duration>) -> Option<Outcome<T>> {
        let (engine, source) = self.into_parts();
        let node = match source {
            Source::Settled(outcome) => return Some(outcome),
            Source::Node(node) => node,
        };
        match sync_wait::try_wait_for_result(&engine, node, timeout) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(%err, "invalid use of a promise handle");
                let reason = RejectReason::from(err);
                Some(Outcome::Rejected(engine.reject_container(reason)))
            }
        }
    }

    /// Settles `target` with this promise's outcome once it is known.
    pub(crate) fn forward_into(self, target: NodeRef<T>) {
        let (engine, source) = self.into_parts();
        match source {
            Source::Settled(outcome) => target.settle(outcome),
            Source::Node(node) => continuation::adopt(&engine, node, target),
        }
    }
}

impl<T: Send + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(Source::Node(node)) = &self.source {
            if let Err(err) = node.forget() {
                tracing::warn!(id = node.id, %err, "failed to forget promise");
            }
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reject::tests::RecordingSink;
    use crate::Config;

    #[test]
    fn forgotten_pending_rejection_is_reported() {
        let sink = Arc::new(RecordingSink::default());
        let engine = Engine::with_rejection_sink(Config::default(), sink.clone());
        let (deferred, promise) = engine.new_pending::<u32>();
        promise.forget();
        assert!(sink.reported().is_empty());
        deferred.reject("nobody listens");
        assert_eq!(sink.reported().len(), 1);
    }

    #[test]
    fn forgotten_resolution_recycles_the_node() {
        let engine = Engine::default();
        let (deferred, promise) = engine.new_pending::<u32>();
        drop(promise);
        deferred.resolve(1);
        let (_again, reused) = engine.new_pending::<u32>();
        assert_eq!(reused.state(), State::Pending);
        assert_eq!(engine.pool_stats().reused, 1);
    }

    #[test]
    fn state_tracks_the_node() {
        let engine = Engine::default();
        let (deferred, promise) = engine.new_pending::<u32>();
        assert_eq!(promise.state(), State::Pending);
        deferred.cancel();
        assert_eq!(promise.state(), State::Canceled);
        assert_eq!(promise.wait().state(), State::Canceled);
    }

    #[test]
    fn debug_shows_the_state() {
        let engine = Engine::default();
        assert_eq!(
            format!("{:?}", engine.resolved(1)),
            "Promise { state: Resolved, .. }"
        );
    }
}
