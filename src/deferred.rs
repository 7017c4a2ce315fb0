use std::any::Any;
use std::fmt;

use crate::engine::Engine;
use crate::error::PromiseError;
use crate::node::{NodeRef, Outcome, State};
use crate::reject::RejectReason;

/// The producing side of a promise created by [`Engine::new_pending`].
///
/// Completing consumes the deferred, so a promise is completed at most once through it. A
/// deferred that is dropped while its promise is still pending rejects it with
/// [`PromiseError::ProducerDropped`].
///
/// # Examples
///
/// ```
/// use promise_engine::Engine;
/// use std::thread;
///
/// let engine = Engine::default();
/// let (deferred, promise) = engine.new_pending::<String>();
///
/// let producer = thread::spawn(move || deferred.resolve("Hi".into()));
/// assert_eq!(promise.wait().into_result().unwrap(), "Hi");
/// producer.join().expect("The producer thread has panicked.");
/// ```
pub struct Deferred<T: Send + 'static> {
    engine: Engine,
    node: Option<NodeRef<T>>,
}

impl<T: Send + 'static> Deferred<T> {
    pub(crate) fn new(engine: Engine, node: NodeRef<T>) -> Self {
        Self {
            engine,
            node: Some(node),
        }
    }

    pub fn resolve(mut self, value: T) {
        self.complete(Outcome::Resolved(value));
    }

    pub fn reject<R>(mut self, reason: R)
    where
        R: Any + Send + Sync + fmt::Debug,
    {
        let container = self.engine.reject_container(RejectReason::new(reason));
        self.complete(Outcome::Rejected(container));
    }

    pub fn cancel(mut self) {
        self.complete(Outcome::Canceled);
    }

    /// Whether the promise is still waiting for this deferred.
    pub fn is_pending(&self) -> bool {
        self.node
            .as_ref()
            .is_some_and(|node| node.node.id() == node.id && node.state() == State::Pending)
    }

    fn complete(&mut self, outcome: Outcome<T>) {
        if let Some(node) = self.node.take() {
            node.settle(outcome);
        }
    }
}

impl<T: Send + 'static> Drop for Deferred<T> {
    fn drop(&mut self) {
        if self.node.is_some() {
            tracing::debug!("deferred dropped without completing its promise");
            let reason = RejectReason::from(PromiseError::ProducerDropped);
            let container = self.engine.reject_container(reason);
            self.complete(Outcome::Rejected(container));
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::thread;

    #[test]
    fn dropped_deferred_rejects_its_promise() {
        let engine = Engine::default();
        let (deferred, promise) = engine.new_pending::<u32>();
        let waiter = thread::spawn(move || block_on(async move { promise.await }));
        drop(deferred);

        let err = waiter.join().unwrap().into_result().unwrap_err();
        assert_eq!(
            err.reason_as::<PromiseError>(),
            Some(&PromiseError::ProducerDropped)
        );
    }

    #[test]
    fn is_pending_until_completed_elsewhere() {
        let engine = Engine::default();
        let (deferred, promise) = engine.new_pending::<u32>();
        assert!(deferred.is_pending());
        let promise = promise.wait_async(crate::SynchronousContext::shared());
        assert!(deferred.is_pending());
        deferred.cancel();
        assert_eq!(promise.wait().state(), State::Canceled);
    }

    #[test]
    fn completing_after_the_promise_is_recycled_is_harmless() {
        let engine = Engine::default();
        let (deferred, promise) = engine.new_pending::<u32>();
        let copy = Deferred::new(engine.clone(), deferred.node.clone().unwrap());
        deferred.resolve(1);
        assert_eq!(promise.wait().into_result().unwrap(), 1);
        assert!(!copy.is_pending());
        copy.resolve(2);
    }
}
