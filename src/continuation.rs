//! Pooled waiters that sit between a source node and the node they drive.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::context::{CancelationToken, ExecutionContext, Registration, TimerFactory, TimerHandle};
use crate::dispatch::{self, Callback};
use crate::engine::Engine;
use crate::error::PromiseError;
use crate::node::{NodeRef, Outcome, Waiter};
use crate::pool::{self, Pool, Poolable};
use crate::promise::{Promise, Source};
use crate::reject::RejectReason;
use crate::util::lock;

fn rejected_with<T>(engine: &Engine, err: PromiseError) -> Outcome<T> {
    Outcome::Rejected(engine.reject_container(RejectReason::from(err)))
}

struct Armed<T, C> {
    engine: Engine,
    target: NodeRef<T>,
    callback: C,
}

/// Runs a delegate when its source completes and settles the target with the result.
pub(crate) struct ContinuationNode<S, T, C> {
    armed: Mutex<Option<Armed<T, C>>>,
    pool: Weak<Pool<Self>>,
    _source: PhantomData<fn(S)>,
}

impl<S, T, C> Poolable for ContinuationNode<S, T, C>
where
    S: Send + 'static,
    T: Send + 'static,
    C: Callback<S, T>,
{
    fn create(pool: Weak<Pool<Self>>) -> Self {
        Self {
            armed: Mutex::new(None),
            pool,
            _source: PhantomData,
        }
    }

    fn pool(&self) -> &Weak<Pool<Self>> {
        &self.pool
    }
}

impl<S, T, C> ContinuationNode<S, T, C>
where
    S: Send + 'static,
    T: Send + 'static,
    C: Callback<S, T>,
{
    pub(crate) fn arm(&self, engine: Engine, target: NodeRef<T>, callback: C) {
        *lock(&self.armed) = Some(Armed {
            engine,
            target,
            callback,
        });
    }

    /// The subscription failed; the callback never runs and the target carries the error.
    pub(crate) fn fail(self: Arc<Self>, err: PromiseError) {
        let armed = lock(&self.armed).take();
        pool::recycle(self);
        if let Some(Armed { engine, target, .. }) = armed {
            target.settle(rejected_with(&engine, err));
        }
    }
}

impl<S, T, C> Waiter<S> for ContinuationNode<S, T, C>
where
    S: Send + 'static,
    T: Send + 'static,
    C: Callback<S, T>,
{
    fn handle(self: Arc<Self>, outcome: Outcome<S>) {
        let armed = lock(&self.armed).take();
        pool::recycle(self);
        match armed {
            Some(Armed {
                engine,
                target,
                callback,
            }) => callback.invoke(outcome, &engine).settle_into(&engine, target),
            None => tracing::warn!("continuation completed without being armed"),
        }
    }
}

/// Keeps the original outcome of a `finally_wait` until the promise its callback returned
/// completes.
pub(crate) struct FinallyWaitNode<T> {
    held: Mutex<Option<(Outcome<T>, NodeRef<T>)>>,
    pool: Weak<Pool<Self>>,
}

impl<T: Send + 'static> Poolable for FinallyWaitNode<T> {
    fn create(pool: Weak<Pool<Self>>) -> Self {
        Self {
            held: Mutex::new(None),
            pool,
        }
    }

    fn pool(&self) -> &Weak<Pool<Self>> {
        &self.pool
    }
}

impl<T: Send + 'static> Waiter<()> for FinallyWaitNode<T> {
    fn handle(self: Arc<Self>, nested: Outcome<()>) {
        let held = lock(&self.held).take();
        pool::recycle(self);
        if let Some((original, target)) = held {
            target.settle(finally_outcome(original, nested));
        }
    }
}

/// The outcome of a `finally_wait` once its nested promise completed: the original, unless the
/// nested promise was rejected or canceled.
pub(crate) fn finally_outcome<T>(original: Outcome<T>, nested: Outcome<()>) -> Outcome<T> {
    match nested {
        Outcome::Resolved(()) => original,
        Outcome::Rejected(container) => Outcome::Rejected(container),
        Outcome::Canceled => Outcome::Canceled,
    }
}

pub(crate) fn hold_finally<T: Send + 'static>(
    engine: &Engine,
    original: Outcome<T>,
    nested: Promise<()>,
    target: NodeRef<T>,
) {
    let (_, nested) = nested.into_parts();
    let node = match nested {
        Source::Settled(outcome) => return target.settle(finally_outcome(original, outcome)),
        Source::Node(node) => node,
    };

    let holder = engine.pool::<FinallyWaitNode<T>>().get_or_create();
    *lock(&holder.held) = Some((original, target));
    if let Err(err) = node.subscribe(holder.clone()) {
        let held = lock(&holder.held).take();
        pool::recycle(holder);
        if let Some((_, target)) = held {
            target.settle(rejected_with(engine, err));
        }
    }
}

/// Settles the adopting node with the nested outcome, under the id it had when it adopted.
pub(crate) struct AdoptionNode<T> {
    target: Mutex<Option<NodeRef<T>>>,
    pool: Weak<Pool<Self>>,
}

impl<T: Send + 'static> Poolable for AdoptionNode<T> {
    fn create(pool: Weak<Pool<Self>>) -> Self {
        Self {
            target: Mutex::new(None),
            pool,
        }
    }

    fn pool(&self) -> &Weak<Pool<Self>> {
        &self.pool
    }
}

impl<T: Send + 'static> Waiter<T> for AdoptionNode<T> {
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        let target = lock(&self.target).take();
        pool::recycle(self);
        if let Some(target) = target {
            target.settle(outcome);
        }
    }
}

pub(crate) fn adopt<T: Send + 'static>(engine: &Engine, source: NodeRef<T>, target: NodeRef<T>) {
    let adoption = engine.pool::<AdoptionNode<T>>().get_or_create();
    *lock(&adoption.target) = Some(target);
    if let Err(err) = source.subscribe(adoption.clone()) {
        let target = lock(&adoption.target).take();
        pool::recycle(adoption);
        if let Some(target) = target {
            target.settle(rejected_with(engine, err));
        }
    }
}

/// Delivers an outcome on a particular execution context.
pub(crate) struct ConfiguredNode<T> {
    armed: Mutex<Option<(Arc<dyn ExecutionContext>, NodeRef<T>)>>,
    pool: Weak<Pool<Self>>,
}

impl<T: Send + 'static> Poolable for ConfiguredNode<T> {
    fn create(pool: Weak<Pool<Self>>) -> Self {
        Self {
            armed: Mutex::new(None),
            pool,
        }
    }

    fn pool(&self) -> &Weak<Pool<Self>> {
        &self.pool
    }
}

impl<T: Send + 'static> Waiter<T> for ConfiguredNode<T> {
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        let armed = lock(&self.armed).take();
        pool::recycle(self);
        if let Some((context, target)) = armed {
            deliver(&context, target, outcome);
        }
    }
}

fn deliver<T: Send + 'static>(
    context: &Arc<dyn ExecutionContext>,
    target: NodeRef<T>,
    outcome: Outcome<T>,
) {
    if context.should_continue_immediately() {
        target.settle(outcome);
    } else {
        context.post(Box::new(move || target.settle(outcome)));
    }
}

pub(crate) fn wait_async<T: Send + 'static>(
    promise: Promise<T>,
    context: Arc<dyn ExecutionContext>,
) -> Promise<T> {
    let (engine, source) = promise.into_parts();
    let node = match source {
        Source::Settled(outcome) => return on_context(engine, &context, outcome),
        Source::Node(node) => node,
    };
    match node.take() {
        Ok(Some(outcome)) => on_context(engine, &context, outcome),
        Ok(None) => {
            let target = engine.node::<T>();
            let configured = engine.pool::<ConfiguredNode<T>>().get_or_create();
            *lock(&configured.armed) = Some((context, target.clone()));
            if let Err(err) = node.subscribe(configured.clone()) {
                *lock(&configured.armed) = None;
                pool::recycle(configured);
                target.settle(rejected_with(&engine, err));
            }
            Promise::from_node(engine, target)
        }
        Err(err) => dispatch::usage_error(&engine, err),
    }
}

fn on_context<T: Send + 'static>(
    engine: Engine,
    context: &Arc<dyn ExecutionContext>,
    outcome: Outcome<T>,
) -> Promise<T> {
    if context.should_continue_immediately() {
        return Promise::settled(engine, outcome);
    }
    let target = engine.node::<T>();
    deliver(context, target.clone(), outcome);
    Promise::from_node(engine, target)
}

struct Race<T> {
    target: NodeRef<T>,
    rival: Rival,
}

/// Whatever the source races against, released once the race is decided.
enum Rival {
    Timer(Box<dyn TimerHandle>),
    Token(Box<dyn Registration>),
}

impl Rival {
    fn release(self) {
        match self {
            Rival::Timer(timer) => timer.cancel(),
            Rival::Token(registration) => registration.unregister(),
        }
    }
}

/// Forwards the source outcome unless a timer or cancelation settled the target first.
pub(crate) struct RaceNode<T> {
    armed: Mutex<Option<Race<T>>>,
    pool: Weak<Pool<Self>>,
}

impl<T: Send + 'static> Poolable for RaceNode<T> {
    fn create(pool: Weak<Pool<Self>>) -> Self {
        Self {
            armed: Mutex::new(None),
            pool,
        }
    }

    fn pool(&self) -> &Weak<Pool<Self>> {
        &self.pool
    }
}

impl<T: Send + 'static> Waiter<T> for RaceNode<T> {
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        let armed = lock(&self.armed).take();
        pool::recycle(self);
        let Some(Race { target, rival }) = armed else {
            return;
        };
        rival.release();
        if let Err(lost) = target.try_settle(outcome) {
            tracing::trace!(state = ?lost.state(), "source completed after the race was decided");
        }
    }
}

/// Splits off a still pending source. A source whose outcome is already known comes back as a
/// settled promise.
fn pending_node<T: Send + 'static>(
    promise: Promise<T>,
) -> Result<(Engine, NodeRef<T>), Promise<T>> {
    let (engine, source) = promise.into_parts();
    match source {
        Source::Settled(outcome) => Err(Promise::settled(engine, outcome)),
        Source::Node(node) => match node.take() {
            Ok(Some(outcome)) => Err(Promise::settled(engine, outcome)),
            Ok(None) => Ok((engine, node)),
            Err(err) => Err(dispatch::usage_error(&engine, err)),
        },
    }
}

fn race<T: Send + 'static>(
    engine: Engine,
    source: NodeRef<T>,
    target: NodeRef<T>,
    rival: Rival,
) -> Promise<T> {
    let racer = engine.pool::<RaceNode<T>>().get_or_create();
    *lock(&racer.armed) = Some(Race {
        target: target.clone(),
        rival,
    });
    if let Err(err) = source.subscribe(racer.clone()) {
        let armed = lock(&racer.armed).take();
        if let Some(Race { rival, .. }) = armed {
            rival.release();
        }
        pool::recycle(racer);
        if let Err(lost) = target.try_settle(rejected_with(&engine, err)) {
            lost.suppress();
        }
    }
    Promise::from_node(engine, target)
}

/// Rejects with [`PromiseError::Timeout`] unless the source settles within `timeout`.
///
/// `None` waits forever and returns the source as is. A source that has already completed
/// wins over any timeout, including a zero one.
pub(crate) fn wait_async_timeout<T: Send + 'static>(
    promise: Promise<T>,
    timeout: Option<Duration>,
    timers: &dyn TimerFactory,
) -> Promise<T> {
    let Some(timeout) = timeout else {
        return promise;
    };
    let (engine, source) = match pending_node(promise) {
        Ok(pending) => pending,
        Err(known) => return known,
    };

    if timeout.is_zero() {
        if let Err(err) = source.forget() {
            tracing::warn!(%err, "failed to release a timed out promise");
        }
        return Promise::settled(engine.clone(), rejected_with(&engine, PromiseError::Timeout));
    }

    let target = engine.node::<T>();
    let timer = {
        let engine = engine.clone();
        let target = target.clone();
        timers.schedule_once(
            timeout,
            Box::new(move || {
                tracing::debug!(?timeout, "promise timed out");
                if let Err(lost) = target.try_settle(rejected_with(&engine, PromiseError::Timeout)) {
                    lost.suppress();
                }
            }),
        )
    };
    race(engine, source, target, Rival::Timer(timer))
}

/// Cancels the returned promise when `token` fires before the source settles.
pub(crate) fn with_cancelation<T: Send + 'static>(
    promise: Promise<T>,
    token: &dyn CancelationToken,
) -> Promise<T> {
    if !token.can_be_canceled() {
        return promise;
    }
    if token.is_cancelation_requested() {
        let engine = promise.engine().clone();
        drop(promise);
        return engine.canceled();
    }
    let (engine, source) = match pending_node(promise) {
        Ok(pending) => pending,
        Err(known) => return known,
    };

    let target = engine.node::<T>();
    let registration = {
        let target = target.clone();
        token.register(Box::new(move || {
            // A lost race here means the source already won.
            let _ = target.try_settle(Outcome::Canceled);
        }))
    };
    race(engine, source, target, Rival::Token(registration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reject::tests::RecordingSink;
    use crate::test_util::{FlagToken, ManualTimer, QueueContext};
    use crate::{Config, Fault, State};

    fn recording_engine() -> (Engine, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (Engine::with_rejection_sink(Config::default(), sink.clone()), sink)
    }

    #[test]
    fn continuation_nodes_are_reused() {
        let engine = Engine::default();
        for i in 0..3 {
            let (deferred, promise) = engine.new_pending::<u32>();
            let chained = promise.then(|v| Ok(v + 1));
            deferred.resolve(i);
            assert_eq!(chained.wait().into_result().unwrap(), i + 1);
        }
        let stats = engine.pool_stats();
        // A source node, a target node and a continuation for the first round only.
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.reused, 6);
    }

    #[test]
    fn finally_wait_holds_the_original_until_the_nested_promise_settles() {
        let engine = Engine::default();
        let (cleanup, nested) = engine.new_pending::<()>();
        let promise = engine.resolved(1).finally_wait(move || Ok(nested));
        assert_eq!(promise.state(), State::Pending);
        cleanup.resolve(());
        assert_eq!(promise.wait().into_result().unwrap(), 1);
    }

    #[test]
    fn finally_wait_takes_the_nested_failure() {
        let (engine, sink) = recording_engine();
        let nested = engine.canceled::<()>();
        let outcome = engine
            .rejected::<u32, _>("original")
            .finally_wait(move || Ok(nested))
            .wait();
        assert_eq!(outcome.state(), State::Canceled);
        assert_eq!(sink.reported().len(), 1);
    }

    #[test]
    fn stale_adoption_does_not_reach_a_reused_node() {
        let engine = Engine::default();
        let (deferred, nested) = engine.new_pending::<u32>();
        let target = engine.node::<u32>();
        nested.forward_into(target.clone());

        // The target completes on its own and goes back to the pool.
        target.settle(Outcome::Resolved(1));
        assert_eq!(target.take().unwrap().unwrap().into_result().unwrap(), 1);
        let fresh = engine.node::<u32>();
        assert!(Arc::ptr_eq(&fresh.node, &target.node));

        deferred.resolve(2);
        assert_eq!(fresh.state(), State::Pending);
        assert_eq!(engine.pool::<AdoptionNode<u32>>().idle(), 1);
    }

    #[test]
    fn wait_async_posts_to_the_context() {
        let engine = Engine::default();
        let queue = QueueContext::new();
        let (deferred, promise) = engine.new_pending::<u32>();
        let moved = promise.wait_async(queue.clone());

        deferred.resolve(4);
        assert_eq!(moved.state(), State::Pending);
        assert_eq!(queue.drain(), 1);
        assert_eq!(moved.wait().into_result().unwrap(), 4);
    }

    #[test]
    fn wait_async_on_a_settled_promise_still_posts() {
        let engine = Engine::default();
        let queue = QueueContext::new();
        let moved = engine.resolved(4).wait_async(queue.clone());
        assert_eq!(moved.state(), State::Pending);
        assert_eq!(queue.drain(), 1);
        assert_eq!(moved.state(), State::Resolved);
        moved.forget();
    }

    #[test]
    fn timer_rejects_a_slow_source() {
        let _trace = crate::test_util::trace();
        let (engine, sink) = recording_engine();
        let timers = ManualTimer::default();
        let (deferred, promise) = engine.new_pending::<u32>();
        let raced = promise.wait_async_timeout(Some(Duration::from_secs(1)), &timers);

        timers.fire_all();
        let err = raced.wait().into_result().unwrap_err();
        assert_eq!(err.reason_as::<PromiseError>(), Some(&PromiseError::Timeout));

        deferred.resolve(1);
        assert!(sink.reported().is_empty());
    }

    #[test]
    fn settled_source_cancels_the_timer() {
        let engine = Engine::default();
        let timers = ManualTimer::default();
        let (deferred, promise) = engine.new_pending::<u32>();
        let raced = promise.wait_async_timeout(Some(Duration::from_secs(1)), &timers);

        deferred.resolve(9);
        assert_eq!(timers.canceled(), 1);
        timers.fire_all();
        assert_eq!(raced.wait().into_result().unwrap(), 9);
    }

    #[test]
    fn zero_timeout_rejects_unless_already_settled() {
        let engine = Engine::default();
        let timers = ManualTimer::default();

        let settled = engine.resolved(1).wait_async_timeout(Some(Duration::ZERO), &timers);
        assert_eq!(settled.wait().into_result().unwrap(), 1);

        let (_deferred, pending) = engine.new_pending::<u32>();
        let outcome = pending.wait_async_timeout(Some(Duration::ZERO), &timers).wait();
        assert_eq!(outcome.state(), State::Rejected);
        outcome.suppress();
        assert_eq!(timers.scheduled(), 0);
    }

    #[test]
    fn infinite_timeout_is_the_source() {
        let engine = Engine::default();
        let timers = ManualTimer::default();
        let (deferred, promise) = engine.new_pending::<u32>();
        let same = promise.wait_async_timeout(None, &timers);
        deferred.resolve(2);
        assert_eq!(same.wait().into_result().unwrap(), 2);
        assert_eq!(timers.scheduled(), 0);
    }

    #[test]
    fn cancelation_wins_over_a_pending_source() {
        let (engine, sink) = recording_engine();
        let token = FlagToken::default();
        let (deferred, promise) = engine.new_pending::<u32>();
        let guarded = promise.with_cancelation(&token);

        token.cancel();
        assert_eq!(guarded.wait().state(), State::Canceled);

        // The source completes later and nobody observes its rejection.
        deferred.reject("late");
        assert_eq!(sink.reported().len(), 1);
    }

    #[test]
    fn already_canceled_token_skips_allocation() {
        let engine = Engine::default();
        let token = FlagToken::default();
        token.cancel();
        let canceled = engine
            .resolved(1)
            .with_cancelation(&token)
            .catch_cancelation(|| Ok(0));
        assert_eq!(canceled.wait().into_result().unwrap(), 0);
        assert_eq!(engine.pool_stats().allocated, 0);
    }

    #[test]
    fn source_beats_a_later_cancelation() {
        let engine = Engine::default();
        let token = FlagToken::default();
        let (deferred, promise) = engine.new_pending::<u32>();
        let guarded = promise
            .with_cancelation(&token)
            .then(|v| Ok::<_, Fault>(v * 3));
        deferred.resolve(3);
        token.cancel();
        assert_eq!(guarded.wait().into_result().unwrap(), 9);
    }

    #[test]
    fn settled_source_unregisters_from_the_token() {
        let engine = Engine::default();
        let token = FlagToken::default();
        let (deferred, promise) = engine.new_pending::<u32>();
        let guarded = promise.with_cancelation(&token);
        assert_eq!(token.registered(), 1);

        deferred.resolve(4);
        assert_eq!(token.registered(), 0);
        assert_eq!(guarded.wait().into_result().unwrap(), 4);
    }
}
