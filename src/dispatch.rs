//! Dispatch of continuation callbacks.
//!
//! Every chaining method on [`Promise`] boils down to [`dispatch`] with a delegate implementing
//! [`Callback`]. A delegate owns the user's closure and knows which source outcomes it reacts to;
//! everything else passes through to the returned promise untouched.
//!
//! Whether a closure returns a plain value or a promise to adopt is decided at compile time by
//! the [`Immediate`] and [`Nested`] markers.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::continuation::{self, ContinuationNode};
use crate::engine::Engine;
use crate::error::{Fault, PromiseError};
use crate::node::{NodeRef, Outcome};
use crate::promise::{Promise, Source};
use crate::reject::RejectReason;

/// What a delegate produced for the promise it drives.
pub(crate) enum Next<T: Send + 'static> {
    Settled(Outcome<T>),
    /// Resolve with whatever this promise settles with.
    Adopt(Promise<T>),
    /// Settle with `original` once `nested` completes, unless `nested` fails.
    Hold {
        original: Outcome<T>,
        nested: Promise<()>,
    },
}

impl<T: Send + 'static> Next<T> {
    /// Turns the result into a promise without allocating a node when it is already known.
    pub(crate) fn into_promise(self, engine: &Engine) -> Promise<T> {
        match self {
            Next::Settled(outcome) => Promise::settled(engine.clone(), outcome),
            Next::Adopt(promise) => promise,
            hold => {
                let target = engine.node::<T>();
                hold.settle_into(engine, target.clone());
                Promise::from_node(engine.clone(), target)
            }
        }
    }

    pub(crate) fn settle_into(self, engine: &Engine, target: NodeRef<T>) {
        match self {
            Next::Settled(outcome) => target.settle(outcome),
            Next::Adopt(promise) => promise.forward_into(target),
            Next::Hold { original, nested } => {
                continuation::hold_finally(engine, original, nested, target)
            }
        }
    }
}

/// A continuation delegate: consumes the source outcome and decides the next one.
pub(crate) trait Callback<S, T: Send + 'static>: Send + 'static {
    fn invoke(self, outcome: Outcome<S>, engine: &Engine) -> Next<T>;
}

/// The closure returns the value directly.
pub(crate) enum Immediate {}

/// The closure returns a promise that the result adopts.
pub(crate) enum Nested {}

pub(crate) trait Returns<T: Send + 'static>: 'static {
    type Value;

    fn into_next(engine: &Engine, result: Result<Self::Value, Fault>, origin: Origin) -> Next<T>;
}

impl<T: Send + 'static> Returns<T> for Immediate {
    type Value = T;

    fn into_next(engine: &Engine, result: Result<T, Fault>, origin: Origin) -> Next<T> {
        match result {
            Ok(value) => Next::Settled(Outcome::Resolved(value)),
            Err(fault) => Next::Settled(fault_outcome(engine, fault, origin)),
        }
    }
}

impl<T: Send + 'static> Returns<T> for Nested {
    type Value = Promise<T>;

    fn into_next(engine: &Engine, result: Result<Promise<T>, Fault>, origin: Origin) -> Next<T> {
        match result {
            Ok(promise) => Next::Adopt(promise),
            Err(fault) => Next::Settled(fault_outcome(engine, fault, origin)),
        }
    }
}

/// The rejection or cancelation a handler was invoked for; the target of `Fault::Rethrow`.
pub(crate) enum Origin {
    Nothing,
    Rejected(RejectReason),
    Canceled,
}

impl Origin {
    fn of<T>(outcome: &Outcome<T>) -> Self {
        match outcome {
            Outcome::Resolved(_) => Origin::Nothing,
            Outcome::Rejected(container) => Origin::Rejected(container.reason().clone()),
            Outcome::Canceled => Origin::Canceled,
        }
    }
}

/// Maps a callback's fault to the outcome of the promise it drives.
///
/// A rethrown rejection keeps its reason, so reason identity survives any number of handlers.
pub(crate) fn fault_outcome<T>(engine: &Engine, fault: Fault, origin: Origin) -> Outcome<T> {
    match fault {
        Fault::Rejected(reason) => Outcome::Rejected(engine.reject_container(reason)),
        Fault::Canceled => Outcome::Canceled,
        Fault::Rethrow => match origin {
            Origin::Rejected(reason) => Outcome::Rejected(engine.reject_container(reason)),
            Origin::Canceled => Outcome::Canceled,
            Origin::Nothing => {
                tracing::warn!("rethrow returned outside of a rejection handler");
                let reason = RejectReason::from(PromiseError::InvalidRethrow);
                Outcome::Rejected(engine.reject_container(reason))
            }
        },
    }
}

/// Runs a user callback, turning a panic into a `Panicked` rejection.
pub(crate) fn guarded<R>(f: impl FnOnce() -> Result<R, Fault>) -> Result<R, Fault> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(&*payload);
        tracing::debug!(%message, "promise callback panicked");
        Err(Fault::from(PromiseError::Panicked(message)))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("Box<dyn Any>")
    }
}

/// `then`: runs on resolution, passes rejection and cancelation through.
pub(crate) struct Then<F, W> {
    f: F,
    _returns: PhantomData<fn() -> W>,
}

impl<F, W> Then<F, W> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _returns: PhantomData,
        }
    }
}

impl<S, T, F, W> Callback<S, T> for Then<F, W>
where
    S: Send + 'static,
    T: Send + 'static,
    W: Returns<T>,
    F: FnOnce(S) -> Result<W::Value, Fault> + Send + 'static,
{
    fn invoke(self, outcome: Outcome<S>, engine: &Engine) -> Next<T> {
        match outcome.into_resolved::<T>() {
            Ok(value) => {
                let f = self.f;
                W::into_next(engine, guarded(move || f(value)), Origin::Nothing)
            }
            Err(passthrough) => Next::Settled(passthrough),
        }
    }
}

/// `catch`: runs only for rejections whose reason is an `R`.
pub(crate) struct Catch<R, F, W> {
    f: F,
    _marker: PhantomData<fn(&R) -> W>,
}

impl<R, F, W> Catch<R, F, W> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<T, R, F, W> Callback<T, T> for Catch<R, F, W>
where
    T: Send + 'static,
    R: Any,
    W: Returns<T>,
    F: FnOnce(&R) -> Result<W::Value, Fault> + Send + 'static,
{
    fn invoke(self, outcome: Outcome<T>, engine: &Engine) -> Next<T> {
        let container = match outcome {
            Outcome::Rejected(container) => container,
            other => return Next::Settled(other),
        };
        let reason = container.reason().clone();
        let Some(matched) = reason.downcast_ref::<R>() else {
            return Next::Settled(Outcome::Rejected(container));
        };

        container.suppress();
        let f = self.f;
        let result = guarded(move || f(matched));
        W::into_next(engine, result, Origin::Rejected(reason.clone()))
    }
}

/// `catch_cancelation`: runs only when the source was canceled.
pub(crate) struct CatchCancelation<F, W> {
    f: F,
    _returns: PhantomData<fn() -> W>,
}

impl<F, W> CatchCancelation<F, W> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _returns: PhantomData,
        }
    }
}

impl<T, F, W> Callback<T, T> for CatchCancelation<F, W>
where
    T: Send + 'static,
    W: Returns<T>,
    F: FnOnce() -> Result<W::Value, Fault> + Send + 'static,
{
    fn invoke(self, outcome: Outcome<T>, engine: &Engine) -> Next<T> {
        match outcome {
            Outcome::Canceled => W::into_next(engine, guarded(self.f), Origin::Canceled),
            other => Next::Settled(other),
        }
    }
}

/// `continue_with`: always runs and observes the source.
pub(crate) struct ContinueWith<F, W> {
    f: F,
    _returns: PhantomData<fn() -> W>,
}

impl<F, W> ContinueWith<F, W> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _returns: PhantomData,
        }
    }
}

impl<S, T, F, W> Callback<S, T> for ContinueWith<F, W>
where
    S: Send + 'static,
    T: Send + 'static,
    W: Returns<T>,
    F: FnOnce(Outcome<S>) -> Result<W::Value, Fault> + Send + 'static,
{
    fn invoke(self, outcome: Outcome<S>, engine: &Engine) -> Next<T> {
        outcome.suppress();
        let origin = Origin::of(&outcome);
        let f = self.f;
        W::into_next(engine, guarded(move || f(outcome)), origin)
    }
}

/// `finally`: runs on every outcome and passes the original through unless it fails itself.
pub(crate) struct Finally<F> {
    f: F,
}

impl<F> Finally<F> {
    pub(crate) fn new(f: F) -> Self {
        Self { f }
    }
}

impl<T, F> Callback<T, T> for Finally<F>
where
    T: Send + 'static,
    F: FnOnce() -> Result<(), Fault> + Send + 'static,
{
    fn invoke(self, outcome: Outcome<T>, engine: &Engine) -> Next<T> {
        match guarded(self.f) {
            Ok(()) => Next::Settled(outcome),
            Err(fault) => {
                // The replaced outcome was never observed; dropping it reports a rejection.
                drop(outcome);
                Next::Settled(fault_outcome(engine, fault, Origin::Nothing))
            }
        }
    }
}

/// `finally_wait`: like `finally`, but the callback's promise must settle first.
pub(crate) struct FinallyWait<F> {
    f: F,
}

impl<F> FinallyWait<F> {
    pub(crate) fn new(f: F) -> Self {
        Self { f }
    }
}

impl<T, F> Callback<T, T> for FinallyWait<F>
where
    T: Send + 'static,
    F: FnOnce() -> Result<Promise<()>, Fault> + Send + 'static,
{
    fn invoke(self, outcome: Outcome<T>, engine: &Engine) -> Next<T> {
        match guarded(self.f) {
            Ok(nested) => Next::Hold {
                original: outcome,
                nested,
            },
            Err(fault) => {
                drop(outcome);
                Next::Settled(fault_outcome(engine, fault, Origin::Nothing))
            }
        }
    }
}

/// Chains `callback` onto `source`.
///
/// A source that is already terminal runs the callback inline without allocating; a pending
/// one gets a pooled continuation node subscribed to it.
pub(crate) fn dispatch<S, T, C>(source: Promise<S>, callback: C) -> Promise<T>
where
    S: Send + 'static,
    T: Send + 'static,
    C: Callback<S, T>,
{
    let (engine, source) = source.into_parts();
    match source {
        Source::Settled(outcome) => callback.invoke(outcome, &engine).into_promise(&engine),
        Source::Node(node) => match node.take() {
            Ok(Some(outcome)) => invoke_terminal(&engine, outcome, callback),
            Ok(None) => subscribe(&engine, node, callback),
            Err(err) => usage_error(&engine, err),
        },
    }
}

/// The node completed between the handle being created and the callback being attached.
#[cold]
#[inline(never)]
fn invoke_terminal<S, T, C>(engine: &Engine, outcome: Outcome<S>, callback: C) -> Promise<T>
where
    S: Send + 'static,
    T: Send + 'static,
    C: Callback<S, T>,
{
    callback.invoke(outcome, engine).into_promise(engine)
}

fn subscribe<S, T, C>(engine: &Engine, source: NodeRef<S>, callback: C) -> Promise<T>
where
    S: Send + 'static,
    T: Send + 'static,
    C: Callback<S, T>,
{
    let target = engine.node::<T>();
    let continuation = engine.pool::<ContinuationNode<S, T, C>>().get_or_create();
    continuation.arm(engine.clone(), target.clone(), callback);
    if let Err(err) = source.subscribe(continuation.clone()) {
        continuation.fail(err);
    }
    Promise::from_node(engine.clone(), target)
}

/// A promise rejected with a usage error of the handle it was derived from.
pub(crate) fn usage_error<T: Send + 'static>(engine: &Engine, err: PromiseError) -> Promise<T> {
    tracing::error!(%err, "invalid use of a promise handle");
    let container = engine.reject_container(RejectReason::from(err));
    Promise::settled(engine.clone(), Outcome::Rejected(container))
}

/// Runs `callback` on `context` with a unit source.
pub(crate) fn schedule<T, C>(engine: &Engine, context: &Arc<dyn ExecutionContext>, callback: C) -> Promise<T>
where
    T: Send + 'static,
    C: Callback<(), T>,
{
    if context.should_continue_immediately() {
        return callback
            .invoke(Outcome::Resolved(()), engine)
            .into_promise(engine);
    }

    let target = engine.node::<T>();
    let promise = Promise::from_node(engine.clone(), target.clone());
    let engine = engine.clone();
    context.post(Box::new(move || {
        callback
            .invoke(Outcome::Resolved(()), &engine)
            .settle_into(&engine, target);
    }));
    promise
}
