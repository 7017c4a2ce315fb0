//! The promise state machine.
//!
//! A [`Node`] is the backing object of a pending promise. It moves from `Pending` to exactly one
//! terminal state, hands its outcome to at most one [`Waiter`], and is then returned to its pool
//! with a bumped id. Continuation nodes are waiters of their source and drive a node of their
//! own, so a promise chain is a singly linked list of nodes.
//!
//! Locking: the payload and the waiter link live behind one mutex, which is never held while a
//! waiter or a user callback runs. `state` and `id` are atomics so they can be read without it.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::{PromiseError, Rejection};
use crate::pool::{self, Pool, Poolable};
use crate::reject::RejectContainer;
use crate::util::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    Pending = 0,
    Resolved = 1,
    Rejected = 2,
    Canceled = 3,
}

impl State {
    fn from_u8(state: u8) -> Self {
        match state {
            1 => State::Resolved,
            2 => State::Rejected,
            3 => State::Canceled,
            _ => State::Pending,
        }
    }
}

/// The terminal payload of a promise.
pub enum Outcome<T> {
    Resolved(T),
    Rejected(RejectContainer),
    Canceled,
}

impl<T> Outcome<T> {
    pub fn state(&self) -> State {
        match self {
            Outcome::Resolved(_) => State::Resolved,
            Outcome::Rejected(_) => State::Rejected,
            Outcome::Canceled => State::Canceled,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Resolved(value) => Some(value),
            _ => None,
        }
    }

    pub fn reject_container(&self) -> Option<&RejectContainer> {
        match self {
            Outcome::Rejected(container) => Some(container),
            _ => None,
        }
    }

    /// Consumes the outcome, marking a rejection as observed.
    pub fn into_result(self) -> Result<T, Rejection> {
        match self {
            Outcome::Resolved(value) => Ok(value),
            Outcome::Rejected(container) => Err(Rejection::Rejected(container.into_reason())),
            Outcome::Canceled => Err(Rejection::Canceled),
        }
    }

    /// Splits off the resolved value, re-typing any other outcome so it can pass through a
    /// continuation unchanged.
    pub(crate) fn into_resolved<U>(self) -> Result<T, Outcome<U>> {
        match self {
            Outcome::Resolved(value) => Ok(value),
            Outcome::Rejected(container) => Err(Outcome::Rejected(container)),
            Outcome::Canceled => Err(Outcome::Canceled),
        }
    }

    pub(crate) fn suppress(&self) {
        if let Outcome::Rejected(container) = self {
            container.suppress();
        }
    }
}

impl<T: Clone> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Resolved(value) => Outcome::Resolved(value.clone()),
            Outcome::Rejected(container) => Outcome::Rejected(container.clone()),
            Outcome::Canceled => Outcome::Canceled,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Resolved(value) => f.debug_tuple("Resolved").field(value).finish(),
            Outcome::Rejected(container) => f.debug_tuple("Rejected").field(container).finish(),
            Outcome::Canceled => f.write_str("Canceled"),
        }
    }
}

/// The single subscriber a node hands its outcome to.
///
/// `handle` is called exactly once, on the completing thread, after the source node has already
/// been disposed. Implementations must not unwind.
pub(crate) trait Waiter<T>: Send + Sync {
    fn handle(self: Arc<Self>, outcome: Outcome<T>);
}

enum WaiterSlot<T> {
    Empty,
    /// The handle was dropped while pending; the completer disposes the node.
    Forgotten,
    Subscribed(Arc<dyn Waiter<T>>),
}

struct Inner<T> {
    value: Option<Outcome<T>>,
    waiter: WaiterSlot<T>,
}

pub(crate) struct Node<T> {
    id: AtomicU32,
    state: AtomicU8,
    inner: Mutex<Inner<T>>,
    pool: Weak<Pool<Node<T>>>,
}

impl<T: Send + 'static> Poolable for Node<T> {
    fn create(pool: Weak<Pool<Self>>) -> Self {
        Self {
            id: AtomicU32::new(0),
            state: AtomicU8::new(State::Pending as u8),
            inner: Mutex::new(Inner {
                value: None,
                waiter: WaiterSlot::Empty,
            }),
            pool,
        }
    }

    fn pool(&self) -> &Weak<Pool<Self>> {
        &self.pool
    }
}

impl<T: Send + 'static> Node<T> {
    pub(crate) fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn check_id(&self, id: u32) -> Result<(), PromiseError> {
        if self.id() == id {
            Ok(())
        } else {
            Err(PromiseError::InvalidOperation)
        }
    }

    /// Transitions the node out of `Pending`.
    ///
    /// If a waiter is subscribed the node is disposed and the waiter receives the outcome. If
    /// the handle was forgotten the outcome is dropped, which reports an unobserved rejection.
    /// Otherwise the outcome is stored until the consumer takes it.
    ///
    /// A rejection passed to a failing `settle` is discarded without being reported.
    pub(crate) fn settle(self: &Arc<Self>, id: u32, outcome: Outcome<T>) -> Result<(), PromiseError> {
        self.complete(id, outcome, true).map_err(|(err, discarded)| {
            discarded.suppress();
            err
        })
    }

    /// Like [`settle`](Self::settle), but losing a completion race is expected and silent. The
    /// losing outcome is handed back so the caller can decide whether it was observed.
    pub(crate) fn try_settle(self: &Arc<Self>, id: u32, outcome: Outcome<T>) -> Result<(), Outcome<T>> {
        self.complete(id, outcome, false).map_err(|(_, lost)| lost)
    }

    fn complete(
        self: &Arc<Self>,
        id: u32,
        outcome: Outcome<T>,
        warn_if_complete: bool,
    ) -> Result<(), (PromiseError, Outcome<T>)> {
        let mut inner = lock(&self.inner);
        if let Err(err) = self.check_id(id) {
            return Err((err, outcome));
        }
        if self.state() != State::Pending {
            drop(inner);
            if warn_if_complete {
                tracing::warn!(id, state = ?self.state(), "attempted to complete a promise that is already complete");
            }
            return Err((PromiseError::AlreadyComplete, outcome));
        }

        tracing::trace!(id, state = ?outcome.state(), "promise settled");
        match mem::replace(&mut inner.waiter, WaiterSlot::Empty) {
            WaiterSlot::Empty => {
                self.state.store(outcome.state() as u8, Ordering::Release);
                inner.value = Some(outcome);
            }
            WaiterSlot::Forgotten => {
                self.dispose(inner);
                drop(outcome);
            }
            WaiterSlot::Subscribed(waiter) => {
                self.dispose(inner);
                waiter.handle(outcome);
            }
        }
        Ok(())
    }

    /// Installs the node's only waiter. A node that is already terminal hands its outcome to
    /// the waiter right away and is disposed.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        id: u32,
        waiter: Arc<dyn Waiter<T>>,
    ) -> Result<(), PromiseError> {
        let mut inner = lock(&self.inner);
        self.check_id(id)?;

        if let Some(outcome) = inner.value.take() {
            self.dispose(inner);
            waiter.handle(outcome);
            return Ok(());
        }

        if !matches!(inner.waiter, WaiterSlot::Empty) {
            return Err(PromiseError::InvalidOperation);
        }
        tracing::trace!(id, "waiter subscribed");
        inner.waiter = WaiterSlot::Subscribed(waiter);
        Ok(())
    }

    /// Takes the outcome of a terminal node and disposes it. Returns `None` while pending.
    pub(crate) fn maybe_mark_awaited_and_dispose(
        self: &Arc<Self>,
        id: u32,
    ) -> Result<Option<Outcome<T>>, PromiseError> {
        let mut inner = lock(&self.inner);
        self.check_id(id)?;

        match inner.value.take() {
            Some(outcome) => {
                self.dispose(inner);
                Ok(Some(outcome))
            }
            None => Ok(None),
        }
    }

    /// Releases the handle's claim on the node without observing it.
    pub(crate) fn forget(self: &Arc<Self>, id: u32) -> Result<(), PromiseError> {
        let mut inner = lock(&self.inner);
        self.check_id(id)?;

        if let Some(outcome) = inner.value.take() {
            self.dispose(inner);
            drop(outcome);
            return Ok(());
        }

        if !matches!(inner.waiter, WaiterSlot::Empty) {
            return Err(PromiseError::InvalidOperation);
        }
        inner.waiter = WaiterSlot::Forgotten;
        Ok(())
    }

    /// Bumps the id, clears the node and returns it to the pool. Any handle still holding the
    /// old id fails its next id check.
    fn dispose(self: &Arc<Self>, mut inner: MutexGuard<'_, Inner<T>>) {
        let id = self.id.fetch_add(1, Ordering::AcqRel);
        self.state.store(State::Pending as u8, Ordering::Release);
        let leftover = inner.value.take();
        inner.waiter = WaiterSlot::Empty;
        drop(inner);
        drop(leftover);

        tracing::trace!(id, "promise node disposed");
        pool::recycle(Arc::clone(self));
    }
}

/// A node together with the id a handle observed when it was issued.
pub(crate) struct NodeRef<T> {
    pub(crate) node: Arc<Node<T>>,
    pub(crate) id: u32,
}

impl<T: Send + 'static> NodeRef<T> {
    pub(crate) fn new(node: Arc<Node<T>>) -> Self {
        let id = node.id();
        Self { node, id }
    }

    /// Completes the node. A failure here is a usage error inside the engine, it is logged.
    pub(crate) fn settle(&self, outcome: Outcome<T>) {
        if let Err(err) = self.node.settle(self.id, outcome) {
            tracing::warn!(id = self.id, %err, "failed to complete promise");
        }
    }

    pub(crate) fn try_settle(&self, outcome: Outcome<T>) -> Result<(), Outcome<T>> {
        self.node.try_settle(self.id, outcome)
    }

    pub(crate) fn subscribe(&self, waiter: Arc<dyn Waiter<T>>) -> Result<(), PromiseError> {
        self.node.subscribe(self.id, waiter)
    }

    pub(crate) fn take(&self) -> Result<Option<Outcome<T>>, PromiseError> {
        self.node.maybe_mark_awaited_and_dispose(self.id)
    }

    pub(crate) fn forget(&self) -> Result<(), PromiseError> {
        self.node.forget(self.id)
    }

    pub(crate) fn state(&self) -> State {
        if self.node.id() == self.id {
            self.node.state()
        } else {
            State::Pending
        }
    }
}

impl<T> Clone for NodeRef<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            id: self.id,
        }
    }
}

impl<T> fmt::Debug for NodeRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef").field("id", &self.id).finish_non_exhaustive()
    }
}
