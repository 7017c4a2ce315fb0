use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};

use crate::engine::Engine;
use crate::node::{NodeRef, Outcome, Waiter};
use crate::promise::{Promise, Source};
use crate::reject::RejectReason;
use crate::util::lock;

/// A promise whose outcome can be handed to any number of consumers.
///
/// Created by [`Promise::preserve`]. Every [`duplicate`](Self::duplicate) is an ordinary
/// single-consumer promise that settles with a clone of the shared outcome; duplicates taken
/// while the source is pending are settled in the order they were taken. A rejection counts as
/// observed as soon as any duplicate observes it.
///
/// # Examples
///
/// ```
/// use promise_engine::Engine;
/// use std::thread;
///
/// let engine = Engine::default();
/// let (deferred, promise) = engine.new_pending::<String>();
/// let preserved = promise.preserve();
///
/// let first = preserved.duplicate();
/// let second = preserved.duplicate();
/// let task1 = thread::spawn(move || first.wait().into_result().unwrap());
/// let task2 = thread::spawn(move || second.wait().into_result().unwrap());
///
/// deferred.resolve("Hi".into());
/// assert_eq!(task1.join().expect("The task1 thread has panicked."), "Hi");
/// assert_eq!(task2.join().expect("The task2 thread has panicked."), "Hi");
/// ```
pub struct Preserved<T: Clone + Send + 'static> {
    engine: Engine,
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    value: Option<Outcome<T>>,
    waiters: Vec<NodeRef<T>>,
}

impl<T: Clone + Send + 'static> Waiter<T> for Shared<T> {
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        let waiters = {
            let mut inner = lock(&self.inner);
            inner.value = Some(outcome.clone());
            mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            waiter.settle(outcome.clone());
        }
    }
}

impl<T: Clone + Send + 'static> Preserved<T> {
    pub(crate) fn new(promise: Promise<T>) -> Self {
        let (engine, source) = promise.into_parts();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                value: None,
                waiters: Vec::new(),
            }),
        });
        match source {
            Source::Settled(outcome) => lock(&shared.inner).value = Some(outcome),
            Source::Node(node) => {
                if let Err(err) = node.subscribe(shared.clone()) {
                    let container = engine.reject_container(RejectReason::from(err));
                    lock(&shared.inner).value = Some(Outcome::Rejected(container));
                }
            }
        }
        Self { engine, shared }
    }

    /// Returns a new single-consumer promise for the shared outcome.
    pub fn duplicate(&self) -> Promise<T> {
        let mut inner = lock(&self.shared.inner);
        if let Some(outcome) = &inner.value {
            return Promise::settled(self.engine.clone(), outcome.clone());
        }
        let target = self.engine.node::<T>();
        inner.waiters.push(target.clone());
        Promise::from_node(self.engine.clone(), target)
    }

    /// Releases this handle. Duplicates already taken still settle.
    pub fn forget(self) {
        drop(self);
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Preserved<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.shared.inner);
        f.debug_struct("Preserved")
            .field("state", &inner.value.as_ref().map(Outcome::state))
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}
