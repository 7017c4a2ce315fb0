use std::fmt;
use std::future::{Future, IntoFuture};
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::node::{Outcome, Waiter};
use crate::promise::{Promise, Source};
use crate::reject::RejectReason;
use crate::util::lock;

/// A [`Future`] that resolves to the outcome of a [`Promise`].
///
/// Created by awaiting a promise:
///
/// ```
/// use promise_engine::Engine;
/// use futures::executor::block_on;
/// use std::thread;
///
/// let engine = Engine::default();
/// let (deferred, promise) = engine.new_pending::<String>();
///
/// let task1 = thread::spawn(move || block_on(async {
///     promise.await.into_result().unwrap()
/// }));
/// deferred.resolve("Hi".into());
/// assert_eq!(task1.join().expect("The task1 thread has panicked."), "Hi");
/// ```
pub struct PromiseFuture<T: Send + 'static> {
    state: FutureState<T>,
}

enum FutureState<T: Send + 'static> {
    Start(Promise<T>),
    Waiting(Arc<FutureWaiter<T>>),
    Done,
}

#[derive(Debug)]
enum WakerState {
    Fresh,
    Tainted,
}

struct FutureWaiter<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    value: Option<Outcome<T>>,
    waker: Result<Waker, WakerState>,
}

impl<T: Send + 'static> Waiter<T> for FutureWaiter<T> {
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        let mut inner = lock(&self.inner);
        inner.value = Some(outcome);
        let waker = mem::replace(&mut inner.waker, Err(WakerState::Tainted));
        drop(inner);
        if let Ok(waker) = waker {
            waker.wake();
        }
    }
}

impl<T: Send + 'static> FutureWaiter<T> {
    fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Outcome<T>> {
        let mut inner = lock(&self.inner);
        match inner.value.take() {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                inner.waker = Ok(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

// The outcome is moved out on completion and never pinned in place.
impl<T: Send + 'static> Unpin for PromiseFuture<T> {}

impl<T: Send + 'static> Future for PromiseFuture<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let waiter = match mem::replace(&mut this.state, FutureState::Done) {
            FutureState::Start(promise) => {
                let (engine, source) = promise.into_parts();
                let node = match source {
                    Source::Settled(outcome) => return Poll::Ready(outcome),
                    Source::Node(node) => node,
                };
                match node.take() {
                    Ok(Some(outcome)) => return Poll::Ready(outcome),
                    Ok(None) => {}
                    Err(err) => {
                        let container = engine.reject_container(RejectReason::from(err));
                        return Poll::Ready(Outcome::Rejected(container));
                    }
                }

                let waiter = Arc::new(FutureWaiter {
                    inner: Mutex::new(Inner {
                        value: None,
                        waker: Err(WakerState::Fresh),
                    }),
                });
                if let Err(err) = node.subscribe(waiter.clone()) {
                    let container = engine.reject_container(RejectReason::from(err));
                    return Poll::Ready(Outcome::Rejected(container));
                }
                waiter
            }
            FutureState::Waiting(waiter) => waiter,
            FutureState::Done => panic!("`PromiseFuture` polled after completion"),
        };

        let poll = waiter.poll_outcome(cx);
        if poll.is_pending() {
            this.state = FutureState::Waiting(waiter);
        }
        poll
    }
}

impl<T: Send + 'static> IntoFuture for Promise<T> {
    type Output = Outcome<T>;
    type IntoFuture = PromiseFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        PromiseFuture {
            state: FutureState::Start(self),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for PromiseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            FutureState::Start(_) => "start",
            FutureState::Waiting(_) => "waiting",
            FutureState::Done => "done",
        };
        f.debug_struct("PromiseFuture").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Engine, Fault, State};
    use futures::executor::block_on;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn awaits_a_settled_promise() {
        let engine = Engine::default();
        let outcome = block_on(engine.resolved(3).then(|v| Ok::<_, Fault>(v * 2)).into_future());
        assert_eq!(outcome.into_result().unwrap(), 6);
    }

    #[test]
    fn wakes_when_another_thread_completes() {
        let engine = Engine::default();
        let (deferred, promise) = engine.new_pending::<u32>();
        let task = thread::spawn(move || block_on(async { promise.await.state() }));
        thread::sleep(Duration::from_millis(10));
        deferred.cancel();
        assert_eq!(task.join().unwrap(), State::Canceled);
    }

    #[test]
    fn future_is_unpin_for_any_value() {
        fn assert_unpin<F: Unpin>(_: &F) {}
        let engine = Engine::default();
        let future = engine.resolved(std::marker::PhantomPinned).into_future();
        assert_unpin(&future);
        assert_eq!(block_on(future).state(), State::Resolved);
    }

    #[test]
    fn dropping_an_unpolled_future_forgets_the_promise() {
        let engine = Engine::default();
        let (deferred, promise) = engine.new_pending::<u32>();
        drop(promise.into_future());
        deferred.resolve(1);
        assert_eq!(engine.pool_stats().allocated, 1);
        let (_deferred, again) = engine.new_pending::<u32>();
        assert_eq!(again.state(), State::Pending);
        assert_eq!(engine.pool_stats().reused, 1);
    }
}
