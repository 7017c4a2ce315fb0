//! Blocking waits on a promise from a plain thread.
//!
//! The waiting thread spins briefly, then parks on a condition variable. A waiter that gives up
//! on a deadline stays subscribed to its source; whichever side finishes last returns it to the
//! pool, which is coordinated through `status`:
//!
//! ```text
//! INITIAL --complete--> COMPLETED                      (waiter sees it while spinning)
//! INITIAL --block--> WAITING --complete--> COMPLETED --take--> WAITED_SUCCESS
//!                            \--deadline--> WAITED_FAILED --complete--> (completer disposes)
//! ```

use std::hint;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::engine::Engine;
use crate::error::PromiseError;
use crate::node::{NodeRef, Outcome, Waiter};
use crate::pool::{self, Pool, Poolable};
use crate::util::lock;

const INITIAL: u8 = 0;
const WAITING: u8 = 1;
const COMPLETED: u8 = 2;
const WAITED_SUCCESS: u8 = 3;
const WAITED_FAILED: u8 = 4;

pub(crate) struct SyncWaiter<T> {
    status: AtomicU8,
    result: Mutex<Option<Outcome<T>>>,
    monitor: Mutex<()>,
    condvar: Condvar,
    pool: Weak<Pool<Self>>,
}

impl<T: Send + 'static> Poolable for SyncWaiter<T> {
    fn create(pool: Weak<Pool<Self>>) -> Self {
        Self {
            status: AtomicU8::new(INITIAL),
            result: Mutex::new(None),
            monitor: Mutex::new(()),
            condvar: Condvar::new(),
            pool,
        }
    }

    fn pool(&self) -> &Weak<Pool<Self>> {
        &self.pool
    }
}

/// Blocks until `source` completes or `timeout` elapses.
///
/// Returns `Ok(None)` on timeout, in which case the source is left to complete on its own and
/// an unobserved rejection is reported when it does. `None` waits forever.
pub(crate) fn try_wait_for_result<T: Send + 'static>(
    engine: &Engine,
    source: NodeRef<T>,
    timeout: Option<Duration>,
) -> Result<Option<Outcome<T>>, PromiseError> {
    if let Some(outcome) = source.take()? {
        return Ok(Some(outcome));
    }
    // A deadline too far out to represent is the same as none at all.
    let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));

    let waiter = engine.pool::<SyncWaiter<T>>().get_or_create();
    if let Err(err) = source.subscribe(waiter.clone()) {
        waiter.recycle();
        return Err(err);
    }
    Ok(waiter.wait(engine.config().spin_duration, deadline))
}

impl<T: Send + 'static> SyncWaiter<T> {
    fn wait(self: Arc<Self>, spin: Duration, deadline: Option<Instant>) -> Option<Outcome<T>> {
        // Spinning never outlasts the deadline.
        let spin_until = Instant::now()
            .checked_add(spin)
            .map(|spin_until| deadline.map_or(spin_until, |deadline| spin_until.min(deadline)));
        if let Some(spin_until) = spin_until {
            while Instant::now() < spin_until {
                if self.status.load(Ordering::Acquire) == COMPLETED {
                    return self.take_and_recycle();
                }
                hint::spin_loop();
            }
        }

        let mut guard = lock(&self.monitor);
        if self.status.swap(WAITING, Ordering::AcqRel) == COMPLETED {
            drop(guard);
            return self.take_and_recycle();
        }
        while self.status.load(Ordering::Acquire) != COMPLETED {
            match deadline {
                None => {
                    guard = self
                        .condvar
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    guard = match self.condvar.wait_timeout(guard, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        }
        drop(guard);

        match self.status.compare_exchange(
            WAITING,
            WAITED_FAILED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::debug!("timed out waiting for promise");
                None
            }
            Err(_) => {
                let outcome = lock(&self.result).take();
                // The completer is spinning on this store and recycles the waiter after it.
                self.status.store(WAITED_SUCCESS, Ordering::Release);
                outcome
            }
        }
    }

    fn take_and_recycle(self: Arc<Self>) -> Option<Outcome<T>> {
        let outcome = lock(&self.result).take();
        self.recycle();
        outcome
    }

    fn recycle(self: Arc<Self>) {
        self.status.store(INITIAL, Ordering::Release);
        pool::recycle(self);
    }
}

impl<T: Send + 'static> Waiter<T> for SyncWaiter<T> {
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        *lock(&self.result) = Some(outcome);
        match self.status.swap(COMPLETED, Ordering::AcqRel) {
            INITIAL => {}
            WAITED_FAILED => {
                let abandoned = lock(&self.result).take();
                self.recycle();
                drop(abandoned);
            }
            _ => {
                {
                    let _guard = lock(&self.monitor);
                    self.condvar.notify_all();
                }
                while self.status.load(Ordering::Acquire) != WAITED_SUCCESS {
                    thread::yield_now();
                }
                self.recycle();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reject::tests::RecordingSink;
    use crate::{Config, State};

    #[test]
    fn blocks_until_another_thread_resolves() {
        let _trace = crate::test_util::trace();
        let engine = Engine::default();
        let (deferred, promise) = engine.new_pending::<String>();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            deferred.resolve("done".into());
        });
        assert_eq!(promise.wait().into_result().unwrap(), "done");
        producer.join().unwrap();
        assert_eq!(engine.pool::<SyncWaiter<String>>().idle(), 1);
    }

    #[test]
    fn spinning_catches_a_fast_completion() {
        let engine = Engine::new(Config {
            spin_duration: Duration::from_secs(5),
            ..Config::default()
        });
        let (deferred, promise) = engine.new_pending::<u32>();
        let producer = thread::spawn(move || deferred.resolve(3));
        assert_eq!(promise.wait().into_result().unwrap(), 3);
        producer.join().unwrap();
    }

    #[test]
    fn timed_out_waiter_is_disposed_by_the_completer() {
        let sink = Arc::new(RecordingSink::default());
        let engine = Engine::with_rejection_sink(Config::default(), sink.clone());
        let (deferred, promise) = engine.new_pending::<u32>();

        assert!(promise.try_wait(Duration::from_millis(10)).is_none());
        assert_eq!(engine.pool::<SyncWaiter<u32>>().idle(), 0);

        deferred.reject("late");
        assert_eq!(engine.pool::<SyncWaiter<u32>>().idle(), 1);
        assert_eq!(sink.reported().len(), 1);
    }

    #[test]
    fn spinning_stops_at_the_deadline() {
        let engine = Engine::new(Config {
            spin_duration: Duration::from_secs(2),
            ..Config::default()
        });
        let (_deferred, promise) = engine.new_pending::<u32>();
        let start = Instant::now();
        assert!(promise.try_wait(Duration::from_millis(10)).is_none());
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn resolved_before_the_timeout() {
        let engine = Engine::default();
        let (deferred, promise) = engine.new_pending::<u32>();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            deferred.resolve(8);
        });
        let outcome = promise.try_wait(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.into_result().unwrap(), 8);
        producer.join().unwrap();
        assert_eq!(engine.pool::<SyncWaiter<u32>>().idle(), 1);
    }

    #[test]
    fn zero_timeout_returns_a_known_outcome() {
        let engine = Engine::default();
        let (deferred, promise) = engine.new_pending::<u32>();
        deferred.resolve(5);
        let outcome = promise.try_wait(Duration::ZERO).unwrap();
        assert_eq!(outcome.state(), State::Resolved);
    }

    #[test]
    fn stale_handle_is_a_usage_error() {
        let engine = Engine::default();
        let node = engine.node::<u32>();
        node.settle(Outcome::Resolved(1));
        let _ = node.take().unwrap();

        let err = try_wait_for_result(&engine, node, None).unwrap_err();
        assert_eq!(err, PromiseError::InvalidOperation);
    }
}
