//! Per-type free lists for the engine's nodes and waiters.
//!
//! Every pooled object keeps a weak link back to the pool it came from so it can return itself
//! once the last party that may still touch it is done. Objects are reset by their owner before
//! they are returned; a pool never hands out an object that still carries state from its
//! previous use. Stale handles to a recycled [`Node`](crate::node::Node) are caught by its id,
//! which is bumped on every return.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::config::Config;
use crate::util::lock;

/// An object that can live in a [`Pool`].
pub(crate) trait Poolable: Send + Sync + Sized + 'static {
    /// Creates a fresh, empty instance belonging to `pool`.
    fn create(pool: Weak<Pool<Self>>) -> Self;

    fn pool(&self) -> &Weak<Pool<Self>>;
}

/// Engine-wide allocation counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    allocated: AtomicUsize,
    reused: AtomicUsize,
}

impl Counters {
    pub(crate) fn snapshot(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of how many pooled objects an engine allocated and how many it reused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated: usize,
    pub reused: usize,
}

#[derive(Debug)]
pub(crate) struct Pool<N> {
    free: Mutex<Vec<Arc<N>>>,
    enabled: bool,
    max: usize,
    counters: Arc<Counters>,
}

impl<N: Poolable> Pool<N> {
    pub(crate) fn new(config: &Config, counters: Arc<Counters>) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            enabled: config.pooling,
            max: config.max_pooled,
            counters,
        }
    }

    /// Pops an idle instance, or allocates a new one on a miss.
    pub(crate) fn get_or_create(self: &Arc<Self>) -> Arc<N> {
        let reused = lock(&self.free).pop();
        match reused {
            Some(item) => {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                item
            }
            None => {
                self.counters.allocated.fetch_add(1, Ordering::Relaxed);
                Arc::new(N::create(Arc::downgrade(self)))
            }
        }
    }

    /// Stores an already reset instance for later reuse.
    pub(crate) fn put(&self, item: Arc<N>) {
        if !self.enabled {
            return;
        }
        let mut free = lock(&self.free);
        if free.len() < self.max {
            free.push(item);
        }
    }

    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        lock(&self.free).len()
    }
}

/// Returns `item` to the pool it was created by, if that pool (and its engine) still exists.
pub(crate) fn recycle<N: Poolable>(item: Arc<N>) {
    let pool = item.pool().upgrade();
    if let Some(pool) = pool {
        pool.put(item);
    }
}
