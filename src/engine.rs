use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::context::ExecutionContext;
use crate::deferred::Deferred;
use crate::dispatch::{self, Immediate, Nested, Then};
use crate::error::Fault;
use crate::node::{Node, NodeRef, Outcome};
use crate::pool::{Counters, Pool, PoolStats, Poolable};
use crate::promise::Promise;
use crate::reject::{RejectContainer, RejectReason, RejectionSink, TracingSink};
use crate::util::{read, write};

/// Owns the configuration, the unhandled-rejection sink and the object pools every promise
/// created through it draws from.
///
/// Cloning an `Engine` is cheap, all clones share the same pools.
///
/// # Examples
///
/// ```
/// use promise_engine::{Engine, Fault};
///
/// let engine = Engine::default();
/// let (deferred, promise) = engine.new_pending::<u32>();
/// let doubled = promise.then(|v| Ok::<_, Fault>(v * 2));
/// deferred.resolve(21);
/// assert_eq!(doubled.wait().into_result().unwrap(), 42);
/// ```
#[derive(Clone)]
pub struct Engine(Arc<Shared>);

struct Shared {
    config: Config,
    sink: Arc<dyn RejectionSink>,
    // Written once per pooled type; every later lookup only reads.
    pools: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    counters: Arc<Counters>,
}

impl Engine {
    /// Creates an engine that logs unhandled rejections through `tracing`.
    pub fn new(config: Config) -> Self {
        Self::with_rejection_sink(config, Arc::new(TracingSink))
    }

    pub fn with_rejection_sink(config: Config, sink: Arc<dyn RejectionSink>) -> Self {
        Self(Arc::new(Shared {
            config,
            sink,
            pools: RwLock::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.0.counters.snapshot()
    }

    /// Creates a pending promise together with the [`Deferred`] that completes it.
    pub fn new_pending<T: Send + 'static>(&self) -> (Deferred<T>, Promise<T>) {
        let node = self.node::<T>();
        (
            Deferred::new(self.clone(), node.clone()),
            Promise::from_node(self.clone(), node),
        )
    }

    /// An already resolved promise; no node is allocated.
    pub fn resolved<T: Send + 'static>(&self, value: T) -> Promise<T> {
        Promise::settled(self.clone(), Outcome::Resolved(value))
    }

    pub fn rejected<T, R>(&self, reason: R) -> Promise<T>
    where
        T: Send + 'static,
        R: Any + Send + Sync + fmt::Debug,
    {
        let container = self.reject_container(RejectReason::new(reason));
        Promise::settled(self.clone(), Outcome::Rejected(container))
    }

    pub fn canceled<T: Send + 'static>(&self) -> Promise<T> {
        Promise::settled(self.clone(), Outcome::Canceled)
    }

    /// Runs `f` on `context` and resolves the returned promise with its result.
    ///
    /// If the context reports that work may continue on the calling thread, `f` runs right away.
    pub fn run<T, F>(&self, context: &Arc<dyn ExecutionContext>, f: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Fault> + Send + 'static,
    {
        dispatch::schedule(self, context, Then::<_, Immediate>::new(move |()| f()))
    }

    /// Like [`run`](Self::run), but `f` returns a promise whose outcome is adopted.
    pub fn run_wait<T, F>(&self, context: &Arc<dyn ExecutionContext>, f: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<Promise<T>, Fault> + Send + 'static,
    {
        dispatch::schedule(self, context, Then::<_, Nested>::new(move |()| f()))
    }

    pub(crate) fn pool<N: Poolable>(&self) -> Arc<Pool<N>> {
        let key = TypeId::of::<N>();
        let found = read(&self.0.pools).get(&key).cloned();
        let pool = match found {
            Some(pool) => pool,
            None => write(&self.0.pools)
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(Pool::<N>::new(&self.0.config, self.0.counters.clone()))
                        as Arc<dyn Any + Send + Sync>
                })
                .clone(),
        };
        match pool.downcast::<Pool<N>>() {
            Ok(pool) => pool,
            Err(_) => unreachable!("pool registry entries are keyed by their type id"),
        }
    }

    /// Takes a pending node from the pool.
    pub(crate) fn node<T: Send + 'static>(&self) -> NodeRef<T> {
        NodeRef::new(self.pool::<Node<T>>().get_or_create())
    }

    pub(crate) fn reject_container(&self, reason: RejectReason) -> RejectContainer {
        RejectContainer::new(reason, Arc::clone(&self.0.sink))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.0.config)
            .field("pools", &read(&self.0.pools).len())
            .field("stats", &self.pool_stats())
            .finish_non_exhaustive()
    }
}
