use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::subscriber::DefaultGuard;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::context::{
    CancelationToken, ExecutionContext, Job, Registration, TimerFactory, TimerHandle,
};

/// Installs a thread-local subscriber filtered by `RUST_LOG`.
pub(crate) fn trace() -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default()
}

/// Collects posted jobs until the test drains them.
#[derive(Default)]
pub(crate) struct QueueContext {
    jobs: Mutex<VecDeque<Job>>,
}

impl QueueContext {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs queued jobs, including ones posted while draining, and returns how many ran.
    pub(crate) fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.jobs.lock().unwrap().pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl ExecutionContext for QueueContext {
    fn post(&self, job: Job) {
        self.jobs.lock().unwrap().push_back(job);
    }
}

struct Timer {
    canceled: Arc<AtomicBool>,
    callback: Job,
}

/// Timers that only fire when the test says so.
#[derive(Default)]
pub(crate) struct ManualTimer {
    timers: Mutex<Vec<Timer>>,
    canceled: Mutex<Vec<Arc<AtomicBool>>>,
}

impl ManualTimer {
    pub(crate) fn scheduled(&self) -> usize {
        self.canceled.lock().unwrap().len()
    }

    pub(crate) fn canceled(&self) -> usize {
        self.canceled
            .lock()
            .unwrap()
            .iter()
            .filter(|flag| flag.load(Ordering::SeqCst))
            .count()
    }

    /// Runs every timer that has not been canceled.
    pub(crate) fn fire_all(&self) {
        let timers = std::mem::take(&mut *self.timers.lock().unwrap());
        for timer in timers {
            if !timer.canceled.load(Ordering::SeqCst) {
                (timer.callback)();
            }
        }
    }
}

struct ManualHandle(Arc<AtomicBool>);

impl TimerHandle for ManualHandle {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl TimerFactory for ManualTimer {
    fn schedule_once(&self, _delay: Duration, callback: Job) -> Box<dyn TimerHandle> {
        let canceled = Arc::new(AtomicBool::new(false));
        self.canceled.lock().unwrap().push(canceled.clone());
        self.timers.lock().unwrap().push(Timer {
            canceled: canceled.clone(),
            callback,
        });
        Box::new(ManualHandle(canceled))
    }
}

type Callbacks = Mutex<Vec<(u64, Job)>>;

/// A cancelation source and token in one.
#[derive(Default)]
pub(crate) struct FlagToken {
    requested: AtomicBool,
    next_id: AtomicU64,
    callbacks: Arc<Callbacks>,
}

impl FlagToken {
    pub(crate) fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let callbacks = std::mem::take(&mut *self.callbacks.lock().unwrap());
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Callbacks still waiting for cancelation.
    pub(crate) fn registered(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }
}

struct FlagRegistration {
    callbacks: Weak<Callbacks>,
    id: u64,
}

impl Registration for FlagRegistration {
    fn unregister(&self) {
        if let Some(callbacks) = self.callbacks.upgrade() {
            callbacks.lock().unwrap().retain(|(id, _)| *id != self.id);
        }
    }
}

impl CancelationToken for FlagToken {
    fn is_cancelation_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn register(&self, callback: Job) -> Box<dyn Registration> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self.is_cancelation_requested() {
            callback();
        } else {
            self.callbacks.lock().unwrap().push((id, callback));
        }
        Box::new(FlagRegistration {
            callbacks: Arc::downgrade(&self.callbacks),
            id,
        })
    }
}
