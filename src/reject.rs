//! Rejection reasons and the containers that track whether anyone observed them.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::PromiseError;

type FmtFn = fn(&(dyn Any + Send + Sync), &mut fmt::Formatter<'_>) -> fmt::Result;

/// A type-erased, cheaply clonable rejection reason.
///
/// Reasons keep their concrete type so rejection handlers can filter on it, see
/// [`Promise::catch`](crate::Promise::catch).
#[derive(Clone)]
pub struct RejectReason {
    value: Arc<dyn Any + Send + Sync>,
    fmt: FmtFn,
    type_name: &'static str,
}

impl RejectReason {
    pub fn new<R>(reason: R) -> Self
    where
        R: Any + Send + Sync + fmt::Debug,
    {
        Self {
            value: Arc::new(reason),
            fmt: debug_reason::<R>,
            type_name: std::any::type_name::<R>(),
        }
    }

    /// Returns the reason as an `R`, if that is its type.
    ///
    /// `RejectReason` itself matches every reason, which is how catch-all handlers are expressed.
    pub fn downcast_ref<R: Any>(&self) -> Option<&R> {
        if let Some(this) = (self as &dyn Any).downcast_ref::<R>() {
            return Some(this);
        }
        (*self.value).downcast_ref::<R>()
    }

    pub fn is<R: Any>(&self) -> bool {
        self.downcast_ref::<R>().is_some()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns `true` if both reasons are the very same rejection, not just equal ones.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.value, &other.value)
    }
}

fn debug_reason<R: Any + fmt::Debug>(
    value: &(dyn Any + Send + Sync),
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    match value.downcast_ref::<R>() {
        Some(reason) => fmt::Debug::fmt(reason, f),
        None => f.write_str("<unknown>"),
    }
}

impl From<PromiseError> for RejectReason {
    fn from(err: PromiseError) -> Self {
        RejectReason::new(err)
    }
}

impl fmt::Debug for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RejectReason(")?;
        (self.fmt)(&*self.value, f)?;
        f.write_str(")")
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = (*self.value).downcast_ref::<&'static str>() {
            f.write_str(s)
        } else if let Some(s) = (*self.value).downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(err) = (*self.value).downcast_ref::<PromiseError>() {
            fmt::Display::fmt(err, f)
        } else {
            (self.fmt)(&*self.value, f)
        }
    }
}

/// Receives rejections that were dropped without ever being observed.
pub trait RejectionSink: Send + Sync {
    fn report(&self, reason: &RejectReason);
}

/// The default sink, logs unhandled rejections at `ERROR` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl RejectionSink for TracingSink {
    fn report(&self, reason: &RejectReason) {
        tracing::error!(reason = %reason, ty = reason.type_name(), "unhandled promise rejection");
    }
}

/// A rejection reason plus the "was it observed" flag.
///
/// Clones share the flag. When the last clone of a container that was never suppressed is
/// dropped, its reason is handed to the engine's [`RejectionSink`].
#[derive(Clone)]
pub struct RejectContainer(Arc<Inner>);

struct Inner {
    reason: RejectReason,
    suppressed: AtomicBool,
    sink: Arc<dyn RejectionSink>,
}

impl RejectContainer {
    pub(crate) fn new(reason: RejectReason, sink: Arc<dyn RejectionSink>) -> Self {
        Self(Arc::new(Inner {
            reason,
            suppressed: AtomicBool::new(false),
            sink,
        }))
    }

    pub fn reason(&self) -> &RejectReason {
        &self.0.reason
    }

    /// The type-filtered match used by rejection handlers: returns the reason as `R` if it has
    /// that type, leaving the container untouched otherwise.
    pub fn reason_as<R: Any>(&self) -> Option<&R> {
        self.0.reason.downcast_ref::<R>()
    }

    /// Marks the rejection as observed so it is not reported as unhandled.
    pub fn suppress(&self) {
        self.0.suppressed.store(true, Ordering::Release);
    }

    pub fn is_suppressed(&self) -> bool {
        self.0.suppressed.load(Ordering::Acquire)
    }

    /// Observes the rejection and returns its reason.
    pub fn into_reason(self) -> RejectReason {
        self.suppress();
        self.0.reason.clone()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !*self.suppressed.get_mut() {
            self.sink.report(&self.reason);
        }
    }
}

impl fmt::Debug for RejectContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejectContainer")
            .field("reason", &self.0.reason)
            .field("suppressed", &self.is_suppressed())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Collects reported reasons so tests can assert on them.
    #[derive(Default)]
    pub(crate) struct RecordingSink(Mutex<Vec<RejectReason>>);

    impl RecordingSink {
        pub(crate) fn reported(&self) -> Vec<RejectReason> {
            self.0.lock().unwrap().clone()
        }
    }

    impl RejectionSink for RecordingSink {
        fn report(&self, reason: &RejectReason) {
            self.0.lock().unwrap().push(reason.clone());
        }
    }

    #[test]
    fn unobserved_rejection_is_reported_once() {
        let sink = Arc::new(RecordingSink::default());
        let container = RejectContainer::new(RejectReason::new("boom"), sink.clone());
        let clone = container.clone();
        drop(container);
        assert!(sink.reported().is_empty());
        drop(clone);

        let reported = sink.reported();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].downcast_ref::<&str>(), Some(&"boom"));
    }

    #[test]
    fn suppressed_rejection_is_not_reported() {
        let sink = Arc::new(RecordingSink::default());
        let container = RejectContainer::new(RejectReason::new(42_u32), sink.clone());
        container.clone().suppress();
        drop(container);
        assert!(sink.reported().is_empty());
    }

    #[test]
    fn reason_matches_its_type_and_catch_all() {
        let reason = RejectReason::new(String::from("E"));
        assert_eq!(reason.downcast_ref::<String>().map(String::as_str), Some("E"));
        assert!(reason.downcast_ref::<u32>().is_none());
        assert!(reason.is::<RejectReason>());
        assert_eq!(reason.to_string(), "E");
        assert_eq!(format!("{reason:?}"), "RejectReason(\"E\")");
    }

    #[test]
    fn engine_errors_display_through_the_reason() {
        let reason = RejectReason::from(PromiseError::Timeout);
        assert_eq!(reason.to_string(), "the operation has timed out");
    }
}
