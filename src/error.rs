use std::any::Any;
use std::fmt;

use thiserror::Error;

use crate::reject::RejectReason;

/// Usage errors and the reasons the engine itself rejects promises with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromiseError {
    /// The handle's id no longer matches the node: it was already awaited, forgotten or
    /// returned to the pool.
    #[error("invalid operation: promise was already awaited or disposed")]
    InvalidOperation,
    /// A completion was attempted on a node that has already left the pending state.
    #[error("promise has already been completed")]
    AlreadyComplete,
    #[error("the deferred was dropped without completing its promise")]
    ProducerDropped,
    /// `Fault::Rethrow` was returned from a callback that has no rejection to rethrow.
    #[error("rethrow is only valid inside a rejection or continuation handler")]
    InvalidRethrow,
    #[error("callback panicked: {0}")]
    Panicked(String),
    #[error("the operation has timed out")]
    Timeout,
}

/// Why a promise did not resolve, as seen by the code that finally consumes it.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("promise was rejected: {0}")]
    Rejected(RejectReason),
    #[error("promise was canceled")]
    Canceled,
}

impl Rejection {
    /// Returns the rejection reason if it has type `R`.
    pub fn reason_as<R: Any>(&self) -> Option<&R> {
        match self {
            Rejection::Rejected(reason) => reason.downcast_ref::<R>(),
            Rejection::Canceled => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Rejection::Canceled)
    }
}

/// The non-value outcome of a callback.
///
/// Every callback handed to the engine returns `Result<_, Fault>`:
///
/// * [`Fault::Rejected`] rejects the resulting promise with a new reason,
/// * [`Fault::Canceled`] cancels it,
/// * [`Fault::Rethrow`] carries the *original* upstream rejection forward untouched, which lets
///   a rejection handler inspect a reason and hand it on verbatim.
#[derive(Debug)]
pub enum Fault {
    Rejected(RejectReason),
    Canceled,
    Rethrow,
}

impl Fault {
    pub fn reject<R>(reason: R) -> Self
    where
        R: Any + Send + Sync + fmt::Debug,
    {
        Fault::Rejected(RejectReason::new(reason))
    }
}

impl From<PromiseError> for Fault {
    fn from(err: PromiseError) -> Self {
        Fault::Rejected(RejectReason::from(err))
    }
}
