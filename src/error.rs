//! The value-level error channel.
//!
//! Failures travel through a chain as [`Rejection`]s: shared handles to an
//! error value, since a settled result fans out to every subscriber of a box.
//! Cancellation is not a separate channel; it is an ordinary rejection whose
//! error happens to classify itself as cancellation via [`ChainError`].
//! Catch-style consumers use that classification to skip cancellations by
//! default, unless they opt into [`CatchPolicy::AllErrors`].

use std::{error, fmt, sync::Arc};

/// Capability implemented by every error type that can travel through a chain.
///
/// The classification replaces any runtime type test for "is this a
/// cancellation": concrete error types state it themselves, so consumers can
/// rely on it being exhaustive.
pub trait ChainError: error::Error + Send + Sync {
    /// Returns `true` if this error reports that the work which should have
    /// produced a value was cancelled, rather than that it failed.
    fn is_cancellation(&self) -> bool {
        false
    }
}

/// A shared handle to the error a chain step was rejected with.
pub type Rejection = Arc<dyn ChainError>;

/// The error a [`CancelContext`][crate::CancelContext] records when it is
/// cancelled without an explicit error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the chain was cancelled")
    }
}

impl error::Error for Cancelled {}

impl ChainError for Cancelled {
    fn is_cancellation(&self) -> bool {
        true
    }
}

/// The error recorded when an armed timeout fires.
///
/// Deliberately *not* classified as cancellation: a timeout is a failure the
/// caller wants to see, so default-policy catch handlers receive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the chain timed out")
    }
}

impl error::Error for TimedOut {}

impl ChainError for TimedOut {}

/// Which rejections a catch-style handler wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatchPolicy {
    /// Handle ordinary failures, skip rejections that classify as
    /// cancellation. The default: a cancelled chain usually has nothing left
    /// to report.
    #[default]
    SkipCancellation,
    /// Handle every rejection, cancellation included.
    AllErrors,
}

impl CatchPolicy {
    pub(crate) fn handles(self, error: &Rejection) -> bool {
        match self {
            CatchPolicy::SkipCancellation => !error.is_cancellation(),
            CatchPolicy::AllErrors => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let cancelled: Rejection = Arc::new(Cancelled);
        let timed_out: Rejection = Arc::new(TimedOut);
        assert!(cancelled.is_cancellation());
        assert!(!timed_out.is_cancellation());
    }

    #[test]
    fn default_policy_skips_cancellation_only() {
        let cancelled: Rejection = Arc::new(Cancelled);
        let timed_out: Rejection = Arc::new(TimedOut);

        assert!(!CatchPolicy::SkipCancellation.handles(&cancelled));
        assert!(CatchPolicy::SkipCancellation.handles(&timed_out));
        assert!(CatchPolicy::AllErrors.handles(&cancelled));
        assert!(CatchPolicy::AllErrors.handles(&timed_out));
    }
}
