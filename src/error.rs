//! Failures reported by futures.
//!
//! There are three ways a [Future](crate::Future) can fail to produce a value:
//!
//! 1. The wrapped computation returned an error. This is reported to every
//!    caller of [Future::result](crate::Future::result) as [Error::Failed].
//! 2. The caller's cancellation token fired before the value was available.
//!    This is local to the one call that was cancelled and is reported as
//!    [Error::Cancelled].
//! 3. The wrapped computation panicked. The panic is captured as a
//!    [PanicError] and re-raised as a panic in every caller that asks for the
//!    result. It is never handed out as an ordinary error value.
use std::{any::Any, backtrace::Backtrace, error, fmt};

/// Why a cancellation token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The token, or one of its parents, was cancelled explicitly.
    Cancelled,
    /// The token's deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => f.write_str("operation cancelled"),
            CancelReason::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

impl error::Error for CancelReason {}

/// The error returned by [Future::result](crate::Future::result).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error<E> {
    /// The caller stopped waiting because its token fired. The computation
    /// itself carries on.
    Cancelled(CancelReason),
    /// The wrapped computation returned an error.
    Failed(E),
}

impl<E> Error<E> {
    /// Returns `true` if this is a cancellation rather than a failure of the
    /// computation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Return the computation's own error, if that is what this is.
    pub fn into_failure(self) -> Option<E> {
        match self {
            Error::Cancelled(_) => None,
            Error::Failed(e) => Some(e),
        }
    }
}

impl<E> From<CancelReason> for Error<E> {
    fn from(reason: CancelReason) -> Self {
        Error::Cancelled(reason)
    }
}

impl<E: fmt::Display> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Cancelled(reason) => fmt::Display::fmt(reason, f),
            Error::Failed(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl<E: error::Error + 'static> error::Error for Error<E> {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Cancelled(reason) => Some(reason),
            Error::Failed(e) => Some(e),
        }
    }
}

/// A panic raised by a future's computation, captured so that it can be
/// delivered to every observer.
///
/// Its [Display](fmt::Display) form is `panic: <payload>` followed by the
/// backtrace captured when the panic was caught.
#[derive(Debug)]
pub struct PanicError {
    message: String,
    backtrace: String,
}

impl PanicError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: Backtrace::force_capture().to_string(),
        }
    }

    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        if let Some(s) = payload.downcast_ref::<&'static str>() {
            Self::new(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Self::new(s.as_str())
        } else {
            Self::new("Box<dyn Any>")
        }
    }

    /// The panic payload, rendered as a string.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The backtrace captured when the panic was caught.
    pub fn backtrace(&self) -> &str {
        &self.backtrace
    }
}

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}\n{}", self.message, self.backtrace)
    }
}

impl error::Error for PanicError {}
