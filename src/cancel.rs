//! Cancellation tokens.
//!
//! A [Token] is handed to [Future::result](crate::Future::result) to bound how
//! long the caller is willing to wait. Cancellation is purely advisory: it
//! makes the waiting call return early, it never stops the computation.
//!
//! Tokens come in a few flavours:
//!
//! - [Token::never] can never fire. Waiting with it is unbounded, which lets
//!   futures take a fast path and run their computation inline.
//! - [Token::new] fires when [Token::cancel] is called.
//! - [Token::with_deadline] and [Token::with_timeout] additionally fire once
//!   a point in time has passed.
//! - [Token::child] derives a token that fires whenever its parent does, but
//!   can also be cancelled on its own without affecting the parent.
//!
//! # Example
//!
//! ```
//! use ondemand::{CancelReason, Token};
//! use std::time::Duration;
//!
//! let parent = Token::new();
//! let child = parent.child();
//! let timed = Token::with_timeout(Duration::ZERO);
//!
//! assert!(!child.is_cancelled());
//! parent.cancel();
//! assert_eq!(child.reason(), Some(CancelReason::Cancelled));
//! assert_eq!(timed.reason(), Some(CancelReason::DeadlineExceeded));
//! assert!(!Token::never().can_fire());
//! ```
use std::{
    fmt,
    future::Future as _,
    pin::pin,
    sync::{Arc, OnceLock},
    task::Context,
    thread,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

use crate::{
    error::CancelReason,
    signal::{Signal, Waiter},
};

struct TokenInner {
    token: CancellationToken,
    // Set by whoever fires this token first. A token that was only cancelled
    // through its parent leaves this empty until somebody asks.
    reason: OnceLock<CancelReason>,
    deadline: Option<Instant>,
}

impl TokenInner {
    fn new(token: CancellationToken, deadline: Option<Instant>) -> Arc<Self> {
        Arc::new(Self {
            token,
            reason: OnceLock::new(),
            deadline,
        })
    }

    fn cancel(&self, reason: CancelReason) -> bool {
        if self.reason().is_some() || self.reason.set(reason).is_err() {
            return false;
        }

        self.token.cancel();
        true
    }

    fn reason(&self) -> Option<CancelReason> {
        if let Some(reason) = self.reason.get() {
            return Some(*reason);
        }

        // Deadlines are inherited, so a parent that timed out implies the
        // same of this token.
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            let reason = *self.reason.get_or_init(|| CancelReason::DeadlineExceeded);
            self.token.cancel();
            return Some(reason);
        }

        if self.token.is_cancelled() {
            return Some(*self.reason.get_or_init(|| CancelReason::Cancelled));
        }

        None
    }
}

/// A cancellation token.
///
/// Clones share the same cancellation state. See the
/// [module-level documentation](self) for more information.
#[derive(Clone)]
pub struct Token {
    inner: Option<Arc<TokenInner>>,
}

impl Token {
    /// A token that can never fire.
    pub const fn never() -> Self {
        Self { inner: None }
    }

    /// A token that fires once [Token::cancel] is called.
    pub fn new() -> Self {
        Self {
            inner: Some(TokenInner::new(CancellationToken::new(), None)),
        }
    }

    /// A token that fires once [Token::cancel] is called or `deadline` has
    /// passed, whichever comes first.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: Some(TokenInner::new(CancellationToken::new(), Some(deadline))),
        }
    }

    /// A token that fires once [Token::cancel] is called or `timeout` has
    /// elapsed from now, whichever comes first.
    ///
    /// A timeout too large to be represented as an [Instant] means no
    /// deadline at all.
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::new(),
        }
    }

    /// Derive a token that fires when this one does.
    ///
    /// Cancelling the child leaves the parent untouched. A child of
    /// [Token::never] is equivalent to [Token::new].
    pub fn child(&self) -> Self {
        self.child_inner(None)
    }

    /// Derive a token that fires when this one does or when `timeout` has
    /// elapsed from now, whichever comes first.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        self.child_inner(Instant::now().checked_add(timeout))
    }

    fn child_inner(&self, deadline: Option<Instant>) -> Self {
        let Some(parent) = &self.inner else {
            return Self {
                inner: Some(TokenInner::new(CancellationToken::new(), deadline)),
            };
        };

        let deadline = match (parent.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        Self {
            inner: Some(TokenInner::new(parent.token.child_token(), deadline)),
        }
    }

    /// Cancel this token and all tokens derived from it. Returns `false` if
    /// the token had already fired or can never fire.
    pub fn cancel(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.cancel(CancelReason::Cancelled),
            None => false,
        }
    }

    /// Returns whether this token can ever fire.
    pub fn can_fire(&self) -> bool {
        self.inner.is_some()
    }

    /// Returns whether this token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Why this token fired, or `None` if it has not fired (yet).
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.as_ref().and_then(|inner| inner.reason())
    }

    /// The point in time after which this token fires on its own, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.as_ref().and_then(|inner| inner.deadline)
    }

    /// Block the calling thread until either `signal` fires or this token
    /// does.
    ///
    /// The signal always wins: if both have fired by the time the calling
    /// thread wakes up, `Ok(())` is returned.
    pub fn wait_for(&self, signal: &Signal) -> Result<(), CancelReason> {
        let Some(inner) = &self.inner else {
            signal.wait();
            return Ok(());
        };

        let mut waiter = Waiter::new();
        let waker = waiter.waker().clone();
        let mut cx = Context::from_waker(&waker);
        let mut cancelled = pin!(inner.token.cancelled());

        loop {
            waiter.watch(signal);
            // Registers the waker with the token until it fires.
            let _ = cancelled.as_mut().poll(&mut cx);

            if signal.is_fired() {
                return Ok(());
            }

            if let Some(reason) = inner.reason() {
                return Err(reason);
            }

            match inner.deadline {
                Some(deadline) => {
                    thread::park_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => thread::park(),
            }
        }
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("can_fire", &self.can_fire())
            .field("reason", &self.reason())
            .field("deadline", &self.deadline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Token;
    use crate::{error::CancelReason, signal::Signal};
    use std::{
        thread,
        time::{Duration, Instant},
    };

    #[test]
    fn never() {
        let t = Token::never();
        assert!(!t.can_fire());
        assert!(!t.cancel());
        assert!(!t.is_cancelled());
        assert_eq!(t.deadline(), None);
    }

    #[test]
    fn cancel_once() {
        let t = Token::new();
        let t2 = t.clone();
        assert!(t.can_fire());
        assert!(!t.is_cancelled());
        assert!(t2.cancel());
        assert!(!t.cancel());
        assert_eq!(t.reason(), Some(CancelReason::Cancelled));
    }

    #[test]
    fn children() {
        let parent = Token::new();
        let a = parent.child();
        let b = a.child();
        let c = parent.child();

        assert!(c.cancel());
        assert!(!parent.is_cancelled());
        assert!(!a.is_cancelled());

        parent.cancel();
        assert_eq!(a.reason(), Some(CancelReason::Cancelled));
        assert_eq!(b.reason(), Some(CancelReason::Cancelled));

        let late = parent.child();
        assert!(late.is_cancelled());
    }

    #[test]
    fn child_of_never() {
        let t = Token::never().child();
        assert!(t.can_fire());
        assert!(t.cancel());
    }

    #[test]
    fn deadline() {
        let t = Token::with_timeout(Duration::from_millis(100));
        assert!(!t.is_cancelled());
        thread::sleep(Duration::from_millis(150));
        assert_eq!(t.reason(), Some(CancelReason::DeadlineExceeded));

        // An explicit cancel afterwards doesn't change the reason.
        assert!(!t.cancel());
        assert_eq!(t.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[test]
    fn huge_timeouts_mean_no_deadline() {
        let t = Token::with_timeout(Duration::MAX);
        assert!(t.can_fire());
        assert_eq!(t.deadline(), None);
        assert!(!t.is_cancelled());

        let child = Token::new().child_with_timeout(Duration::MAX);
        assert_eq!(child.deadline(), None);

        let parent = Token::with_timeout(Duration::from_secs(60));
        let child = parent.child_with_timeout(Duration::MAX);
        assert_eq!(child.deadline(), parent.deadline());

        assert!(t.cancel());
        assert_eq!(t.reason(), Some(CancelReason::Cancelled));
    }

    #[test]
    fn parent_deadline_reaches_child() {
        let parent = Token::with_timeout(Duration::from_millis(50));
        let child = parent.child();
        let s = Signal::new();

        assert_eq!(child.wait_for(&s), Err(CancelReason::DeadlineExceeded));
        assert_eq!(parent.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[test]
    fn wait_for_parent_cancel() {
        let parent = Token::new();
        let child = parent.child();
        let s = Signal::new();

        let th = {
            let parent = parent.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                parent.cancel();
            })
        };

        assert_eq!(child.wait_for(&s), Err(CancelReason::Cancelled));
        assert!(!child.cancel());
        th.join().unwrap();
    }

    #[test]
    fn child_inherits_deadline() {
        let parent = Token::with_timeout(Duration::from_millis(50));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        let child = parent.child_with_timeout(Duration::ZERO);
        assert!(child.deadline() < parent.deadline());
        assert_eq!(child.reason(), Some(CancelReason::DeadlineExceeded));
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn wait_for_signal() {
        let t = Token::new();
        let s = Signal::new();

        let th = {
            let s = s.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                s.fire();
            })
        };

        assert_eq!(t.wait_for(&s), Ok(()));
        th.join().unwrap();
    }

    #[test]
    fn wait_for_cancel() {
        let t = Token::new();
        let s = Signal::new();

        let th = {
            let t = t.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                t.cancel();
            })
        };

        assert_eq!(t.wait_for(&s), Err(CancelReason::Cancelled));
        assert!(!s.is_fired());
        th.join().unwrap();
    }

    #[test]
    fn wait_for_deadline() {
        let before = Instant::now();
        let t = Token::with_timeout(Duration::from_millis(100));
        assert_eq!(
            t.wait_for(&Signal::new()),
            Err(CancelReason::DeadlineExceeded)
        );
        assert!(before.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn signal_wins_ties() {
        let t = Token::new();
        let s = Signal::new();
        t.cancel();
        s.fire();
        assert_eq!(t.wait_for(&s), Ok(()));
    }
}
