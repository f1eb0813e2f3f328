//! # `ondemand`: memoized futures for demand-driven work
//!
//! This crate provides a single primitive, [Future], which wraps a fallible
//! computation so that it runs *at most once*, either lazily when its result
//! is first asked for or eagerly in the background, and shares its outcome
//! with everybody who holds a handle to it.
//!
//! Futures are meant to be composed into graphs: the computation of one future
//! simply asks other futures for their results. Only the nodes that are
//! actually needed run, while dependencies that are *probably* needed can be
//! kicked off early with [Future::eager] so that they overlap with each other.
//!
//! Waiting for a result is bounded by a cancellation [Token]. Cancellation is
//! local to the waiting call and never stops the computation itself.
//!
//! For how futures behave, see the [future] module. Cancellation tokens live in
//! [cancel], the completion signals that can be waited on (or `.await`ed) in
//! [signal], and the handling of panics nobody asked about in [leak].
//!
//! ## Example
//!
//! ```
//! use ondemand::{Future, Token};
//! use std::time::Duration;
//!
//! let slow = Future::<_, String>::new(|| {
//!     std::thread::sleep(Duration::from_millis(50));
//!     Ok("slow")
//! });
//! let fast = Future::<_, String>::new(|| Ok("fast")).non_blocking();
//!
//! // Start the slow one in the background while we get on with the fast one.
//! slow.eager();
//! assert_eq!(fast.result(&Token::never()), Ok("fast"));
//! assert_eq!(slow.result(&Token::with_timeout(Duration::from_secs(5))), Ok("slow"));
//! ```
pub mod cancel;
pub mod error;
pub mod future;
pub mod leak;
pub mod signal;

pub use cancel::Token;
pub use error::{CancelReason, Error, PanicError};
pub use future::Future;
pub use signal::Signal;
