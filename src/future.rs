//! Memoized, demand-driven futures.
//!
//! A [Future] wraps a fallible computation. The computation is not run when
//! the future is created; it is run at most once, the first time somebody
//! needs it, and its outcome is then shared by every handle to the future.
//!
//! There are three ways to get a computation going:
//!
//! - [Future::result] runs it (if needed) and waits for its outcome, giving up
//!   early if the caller's [Token] fires first.
//! - [Future::eager] starts it in the background without waiting, so that it
//!   can overlap with other work. Useful for dependencies that are likely to
//!   be needed later on.
//! - [Future::resolve] runs it on the calling thread and only reports whether
//!   it failed.
//!
//! This makes it cheap to describe a graph of computations up front, where
//! each node only executes if something actually asks for it:
//!
//! ```
//! use ondemand::{Future, Token};
//!
//! let token = Token::never();
//!
//! let answer = Future::<i32, String>::new(|| Ok(42)).non_blocking();
//! let unused = Future::<i32, String>::new(|| unreachable!());
//!
//! let sentence = {
//!     let answer = answer.clone();
//!     let token = token.clone();
//!     Future::new(move || {
//!         let n = answer.result(&token).map_err(|e| e.to_string())?;
//!         Ok::<_, String>(format!("the answer is {n}"))
//!     })
//! };
//!
//! assert_eq!(sentence.result(&token).unwrap(), "the answer is 42");
//! assert!(!unused.is_completed());
//! ```
//!
//! # Blocking and non-blocking computations
//!
//! By default a computation is assumed to take a while, or to block on I/O, so
//! [Future::eager] runs it on a freshly spawned thread. Computations that are
//! known to finish within microseconds and never block can be marked with
//! [Future::non_blocking]; they are then always run inline on whichever
//! thread triggers them, which avoids the cost of a thread entirely.
//!
//! # Panics
//!
//! If the computation panics, the panic is caught and re-raised in *every*
//! caller of [Future::result] and [Future::resolve]. Code that triggers a
//! future with [Future::eager] or [Future::done] must therefore also call
//! [Future::result] (or [Future::resolve]) at some point; a panic that nobody
//! observed is reported through the [leak hook](crate::leak) when the last
//! handle is dropped.
use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Once, OnceLock, PoisonError,
    },
    thread,
};

use log::{debug, trace, warn};

use crate::{
    cancel::Token,
    error::{Error, PanicError},
    leak,
    signal::Signal,
};

/// A boxed computation, as accepted by [Future::from_boxed].
pub type Body<T, E> = Box<dyn FnOnce() -> Result<T, E> + Send + 'static>;

enum Outcome<T, E> {
    Value(T),
    Failed(E),
    Panicked(PanicError),
}

struct Shared<T, E> {
    body: Mutex<Option<Body<T, E>>>,
    outcome: OnceLock<Outcome<T, E>>,
    non_blocking: AtomicBool,
    eager: Once,
    done: OnceLock<Signal>,
    observed: AtomicBool,
    name: OnceLock<String>,
}

impl<T, E> Shared<T, E> {
    fn name(&self) -> &str {
        self.name.get().map(String::as_str).unwrap_or("<unnamed>")
    }

    fn run(&self) -> Outcome<T, E> {
        // Taking the body counts as running it: if anything panics from here
        // on, a later caller must find a panicked outcome rather than a
        // missing body.
        let ran = catch_unwind(AssertUnwindSafe(|| {
            let body = self
                .body
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()?;

            trace!("future {}: running", self.name());
            Some(body())
        }));

        let outcome = match ran {
            Ok(Some(Ok(v))) => Outcome::Value(v),
            Ok(Some(Err(e))) => Outcome::Failed(e),
            Ok(None) => Outcome::Panicked(PanicError::new("future body consumed twice")),
            Err(payload) => Outcome::Panicked(PanicError::from_payload(payload)),
        };

        match &outcome {
            Outcome::Panicked(perr) => {
                debug!("future {}: panicked: {}", self.name(), perr.message())
            }
            _ => trace!("future {}: finished", self.name()),
        }

        outcome
    }

    fn complete(&self) {
        let mut fresh = false;

        let done = self.done.get_or_init(|| {
            fresh = true;
            Signal::fired()
        });

        if !fresh {
            done.fire();
        }
    }

    fn done(&self) -> &Signal {
        self.done.get_or_init(Signal::new)
    }
}

impl<T, E> Drop for Shared<T, E> {
    fn drop(&mut self) {
        if let Some(Outcome::Panicked(perr)) = self.outcome.get() {
            if !*self.observed.get_mut() {
                leak::report(perr);
            }
        }
    }
}

/// A memoized, lazily or eagerly evaluated computation.
///
/// Cloning a `Future` is cheap and yields another handle to the same
/// computation. See the [module-level documentation](self) for more
/// information.
pub struct Future<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Future<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> Future<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Wrap `f` into a future.
    ///
    /// `f` is not invoked by this function. It is invoked at most once, when
    /// [Future::result], [Future::eager], [Future::done] or [Future::resolve]
    /// is first called on any handle to the future.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        Self::from_boxed(Some(Box::new(f)))
    }

    /// Wrap an already boxed computation into a future.
    ///
    /// # Panics
    ///
    /// A future always needs something to compute: this panics if `body` is
    /// `None`.
    pub fn from_boxed(body: Option<Body<T, E>>) -> Self {
        let Some(body) = body else {
            panic!("future constructed without a body");
        };

        Self::with_shared(Some(body), OnceLock::new(), OnceLock::new())
    }

    /// A future that has already completed with `value`.
    pub fn ready(value: T) -> Self {
        Self::completed(Outcome::Value(value))
    }

    /// A future that has already completed with the error `err`.
    pub fn failed(err: E) -> Self {
        Self::completed(Outcome::Failed(err))
    }

    fn completed(outcome: Outcome<T, E>) -> Self {
        let f = Self::with_shared(
            None,
            OnceLock::from(outcome),
            OnceLock::from(Signal::fired()),
        );
        f.shared.eager.call_once(|| {});
        f
    }

    fn with_shared(
        body: Option<Body<T, E>>,
        outcome: OnceLock<Outcome<T, E>>,
        done: OnceLock<Signal>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                body: Mutex::new(body),
                outcome,
                non_blocking: AtomicBool::new(false),
                eager: Once::new(),
                done,
                observed: AtomicBool::new(false),
                name: OnceLock::new(),
            }),
        }
    }

    /// Mark the computation as non-blocking.
    ///
    /// A non-blocking computation is expected to finish quickly (no more
    /// than a few microseconds) and never block, e.g. on I/O. Such
    /// computations are always run inline instead of on a separate thread,
    /// which avoids spawning and synchronisation costs. As a consequence,
    /// [Future::eager] and [Future::done] block until the computation has
    /// finished.
    ///
    /// This should be called before the future is triggered in any way.
    /// Used inappropriately it inhibits concurrency and slows things down; in
    /// case of doubt, don't.
    #[must_use]
    pub fn non_blocking(self) -> Self {
        self.shared.non_blocking.store(true, Ordering::Release);
        self
    }

    /// Give the future a name. The name shows up in log records and as the
    /// name of the thread that [Future::eager] spawns.
    ///
    /// This should be called before the future is triggered in any way.
    /// Only the first name given to a future sticks.
    #[must_use]
    pub fn named(self, name: impl Into<String>) -> Self {
        let _ = self.shared.name.set(name.into());
        self
    }

    /// Start executing the computation now, if it hasn't been started yet.
    ///
    /// For blocking computations this spawns a thread and returns straight
    /// away. For [non-blocking](Future::non_blocking) ones the computation is
    /// run on the calling thread and this returns once it has finished.
    ///
    /// Code that calls `eager` must eventually call [Future::result] or
    /// [Future::resolve] as well, otherwise a panic in the computation is only
    /// ever seen by the [leak hook](crate::leak).
    pub fn eager(&self) {
        self.shared.eager.call_once(|| {
            if self.shared.non_blocking.load(Ordering::Acquire) {
                self.execute();
            } else {
                self.spawn();
            }
        });
    }

    /// Start executing the computation if it hasn't been started yet, and
    /// return a signal that fires once it has finished. After that, calls to
    /// [Future::result] don't block.
    ///
    /// The returned [Signal] can be waited on from a thread or `.await`ed.
    /// The same obligation to eventually call [Future::result] as for
    /// [Future::eager] applies.
    pub fn done(&self) -> Signal {
        self.eager();
        self.shared.done().clone()
    }

    /// Returns whether the computation has finished.
    pub fn is_completed(&self) -> bool {
        self.shared.outcome.get().is_some()
    }

    fn spawn(&self) {
        let name = match self.shared.name.get() {
            Some(name) => format!("ondemand:{name}"),
            None => "ondemand".to_owned(),
        };

        let this = self.clone();

        match thread::Builder::new().name(name).spawn(move || {
            this.execute();
        }) {
            Ok(_) => debug!("future {}: started in background", self.shared.name()),
            Err(e) => {
                warn!(
                    "future {}: could not spawn thread, running inline: {e}",
                    self.shared.name()
                );
                self.execute();
            }
        }
    }

    /// Run the computation on this thread, unless it has already run or is
    /// running elsewhere, in which case wait for it to finish.
    fn execute(&self) -> &Outcome<T, E> {
        let mut ran = false;

        let outcome = self.shared.outcome.get_or_init(|| {
            ran = true;
            self.shared.run()
        });

        if ran {
            self.shared.complete();
        }

        outcome
    }

    fn observe<'a>(&self, outcome: &'a Outcome<T, E>) -> Result<&'a T, &'a E> {
        match outcome {
            Outcome::Value(v) => Ok(v),
            Outcome::Failed(e) => Err(e),
            Outcome::Panicked(perr) => {
                self.shared.observed.store(true, Ordering::Release);
                panic!("{perr}");
            }
        }
    }

    /// Run the computation on the calling thread, if it hasn't been started
    /// yet, and return its error, if any. The value is discarded.
    ///
    /// If the computation is already running elsewhere this waits for it to
    /// finish. Mostly useful to hand a future to code that drives fallible
    /// jobs, such as a pool of scoped threads.
    ///
    /// # Panics
    ///
    /// If the computation panicked, the panic is propagated to the caller.
    pub fn resolve(&self) -> Result<(), E>
    where
        E: Clone,
    {
        let outcome = self.execute();

        self.observe(outcome).map(|_| ()).map_err(|e| e.clone())
    }
}

impl<T, E> Future<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Return the outcome of the computation, once it has finished.
    ///
    /// Every call returns the same outcome, and the computation is invoked at
    /// most once no matter how many times, or from how many threads, this is
    /// called.
    ///
    /// If `token` can never fire (see [Token::never]) and the computation
    /// hasn't been started, it is run right here on the calling thread.
    /// Otherwise the computation is started with [Future::eager], unless
    /// `token` has already fired, and this waits for either the outcome or
    /// the token. An outcome that is available always takes priority over
    /// the token: only if the token fires *first* does this return
    /// [Error::Cancelled]. In that case the computation carries on in the
    /// background for the benefit of other callers.
    ///
    /// # Panics
    ///
    /// If the computation panicked, the panic is propagated to every caller,
    /// with a message starting with `panic: ` followed by the original panic
    /// message.
    pub fn result(&self, token: &Token) -> Result<T, Error<E>> {
        if !token.can_fire() {
            let outcome = self.execute();

            return self
                .observe(outcome)
                .cloned()
                .map_err(|e| Error::Failed(e.clone()));
        }

        if !token.is_cancelled() {
            self.eager();
        }

        if let Err(reason) = token.wait_for(self.shared.done()) {
            debug!("future {}: stopped waiting: {reason}", self.shared.name());
            return Err(Error::Cancelled(reason));
        }

        match self.shared.outcome.get() {
            Some(outcome) => self
                .observe(outcome)
                .cloned()
                .map_err(|e| Error::Failed(e.clone())),
            None => unreachable!("future signalled completion without an outcome"),
        }
    }

    /// Return the outcome of the computation if it has already finished,
    /// without starting or waiting for it.
    ///
    /// # Panics
    ///
    /// Like [Future::result], if the computation panicked.
    pub fn try_result(&self) -> Option<Result<T, E>> {
        let outcome = self.shared.outcome.get()?;

        Some(self.observe(outcome).cloned().map_err(|e| e.clone()))
    }
}

impl<T, E> fmt::Debug for Future<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("name", &self.shared.name.get())
            .field("non_blocking", &self.shared.non_blocking.load(Ordering::Relaxed))
            .field("completed", &self.shared.outcome.get().is_some())
            .finish()
    }
}
