//! One-shot broadcast signals.
//!
//! A [Signal] starts out unfired and can be fired exactly once. Once fired it
//! stays fired forever, so any number of observers can check or wait on it,
//! before or after the fact, and they will all see the same thing.
//!
//! Signals are cheap to clone; every clone refers to the same underlying
//! signal. A thread can block on a signal with [Signal::wait] (or one of its
//! timed variants), and an asynchronous task can simply `.await` it, since
//! [Signal] implements [std::future::Future].
//!
//! # Example
//!
//! ```
//! use ondemand::Signal;
//! use std::thread;
//!
//! let signal = Signal::new();
//!
//! let t = {
//!     let signal = signal.clone();
//!     thread::spawn(move || signal.wait())
//! };
//!
//! assert!(signal.fire());
//! assert!(!signal.fire());
//! t.join().unwrap();
//! assert!(signal.is_fired());
//! ```
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    task::{Context, Poll, Wake, Waker},
    thread::{self, Thread},
    time::{Duration, Instant},
};

use slab::Slab;

struct SignalInner {
    fired: AtomicBool,
    waiters: Mutex<Slab<Waker>>,
}

/// A broadcast, fire-once signal.
///
/// See the [module-level documentation](self) for more information.
pub struct Signal {
    inner: Arc<SignalInner>,
    // Registration of this handle while it is being polled as a future.
    key: Option<usize>,
}

static FIRED: OnceLock<Signal> = OnceLock::new();

impl Signal {
    /// Create a new, unfired signal.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                fired: AtomicBool::new(false),
                waiters: Mutex::new(Slab::new()),
            }),
            key: None,
        }
    }

    /// Return a handle to a process-wide signal that has already fired.
    ///
    /// This never allocates after the first call.
    pub(crate) fn fired() -> Self {
        FIRED
            .get_or_init(|| {
                let s = Signal::new();
                s.fire();
                s
            })
            .clone()
    }

    pub(crate) fn ptr_eq(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn waiters(&self) -> MutexGuard<'_, Slab<Waker>> {
        self.inner
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Fire the signal, waking everybody that is waiting on it.
    ///
    /// Returns `true` if this call fired the signal and `false` if it had
    /// already been fired.
    pub fn fire(&self) -> bool {
        let wakers = {
            let mut waiters = self.waiters();

            if self.inner.fired.swap(true, Ordering::AcqRel) {
                return false;
            }

            std::mem::take(&mut *waiters)
        };

        for waker in wakers.into_iter().map(|(_, w)| w) {
            waker.wake();
        }

        true
    }

    /// Returns whether the signal has been fired.
    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Register `waker` to be woken when the signal fires. Returns `None`,
    /// without registering anything, if the signal has already fired.
    pub(crate) fn register(&self, waker: &Waker) -> Option<usize> {
        let mut waiters = self.waiters();

        if self.is_fired() {
            return None;
        }

        Some(waiters.insert(waker.clone()))
    }

    /// Replace the waker registered under `key`.
    fn reregister(&self, key: usize, waker: &Waker) {
        let mut waiters = self.waiters();

        if self.is_fired() {
            return;
        }

        if let Some(w) = waiters.get_mut(key) {
            w.clone_from(waker);
        }
    }

    /// Remove a registration made with [Signal::register].
    ///
    /// Firing empties the waiter list and nothing is registered afterwards,
    /// so keys of a fired signal are simply ignored.
    pub(crate) fn deregister(&self, key: usize) {
        let mut waiters = self.waiters();

        if self.is_fired() {
            return;
        }

        waiters.try_remove(key);
    }

    /// Block the calling thread until the signal fires.
    pub fn wait(&self) {
        let mut waiter = Waiter::new();

        loop {
            waiter.watch(self);

            if self.is_fired() {
                return;
            }

            thread::park();
        }
    }

    /// Block the calling thread until the signal fires or `timeout` elapses.
    /// Returns whether the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_deadline(deadline),
            None => {
                self.wait();
                true
            }
        }
    }

    /// Block the calling thread until the signal fires or `deadline` is
    /// reached. Returns whether the signal fired.
    pub fn wait_deadline(&self, deadline: Instant) -> bool {
        let mut waiter = Waiter::new();

        loop {
            waiter.watch(self);

            if self.is_fired() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            thread::park_timeout(deadline - now);
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Signal {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            key: None,
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("fired", &self.is_fired())
            .finish()
    }
}

impl Future for Signal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.is_fired() {
            return Poll::Ready(());
        }

        let key = self.key;

        match key {
            Some(key) => self.reregister(key, cx.waker()),
            None => match self.register(cx.waker()) {
                Some(key) => self.key = Some(key),
                None => return Poll::Ready(()),
            },
        }

        if self.is_fired() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.deregister(key);
        }
    }
}

struct Unparker(Thread);

impl Wake for Unparker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Parks the current thread on one or more signals.
///
/// Each watched signal gets a single registration for the lifetime of the
/// waiter, which is removed again when the waiter is dropped.
pub(crate) struct Waiter {
    waker: Waker,
    watched: Vec<(Signal, usize)>,
}

impl Waiter {
    pub(crate) fn new() -> Self {
        Self {
            waker: Waker::from(Arc::new(Unparker(thread::current()))),
            watched: Vec::new(),
        }
    }

    /// The waker that unparks the waiting thread.
    pub(crate) fn waker(&self) -> &Waker {
        &self.waker
    }

    /// Make sure the current thread is unparked when `signal` fires. Callers
    /// must check the signal *after* watching it and before parking.
    pub(crate) fn watch(&mut self, signal: &Signal) {
        if self.watched.iter().any(|(s, _)| s.ptr_eq(signal)) {
            return;
        }

        if let Some(key) = signal.register(&self.waker) {
            self.watched.push((signal.clone(), key));
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        for (signal, key) in self.watched.drain(..) {
            signal.deregister(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Signal;
    use std::{
        future::Future,
        pin::pin,
        sync::{Arc, Barrier},
        task::{Context, Poll, Wake, Waker},
        thread,
        time::{Duration, Instant},
    };

    struct ThreadWaker(thread::Thread);

    impl Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
    }

    fn block_on<F: Future>(f: F) -> F::Output {
        let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
        let mut cx = Context::from_waker(&waker);
        let mut f = pin!(f);

        loop {
            match f.as_mut().poll(&mut cx) {
                Poll::Ready(v) => return v,
                Poll::Pending => thread::park(),
            }
        }
    }

    #[test]
    fn fire_once() {
        let s = Signal::new();
        assert!(!s.is_fired());
        assert!(s.fire());
        assert!(s.is_fired());
        assert!(!s.fire());
        assert!(s.clone().is_fired());
    }

    #[test]
    fn wait_after_fire() {
        let s = Signal::new();
        s.fire();
        s.wait();
        s.wait();
        assert!(s.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn shared_fired_signal() {
        let a = Signal::fired();
        let b = Signal::fired();
        assert!(a.is_fired());
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn wait_timeout_expires() {
        let s = Signal::new();
        let before = Instant::now();
        assert!(!s.wait_timeout(Duration::from_millis(100)));
        assert!(before.elapsed() >= Duration::from_millis(100));
        assert!(s.inner.waiters.lock().unwrap().is_empty());
    }

    #[test]
    fn unbounded_wait_timeout() {
        let s = Signal::new();

        let t = {
            let s = s.clone();
            thread::spawn(move || s.wait_timeout(Duration::MAX))
        };

        thread::sleep(Duration::from_millis(50));
        s.fire();
        assert!(t.join().unwrap());
    }

    #[test]
    fn many_waiters() {
        let s = Signal::new();
        let barrier = Arc::new(Barrier::new(9));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let s = s.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    s.wait();
                    s.is_fired()
                })
            })
            .collect();

        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        s.fire();

        for t in threads {
            assert!(t.join().unwrap());
        }
    }

    #[test]
    fn await_signal() {
        let s = Signal::new();

        let t = {
            let s = s.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                s.fire();
            })
        };

        block_on(s.clone());
        assert!(s.is_fired());
        t.join().unwrap();
    }

    #[test]
    fn dropped_future_deregisters() {
        let s = Signal::new();
        let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
        let mut cx = Context::from_waker(&waker);

        {
            let mut f = pin!(s.clone());
            assert!(f.as_mut().poll(&mut cx).is_pending());
            assert_eq!(s.inner.waiters.lock().unwrap().len(), 1);
        }

        assert!(s.inner.waiters.lock().unwrap().is_empty());
    }
}
