//! Detection of panics that nobody observed.
//!
//! When a future's computation panics, the panic is stored and re-raised in
//! every caller of [Future::result](crate::Future::result). If the caller
//! only ever called [Future::eager](crate::Future::eager) or
//! [Future::done](crate::Future::done) and never asked for the result, the
//! panic would otherwise vanish without a trace.
//!
//! To prevent that, dropping the last handle to a future that is holding an
//! unobserved panic invokes the leak hook. The default hook logs the panic and
//! then aborts the process. The last handle is often dropped by the worker
//! thread of a blocking future, where a plain panic would only end that
//! thread.
//!
//! The hook is process-wide and can be replaced, much like
//! [std::panic::set_hook]:
//!
//! ```
//! use ondemand::{leak, Future};
//! use std::sync::{Arc, Mutex};
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let prev = {
//!     let seen = seen.clone();
//!     leak::set_hook(move |perr| seen.lock().unwrap().push(perr.message().to_owned()))
//! };
//!
//! let f = Future::<i32, ()>::new(|| panic!("lost and found")).non_blocking();
//! f.eager();
//! drop(f);
//!
//! leak::restore_hook(prev);
//! assert_eq!(*seen.lock().unwrap(), ["lost and found"]);
//! ```
use std::sync::{Arc, PoisonError, RwLock};

use log::error;

use crate::error::PanicError;

/// A leak hook, see [set_hook].
pub type Hook = Arc<dyn Fn(&PanicError) + Send + Sync>;

static HOOK: RwLock<Option<Hook>> = RwLock::new(None);

/// Serializes unit tests that replace the process-wide hook.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Install `hook` as the leak hook, returning the previously installed one
/// (`None` for the default hook).
pub fn set_hook(hook: impl Fn(&PanicError) + Send + Sync + 'static) -> Option<Hook> {
    restore_hook(Some(Arc::new(hook)))
}

/// Reinstate a hook previously returned by [set_hook] or [take_hook]. Passing
/// `None` reinstates the default hook. Returns the hook that was replaced.
pub fn restore_hook(hook: Option<Hook>) -> Option<Hook> {
    let mut slot = HOOK.write().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *slot, hook)
}

/// Remove the current leak hook, reinstating the default one, and return it.
pub fn take_hook() -> Option<Hook> {
    restore_hook(None)
}

/// Report an unobserved panic through the current hook.
pub(crate) fn report(perr: &PanicError) {
    // Clone the hook out so that it may itself replace the hook, or drop
    // futures, without deadlocking.
    let hook = HOOK
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    match hook {
        Some(hook) => hook(perr),
        None => default_hook(perr),
    }
}

fn default_hook(perr: &PanicError) {
    error!("future dropped without observing its panic: {perr}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::{report, restore_hook, set_hook, take_hook, TEST_LOCK};
    use crate::error::PanicError;
    use std::{
        env,
        panic::catch_unwind,
        process::Command,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    fn perr(msg: &'static str) -> PanicError {
        PanicError::from_payload(catch_unwind(move || panic!("{msg}")).unwrap_err())
    }

    #[test]
    fn swap_hooks() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let calls = Arc::new(AtomicUsize::new(0));

        let prev = {
            let calls = calls.clone();
            set_hook(move |perr| {
                assert_eq!(perr.message(), "first");
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        report(&perr("first"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let ours = take_hook();
        assert!(ours.is_some());

        restore_hook(ours);
        report(&perr("first"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        restore_hook(prev);
    }

    #[test]
    fn default_hook_aborts() {
        const CHILD: &str = "ONDEMAND_LEAK_ABORT_CHILD";

        if env::var_os(CHILD).is_some() {
            let _ = take_hook();
            report(&perr("unheard"));
            unreachable!("the default hook returned");
        }

        // Run this same test in a child process, where it takes the branch
        // above.
        let status = Command::new(env::current_exe().unwrap())
            .args(["leak::tests::default_hook_aborts", "--exact", "--nocapture"])
            .env(CHILD, "1")
            .status()
            .unwrap();

        assert!(!status.success());

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(status.signal(), Some(6), "not killed by SIGABRT");
        }
    }
}
