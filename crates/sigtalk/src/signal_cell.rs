use std::cell::UnsafeCell;

use nix::sys::signal::{SigSet, SigmaskHow, pthread_sigmask};

/// Process-wide state shared between a signal handler and the main flow.
///
/// Access discipline: the value is only touched while every signal whose
/// handler can reach it is blocked. Inside the handler that is guaranteed by
/// registering it with those signals in `sa_mask`; everywhere else
/// [`SignalCell::with_blocked`] blocks them for the duration of the closure.
/// The process must stay single threaded for this to hold.
pub struct SignalCell<T> {
    inner: UnsafeCell<T>,
}

// SAFETY: see the access discipline above; no two accesses ever overlap.
unsafe impl<T: Send> Sync for SignalCell<T> {}

impl<T> SignalCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: UnsafeCell::new(value),
        }
    }

    /// Run `f` with the value from the main flow, with `guarded` blocked.
    /// The previous signal mask is restored afterwards.
    pub fn with_blocked<R>(
        &self,
        guarded: &SigSet,
        f: impl FnOnce(&mut T) -> R,
    ) -> nix::Result<R> {
        let mut previous = SigSet::empty();
        pthread_sigmask(
            SigmaskHow::SIG_BLOCK,
            Some(guarded),
            Some(&mut previous),
        )?;
        // SAFETY: every handler that touches the cell is blocked right now.
        let out = f(unsafe { &mut *self.inner.get() });
        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None)?;
        Ok(out)
    }

    /// Run `f` with the value from inside a signal handler.
    ///
    /// # Safety
    ///
    /// Must only be called from a handler installed with every signal that
    /// can reach this cell in its `sa_mask`, in a single threaded process.
    pub unsafe fn with_in_handler<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(unsafe { &mut *self.inner.get() })
    }
}
