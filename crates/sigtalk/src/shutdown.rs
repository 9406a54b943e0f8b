use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction,
};

static SHUTDOWN_SIGNALED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_signo: libc::c_int) {
    SHUTDOWN_SIGNALED.store(true, Ordering::SeqCst);
}

/// SIGINT/SIGTERM turn into a flag the server's wait loop checks between
/// signals, so it can leave the loop and release its buffer.
#[derive(Clone, Copy, Debug)]
pub struct Shutdown {
    _private: (),
}

impl Shutdown {
    pub const SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

    pub fn install() -> nix::Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(on_shutdown_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for signal in Self::SIGNALS {
            // SAFETY: the handler only stores to an atomic.
            unsafe { sigaction(signal, &action)? };
        }
        Ok(Self { _private: () })
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        SHUTDOWN_SIGNALED.load(Ordering::SeqCst)
    }
}
