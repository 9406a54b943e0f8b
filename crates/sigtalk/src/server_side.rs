use std::os::fd::RawFd;

use nix::{
    errno::Errno,
    sys::signal::{
        SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, kill,
        pthread_sigmask, sigaction,
    },
};
use sigtalk_common::{
    diagnostics::{Diagnostics, DiagnosticsSnapshot},
    protocol_common::{
        Bit, BufferSnafu, ProtocolError, SIG_ACK, SIG_BIT_ONE, SIG_BIT_ZERO,
        SenderId,
    },
    session::{Session, SessionOwner, SessionSink},
};
use snafu::ResultExt;
use tracing::{debug, error, info, trace, warn};

use crate::{cli::ServerArgs, shutdown::Shutdown, signal_cell::SignalCell};

static SESSION: SignalCell<Session> = SignalCell::new(Session::new());
static DIAGNOSTICS: Diagnostics = Diagnostics::new();

#[derive(Debug, Clone, Copy, Default)]
pub struct ServerConfig {
    pub ack: bool,
    pub max_buffer_capacity: Option<usize>,
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            ack: args.ack,
            max_buffer_capacity: args.max_buffer_capacity,
        }
    }
}

#[must_use]
pub fn bit_signal_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(SIG_BIT_ONE);
    set.add(SIG_BIT_ZERO);
    set
}

/// Sink used from inside the handler: only async-signal-safe calls.
struct HandlerSink;

impl SessionSink for HandlerSink {
    fn flush(&mut self, message: &[u8]) {
        write_all_raw(libc::STDOUT_FILENO, message);
        write_all_raw(libc::STDOUT_FILENO, b"\n");
    }

    fn acknowledge(&mut self, sender: SenderId) -> Result<(), Errno> {
        let Some(pid) = sender.as_pid() else {
            return Err(Errno::ESRCH);
        };
        kill(pid, SIG_ACK)
    }
}

/// `write(2)` until done. Errors other than EINTR drop the rest; there is
/// nobody to report them to from here.
fn write_all_raw(fd: RawFd, mut buf: &[u8]) {
    while !buf.is_empty() {
        // SAFETY: `buf` is a live slice for the duration of the call.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        match usize::try_from(n) {
            Ok(0) => return,
            Ok(written) => buf = &buf[written..],
            Err(_) if Errno::last() == Errno::EINTR => {}
            Err(_) => return,
        }
    }
}

extern "C" fn on_bit_signal(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let saved_errno = Errno::last_raw();

    if let Some(bit) = Bit::from_raw(signo) {
        let from = if info.is_null() {
            SenderId::UNATTRIBUTED
        } else {
            // SAFETY: the kernel hands us a valid siginfo with SA_SIGINFO.
            SenderId(unsafe { (*info).si_pid() })
        };
        // SAFETY: registered with both bit kinds in sa_mask, and the main
        // flow keeps them blocked outside of sigsuspend.
        let step = unsafe {
            SESSION.with_in_handler(|session| {
                session.step(bit, from, &mut HandlerSink)
            })
        };
        DIAGNOSTICS.record(&step);
    }

    Errno::set_raw(saved_errno);
}

fn install_bit_handlers() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::SigAction(on_bit_signal),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        bit_signal_set(),
    );
    // SAFETY: the handler only calls async-signal-safe functions and touches
    // state guarded by the mask above.
    unsafe {
        sigaction(SIG_BIT_ONE, &action)?;
        sigaction(SIG_BIT_ZERO, &action)?;
    }
    Ok(())
}

fn log_activity(delta: &DiagnosticsSnapshot) {
    if delta.is_quiet() {
        return;
    }
    trace!(bytes = delta.bytes, "bytes reassembled");
    if delta.displaced > 0 {
        warn!(
            count = delta.displaced,
            "another client took over, partial message discarded"
        );
    }
    if delta.abandoned > 0 {
        error!(
            count = delta.abandoned,
            "could not grow message buffer, message dropped"
        );
    }
    if delta.dropped_bits > 0 {
        error!(
            count = delta.dropped_bits,
            "no message buffer available, bits dropped"
        );
    }
    if delta.rearm_failures > 0 {
        error!(
            count = delta.rearm_failures,
            "failed to allocate a fresh message buffer"
        );
    }
    if delta.ack_failures > 0 {
        warn!(
            count = delta.ack_failures,
            errno = %Errno::from_raw(delta.last_ack_errno),
            "failed to send acknowledgment"
        );
    }
    if delta.acks_sent > 0 {
        debug!(count = delta.acks_sent, "acknowledgment sent");
    }
    if delta.messages > 0 {
        info!(count = delta.messages, "message received");
    }
}

/// Print our pid, install the handlers and serve until SIGINT/SIGTERM.
///
/// The bit signals stay blocked in the main flow and are only let through
/// while parked in `sigsuspend`, so the handler never interrupts logging or
/// an allocation in progress here.
pub fn run_server(
    config: &ServerConfig,
) -> Result<DiagnosticsSnapshot, ProtocolError> {
    let guarded = bit_signal_set();
    let pid = rustix::process::getpid().as_raw_nonzero();
    println!("Server PID: {pid}");

    SESSION
        .with_blocked(&guarded, |session| {
            session.set_ack_enabled(config.ack);
            session.set_capacity_limit(config.max_buffer_capacity);
            session.reset(SessionOwner::Idle)
        })?
        .context(BufferSnafu)?;

    let shutdown = Shutdown::install()?;

    let mut wait_mask = SigSet::thread_get_mask()?;
    for signal in [SIG_BIT_ONE, SIG_BIT_ZERO]
        .into_iter()
        .chain(Shutdown::SIGNALS)
    {
        wait_mask.remove(signal);
    }
    let mut main_flow_mask = guarded;
    for signal in Shutdown::SIGNALS {
        main_flow_mask.add(signal);
    }
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&main_flow_mask), None)?;

    if let Err(err) = install_bit_handlers() {
        teardown(&guarded)?;
        return Err(err.into());
    }

    println!("Server ready. Waiting for signals...");
    info!(
        pid = pid.get(),
        ack = config.ack,
        limit = ?config.max_buffer_capacity,
        "listening"
    );

    let mut reported = DiagnosticsSnapshot::default();
    while !shutdown.is_shutdown() {
        // SAFETY: sigsuspend only swaps the signal mask while it waits.
        unsafe { libc::sigsuspend(wait_mask.as_ref()) };
        let now = DIAGNOSTICS.snapshot();
        log_activity(&now.since(&reported));
        reported = now;
    }

    teardown(&guarded)?;
    info!(
        messages = reported.messages,
        displaced = reported.displaced,
        abandoned = reported.abandoned,
        "shutting down"
    );
    Ok(reported)
}

fn teardown(guarded: &SigSet) -> nix::Result<()> {
    SESSION.with_blocked(guarded, Session::release)
}
