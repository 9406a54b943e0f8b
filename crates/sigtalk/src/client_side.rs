use std::{
    os::unix::ffi::OsStringExt,
    sync::atomic::{AtomicBool, AtomicI32, Ordering},
    thread,
    time::Duration,
};

use nix::{
    sys::signal::{SaFlags, SigAction, SigHandler, SigSet, kill, sigaction},
    unistd::Pid,
};
use sigtalk_common::protocol_common::{
    ACK_POLL_INTERVAL, AckTimeoutSnafu, Bit, ProtocolError, SIG_ACK,
    SignalSnafu, encode_message,
};
use snafu::ResultExt;
use tracing::{debug, trace};

use crate::cli::ClientArgs;

static ACK_RECEIVED: AtomicBool = AtomicBool::new(false);
static ACK_EXPECTED_FROM: AtomicI32 = AtomicI32::new(0);

/// Something that can put one bit on the wire.
pub trait Transport {
    fn send_bit(&mut self, bit: Bit) -> Result<(), ProtocolError>;
}

/// One `kill(2)` per bit, followed by a fixed pause.
pub struct SignalTransport {
    target: Pid,
    bit_delay: Duration,
}

impl SignalTransport {
    #[must_use]
    pub fn new(target: Pid, bit_delay: Duration) -> Self {
        Self { target, bit_delay }
    }
}

impl Transport for SignalTransport {
    fn send_bit(&mut self, bit: Bit) -> Result<(), ProtocolError> {
        kill(self.target, bit.signal()).context(SignalSnafu)?;
        thread::sleep(self.bit_delay);
        Ok(())
    }
}

/// Send `message` and its terminator. Stops at the first bit that cannot be
/// delivered; nothing is retried. Returns the number of bits sent.
pub fn transmit<T: Transport>(
    transport: &mut T,
    message: &[u8],
) -> Result<usize, ProtocolError> {
    let mut sent = 0;
    for bit in encode_message(message)? {
        transport.send_bit(bit)?;
        sent += 1;
    }
    trace!(bits = sent, "transmitted");
    Ok(sent)
}

extern "C" fn on_ack_signal(
    _signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let from = if info.is_null() {
        0
    } else {
        // SAFETY: valid siginfo with SA_SIGINFO.
        unsafe { (*info).si_pid() }
    };
    if from == 0 || from == ACK_EXPECTED_FROM.load(Ordering::SeqCst) {
        ACK_RECEIVED.store(true, Ordering::SeqCst);
    }
}

/// Catches the server's acknowledgment. Installed before the first bit goes
/// out so an acknowledging server never hits the default action of
/// `SIG_ACK`, which would terminate us.
#[derive(Debug)]
pub struct AckListener {
    server: Pid,
}

impl AckListener {
    pub fn install(server: Pid) -> Result<Self, ProtocolError> {
        ACK_EXPECTED_FROM.store(server.as_raw(), Ordering::SeqCst);
        ACK_RECEIVED.store(false, Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::SigAction(on_ack_signal),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handler only touches atomics.
        unsafe { sigaction(SIG_ACK, &action) }.context(SignalSnafu)?;
        Ok(Self { server })
    }

    #[must_use]
    pub fn received(&self) -> bool {
        ACK_RECEIVED.load(Ordering::SeqCst)
    }

    /// Poll once a second for up to `ceiling_secs`.
    pub fn wait(&self, ceiling_secs: u32) -> Result<u32, ProtocolError> {
        debug!(
            server = self.server.as_raw(),
            ceiling_secs,
            "waiting for acknowledgment"
        );
        poll_with_ceiling(|| self.received(), ceiling_secs, ACK_POLL_INTERVAL)
    }
}

/// Check `ready` up to `ceiling` times, sleeping `interval` in between.
/// Returns how many intervals passed before it turned true. A timeout is only
/// reported after all `ceiling` intervals have been slept.
pub fn poll_with_ceiling(
    mut ready: impl FnMut() -> bool,
    ceiling: u32,
    interval: Duration,
) -> Result<u32, ProtocolError> {
    for waited in 0..ceiling {
        if ready() {
            return Ok(waited);
        }
        thread::sleep(interval);
    }
    if ready() {
        Ok(ceiling)
    } else {
        AckTimeoutSnafu {
            waited_secs: ceiling,
        }
        .fail()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub target: Pid,
    pub message: Vec<u8>,
    pub bit_delay: Duration,
    pub wait_for_ack: bool,
    pub ack_timeout_secs: u32,
}

impl From<ClientArgs> for ClientConfig {
    fn from(args: ClientArgs) -> Self {
        Self {
            target: args.pid,
            message: args.message.into_vec(),
            bit_delay: Duration::from_micros(args.bit_delay_us),
            wait_for_ack: args.ack,
            ack_timeout_secs: args.ack_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent { bits: usize },
    Acknowledged { bits: usize, waited_secs: u32 },
}

pub fn run_client(config: &ClientConfig) -> Result<Delivery, ProtocolError> {
    let listener = AckListener::install(config.target)?;
    let mut transport = SignalTransport::new(config.target, config.bit_delay);

    let bits = transmit(&mut transport, &config.message)?;
    debug!(
        server = config.target.as_raw(),
        bytes = config.message.len(),
        bits,
        "message sent"
    );

    if !config.wait_for_ack {
        return Ok(Delivery::Sent { bits });
    }
    let waited_secs = listener.wait(config.ack_timeout_secs)?;
    Ok(Delivery::Acknowledged { bits, waited_secs })
}
