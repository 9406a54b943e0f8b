use std::{iter, time::Duration};

use nix::{sys::signal::Signal, unistd::Pid};
use snafu::{Backtrace, Snafu, ensure};

/// Signal carrying a `1` bit from client to server.
pub const SIG_BIT_ONE: Signal = Signal::SIGUSR1;
/// Signal carrying a `0` bit from client to server.
pub const SIG_BIT_ZERO: Signal = Signal::SIGUSR2;
/// Signal sent back from server to client once a message was flushed.
pub const SIG_ACK: Signal = Signal::SIGUSR1;

/// Marks the end of a message on the wire. Never part of the delivered text.
pub const TERMINATOR: u8 = 0;
pub const BITS_PER_BYTE: u8 = 8;

pub const INITIAL_BUFFER_CAPACITY: usize = 64;

/// Standard signals are not queued, so the client spaces them out.
pub const DEFAULT_BIT_DELAY: Duration = Duration::from_micros(100);
pub const DEFAULT_ACK_TIMEOUT_SECS: u32 = 5;
pub const ACK_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bit {
    Zero,
    One,
}

impl Bit {
    #[must_use]
    pub fn signal(self) -> Signal {
        match self {
            Bit::Zero => SIG_BIT_ZERO,
            Bit::One => SIG_BIT_ONE,
        }
    }

    /// Map a raw signal number (as handed to a `sigaction` handler) back to a
    /// bit. Anything that is not one of the two bit kinds yields `None`.
    #[must_use]
    pub fn from_raw(signo: libc::c_int) -> Option<Self> {
        if signo == SIG_BIT_ONE as libc::c_int {
            Some(Bit::One)
        } else if signo == SIG_BIT_ZERO as libc::c_int {
            Some(Bit::Zero)
        } else {
            None
        }
    }
}

/// Process id of whoever sent a signal, as reported by `si_pid`.
/// The kernel reports 0 when it cannot attribute the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SenderId(pub i32);

impl SenderId {
    pub const UNATTRIBUTED: SenderId = SenderId(0);

    #[must_use]
    pub fn is_attributed(self) -> bool {
        self.0 != 0
    }

    #[must_use]
    pub fn as_pid(self) -> Option<Pid> {
        self.is_attributed().then(|| Pid::from_raw(self.0))
    }
}

impl From<Pid> for SenderId {
    fn from(pid: Pid) -> Self {
        SenderId(pid.as_raw())
    }
}

/// MSB-first bits of a single byte.
pub fn encode_byte(byte: u8) -> impl Iterator<Item = Bit> {
    (0..BITS_PER_BYTE).rev().map(move |shift| {
        if (byte >> shift) & 1 == 1 {
            Bit::One
        } else {
            Bit::Zero
        }
    })
}

/// Full bit stream for `message`, terminator included.
///
/// A zero byte inside the payload would end the message early on the
/// receiving side, so it is rejected up front.
pub fn encode_message(
    message: &[u8],
) -> Result<impl Iterator<Item = Bit> + '_, ProtocolError> {
    let position = message.iter().position(|b| *b == TERMINATOR);
    ensure!(
        position.is_none(),
        EmbeddedTerminatorSnafu {
            position: position.unwrap_or_default()
        }
    );

    Ok(message
        .iter()
        .copied()
        .chain(iter::once(TERMINATOR))
        .flat_map(encode_byte))
}

/// Failures of the message buffer. These are produced inside the signal
/// handler, so they carry no backtrace and never allocate.
#[derive(Snafu, Debug, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum BufferError {
    #[snafu(display(
        "could not allocate {requested} bytes for the message buffer"
    ))]
    Allocation { requested: usize },
    #[snafu(display(
        "message buffer would grow to {requested} bytes, above the {limit} \
         byte limit"
    ))]
    CapacityExceeded { requested: usize, limit: usize },
}

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum ProtocolError {
    #[snafu(display("signal error: {source}"))]
    Signal {
        source: nix::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("I/O error: {source}"))]
    Io {
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("buffer error: {source}"))]
    Buffer {
        source: BufferError,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("{raw:?} is not a valid process id"))]
    InvalidPid {
        raw: String,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display(
        "message contains a zero byte at offset {position}, which is reserved \
         as the terminator"
    ))]
    EmbeddedTerminator {
        position: usize,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("no acknowledgment after {waited_secs}s"))]
    AckTimeout {
        waited_secs: u32,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
}

impl From<nix::Error> for ProtocolError {
    fn from(source: nix::Error) -> Self {
        ProtocolError::Signal {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(source: std::io::Error) -> Self {
        ProtocolError::Io {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

/// Parse a process id given on the command line. Only plain positive decimal
/// values are accepted: no sign, no surrounding whitespace. 0 and negatives
/// address process groups in `kill(2)`.
pub fn parse_pid(raw: &str) -> Result<Pid, ProtocolError> {
    let digits_only = raw.bytes().all(|b| b.is_ascii_digit());
    match raw.parse::<i32>() {
        Ok(pid) if digits_only && pid > 0 => Ok(Pid::from_raw(pid)),
        _ => InvalidPidSnafu { raw }.fail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits_to_byte(bits: &[Bit]) -> u8 {
        bits.iter()
            .fold(0u8, |acc, b| (acc << 1) | u8::from(*b == Bit::One))
    }

    #[test]
    fn byte_is_sent_msb_first() {
        let bits: Vec<Bit> = encode_byte(b'H').collect();
        // 'H' = 0b0100_1000
        assert_eq!(
            bits,
            vec![
                Bit::Zero,
                Bit::One,
                Bit::Zero,
                Bit::Zero,
                Bit::One,
                Bit::Zero,
                Bit::Zero,
                Bit::Zero
            ]
        );
        assert_eq!(bits_to_byte(&bits), b'H');
    }

    #[test]
    fn message_ends_with_terminator() {
        let bits: Vec<Bit> = encode_message(b"Hi").unwrap().collect();
        assert_eq!(bits.len(), 3 * usize::from(BITS_PER_BYTE));
        assert!(bits[16..].iter().all(|b| *b == Bit::Zero));
        assert_eq!(bits_to_byte(&bits[..8]), b'H');
        assert_eq!(bits_to_byte(&bits[8..16]), b'i');
    }

    #[test]
    fn empty_message_is_only_terminator() {
        let bits: Vec<Bit> = encode_message(b"").unwrap().collect();
        assert_eq!(bits, vec![Bit::Zero; 8]);
    }

    #[test]
    fn embedded_zero_is_rejected() {
        let err = encode_message(b"a\0b").err().unwrap();
        assert!(matches!(
            err,
            ProtocolError::EmbeddedTerminator { position: 1, .. }
        ));
    }

    #[test]
    fn bit_signals_round_trip_through_raw_numbers() {
        for bit in [Bit::Zero, Bit::One] {
            assert_eq!(Bit::from_raw(bit.signal() as libc::c_int), Some(bit));
        }
        assert_eq!(Bit::from_raw(libc::SIGINT), None);
    }

    #[test]
    fn pid_parsing() {
        assert_eq!(parse_pid("4242").unwrap(), Pid::from_raw(4242));
        assert!(parse_pid("0").is_err());
        assert!(parse_pid("-12").is_err());
        assert!(parse_pid("abc").is_err());
        assert!(parse_pid("").is_err());
    }

    #[test]
    fn pid_parsing_is_strict_about_formatting() {
        for loose in [" 42", "42 ", "\t42", "+42", "4_2"] {
            assert!(parse_pid(loose).is_err(), "{loose:?} should be rejected");
        }
        assert_eq!(parse_pid("0042").unwrap(), Pid::from_raw(42));
    }

    #[test]
    fn unattributed_sender_has_no_pid() {
        assert_eq!(SenderId::UNATTRIBUTED.as_pid(), None);
        assert_eq!(SenderId(7).as_pid(), Some(Pid::from_raw(7)));
    }
}
