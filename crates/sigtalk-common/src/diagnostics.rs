use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crate::session::{AckOutcome, Step, StepOutcome};

/// Counters bumped from the signal handler and read from the main flow.
///
/// Handlers must not log (the subscriber locks and allocates), so they only
/// touch these atomics. The server drains them between signals.
#[derive(Debug, Default)]
pub struct Diagnostics {
    messages: AtomicU64,
    bytes: AtomicU64,
    displaced: AtomicU64,
    abandoned: AtomicU64,
    dropped_bits: AtomicU64,
    rearm_failures: AtomicU64,
    acks_sent: AtomicU64,
    ack_failures: AtomicU64,
    last_ack_errno: AtomicI32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub messages: u64,
    pub bytes: u64,
    pub displaced: u64,
    pub abandoned: u64,
    pub dropped_bits: u64,
    pub rearm_failures: u64,
    pub acks_sent: u64,
    pub ack_failures: u64,
    /// errno of the most recent failed acknowledgment, 0 if none
    pub last_ack_errno: i32,
}

impl Diagnostics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            displaced: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            dropped_bits: AtomicU64::new(0),
            rearm_failures: AtomicU64::new(0),
            acks_sent: AtomicU64::new(0),
            ack_failures: AtomicU64::new(0),
            last_ack_errno: AtomicI32::new(0),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record(&self, step: &Step) {
        if step.displaced.is_some() {
            Self::bump(&self.displaced);
        }

        match step.outcome {
            StepOutcome::Accumulating { .. } => {}
            StepOutcome::ByteAppended { .. } => Self::bump(&self.bytes),
            StepOutcome::Flushed { ack, rearmed, .. } => {
                Self::bump(&self.messages);
                if !rearmed {
                    Self::bump(&self.rearm_failures);
                }
                match ack {
                    AckOutcome::Sent(_) => Self::bump(&self.acks_sent),
                    AckOutcome::Failed(_, errno) => {
                        self.last_ack_errno
                            .store(errno as i32, Ordering::Relaxed);
                        Self::bump(&self.ack_failures);
                    }
                    AckOutcome::Disabled | AckOutcome::NoSender => {}
                }
            }
            StepOutcome::Abandoned { rearmed, .. } => {
                Self::bump(&self.abandoned);
                if !rearmed {
                    Self::bump(&self.rearm_failures);
                }
            }
            StepOutcome::Dropped { .. } => {
                Self::bump(&self.dropped_bits);
                Self::bump(&self.rearm_failures);
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            displaced: self.displaced.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            dropped_bits: self.dropped_bits.load(Ordering::Relaxed),
            rearm_failures: self.rearm_failures.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            last_ack_errno: self.last_ack_errno.load(Ordering::Relaxed),
        }
    }
}

impl DiagnosticsSnapshot {
    /// What changed between `earlier` and `self`.
    #[must_use]
    pub fn since(&self, earlier: &DiagnosticsSnapshot) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            messages: self.messages.saturating_sub(earlier.messages),
            bytes: self.bytes.saturating_sub(earlier.bytes),
            displaced: self.displaced.saturating_sub(earlier.displaced),
            abandoned: self.abandoned.saturating_sub(earlier.abandoned),
            dropped_bits: self
                .dropped_bits
                .saturating_sub(earlier.dropped_bits),
            rearm_failures: self
                .rearm_failures
                .saturating_sub(earlier.rearm_failures),
            acks_sent: self.acks_sent.saturating_sub(earlier.acks_sent),
            ack_failures: self
                .ack_failures
                .saturating_sub(earlier.ack_failures),
            last_ack_errno: self.last_ack_errno,
        }
    }

    #[must_use]
    pub fn is_quiet(&self) -> bool {
        *self
            == DiagnosticsSnapshot {
                last_ack_errno: self.last_ack_errno,
                ..Default::default()
            }
    }
}
