//! Receiver state machine.
//!
//! One `Session` per server process. It is fed one bit at a time together
//! with the id of the process that sent it, folds bits into bytes (MSB
//! first), accumulates bytes into a [`MessageBuffer`] and flushes the message
//! when the terminator byte arrives.
//!
//! Nothing in here blocks or panics on the hot path, so `step` can be called
//! straight from a signal handler. Side effects go through [`SessionSink`].

use nix::errno::Errno;

use crate::{
    message_buffer::MessageBuffer,
    protocol_common::{BITS_PER_BYTE, Bit, BufferError, SenderId, TERMINATOR},
};

/// Who the in-progress message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionOwner {
    #[default]
    Idle,
    Sender(SenderId),
    /// Opened by a signal the kernel could not attribute to a process.
    Unattributed,
}

impl SessionOwner {
    #[must_use]
    pub fn sender(self) -> Option<SenderId> {
        match self {
            SessionOwner::Sender(id) => Some(id),
            _ => None,
        }
    }
}

/// Effects of a completed message.
pub trait SessionSink {
    /// Emit `message` followed by a newline.
    fn flush(&mut self, message: &[u8]);
    /// Tell `sender` its message was flushed.
    fn acknowledge(&mut self, sender: SenderId) -> Result<(), Errno>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Disabled,
    Sent(SenderId),
    /// The session had no attributable sender to answer.
    NoSender,
    Failed(SenderId, Errno),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Bit folded in, byte not complete yet.
    Accumulating { bits_received: u8 },
    ByteAppended { message_len: usize },
    Flushed {
        message_len: usize,
        ack: AckOutcome,
        /// False if the fresh buffer for the next message could not be
        /// allocated.
        rearmed: bool,
    },
    /// Appending failed, the message so far was dropped.
    Abandoned { error: BufferError, rearmed: bool },
    /// Resetting for a new owner failed. The bit was not folded in.
    Dropped { error: BufferError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Set when this bit displaced another owner's partial message.
    pub displaced: Option<SessionOwner>,
    pub outcome: StepOutcome,
}

#[derive(Debug, Default)]
pub struct Session {
    pending_byte: u8,
    bits_received: u8,
    message: MessageBuffer,
    owner: SessionOwner,
    ack_enabled: bool,
}

impl Session {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending_byte: 0,
            bits_received: 0,
            message: MessageBuffer::empty(),
            owner: SessionOwner::Idle,
            ack_enabled: false,
        }
    }

    pub fn set_ack_enabled(&mut self, enabled: bool) {
        self.ack_enabled = enabled;
    }

    pub fn set_capacity_limit(&mut self, limit: Option<usize>) {
        self.message.set_limit(limit);
    }

    #[must_use]
    pub fn owner(&self) -> SessionOwner {
        self.owner
    }

    #[must_use]
    pub fn pending_byte(&self) -> u8 {
        self.pending_byte
    }

    #[must_use]
    pub fn bits_received(&self) -> u8 {
        self.bits_received
    }

    #[must_use]
    pub fn message(&self) -> &MessageBuffer {
        &self.message
    }

    /// Discard everything in flight and bind the session to `owner`.
    pub fn reset(&mut self, owner: SessionOwner) -> Result<(), BufferError> {
        self.pending_byte = 0;
        self.bits_received = 0;
        self.owner = owner;
        self.message.reset()
    }

    /// Release the buffer for good. Used at shutdown.
    pub fn release(&mut self) {
        self.pending_byte = 0;
        self.bits_received = 0;
        self.owner = SessionOwner::Idle;
        self.message.release();
    }

    fn has_progress(&self) -> bool {
        self.bits_received != 0 || !self.message.is_empty()
    }

    /// Owner the session must be reset to before taking a bit from `from`,
    /// or `None` if the current owner keeps it.
    fn claim(&self, from: SenderId) -> Option<SessionOwner> {
        match (self.owner, from.is_attributed()) {
            (SessionOwner::Sender(current), true) if current == from => None,
            (_, true) => Some(SessionOwner::Sender(from)),
            (SessionOwner::Idle, false) => Some(SessionOwner::Unattributed),
            // unattributed bits belong to whoever is talking right now
            (_, false) => None,
        }
    }

    pub fn step<S: SessionSink>(
        &mut self,
        bit: Bit,
        from: SenderId,
        sink: &mut S,
    ) -> Step {
        let mut displaced = None;
        if let Some(owner) = self.claim(from) {
            if self.owner != SessionOwner::Idle && self.has_progress() {
                displaced = Some(self.owner);
            }
            if let Err(error) = self.reset(owner) {
                return Step {
                    displaced,
                    outcome: StepOutcome::Dropped { error },
                };
            }
        }

        if bit == Bit::One {
            self.pending_byte |= 1 << (BITS_PER_BYTE - 1 - self.bits_received);
        }
        self.bits_received += 1;

        if self.bits_received < BITS_PER_BYTE {
            return Step {
                displaced,
                outcome: StepOutcome::Accumulating {
                    bits_received: self.bits_received,
                },
            };
        }

        let byte = self.pending_byte;
        let outcome = if byte == TERMINATOR {
            self.finish(sink)
        } else {
            match self.message.append(byte) {
                Ok(()) => StepOutcome::ByteAppended {
                    message_len: self.message.len(),
                },
                Err(error) => {
                    let rearmed = self.reset(self.owner).is_ok();
                    StepOutcome::Abandoned { error, rearmed }
                }
            }
        };
        self.pending_byte = 0;
        self.bits_received = 0;

        Step { displaced, outcome }
    }

    fn finish<S: SessionSink>(&mut self, sink: &mut S) -> StepOutcome {
        let message_len = self.message.len();
        sink.flush(self.message.as_bytes());

        let ack = match (self.ack_enabled, self.owner.sender()) {
            (false, _) => AckOutcome::Disabled,
            (true, None) => AckOutcome::NoSender,
            (true, Some(sender)) => match sink.acknowledge(sender) {
                Ok(()) => AckOutcome::Sent(sender),
                Err(errno) => AckOutcome::Failed(sender, errno),
            },
        };

        let rearmed = self.reset(SessionOwner::Idle).is_ok();
        StepOutcome::Flushed {
            message_len,
            ack,
            rearmed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_common::{INITIAL_BUFFER_CAPACITY, encode_byte};

    #[derive(Default)]
    struct RecordingSink {
        lines: Vec<Vec<u8>>,
        acks: Vec<SenderId>,
        refuse_acks: bool,
    }

    impl SessionSink for RecordingSink {
        fn flush(&mut self, message: &[u8]) {
            self.lines.push(message.to_vec());
        }

        fn acknowledge(&mut self, sender: SenderId) -> Result<(), Errno> {
            if self.refuse_acks {
                return Err(Errno::ESRCH);
            }
            self.acks.push(sender);
            Ok(())
        }
    }

    fn feed_byte(
        session: &mut Session,
        byte: u8,
        from: SenderId,
        sink: &mut RecordingSink,
    ) -> Step {
        let mut last = None;
        for bit in encode_byte(byte) {
            last = Some(session.step(bit, from, sink));
        }
        last.unwrap()
    }

    #[test]
    fn bits_fold_msb_first() {
        let mut session = Session::new();
        let mut sink = RecordingSink::default();
        let from = SenderId(10);

        session.step(Bit::One, from, &mut sink);
        assert_eq!(session.pending_byte(), 0b1000_0000);
        session.step(Bit::Zero, from, &mut sink);
        session.step(Bit::One, from, &mut sink);
        assert_eq!(session.pending_byte(), 0b1010_0000);
        assert_eq!(session.bits_received(), 3);
        assert_eq!(session.owner(), SessionOwner::Sender(from));
    }

    #[test]
    fn completed_byte_is_appended_and_counters_cleared() {
        let mut session = Session::new();
        let mut sink = RecordingSink::default();

        let step = feed_byte(&mut session, b'H', SenderId(10), &mut sink);
        assert_eq!(step.outcome, StepOutcome::ByteAppended { message_len: 1 });
        assert_eq!(session.pending_byte(), 0);
        assert_eq!(session.bits_received(), 0);
        assert_eq!(session.message().as_bytes(), b"H");
    }

    #[test]
    fn terminator_flushes_and_goes_idle() {
        let mut session = Session::new();
        let mut sink = RecordingSink::default();
        let from = SenderId(10);

        feed_byte(&mut session, b'H', from, &mut sink);
        feed_byte(&mut session, b'i', from, &mut sink);
        let step = feed_byte(&mut session, 0, from, &mut sink);

        assert_eq!(
            step.outcome,
            StepOutcome::Flushed {
                message_len: 2,
                ack: AckOutcome::Disabled,
                rearmed: true
            }
        );
        assert_eq!(sink.lines, vec![b"Hi".to_vec()]);
        assert!(sink.acks.is_empty());
        assert_eq!(session.owner(), SessionOwner::Idle);
        assert!(session.message().is_empty());
    }

    #[test]
    fn ack_goes_to_the_owner() {
        let mut session = Session::new();
        session.set_ack_enabled(true);
        let mut sink = RecordingSink::default();
        let from = SenderId(77);

        feed_byte(&mut session, b'x', from, &mut sink);
        let step = feed_byte(&mut session, 0, from, &mut sink);

        assert!(matches!(
            step.outcome,
            StepOutcome::Flushed {
                ack: AckOutcome::Sent(SenderId(77)),
                ..
            }
        ));
        assert_eq!(sink.acks, vec![from]);
    }

    #[test]
    fn failed_ack_still_resets() {
        let mut session = Session::new();
        session.set_ack_enabled(true);
        let mut sink = RecordingSink {
            refuse_acks: true,
            ..Default::default()
        };
        let from = SenderId(77);

        let step = feed_byte(&mut session, 0, from, &mut sink);
        assert!(matches!(
            step.outcome,
            StepOutcome::Flushed {
                ack: AckOutcome::Failed(SenderId(77), Errno::ESRCH),
                rearmed: true,
                ..
            }
        ));
        assert_eq!(sink.lines, vec![Vec::<u8>::new()]);
        assert_eq!(session.owner(), SessionOwner::Idle);
    }

    #[test]
    fn unattributed_session_has_no_ack_target() {
        let mut session = Session::new();
        session.set_ack_enabled(true);
        let mut sink = RecordingSink::default();

        feed_byte(&mut session, b'q', SenderId::UNATTRIBUTED, &mut sink);
        assert_eq!(session.owner(), SessionOwner::Unattributed);
        let step =
            feed_byte(&mut session, 0, SenderId::UNATTRIBUTED, &mut sink);

        assert!(matches!(
            step.outcome,
            StepOutcome::Flushed {
                ack: AckOutcome::NoSender,
                ..
            }
        ));
        assert_eq!(sink.lines, vec![b"q".to_vec()]);
    }

    #[test]
    fn unattributed_bits_join_the_active_sender() {
        let mut session = Session::new();
        let mut sink = RecordingSink::default();
        let from = SenderId(5);

        session.step(Bit::Zero, from, &mut sink);
        for bit in encode_byte(b'A').skip(1) {
            session.step(bit, SenderId::UNATTRIBUTED, &mut sink);
        }
        assert_eq!(session.owner(), SessionOwner::Sender(from));
        assert_eq!(session.message().as_bytes(), b"A");
    }

    #[test]
    fn new_sender_displaces_partial_message() {
        let mut session = Session::new();
        let mut sink = RecordingSink::default();
        let first = SenderId(100);
        let second = SenderId(200);

        feed_byte(&mut session, b'o', first, &mut sink);
        session.step(Bit::Zero, first, &mut sink);

        let step = session.step(Bit::Zero, second, &mut sink);
        assert_eq!(step.displaced, Some(SessionOwner::Sender(first)));
        assert_eq!(session.owner(), SessionOwner::Sender(second));
        assert!(session.message().is_empty());
        assert_eq!(session.bits_received(), 1);
    }

    #[test]
    fn capacity_limit_abandons_message_and_rearms_for_same_sender() {
        let mut session = Session::new();
        session.set_capacity_limit(Some(INITIAL_BUFFER_CAPACITY));
        let mut sink = RecordingSink::default();
        let from = SenderId(9);

        for _ in 0..INITIAL_BUFFER_CAPACITY - 1 {
            feed_byte(&mut session, b'a', from, &mut sink);
        }
        let step = feed_byte(&mut session, b'b', from, &mut sink);
        assert!(matches!(
            step.outcome,
            StepOutcome::Abandoned {
                error: BufferError::CapacityExceeded { .. },
                rearmed: true
            }
        ));
        assert_eq!(session.owner(), SessionOwner::Sender(from));
        assert!(session.message().is_empty());

        // next message from the same sender starts fresh
        feed_byte(&mut session, b'c', from, &mut sink);
        feed_byte(&mut session, 0, from, &mut sink);
        assert_eq!(sink.lines, vec![b"c".to_vec()]);
    }
}
