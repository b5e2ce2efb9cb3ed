use std::fmt::{Display, Formatter};

use rand::Rng;

/// The bounded distance within which sequence numbers are considered valid relative
///  to the current window frontiers. Packets outside this distance are rejected as
///  stale or forged without keeping per-packet ack state.
pub const SEQUENCE_WINDOW: i32 = 100;

/// A sequence number naming an outbound reliable payload, unique within a session
///  per direction.
///
/// Sequence numbers are *signed* 32-bit values, and all window comparisons are done
///  on the signed representation. Sessions start near `i32::MIN` (see
///  [`SequenceNumber::random_initial`]), so the signed order is the session order -
///  a full 32-bit wrap is not reached within any realistic session length.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SequenceNumber(i32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub fn from_raw(value: i32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> i32 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    pub fn prev(&self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_sub(1))
    }

    pub fn plus(&self, offset: i32) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(offset))
    }

    /// Picks the starting sequence for a new session: `i32::MIN` plus a small random
    ///  offset, freshly drawn from the OS-seeded thread rng per session.
    ///
    /// The offset starts at [`SEQUENCE_WINDOW`] so that `initial - SEQUENCE_WINDOW`
    ///  cannot wrap below `i32::MIN`, which would break the signed ack window check
    ///  right at session start.
    pub fn random_initial() -> SequenceNumber {
        SequenceNumber(i32::MIN.wrapping_add(rand::thread_rng().gen_range(SEQUENCE_WINDOW..0x8000)))
    }
}

/// The context-validity check for a received `(seq, ack)` pair: the sequence must lie
///  inside the receive window and the ack inside the send window, both bounded by
///  [`SEQUENCE_WINDOW`].
pub fn window_accepts(
    seq: SequenceNumber,
    ack: SequenceNumber,
    recv_next: SequenceNumber,
    recv_high: SequenceNumber,
    send_next: SequenceNumber,
) -> bool {
    seq >= recv_next
        && seq < recv_high.plus(SEQUENCE_WINDOW)
        && ack <= send_next
        && ack > send_next.plus(-SEQUENCE_WINDOW)
}
