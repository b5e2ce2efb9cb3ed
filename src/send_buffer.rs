use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::sequence::{SequenceNumber, SEQUENCE_WINDOW};

/// The send-side reliability store: a copy of every outbound reliable payload, keyed
///  by its sequence number, retained until the peer cumulatively acks past it. The
///  peer's explicit Request packets are answered from here.
pub struct SendBuffer {
    /// next sequence to be assigned to an outbound reliable payload
    next: SequenceNumber,

    retained: BTreeMap<SequenceNumber, Bytes>,
}

impl SendBuffer {
    pub fn new(initial_sequence: SequenceNumber) -> SendBuffer {
        SendBuffer {
            next: initial_sequence,
            retained: BTreeMap::new(),
        }
    }

    /// The sequence the next reliable payload will be assigned.
    pub fn next_sequence(&self) -> SequenceNumber {
        self.next
    }

    /// The last sequence actually used, i.e. the reference sequence announced in
    ///  KeepAlive packets. Before the first reliable send this is one below the
    ///  initial sequence.
    pub fn last_used_sequence(&self) -> SequenceNumber {
        self.next.prev()
    }

    /// Assigns the next sequence to `payload`, retains a copy for retransmission and
    ///  returns the assigned sequence.
    ///
    /// Entries that have fallen more than [`SEQUENCE_WINDOW`] behind the send frontier
    ///  are discarded: the peer's window has moved past them, so a Request for them
    ///  can no longer be answered usefully.
    pub fn store(&mut self, payload: Bytes) -> SequenceNumber {
        let seq = self.next;
        self.retained.insert(seq, payload);
        self.next = self.next.next();

        let lower_bound = self.next.plus(-SEQUENCE_WINDOW);
        while let Some((&oldest, _)) = self.retained.first_key_value() {
            if oldest >= lower_bound {
                break;
            }
            debug!("retained payload #{} fell out of the sequence window - discarding", oldest);
            self.retained.remove(&oldest);
        }

        seq
    }

    /// Cumulative ack: the peer has delivered everything strictly below `ack`, so the
    ///  copies below it will never be requested again. This is the only path that
    ///  releases retained payloads.
    pub fn apply_cumulative_ack(&mut self, ack: SequenceNumber) {
        let mut evicted = 0;
        while let Some((&oldest, _)) = self.retained.first_key_value() {
            if oldest >= ack {
                break;
            }
            self.retained.remove(&oldest);
            evicted += 1;
        }
        if evicted > 0 {
            trace!("cumulative ack {} released {} retained payloads", ack, evicted);
        }
    }

    /// Looks up the retained payload for an explicit retransmit Request. `None` means
    ///  the payload was already cumulatively acked and the request is obsolete.
    pub fn retained(&self, seq: SequenceNumber) -> Option<Bytes> {
        self.retained.get(&seq).cloned()
    }

    /// Drops every retained payload. Called when the session closes - nothing will be
    ///  requested afterwards.
    pub fn clear(&mut self) {
        self.retained.clear();
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.retained.len()
    }
}
