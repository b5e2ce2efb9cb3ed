use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::trace;

use crate::sequence::{SequenceNumber, SEQUENCE_WINDOW};

/// The receive-side reorder buffer: reliable payloads that arrived ahead of the
///  in-order frontier, held until the gaps before them are filled.
///
/// Invariants:
/// * no key below `next` is ever present in `pending`
/// * `next <= high + 1`, where `high` is the highest sequence ever accepted
/// * a payload crosses the in-order frontier exactly once
pub struct ReceiveBuffer {
    /// smallest sequence not yet delivered in order; doubles as the cumulative ack
    ///  value announced to the peer
    next: SequenceNumber,

    /// highest sequence ever accepted from the peer, bounding gap scans
    high: SequenceNumber,

    /// payloads received ahead of `next`. `None` entries mark sequences that were
    ///  received but whose payload was not kept because no ordered handler was
    ///  registered - they still suppress duplicate unordered delivery.
    pending: BTreeMap<SequenceNumber, Option<Bytes>>,
}

/// What [`ReceiveBuffer::accept`] decided about an arriving payload.
pub struct Accepted {
    /// false for duplicates - nothing is delivered and no state changed
    pub fresh: bool,

    /// the payloads that just became deliverable in order, oldest first
    pub ordered_run: Vec<Bytes>,
}

impl ReceiveBuffer {
    pub fn new(peer_initial_sequence: SequenceNumber) -> ReceiveBuffer {
        ReceiveBuffer {
            next: peer_initial_sequence,
            high: peer_initial_sequence,
            pending: BTreeMap::new(),
        }
    }

    /// The in-order frontier, i.e. the cumulative ack to announce to the peer.
    pub fn next_expected(&self) -> SequenceNumber {
        self.next
    }

    pub fn highest_seen(&self) -> SequenceNumber {
        self.high
    }

    /// Takes in a reliable payload that passed the window check. `keep_payload`
    ///  controls whether an ahead-of-order payload is retained for later in-order
    ///  delivery or only its presence is recorded (no ordered handler registered).
    pub fn accept(&mut self, seq: SequenceNumber, payload: Bytes, keep_payload: bool) -> Accepted {
        if seq < self.next || self.pending.contains_key(&seq) {
            return Accepted { fresh: false, ordered_run: Vec::new() };
        }

        if seq > self.high {
            self.high = seq;
        }

        let mut ordered_run = Vec::new();
        if seq == self.next {
            // the frontier payload arrived - deliver it and everything buffered behind it
            ordered_run.push(payload);
            self.next = self.next.next();
            while let Some(entry) = self.pending.remove(&self.next) {
                if let Some(buffered) = entry {
                    ordered_run.push(buffered);
                }
                self.next = self.next.next();
            }
            trace!("frontier advanced to {}, {} payloads deliverable", self.next, ordered_run.len());
        }
        else {
            self.pending.insert(seq, keep_payload.then_some(payload));
        }

        Accepted { fresh: true, ordered_run }
    }

    /// The sequences missing between the in-order frontier (inclusive) and
    ///  `end` (exclusive), to be re-requested from the peer. The scan is capped at
    ///  [`SEQUENCE_WINDOW`] entries; anything beyond will surface in a later scan.
    pub fn missing_up_to(&self, end: SequenceNumber) -> Vec<SequenceNumber> {
        let mut missing = Vec::new();
        let mut seq = self.next;
        let mut scanned = 0;
        while seq < end && scanned < SEQUENCE_WINDOW {
            if !self.pending.contains_key(&seq) {
                missing.push(seq);
            }
            seq = seq.next();
            scanned += 1;
        }
        missing
    }

    /// The sequences missing below the highest accepted one - the gap scan after a
    ///  reliable payload arrived.
    pub fn missing_below_high(&self) -> Vec<SequenceNumber> {
        self.missing_up_to(self.high)
    }

    /// Drops the buffered out-of-order payloads. Called when the session closes.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
