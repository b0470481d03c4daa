//! Version numbering for authoritative deltas.
//!
//! ```text
//! Authority                     Replica (last_applied = S)
//!   stamp() -> S+1  ── DELTA ──>  classify(S+1) = Next      apply, ACK
//!                                 classify(<=S) = Duplicate drop, no ACK
//!                                 classify(>S+1) = Gap      drop, REQ_SNAPSHOT
//! ```
//!
//! There is no reorder buffer: a gap is repaired by a whole-state snapshot,
//! never by waiting for the missing delta.

/// Classification of an inbound delta sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqVerdict {
    /// Exactly the successor of the last applied sequence
    Next,
    /// Already applied (or older); replay
    Duplicate,
    /// At least one delta is missing before this one
    Gap {
        /// The sequence that should have arrived
        expected: u64,
    },
}

/// Tracks the last applied version of the shared state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sequencer {
    last_applied: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last version applied locally
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Authority side: claim the next version.
    pub fn stamp(&mut self) -> u64 {
        self.last_applied += 1;
        self.last_applied
    }

    /// Replica side: decide what to do with `seq`.
    pub fn classify(&self, seq: u64) -> SeqVerdict {
        let expected = self.last_applied + 1;
        if seq < expected {
            SeqVerdict::Duplicate
        } else if seq == expected {
            SeqVerdict::Next
        } else {
            SeqVerdict::Gap { expected }
        }
    }

    /// Record that the successor delta was applied.
    pub fn advance(&mut self, seq: u64) {
        debug_assert_eq!(seq, self.last_applied + 1);
        self.last_applied = seq;
    }

    /// Snapshot receipt: adopt the snapshot's version unconditionally,
    /// including rolling back to a lower one.
    pub fn reset(&mut self, seq: u64) {
        self.last_applied = seq;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_is_strictly_increasing() {
        let mut seq = Sequencer::new();
        assert_eq!(seq.stamp(), 1);
        assert_eq!(seq.stamp(), 2);
        assert_eq!(seq.last_applied(), 2);
    }

    #[test]
    fn test_classify() {
        let mut seq = Sequencer::new();
        seq.reset(5);
        assert_eq!(seq.classify(6), SeqVerdict::Next);
        assert_eq!(seq.classify(5), SeqVerdict::Duplicate);
        assert_eq!(seq.classify(0), SeqVerdict::Duplicate);
        assert_eq!(seq.classify(7), SeqVerdict::Gap { expected: 6 });
    }

    #[test]
    fn test_reset_allows_rollback() {
        let mut seq = Sequencer::new();
        seq.reset(10);
        seq.reset(3);
        assert_eq!(seq.last_applied(), 3);
        assert_eq!(seq.classify(4), SeqVerdict::Next);
        assert_eq!(seq.stamp(), 4);
    }
}
