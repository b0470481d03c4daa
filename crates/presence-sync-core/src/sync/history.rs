//! Bounded ring of recently applied deltas.
//!
//! Populated on every sequenced apply. Nothing replays from it yet; gap
//! recovery goes through snapshots.

use std::collections::VecDeque;

use crate::state::StateDelta;

/// Fixed-capacity log of `(seq, delta)` pairs, oldest evicted first
#[derive(Debug, Clone)]
pub struct DeltaHistory {
    capacity: usize,
    entries: VecDeque<(u64, StateDelta)>,
}

impl DeltaHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, seq: u64, delta: StateDelta) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((seq, delta));
    }

    /// Entries in sequence order (oldest first)
    pub fn entries(&self) -> Vec<(u64, StateDelta)> {
        self.entries.iter().cloned().collect()
    }

    /// Sequences currently retained
    pub fn seqs(&self) -> Vec<u64> {
        self.entries.iter().map(|(seq, _)| *seq).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
