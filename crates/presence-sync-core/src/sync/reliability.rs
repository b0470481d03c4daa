//! Acknowledgment tracking and retransmission schedule for deltas.
//!
//! Each authoritative broadcast registers one [`PendingAck`] keyed by its
//! sequence. The session arms a timer per entry; when it fires the layer
//! decides whether to retransmit or give up:
//!
//! ```text
//! send ──base──> retry 1 ──2·base──> retry 2 ──4·base──> ... retry N ──> lost
//! ```
//!
//! Every entry carries a generation token. A timer only acts if the entry
//! for its sequence still has the token it was armed with, so an ACK or a
//! replacement broadcast that races a firing timer can never cause a second
//! retransmission.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::task::JoinHandle;

/// One unacknowledged delta
#[derive(Debug)]
pub struct PendingAck {
    pub seq: u64,
    /// Encoded envelope, resent verbatim
    pub frame: String,
    /// Sends so far, including the original
    pub attempts: u32,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl PendingAck {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Outcome of a retransmission timer firing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// The entry was acknowledged or replaced; do nothing
    Stale,
    /// Send `frame` again and re-arm after `next_delay`
    Retransmit {
        frame: String,
        /// 1-based retransmission number
        attempt: u32,
        next_delay: Duration,
    },
    /// Budget exhausted; the entry has been dropped
    Exhausted { attempts: u32 },
}

/// Pending-ACK table with exponential backoff
#[derive(Debug)]
pub struct ReliabilityLayer {
    pending: BTreeMap<u64, PendingAck>,
    base_timeout: Duration,
    max_retries: u32,
    next_generation: u64,
}

impl ReliabilityLayer {
    pub fn new(base_timeout: Duration, max_retries: u32) -> Self {
        Self {
            pending: BTreeMap::new(),
            base_timeout,
            max_retries,
            next_generation: 0,
        }
    }

    /// Wait before the timer for an entry that has been sent `attempts` times
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_timeout.saturating_mul(1u32 << exponent)
    }

    /// Register a freshly broadcast delta.
    ///
    /// Replaces (and cancels) any prior entry for the same sequence.
    /// Returns the generation token the caller must arm its timer with.
    pub fn track(&mut self, seq: u64, frame: String) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        let entry = PendingAck {
            seq,
            frame,
            attempts: 1,
            generation,
            timer: None,
        };
        if let Some(mut prior) = self.pending.insert(seq, entry) {
            prior.cancel_timer();
        }
        generation
    }

    /// Hand the layer the timer task for an entry so it can be cancelled.
    pub fn attach_timer(&mut self, seq: u64, generation: u64, timer: JoinHandle<()>) {
        match self.pending.get_mut(&seq) {
            Some(entry) if entry.generation == generation => {
                entry.cancel_timer();
                entry.timer = Some(timer);
            }
            _ => timer.abort(),
        }
    }

    /// Remove the entry for an acknowledged sequence.
    ///
    /// Returns `false` if nothing was pending (duplicate or late ACK).
    pub fn acknowledge(&mut self, seq: u64) -> bool {
        match self.pending.remove(&seq) {
            Some(mut entry) => {
                entry.cancel_timer();
                true
            }
            None => false,
        }
    }

    /// Called by the timer armed with `generation` for `seq`.
    pub fn on_timeout(&mut self, seq: u64, generation: u64) -> RetryDecision {
        let retries_done = match self.pending.get(&seq) {
            Some(entry) if entry.generation == generation => entry.attempts - 1,
            _ => return RetryDecision::Stale,
        };

        if retries_done >= self.max_retries {
            let attempts = self
                .pending
                .remove(&seq)
                .map(|e| e.attempts)
                .unwrap_or_default();
            return RetryDecision::Exhausted { attempts };
        }

        let base_timeout = self.base_timeout;
        let Some(entry) = self.pending.get_mut(&seq) else {
            return RetryDecision::Stale;
        };
        entry.attempts += 1;
        let exponent = (entry.attempts - 1).min(31);
        RetryDecision::Retransmit {
            frame: entry.frame.clone(),
            attempt: entry.attempts - 1,
            next_delay: base_timeout.saturating_mul(1u32 << exponent),
        }
    }

    /// Whether `seq` is still awaiting an ACK
    pub fn is_pending(&self, seq: u64) -> bool {
        self.pending.contains_key(&seq)
    }

    /// Sequences awaiting an ACK, ascending
    pub fn pending_seqs(&self) -> Vec<u64> {
        self.pending.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every entry and abort every timer.
    pub fn cancel_all(&mut self) {
        for (_, mut entry) in std::mem::take(&mut self.pending) {
            entry.cancel_timer();
        }
    }
}

impl Drop for ReliabilityLayer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(max_retries: u32) -> ReliabilityLayer {
        ReliabilityLayer::new(Duration::from_millis(100), max_retries)
    }

    #[test]
    fn test_backoff_doubles() {
        let layer = layer(3);
        assert_eq!(layer.delay_for(1), Duration::from_millis(100));
        assert_eq!(layer.delay_for(2), Duration::from_millis(200));
        assert_eq!(layer.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_retransmits_exactly_max_retries_then_exhausts() {
        let mut layer = layer(3);
        let generation = layer.track(1, "frame".into());

        let mut delays = Vec::new();
        for expected_attempt in 1..=3 {
            match layer.on_timeout(1, generation) {
                RetryDecision::Retransmit {
                    attempt,
                    next_delay,
                    frame,
                } => {
                    assert_eq!(attempt, expected_attempt);
                    assert_eq!(frame, "frame");
                    delays.push(next_delay.as_millis());
                }
                other => panic!("Expected retransmit, got {:?}", other),
            }
        }
        assert_eq!(delays, vec![200, 400, 800]);
        assert_eq!(
            layer.on_timeout(1, generation),
            RetryDecision::Exhausted { attempts: 4 }
        );
        assert!(!layer.is_pending(1));
        assert_eq!(layer.on_timeout(1, generation), RetryDecision::Stale);
    }

    #[test]
    fn test_zero_retries_exhausts_on_first_timeout() {
        let mut layer = layer(0);
        let generation = layer.track(5, "f".into());
        assert_eq!(
            layer.on_timeout(5, generation),
            RetryDecision::Exhausted { attempts: 1 }
        );
    }

    #[test]
    fn test_ack_is_idempotent_and_stales_timer() {
        let mut layer = layer(3);
        let generation = layer.track(2, "f".into());
        assert!(layer.acknowledge(2));
        assert!(!layer.acknowledge(2));
        assert_eq!(layer.on_timeout(2, generation), RetryDecision::Stale);
        assert!(layer.is_empty());
    }

    #[test]
    fn test_rebroadcast_replaces_entry() {
        let mut layer = layer(3);
        let old = layer.track(3, "old".into());
        let new = layer.track(3, "new".into());

        assert_eq!(layer.len(), 1);
        assert_eq!(layer.on_timeout(3, old), RetryDecision::Stale);
        match layer.on_timeout(3, new) {
            RetryDecision::Retransmit { frame, attempt, .. } => {
                assert_eq!(frame, "new");
                assert_eq!(attempt, 1);
            }
            other => panic!("Expected retransmit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_all_aborts_timers() {
        let mut layer = layer(3);
        let generation = layer.track(1, "f".into());
        let (alive_tx, alive_rx) = tokio::sync::oneshot::channel::<()>();
        let timer = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        });
        layer.attach_timer(1, generation, timer);

        layer.cancel_all();
        // The sender is dropped only when the aborted task is torn down.
        assert!(alive_rx.await.is_err());
        assert_eq!(layer.pending_seqs(), Vec::<u64>::new());
    }
}
