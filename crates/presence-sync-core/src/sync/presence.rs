//! Lossy presence streams: cursor and scroll.
//!
//! Presence never goes through the sequencer or the ACK table. Local state
//! is updated on every sample; only the outgoing broadcast is rate limited.
//!
//! ```text
//! cursor samples:  x  x  x  x  x  x  x        (every pointer move)
//! cursor sends:    x        x        x        (at most cursor_fps per second)
//!
//! scroll samples:  a b c         d
//! scroll sends:    a     c       d            (leading edge + trailing latest)
//!                  |-win-|
//! ```

use std::collections::{BTreeMap, HashMap};

use crate::sync::envelope::ScrollPayload;
use crate::types::CursorPosition;

/// Caps outgoing cursor frames to a fixed rate; excess samples are dropped.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval_ms: i64,
    last_sent_ms: Option<i64>,
}

impl CursorThrottle {
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms,
            last_sent_ms: None,
        }
    }

    /// Whether a sample taken at `now_ms` may be broadcast.
    pub fn admit(&mut self, now_ms: i64) -> bool {
        match self.last_sent_ms {
            Some(last) if now_ms - last < self.interval_ms => false,
            _ => {
                self.last_sent_ms = Some(now_ms);
                true
            }
        }
    }
}

/// What to do with a scroll sample
#[derive(Debug, Clone, PartialEq)]
pub enum ScrollDecision {
    /// Outside the throttle window: send immediately
    SendNow,
    /// Inside the window: schedule a trailing send after `delay_ms`
    Schedule { delay_ms: i64 },
    /// A trailing send is already scheduled and will carry this sample
    Coalesced,
}

#[derive(Debug, Clone, Default)]
struct ScrollSlot {
    last_sent_ms: Option<i64>,
    pending: Option<ScrollPayload>,
}

/// Per-container scroll throttle with trailing-edge coalescing.
///
/// The latest sample inside a window is always sent once the window
/// elapses, even if no further sample arrives.
#[derive(Debug, Clone)]
pub struct ScrollThrottle {
    window_ms: i64,
    slots: HashMap<String, ScrollSlot>,
}

impl ScrollThrottle {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            slots: HashMap::new(),
        }
    }

    pub fn offer(&mut self, sample: ScrollPayload, now_ms: i64) -> ScrollDecision {
        let slot = self.slots.entry(sample.container_id.clone()).or_default();
        let elapsed = slot.last_sent_ms.map(|last| now_ms - last);

        match elapsed {
            Some(elapsed) if elapsed < self.window_ms => {
                let already_scheduled = slot.pending.is_some();
                slot.pending = Some(sample);
                if already_scheduled {
                    ScrollDecision::Coalesced
                } else {
                    ScrollDecision::Schedule {
                        delay_ms: self.window_ms - elapsed,
                    }
                }
            }
            _ => {
                slot.pending = None;
                slot.last_sent_ms = Some(now_ms);
                ScrollDecision::SendNow
            }
        }
    }

    /// Trailing timer fired: hand back the latest coalesced sample, if any.
    pub fn take_pending(&mut self, container_id: &str, now_ms: i64) -> Option<ScrollPayload> {
        let slot = self.slots.get_mut(container_id)?;
        let sample = slot.pending.take()?;
        slot.last_sent_ms = Some(now_ms);
        Some(sample)
    }

    /// Forget every scheduled trailing sample.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Remove cursor entries not refreshed within `ttl_ms`.
///
/// Returns the ids that were removed.
pub fn prune_stale(
    cursors: &mut BTreeMap<String, CursorPosition>,
    now_ms: i64,
    ttl_ms: i64,
) -> Vec<String> {
    let stale: Vec<String> = cursors
        .iter()
        .filter(|(_, c)| now_ms - c.timestamp > ttl_ms)
        .map(|(id, _)| id.clone())
        .collect();
    for id in &stale {
        cursors.remove(id);
    }
    stale
}

/// Fold a peer's heartbeat into our cursor table.
///
/// Entry ages are measured on the sender's clock (`sent_at_ms` minus the
/// entry timestamp) and rebased onto ours, so relaying a cursor never makes
/// it look fresher than its owner last reported. The entry for `local_id`
/// is never taken from a peer; each participant is the only source of its
/// own pointer. Returns whether anything changed.
pub fn merge_heartbeat(
    cursors: &mut BTreeMap<String, CursorPosition>,
    local_id: &str,
    incoming: BTreeMap<String, CursorPosition>,
    sent_at_ms: i64,
    now_ms: i64,
    ttl_ms: i64,
) -> bool {
    let mut changed = false;
    for (id, mut position) in incoming {
        if id == local_id {
            continue;
        }
        let age = (sent_at_ms - position.timestamp).max(0);
        if age > ttl_ms {
            continue;
        }
        position.timestamp = now_ms - age;
        let newer = cursors
            .get(&id)
            .map_or(true, |existing| position.timestamp >= existing.timestamp);
        if newer && cursors.get(&id) != Some(&position) {
            cursors.insert(id, position);
            changed = true;
        }
    }
    changed
}
