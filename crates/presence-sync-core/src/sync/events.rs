//! Diagnostic events and counters emitted by a sync session.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncEvent: what happened on the reliable pipeline              │
//! │  ├── DeltaSent / DeltaApplied / DuplicateDelta / GapDetected    │
//! │  ├── AckReceived / Retransmitted / DeltaPresumedLost            │
//! │  ├── SnapshotSent / SnapshotApplied / SnapshotRequested         │
//! │  ├── ActionRejected / MalformedEnvelope / OversizedEnvelope     │
//! │  └── PeerJoined / PeerLeft / Disconnected / SendFailed          │
//! │                                                                 │
//! │  SyncStats: monotonically increasing counters, always on        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Events are only published when telemetry is enabled; counters are
//! maintained regardless.

use crate::types::ClientId;

/// Events emitted during synchronization
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Authority broadcast a sequenced delta
    DeltaSent { seq: u64 },
    /// A remote delta was applied in order
    DeltaApplied { seq: u64 },
    /// A delta at or below the last applied sequence was dropped
    DuplicateDelta { seq: u64, last_applied: u64 },
    /// A delta skipped ahead; it was dropped and a snapshot requested
    GapDetected { seq: u64, expected: u64 },
    /// A pending delta was acknowledged
    AckReceived { seq: u64, from: ClientId },
    /// A pending delta was sent again
    Retransmitted { seq: u64, attempt: u32 },
    /// Retry budget exhausted; the delta is abandoned
    DeltaPresumedLost { seq: u64, attempts: u32 },
    /// Authority broadcast a full snapshot
    SnapshotSent { seq: u64, reason: String },
    /// Local state was replaced by a snapshot
    SnapshotApplied { seq: u64, previous_seq: u64 },
    /// A snapshot request was broadcast
    SnapshotRequested { reason: String },
    /// A local action was refused
    ActionRejected { action: String, reason: String },
    /// An inbound frame could not be parsed
    MalformedEnvelope { error: String },
    /// An outgoing frame exceeded the size threshold (it was still sent)
    OversizedEnvelope { op: String, bytes: usize },
    /// The transport refused a frame
    SendFailed { op: String, error: String },
    /// A peer joined the transport
    PeerJoined { peer_id: ClientId },
    /// A peer left the transport
    PeerLeft { peer_id: ClientId },
    /// Our transport connection dropped
    Disconnected,
}

impl SyncEvent {
    /// Sequence number associated with this event, if any
    pub fn seq(&self) -> Option<u64> {
        match self {
            SyncEvent::DeltaSent { seq }
            | SyncEvent::DeltaApplied { seq }
            | SyncEvent::DuplicateDelta { seq, .. }
            | SyncEvent::GapDetected { seq, .. }
            | SyncEvent::AckReceived { seq, .. }
            | SyncEvent::Retransmitted { seq, .. }
            | SyncEvent::DeltaPresumedLost { seq, .. }
            | SyncEvent::SnapshotSent { seq, .. }
            | SyncEvent::SnapshotApplied { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}

/// Running counters for one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub deltas_sent: u64,
    pub deltas_applied: u64,
    pub duplicates_dropped: u64,
    pub gaps_detected: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub retransmissions: u64,
    pub deltas_lost: u64,
    pub snapshots_sent: u64,
    pub snapshots_applied: u64,
    pub snapshot_requests_sent: u64,
    pub malformed_dropped: u64,
    pub actions_rejected: u64,
}

impl SyncStats {
    pub(crate) fn record(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::DeltaSent { .. } => self.deltas_sent += 1,
            SyncEvent::DeltaApplied { .. } => self.deltas_applied += 1,
            SyncEvent::DuplicateDelta { .. } => self.duplicates_dropped += 1,
            SyncEvent::GapDetected { .. } => self.gaps_detected += 1,
            SyncEvent::AckReceived { .. } => self.acks_received += 1,
            SyncEvent::Retransmitted { .. } => self.retransmissions += 1,
            SyncEvent::DeltaPresumedLost { .. } => self.deltas_lost += 1,
            SyncEvent::SnapshotSent { .. } => self.snapshots_sent += 1,
            SyncEvent::SnapshotApplied { .. } => self.snapshots_applied += 1,
            SyncEvent::SnapshotRequested { .. } => self.snapshot_requests_sent += 1,
            SyncEvent::MalformedEnvelope { .. } => self.malformed_dropped += 1,
            SyncEvent::ActionRejected { .. } => self.actions_rejected += 1,
            _ => {}
        }
    }
}
