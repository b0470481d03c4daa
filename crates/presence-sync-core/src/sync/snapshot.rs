//! Full-state transfer: building, requesting and restoring snapshots.

use std::fmt;

use crate::sync::envelope::{SnapshotPayload, SnapshotRequestPayload, SyncMessage};
use crate::sync::sequencer::Sequencer;
use crate::types::SharedState;

/// Why the Authority is broadcasting a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotReason {
    /// Periodic baseline
    Interval,
    /// A participant joined the transport
    PeerJoined,
    /// Answering a REQ_SNAPSHOT
    Requested,
    /// Explicit call by the application
    Manual,
}

impl SnapshotReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotReason::Interval => "interval",
            SnapshotReason::PeerJoined => "peer-joined",
            SnapshotReason::Requested => "requested",
            SnapshotReason::Manual => "manual",
        }
    }
}

impl fmt::Display for SnapshotReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a participant is asking for a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// Replica just started and has no baseline
    Bootstrap,
    /// A sequence gap was detected
    Gap,
    /// Explicit call by the application
    Manual,
}

impl ResyncReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ResyncReason::Bootstrap => "bootstrap",
            ResyncReason::Gap => "gap",
            ResyncReason::Manual => "manual",
        }
    }
}

impl fmt::Display for ResyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SNAPSHOT message carrying a copy of `state`
pub fn snapshot_message(state: &SharedState, reason: SnapshotReason) -> SyncMessage {
    SyncMessage::Snapshot(SnapshotPayload {
        shared_state: state.clone(),
        reason: reason.as_str().to_string(),
    })
}

/// REQ_SNAPSHOT message
pub fn request_message(reason: ResyncReason) -> SyncMessage {
    SyncMessage::SnapshotRequest(SnapshotRequestPayload {
        reason: reason.as_str().to_string(),
    })
}

/// Overwrite local state with a received snapshot stamped `seq`.
///
/// Sequence tracking is reset to `seq` even when that is lower than the
/// current version. Returns the version that was replaced.
pub fn restore(
    state: &mut SharedState,
    sequencer: &mut Sequencer,
    payload: SnapshotPayload,
    seq: u64,
) -> u64 {
    let previous = sequencer.last_applied();
    let mut incoming = payload.shared_state;
    incoming.seq = seq;
    *state = incoming;
    sequencer.reset(seq);
    previous
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SessionId, ViewName};

    #[test]
    fn test_restore_overwrites_and_rolls_back() {
        let mut state = SharedState::new(SessionId::from("s"));
        state.shared_packages = vec!["local".into()];
        let mut sequencer = Sequencer::new();
        sequencer.reset(10);

        let mut remote = SharedState::new(SessionId::from("s"));
        remote.view = ViewName::Payment;
        let payload = SnapshotPayload {
            shared_state: remote,
            reason: "requested".into(),
        };

        let previous = restore(&mut state, &mut sequencer, payload, 4);
        assert_eq!(previous, 10);
        assert_eq!(sequencer.last_applied(), 4);
        assert_eq!(state.seq, 4);
        assert_eq!(state.view, ViewName::Payment);
        assert!(state.shared_packages.is_empty());
    }

    #[test]
    fn test_messages_carry_reason() {
        let state = SharedState::default();
        match snapshot_message(&state, SnapshotReason::PeerJoined) {
            SyncMessage::Snapshot(p) => assert_eq!(p.reason, "peer-joined"),
            other => panic!("Wrong message type: {:?}", other),
        }
        match request_message(ResyncReason::Gap) {
            SyncMessage::SnapshotRequest(p) => assert_eq!(p.reason, "gap"),
            other => panic!("Wrong message type: {:?}", other),
        }
    }
}
