//! Wire envelopes for the sync protocol.
//!
//! Every frame on the transport is one JSON object:
//!
//! ```text
//! {
//!   "type": "SYNC",
//!   "op": "DELTA" | "SNAPSHOT" | "REQ_SNAPSHOT" | "ACK" | "HEARTBEAT" | "CURSOR" | "SCROLL",
//!   "sessionId": "...",
//!   "seq": 42,
//!   "payload": { ... },
//!   "timestamp": 1760000000000,
//!   "clientId": "..."
//! }
//! ```
//!
//! The header is parsed eagerly; the payload stays a raw JSON value until
//! [`Envelope::open`] decodes it into the [`SyncMessage`] matching `op`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::state::StateDelta;
use crate::types::{ClientId, CursorPosition, SessionId, SharedState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum EnvelopeKind {
    #[serde(rename = "SYNC")]
    Sync,
}

/// Operation carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Op {
    /// Sequenced partial update (reliable)
    Delta,
    /// Full state transfer
    Snapshot,
    /// Ask the Authority for a snapshot
    ReqSnapshot,
    /// Acknowledge a delta by sequence
    Ack,
    /// Periodic presence broadcast
    Heartbeat,
    /// Pointer position (lossy)
    Cursor,
    /// Container scroll position (lossy)
    Scroll,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Delta => "DELTA",
            Op::Snapshot => "SNAPSHOT",
            Op::ReqSnapshot => "REQ_SNAPSHOT",
            Op::Ack => "ACK",
            Op::Heartbeat => "HEARTBEAT",
            Op::Cursor => "CURSOR",
            Op::Scroll => "SCROLL",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaPayload {
    pub delta: StateDelta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub shared_state: SharedState,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRequestPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub cursors: BTreeMap<String, CursorPosition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPayload {
    pub x_percent: f64,
    pub y_percent: f64,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollPayload {
    pub container_id: String,
    pub percent_y: f64,
    pub percent_x: f64,
}

/// Decoded body of an envelope
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    Delta(DeltaPayload),
    Snapshot(SnapshotPayload),
    SnapshotRequest(SnapshotRequestPayload),
    Ack,
    Heartbeat(HeartbeatPayload),
    Cursor(CursorPayload),
    Scroll(ScrollPayload),
}

impl SyncMessage {
    /// Operation tag for this message
    pub fn op(&self) -> Op {
        match self {
            SyncMessage::Delta(_) => Op::Delta,
            SyncMessage::Snapshot(_) => Op::Snapshot,
            SyncMessage::SnapshotRequest(_) => Op::ReqSnapshot,
            SyncMessage::Ack => Op::Ack,
            SyncMessage::Heartbeat(_) => Op::Heartbeat,
            SyncMessage::Cursor(_) => Op::Cursor,
            SyncMessage::Scroll(_) => Op::Scroll,
        }
    }

    fn to_payload(&self) -> SyncResult<Value> {
        let value = match self {
            SyncMessage::Delta(p) => serde_json::to_value(p)?,
            SyncMessage::Snapshot(p) => serde_json::to_value(p)?,
            SyncMessage::SnapshotRequest(p) => serde_json::to_value(p)?,
            SyncMessage::Ack => Value::Null,
            SyncMessage::Heartbeat(p) => serde_json::to_value(p)?,
            SyncMessage::Cursor(p) => serde_json::to_value(p)?,
            SyncMessage::Scroll(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    fn from_payload(op: Op, payload: Value) -> Result<Self, serde_json::Error> {
        let message = match op {
            Op::Delta => SyncMessage::Delta(serde_json::from_value(payload)?),
            Op::Snapshot => SyncMessage::Snapshot(serde_json::from_value(payload)?),
            Op::ReqSnapshot => SyncMessage::SnapshotRequest(serde_json::from_value(payload)?),
            Op::Ack => SyncMessage::Ack,
            Op::Heartbeat => SyncMessage::Heartbeat(serde_json::from_value(payload)?),
            Op::Cursor => SyncMessage::Cursor(serde_json::from_value(payload)?),
            Op::Scroll => SyncMessage::Scroll(serde_json::from_value(payload)?),
        };
        Ok(message)
    }
}

/// One wire frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    pub op: Op,
    pub session_id: SessionId,
    pub seq: u64,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: i64,
    pub client_id: ClientId,
}

impl Envelope {
    /// Wrap a message with its routing header.
    pub fn seal(
        message: &SyncMessage,
        session_id: &SessionId,
        seq: u64,
        client_id: &ClientId,
        timestamp: i64,
    ) -> SyncResult<Self> {
        Ok(Self {
            kind: EnvelopeKind::Sync,
            op: message.op(),
            session_id: session_id.clone(),
            seq,
            payload: message.to_payload()?,
            timestamp,
            client_id: client_id.clone(),
        })
    }

    /// Decode the payload according to `op`.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::MalformedEnvelope` if the payload does not match
    /// the shape required by the op.
    pub fn open(&self) -> SyncResult<SyncMessage> {
        SyncMessage::from_payload(self.op, self.payload.clone()).map_err(|e| {
            SyncError::MalformedEnvelope(format!("{} payload: {}", self.op, e))
        })
    }

    /// Encode to the JSON text sent on the transport.
    pub fn to_json(&self) -> SyncResult<String> {
        serde_json::to_string(self)
            .map_err(|e| SyncError::Serialization(format!("Failed to encode envelope: {}", e)))
    }

    /// Parse a frame received from the transport.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::MalformedEnvelope` for non-JSON input, a `type`
    /// other than `"SYNC"`, an unknown op, or missing header fields.
    pub fn from_json(raw: &str) -> SyncResult<Self> {
        serde_json::from_str(raw).map_err(|e| SyncError::MalformedEnvelope(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn header() -> (SessionId, ClientId) {
        (SessionId::from("s1"), ClientId::from("authority-1"))
    }

    #[test]
    fn test_wire_shape() {
        let (session, client) = header();
        let msg = SyncMessage::SnapshotRequest(SnapshotRequestPayload {
            reason: "gap".into(),
        });
        let envelope = Envelope::seal(&msg, &session, 7, &client, 1_000).unwrap();
        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "SYNC",
                "op": "REQ_SNAPSHOT",
                "sessionId": "s1",
                "seq": 7,
                "payload": {"reason": "gap"},
                "timestamp": 1000,
                "clientId": "authority-1"
            })
        );
    }

    #[test]
    fn test_ack_has_null_payload() {
        let (session, client) = header();
        let envelope = Envelope::seal(&SyncMessage::Ack, &session, 3, &client, 0).unwrap();
        assert_eq!(envelope.payload, Value::Null);

        let parsed = Envelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(parsed.open().unwrap(), SyncMessage::Ack);
        assert_eq!(parsed.seq, 3);
    }

    #[test]
    fn test_open_delta_payload() {
        let raw = r#"{"type":"SYNC","op":"DELTA","sessionId":"s1","seq":1,
            "payload":{"delta":{"metadata":{"a":1}}},"timestamp":5,"clientId":"c"}"#;
        let envelope = Envelope::from_json(raw).unwrap();
        match envelope.open().unwrap() {
            SyncMessage::Delta(DeltaPayload { delta }) => {
                assert_eq!(delta.metadata.unwrap()["a"], json!(1));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_foreign_type() {
        let raw = r#"{"type":"CHAT","op":"DELTA","sessionId":"s1","seq":1,
            "payload":null,"timestamp":5,"clientId":"c"}"#;
        assert!(matches!(
            Envelope::from_json(raw),
            Err(SyncError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_rejects_garbage_and_unknown_op() {
        assert!(Envelope::from_json("not json").is_err());
        let raw = r#"{"type":"SYNC","op":"TELEPORT","sessionId":"s1","seq":1,
            "payload":null,"timestamp":5,"clientId":"c"}"#;
        assert!(Envelope::from_json(raw).is_err());
    }

    #[test]
    fn test_payload_shape_mismatch_is_malformed() {
        let raw = r#"{"type":"SYNC","op":"CURSOR","sessionId":"s1","seq":0,
            "payload":{"xPercent":"left"},"timestamp":5,"clientId":"c"}"#;
        let envelope = Envelope::from_json(raw).unwrap();
        assert!(matches!(
            envelope.open(),
            Err(SyncError::MalformedEnvelope(msg)) if msg.starts_with("CURSOR")
        ));
    }

    #[test]
    fn test_message_op_names() {
        let delta = SyncMessage::Delta(DeltaPayload {
            delta: StateDelta::default(),
        });
        assert_eq!(delta.op().to_string(), "DELTA");
        assert_eq!(
            SyncMessage::Heartbeat(HeartbeatPayload::default()).op(),
            Op::Heartbeat
        );
    }
}
