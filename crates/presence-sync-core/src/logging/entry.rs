//! One JSONL log line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single log entry, self-contained so files can be merged by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp with milliseconds
    pub ts: String,

    /// trace, debug, info, warn, error
    pub level: String,

    /// Client id of the session that emitted the event, or `process`
    pub participant: String,

    /// Module path (e.g. "presence_sync_core::session")
    pub target: String,

    pub msg: String,

    /// Structured event fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Enclosing span names, root first, joined with " > "
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogEntry {
    pub fn new(
        level: impl Into<String>,
        participant: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            participant: participant.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Sequence number carried in the `seq` field, if any
    pub fn seq(&self) -> Option<u64> {
        self.fields.as_ref()?.get("seq")?.as_u64()
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_line_format() {
        let entry = LogEntry::new("info", "authority-1", "presence_sync_core::session", "Broadcast delta")
            .with_fields(json!({"seq": 3}));

        let line = entry.to_json_line().unwrap();
        assert!(line.contains("\"participant\":\"authority-1\""));
        assert!(!line.contains("\"span\""));
        assert!(!line.contains('\n'));

        let parsed = LogEntry::from_json_line(&line).unwrap();
        assert_eq!(parsed.seq(), Some(3));
        assert_eq!(parsed.msg, "Broadcast delta");
    }

    #[test]
    fn test_seq_absent() {
        let entry = LogEntry::new("warn", "r1", "t", "no fields");
        assert_eq!(entry.seq(), None);
    }
}
