//! Tracing layer that splits events into per-participant JSONL files.
//!
//! Several sessions usually share one process (the demo, the tests). Each
//! session runs inside a span carrying a `client_id` field; the layer tags
//! that span on creation and routes every event beneath it to the matching
//! participant's file. Events outside any session go to `process`.

use std::collections::HashMap;
use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::field::{Field, Visit};
use tracing::span::Attributes;
use tracing::{Event, Id, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use super::entry::LogEntry;
use super::writer::ParticipantLogWriter;

/// Span field that names the participant
pub const PARTICIPANT_FIELD: &str = "client_id";

/// File used for events outside any session span
pub const PROCESS_PARTICIPANT: &str = "process";

/// Span extension recording which participant the span belongs to
struct Participant(String);

pub struct JsonlLayer {
    logs_dir: PathBuf,
    writers: Mutex<HashMap<String, Arc<ParticipantLogWriter>>>,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let logs_dir = logs_dir.into();
        std::fs::create_dir_all(&logs_dir)?;
        Ok(Self {
            logs_dir,
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Participants that have written at least one line
    pub fn participants(&self) -> Vec<String> {
        let mut names: Vec<String> = self.writers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn writer_for(&self, participant: &str) -> Option<Arc<ParticipantLogWriter>> {
        let mut writers = self.writers.lock();
        if let Some(writer) = writers.get(participant) {
            return Some(writer.clone());
        }
        let writer = Arc::new(ParticipantLogWriter::new(&self.logs_dir, participant).ok()?);
        writers.insert(participant.to_string(), writer.clone());
        Some(writer)
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        if let Some(Value::String(participant)) = visitor.fields.remove(PARTICIPANT_FIELD) {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(Participant(participant));
            }
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        // Scope iterates leaf first.
        let spans: Vec<_> = ctx
            .event_scope(event)
            .map(|scope| scope.collect())
            .unwrap_or_default();
        let participant = spans
            .iter()
            .find_map(|span| span.extensions().get::<Participant>().map(|p| p.0.clone()))
            .unwrap_or_else(|| PROCESS_PARTICIPANT.to_string());

        let mut entry = LogEntry::new(
            metadata.level().as_str().to_lowercase(),
            participant.as_str(),
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );
        if !visitor.fields.is_empty() {
            entry = entry.with_fields(Value::Object(visitor.fields));
        }
        if !spans.is_empty() {
            let names: Vec<&str> = spans.iter().rev().map(|span| span.name()).collect();
            entry = entry.with_span(names.join(" > "));
        }

        if let Some(writer) = self.writer_for(&participant) {
            // Logging must never take the process down.
            let _ = writer.write(&entry);
        }
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, Value>,
}

impl JsonVisitor {
    fn put(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.put(field, Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.put(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.put(field, Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::String(value.to_string()));
    }
}

/// Installs the global subscriber: env filter, optional console output,
/// optional per-participant JSONL files.
pub struct LoggingBuilder {
    logs_dir: Option<PathBuf>,
    console_output: bool,
    default_filter: String,
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            logs_dir: None,
            console_output: true,
            default_filter: "warn".to_string(),
        }
    }

    /// Map a `-v` count to a default filter.
    pub fn with_verbosity(self, verbosity: u8) -> Self {
        let filter = match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        self.with_filter(filter)
    }

    /// Default directive, used when `RUST_LOG` is unset.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    /// Also write JSONL files into `logs_dir`.
    pub fn with_logs_dir(mut self, logs_dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = Some(logs_dir.into());
        self
    }

    pub fn no_console(mut self) -> Self {
        self.console_output = false;
        self
    }

    pub fn build_layer(&self) -> std::io::Result<Option<JsonlLayer>> {
        self.logs_dir.as_ref().map(JsonlLayer::new).transpose()
    }

    /// Install as the global default.
    pub fn init(self) -> std::io::Result<()> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.default_filter));
        let console = self
            .console_output
            .then(|| tracing_subscriber::fmt::layer().with_target(false));

        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(self.build_layer()?)
            .try_init()
            .map_err(std::io::Error::other)
    }
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_events_routed_by_participant_span() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("logs");
        let layer = JsonlLayer::new(&dir).unwrap();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            let authority = tracing::info_span!("sync_session", client_id = "authority-1");
            authority.in_scope(|| tracing::info!(seq = 1u64, "Broadcast delta"));

            let replica = tracing::info_span!("sync_session", client_id = %"replica-1");
            replica.in_scope(|| {
                let inner = tracing::debug_span!("inbound");
                inner.in_scope(|| tracing::warn!(seq = 3u64, expected = 2u64, "Sequence gap"));
            });

            tracing::info!("outside any session");
        });

        let entries = crate::logging::read_entries(&dir).unwrap();
        assert_eq!(entries.len(), 3);

        let gap = entries
            .iter()
            .find(|e| e.msg == "Sequence gap")
            .unwrap();
        assert_eq!(gap.participant, "replica-1");
        assert_eq!(gap.level, "warn");
        assert_eq!(gap.seq(), Some(3));
        assert_eq!(gap.span.as_deref(), Some("sync_session > inbound"));

        let sent = entries.iter().find(|e| e.msg == "Broadcast delta").unwrap();
        assert_eq!(sent.participant, "authority-1");

        let stray = entries.iter().find(|e| e.msg == "outside any session").unwrap();
        assert_eq!(stray.participant, PROCESS_PARTICIPANT);
        assert!(stray.span.is_none());
    }

    #[test]
    fn test_builder_without_dir_has_no_layer() {
        assert!(LoggingBuilder::new().build_layer().unwrap().is_none());
    }
}
