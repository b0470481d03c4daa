//! Per-participant JSONL logging.
//!
//! ## Layout
//!
//! ```text
//! logs/
//! ├── 2026-10-17_authority.jsonl
//! ├── 2026-10-17_replica-1.jsonl
//! ├── 2026-10-17_replica-2.jsonl
//! └── 2026-10-17_process.jsonl      # events outside any session
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use presence_sync_core::logging::LoggingBuilder;
//!
//! LoggingBuilder::new()
//!     .with_verbosity(2)
//!     .with_logs_dir("./logs")
//!     .init()?;
//! ```
//!
//! ### Querying with jq
//!
//! ```bash
//! # Every gap a replica saw
//! jq 'select(.msg | startswith("Sequence gap"))' logs/*_replica-*.jsonl
//!
//! # One timeline across participants
//! cat logs/*.jsonl | jq -s 'sort_by(.ts)'
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::LogEntry;
pub use layer::{JsonlLayer, LoggingBuilder, PARTICIPANT_FIELD, PROCESS_PARTICIPANT};
pub use writer::{read_entries, ParticipantLogWriter};
