//! Synchronization layer
//!
//! Everything between a local state change and a peer's copy of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Authority                                                      │
//! │  ├── Sequencer (stamps seq = last + 1)                          │
//! │  ├── ReliabilityLayer (pending ACKs, exponential retransmit)    │
//! │  ├── snapshot (periodic / peer-joined / requested baselines)    │
//! │  └── presence (cursor broadcast, heartbeat)                     │
//! │                                                                 │
//! │  Replica                                                        │
//! │  ├── Sequencer (next / duplicate / gap)                         │
//! │  ├── DeltaHistory (recently applied deltas)                     │
//! │  └── snapshot (restore, resync request on gap)                  │
//! │                                                                 │
//! │  Transport (best-effort frames, MemoryNetwork for tests/demo)   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! Every frame is a JSON [`Envelope`] with `type: "SYNC"` and one of seven
//! ops:
//!
//! - **DELTA**: sequenced partial update, ACKed and retransmitted
//! - **SNAPSHOT**: full state, resets the receiver's sequence
//! - **REQ_SNAPSHOT**: ask the Authority for a snapshot
//! - **ACK**: Replica confirms a DELTA
//! - **HEARTBEAT**: cursor table, keeps presence alive
//! - **CURSOR** / **SCROLL**: lossy presence samples

pub mod envelope;
pub mod events;
pub mod history;
pub mod memory;
pub mod presence;
pub mod reliability;
pub mod sequencer;
pub mod snapshot;
pub mod transport;

pub use envelope::{
    CursorPayload, DeltaPayload, Envelope, HeartbeatPayload, Op, ScrollPayload, SnapshotPayload,
    SnapshotRequestPayload, SyncMessage,
};
pub use events::{SyncEvent, SyncStats};
pub use history::DeltaHistory;
pub use memory::{Frame, MemoryNetwork, MemoryTransport};
pub use presence::{CursorThrottle, ScrollDecision, ScrollThrottle};
pub use reliability::{ReliabilityLayer, RetryDecision};
pub use sequencer::{SeqVerdict, Sequencer};
pub use snapshot::{ResyncReason, SnapshotReason};
pub use transport::{Transport, TransportEvent};
