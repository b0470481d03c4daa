//! Presence Sync Core Library
//!
//! Sequenced Authority/Replica state synchronization for co-browsing
//! sessions, with snapshot anti-entropy and lossy presence streams.
//!
//! ## Overview
//!
//! One participant (the Authority) owns navigation and the shared package
//! list. Every change it makes is stamped with a monotonically increasing
//! sequence and broadcast as a partial delta; Replicas apply deltas strictly
//! in order, ACK them, and ask for a full snapshot when they detect a gap.
//! Cursor and scroll presence ride alongside, rate limited and never
//! retransmitted.
//!
//! ## Core Principles
//!
//! - **Single writer**: only the Authority issues sequence numbers
//! - **Ordered apply**: a Replica never applies a delta out of order
//! - **Snapshot wins**: a received snapshot replaces local state outright
//! - **Best-effort transport**: loss and duplication are expected
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use presence_sync_core::{MemoryNetwork, Role, SessionConfig, SessionId, SyncSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::new();
//!     let session_id = SessionId::from("demo");
//!
//!     let authority = SyncSession::start(
//!         SessionConfig::new(Role::Authority, "agent", session_id.clone()),
//!         Arc::new(network.join("agent")),
//!     )?;
//!     let replica = SyncSession::start(
//!         SessionConfig::new(Role::Replica, "customer", session_id),
//!         Arc::new(network.join("customer")),
//!     )?;
//!
//!     replica.on_state_change(|state| println!("now on {}", state.view));
//!     authority.navigate("catalog", Default::default())?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod hub;
pub mod logging;
pub mod session;
pub mod state;
pub mod sync;
pub mod types;

// Re-exports
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{SessionConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use hub::{SubscriberHub, Subscription};
pub use session::SyncSession;
pub use state::{DetailAction, LocalAction, SelectionDelta, StateDelta};
pub use sync::{
    Envelope, Frame, MemoryNetwork, MemoryTransport, Op, ResyncReason, SnapshotReason,
    SyncEvent, SyncMessage, SyncStats, Transport, TransportEvent,
};
pub use types::*;
