//! Contract between the sync core and whatever carries its frames.
//!
//! The core assumes only best-effort delivery: frames may be lost,
//! duplicated or reordered. Every guarantee the session offers is layered on
//! top of this minimal interface.

use tokio::sync::mpsc;

use crate::error::SyncResult;
use crate::types::ClientId;

/// Inbound activity from the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A frame arrived
    Message {
        /// Sender as known to the transport, if it tracks one
        from: Option<ClientId>,
        data: String,
    },
    /// A participant joined
    PeerJoined(ClientId),
    /// A participant left
    PeerLeft(ClientId),
    /// Our own connection was lost
    Disconnected,
}

/// Fire-and-forget frame carrier
pub trait Transport: Send + Sync + 'static {
    /// Queue `data` for delivery to `to`, or to every peer when `None`.
    ///
    /// Must not block. An `Ok` return does not imply delivery.
    fn send(&self, data: String, to: Option<&ClientId>) -> SyncResult<()>;

    /// Start receiving inbound events.
    ///
    /// Dropping the receiver unsubscribes.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;
}
