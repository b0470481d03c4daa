//! In-process transport: a shared bus that every participant joins.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  MemoryNetwork                                            │
//! │  ├── peers: ClientId -> [subscribers]                     │
//! │  ├── taps: observers of every frame sent                  │
//! │  └── faults: drop filter, duplication, self-echo          │
//! │                                                           │
//! │  MemoryTransport (one per participant)                    │
//! │  └── send -> fan out to every other peer (or one target)  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Used by the demo binary and the integration tests. Fault knobs let tests
//! exercise loss and duplication deterministically.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{SyncError, SyncResult};
use crate::sync::transport::{Transport, TransportEvent};
use crate::types::ClientId;

type DropFilter = Box<dyn Fn(&Frame) -> bool + Send>;

/// One frame as observed by a tap
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub from: ClientId,
    pub to: Option<ClientId>,
    pub data: String,
    /// The drop filter discarded this frame
    pub dropped: bool,
}

#[derive(Default)]
struct NetworkInner {
    peers: BTreeMap<ClientId, Vec<mpsc::UnboundedSender<TransportEvent>>>,
    taps: Vec<mpsc::UnboundedSender<Frame>>,
    drop_filter: Option<DropFilter>,
    duplicate: bool,
    echo: bool,
}

impl NetworkInner {
    fn deliver(&mut self, peer: &ClientId, event: TransportEvent) {
        if let Some(subscribers) = self.peers.get_mut(peer) {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn broadcast_lifecycle(&mut self, except: &ClientId, event: TransportEvent) {
        let others: Vec<ClientId> = self.peers.keys().filter(|p| *p != except).cloned().collect();
        for peer in others {
            self.deliver(&peer, event.clone());
        }
    }
}

/// Shared in-memory bus
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a participant; every existing peer sees `PeerJoined`.
    pub fn join(&self, id: impl Into<ClientId>) -> MemoryTransport {
        let id = id.into();
        let mut inner = self.inner.lock();
        inner.peers.entry(id.clone()).or_default();
        inner.broadcast_lifecycle(&id, TransportEvent::PeerJoined(id.clone()));
        debug!(peer = %id, "Joined memory network");
        MemoryTransport {
            id,
            network: self.clone(),
        }
    }

    /// Observe every frame sent on the bus from now on.
    pub fn tap(&self) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().taps.push(tx);
        rx
    }

    /// Discard frames for which `filter` returns true.
    pub fn set_drop_filter(&self, filter: impl Fn(&Frame) -> bool + Send + 'static) {
        self.inner.lock().drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.inner.lock().drop_filter = None;
    }

    /// Deliver every frame twice.
    pub fn set_duplicate(&self, duplicate: bool) {
        self.inner.lock().duplicate = duplicate;
    }

    /// Also deliver broadcasts back to their sender.
    pub fn set_echo(&self, echo: bool) {
        self.inner.lock().echo = echo;
    }

    /// Ids of attached participants
    pub fn peers(&self) -> Vec<ClientId> {
        self.inner.lock().peers.keys().cloned().collect()
    }

    fn send_from(&self, from: &ClientId, data: String, to: Option<&ClientId>) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        if !inner.peers.contains_key(from) {
            return Err(SyncError::Transport(format!("{} is not connected", from)));
        }

        let mut frame = Frame {
            from: from.clone(),
            to: to.cloned(),
            data,
            dropped: false,
        };
        frame.dropped = inner.drop_filter.as_ref().is_some_and(|f| f(&frame));
        inner.taps.retain(|tap| tap.send(frame.clone()).is_ok());

        if frame.dropped {
            trace!(from = %from, "Frame dropped by filter");
            return Ok(());
        }

        let targets: Vec<ClientId> = match to {
            Some(target) => vec![target.clone()],
            None => inner
                .peers
                .keys()
                .filter(|p| inner.echo || *p != from)
                .cloned()
                .collect(),
        };
        let copies = if inner.duplicate { 2 } else { 1 };
        for target in targets {
            for _ in 0..copies {
                inner.deliver(
                    &target,
                    TransportEvent::Message {
                        from: Some(from.clone()),
                        data: frame.data.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    fn leave(&self, id: &ClientId) {
        let mut inner = self.inner.lock();
        if let Some(subscribers) = inner.peers.remove(id) {
            for tx in subscribers {
                let _ = tx.send(TransportEvent::Disconnected);
            }
            inner.broadcast_lifecycle(id, TransportEvent::PeerLeft(id.clone()));
            debug!(peer = %id, "Left memory network");
        }
    }
}

/// One participant's handle on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    id: ClientId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Detach from the bus; peers see `PeerLeft`, our subscribers see
    /// `Disconnected`.
    pub fn leave(&self) {
        self.network.leave(&self.id);
    }
}

impl Transport for MemoryTransport {
    fn send(&self, data: String, to: Option<&ClientId>) -> SyncResult<()> {
        self.network.send_from(&self.id, data, to)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.network
            .inner
            .lock()
            .peers
            .entry(self.id.clone())
            .or_default()
            .push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(data: &str, from: &str) -> TransportEvent {
        TransportEvent::Message {
            from: Some(ClientId::from(from)),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");
        let mut a_rx = a.subscribe();
        let mut b_rx = b.subscribe();

        a.send("hello".into(), None).unwrap();

        assert_eq!(b_rx.try_recv().unwrap(), message("hello", "a"));
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn test_join_and_leave_lifecycle() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let mut a_rx = a.subscribe();
        let b = network.join("b");
        let mut b_rx = b.subscribe();

        assert_eq!(
            a_rx.try_recv().unwrap(),
            TransportEvent::PeerJoined(ClientId::from("b"))
        );

        b.leave();
        assert_eq!(b_rx.try_recv().unwrap(), TransportEvent::Disconnected);
        assert_eq!(
            a_rx.try_recv().unwrap(),
            TransportEvent::PeerLeft(ClientId::from("b"))
        );
        assert!(b.send("late".into(), None).is_err());
    }

    #[test]
    fn test_directed_send() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");
        let c = network.join("c");
        let mut b_rx = b.subscribe();
        let mut c_rx = c.subscribe();

        a.send("ack".into(), Some(&ClientId::from("c"))).unwrap();
        assert!(b_rx.try_recv().is_err());
        assert_eq!(c_rx.try_recv().unwrap(), message("ack", "a"));
    }

    #[test]
    fn test_faults() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");
        let mut b_rx = b.subscribe();
        let mut tap = network.tap();

        network.set_duplicate(true);
        a.send("twice".into(), None).unwrap();
        assert_eq!(b_rx.try_recv().unwrap(), message("twice", "a"));
        assert_eq!(b_rx.try_recv().unwrap(), message("twice", "a"));

        network.set_duplicate(false);
        network.set_drop_filter(|frame| frame.data.contains("lost"));
        a.send("lost".into(), None).unwrap();
        assert!(b_rx.try_recv().is_err());

        let frames: Vec<Frame> = std::iter::from_fn(|| tap.try_recv().ok()).collect();
        assert_eq!(frames.len(), 2);
        assert!(frames[1].dropped);

        network.set_echo(true);
        network.clear_drop_filter();
        let mut a_rx = a.subscribe();
        a.send("echo".into(), None).unwrap();
        assert_eq!(a_rx.try_recv().unwrap(), message("echo", "a"));
    }
}
