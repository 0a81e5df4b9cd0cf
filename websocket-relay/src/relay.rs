//! Broadcast relay: the connection registry and the task that owns it.
//!
//! Every connection task talks to the relay through a [`RelayHandle`]. The
//! handle turns transport events into [`RelayEvent`]s and queues them for the
//! single [`Relay`] task, which is the only code that ever touches the
//! [`Registry`]. Adding, removing and iterating peers therefore never overlap.
//!
//! Delivery is best-effort. The relay hands a payload to each peer's outbound
//! queue and moves on; it never waits on a socket.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub type PeerId = u64;

/// Outbound queue feeding one peer's socket writer.
pub type PeerSender = mpsc::UnboundedSender<Payload>;
pub type PeerReceiver = mpsc::UnboundedReceiver<Payload>;

/// An opaque message. The frame kind is kept so a text frame is forwarded as
/// text and a binary frame as binary; the content is never inspected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Binary(_) => "binary",
        }
    }
}

/// One transport event, already mapped onto a relay operation.
#[derive(Debug)]
pub enum RelayEvent {
    Connect { id: PeerId, sender: PeerSender },
    Message { from: PeerId, payload: Payload },
    Disconnect { id: PeerId },
}

/// The live set of peer channels.
#[derive(Debug, Default)]
pub struct Registry {
    peers: HashMap<PeerId, PeerSender>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn connect(&mut self, id: PeerId, sender: PeerSender) {
        self.peers.insert(id, sender);
    }

    /// Removes a peer. Returns `false` if it was already gone.
    pub fn disconnect(&mut self, id: PeerId) -> bool {
        self.peers.remove(&id).is_some()
    }

    /// Hands `payload` to every open peer except `from` and returns how many
    /// peers accepted it.
    pub fn broadcast(&self, from: PeerId, payload: &Payload) -> usize {
        let mut delivered = 0;
        for (&id, sender) in &self.peers {
            if id == from || sender.is_closed() {
                continue;
            }
            // The peer may close between the check above and this send; a
            // failed send is the same as finding it closed.
            match sender.send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => debug!(peer = id, "skipping closed peer"),
            }
        }
        delivered
    }

    /// Applies one event to the registry.
    pub fn apply(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connect { id, sender } => {
                self.connect(id, sender);
                debug!(peer = id, peers = self.len(), "peer registered");
            }
            RelayEvent::Message { from, payload } => {
                let delivered = self.broadcast(from, &payload);
                debug!(
                    peer = from,
                    kind = payload.kind(),
                    bytes = payload.len(),
                    delivered,
                    "message relayed"
                );
            }
            RelayEvent::Disconnect { id } => {
                if self.disconnect(id) {
                    debug!(peer = id, peers = self.len(), "peer unregistered");
                }
            }
        }
    }
}

/// Returned by [`RelayHandle`] once the relay task has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("relay is no longer running")]
pub struct RelayClosed;

/// A registered peer: its identity plus the queue the relay writes into.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub inbox: PeerReceiver,
}

/// Cloneable entry point to a running [`Relay`].
#[derive(Debug, Clone)]
pub struct RelayHandle {
    events: mpsc::UnboundedSender<RelayEvent>,
    peer_count: watch::Receiver<usize>,
    next_id: Arc<AtomicU64>,
}

impl RelayHandle {
    /// Allocates an identity for a freshly upgraded connection and registers it.
    pub fn connect(&self) -> Result<Peer, RelayClosed> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, inbox) = mpsc::unbounded_channel();
        self.send(RelayEvent::Connect { id, sender })?;
        Ok(Peer { id, inbox })
    }

    /// Queues a payload for every peer other than `from`.
    pub fn publish(&self, from: PeerId, payload: Payload) -> Result<(), RelayClosed> {
        self.send(RelayEvent::Message { from, payload })
    }

    pub fn disconnect(&self, id: PeerId) -> Result<(), RelayClosed> {
        self.send(RelayEvent::Disconnect { id })
    }

    /// Number of registered peers as of the last event the relay applied.
    pub fn peer_count(&self) -> usize {
        *self.peer_count.borrow()
    }

    /// Waits until the relay has applied events leaving exactly `expected`
    /// registered peers.
    pub async fn wait_for_peers(&self, expected: usize) -> Result<(), RelayClosed> {
        let mut peer_count = self.peer_count.clone();
        if peer_count.wait_for(|count| *count == expected).await.is_err() {
            return Err(RelayClosed);
        }
        Ok(())
    }

    fn send(&self, event: RelayEvent) -> Result<(), RelayClosed> {
        self.events.send(event).map_err(|_| RelayClosed)
    }
}

/// The task that owns the [`Registry`].
pub struct Relay {
    registry: Registry,
    events: mpsc::UnboundedReceiver<RelayEvent>,
    peer_count: watch::Sender<usize>,
}

impl Relay {
    pub fn new() -> (Self, RelayHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (count_tx, count_rx) = watch::channel(0);
        let relay = Self {
            registry: Registry::new(),
            events: events_rx,
            peer_count: count_tx,
        };
        let handle = RelayHandle {
            events: events_tx,
            peer_count: count_rx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (relay, handle)
    }

    /// Applies events in arrival order until every handle has been dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.registry.apply(event);
            self.peer_count.send_replace(self.registry.len());
        }
        info!("relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn text(value: &str) -> Payload {
        Payload::Text(value.to_string())
    }

    fn registry_with_peers(ids: &[PeerId]) -> (Registry, HashMap<PeerId, PeerReceiver>) {
        let mut registry = Registry::new();
        let mut inboxes = HashMap::new();
        for &id in ids {
            let (sender, inbox) = mpsc::unbounded_channel();
            registry.connect(id, sender);
            inboxes.insert(id, inbox);
        }
        (registry, inboxes)
    }

    fn drain(inbox: &mut PeerReceiver) -> Vec<Payload> {
        let mut received = Vec::new();
        while let Ok(payload) = inbox.try_recv() {
            received.push(payload);
        }
        received
    }

    #[test]
    fn broadcast_skips_the_sender() {
        let (registry, mut inboxes) = registry_with_peers(&[1, 2, 3]);

        let delivered = registry.broadcast(1, &text("hello"));

        assert_eq!(delivered, 2);
        assert_eq!(drain(inboxes.get_mut(&2).unwrap()), vec![text("hello")]);
        assert_eq!(drain(inboxes.get_mut(&3).unwrap()), vec![text("hello")]);
        assert!(drain(inboxes.get_mut(&1).unwrap()).is_empty());
    }

    #[test]
    fn disconnected_peer_no_longer_receives() {
        let (mut registry, mut inboxes) = registry_with_peers(&[1, 2, 3]);

        assert!(registry.disconnect(2));
        let delivered = registry.broadcast(1, &text("ping"));

        assert_eq!(delivered, 1);
        assert!(drain(inboxes.get_mut(&2).unwrap()).is_empty());
        assert_eq!(drain(inboxes.get_mut(&3).unwrap()), vec![text("ping")]);
    }

    #[test]
    fn second_disconnect_is_a_no_op() {
        let (mut registry, mut inboxes) = registry_with_peers(&[1, 2, 3]);

        assert!(registry.disconnect(2));
        assert!(!registry.disconnect(2));
        assert_eq!(registry.len(), 2);

        registry.broadcast(3, &text("still here"));
        assert_eq!(drain(inboxes.get_mut(&1).unwrap()), vec![text("still here")]);
    }

    #[test]
    fn lone_peer_broadcasts_to_nobody() {
        let (registry, mut inboxes) = registry_with_peers(&[7]);

        assert_eq!(registry.broadcast(7, &text("solo")), 0);
        assert!(drain(inboxes.get_mut(&7).unwrap()).is_empty());
    }

    #[test]
    fn empty_payload_is_forwarded_unchanged() {
        let (registry, mut inboxes) = registry_with_peers(&[1, 2]);

        registry.broadcast(1, &text(""));
        registry.broadcast(1, &Payload::Binary(Vec::new()));

        assert_eq!(
            drain(inboxes.get_mut(&2).unwrap()),
            vec![text(""), Payload::Binary(Vec::new())]
        );
    }

    #[test]
    fn closed_peer_is_skipped_without_affecting_others() {
        let (registry, mut inboxes) = registry_with_peers(&[1, 2, 3, 4]);

        // Peer 3's writer has gone away but the transport has not reported it yet.
        drop(inboxes.remove(&3));
        let delivered = registry.broadcast(1, &text("hello"));

        assert_eq!(delivered, 2);
        assert!(registry.contains(3));
        assert_eq!(drain(inboxes.get_mut(&2).unwrap()), vec![text("hello")]);
        assert_eq!(drain(inboxes.get_mut(&4).unwrap()), vec![text("hello")]);
    }

    #[test]
    fn apply_maps_each_event_onto_one_operation() {
        let mut registry = Registry::new();
        let (sender_a, mut inbox_a) = mpsc::unbounded_channel();
        let (sender_b, mut inbox_b) = mpsc::unbounded_channel();

        registry.apply(RelayEvent::Connect { id: 1, sender: sender_a });
        registry.apply(RelayEvent::Connect { id: 2, sender: sender_b });
        registry.apply(RelayEvent::Message {
            from: 2,
            payload: text("hi"),
        });
        registry.apply(RelayEvent::Disconnect { id: 1 });
        registry.apply(RelayEvent::Message {
            from: 2,
            payload: text("gone"),
        });

        assert_eq!(registry.len(), 1);
        assert_eq!(drain(&mut inbox_a), vec![text("hi")]);
        assert!(drain(&mut inbox_b).is_empty());
    }

    #[test]
    fn churn_during_broadcasts_never_duplicates() {
        let mut registry = Registry::new();
        let mut inboxes = HashMap::new();

        for round in 0..20u64 {
            let (sender, inbox) = mpsc::unbounded_channel();
            registry.connect(round, sender);
            inboxes.insert(round, inbox);
            if round % 3 == 0 {
                registry.disconnect(round / 2);
                registry.disconnect(round / 2);
            }
            registry.broadcast(round, &text(&round.to_string()));
        }

        for (id, inbox) in inboxes.iter_mut() {
            let received = drain(inbox);
            let unique: HashSet<_> = received.iter().cloned().collect();
            assert_eq!(received.len(), unique.len(), "peer {id} saw a duplicate");
            assert!(!received.contains(&text(&id.to_string())));
        }
    }

    #[tokio::test]
    async fn relay_task_tolerates_churn_between_publishes() {
        let (relay, handle) = Relay::new();
        let task = tokio::spawn(relay.run());

        let publisher = handle.connect().expect("relay running");
        let mut steady = handle.connect().expect("relay running");
        let mut transient = Vec::new();

        for n in 0..30 {
            handle
                .publish(publisher.id, text(&n.to_string()))
                .expect("relay running");
            match n % 3 {
                0 => transient.push(handle.connect().expect("relay running")),
                1 => {
                    if let Some(peer) = transient.first() {
                        handle.disconnect(peer.id).expect("relay running");
                        handle.disconnect(peer.id).expect("relay running");
                    }
                }
                _ => {}
            }
        }
        handle.disconnect(publisher.id).expect("relay running");
        for peer in &transient {
            handle.disconnect(peer.id).expect("relay running");
        }
        handle.disconnect(steady.id).expect("relay running");

        let mut received = Vec::new();
        while let Some(payload) = steady.inbox.recv().await {
            received.push(payload);
        }
        let expected: Vec<_> = (0..30).map(|n| text(&n.to_string())).collect();
        assert_eq!(received, expected);

        for peer in &mut transient {
            let mut seen = HashSet::new();
            while let Some(payload) = peer.inbox.recv().await {
                assert!(seen.insert(payload), "peer {} saw a duplicate", peer.id);
            }
        }

        drop(handle);
        task.await.expect("relay task");
    }

    #[tokio::test]
    async fn relay_task_preserves_sender_order() {
        let (relay, handle) = Relay::new();
        let task = tokio::spawn(relay.run());

        let sender = handle.connect().expect("relay running");
        let mut receiver = handle.connect().expect("relay running");
        handle.wait_for_peers(2).await.expect("relay running");

        for n in 0..5 {
            handle
                .publish(sender.id, text(&n.to_string()))
                .expect("relay running");
        }

        for n in 0..5 {
            let payload = receiver.inbox.recv().await.expect("payload");
            assert_eq!(payload, text(&n.to_string()));
        }

        handle.disconnect(receiver.id).expect("relay running");
        handle.disconnect(receiver.id).expect("relay running");
        handle.wait_for_peers(1).await.expect("relay running");
        assert_eq!(handle.peer_count(), 1);
        assert!(receiver.inbox.recv().await.is_none());

        drop(sender);
        drop(handle);
        task.await.expect("relay task");
    }

    #[tokio::test]
    async fn handle_reports_closed_relay() {
        let (relay, handle) = Relay::new();
        drop(relay);

        assert_eq!(handle.connect().unwrap_err(), RelayClosed);
        assert_eq!(handle.publish(1, text("x")), Err(RelayClosed));
        assert_eq!(handle.wait_for_peers(1).await, Err(RelayClosed));
    }
}
