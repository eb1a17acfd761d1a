//! Bookkeeping of the peers reachable under each swarm topic.
//!
//! Peers are indexed by topic and by their owning agent. Events are emitted only for
//! peers owned by the local agent, so subscribers can tell the peers this node hosts
//! apart from the ones other agents report to it.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{Arc, RwLock},
};

use plexus_base::{PeerId, PublicKey, SpaceKey};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CHANNEL_CAP: usize = 1024;

/// Identifier of a swarm topic. Spaces use their key as topic.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TopicId([u8; 32]);

impl TopicId {
    /// Create a topic id from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw bytes of this topic.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<SpaceKey> for TopicId {
    fn from(value: SpaceKey) -> Self {
        Self(*value.as_bytes())
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0);
        text.make_ascii_lowercase();
        write!(f, "{text}")
    }
}

impl fmt::Debug for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0);
        text.make_ascii_lowercase();
        write!(f, "{}…{}", &text[..5], &text[(text.len() - 2)..])
    }
}

/// Opaque handle of the transport session to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// A peer reachable under a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// The topic the peer is reachable under.
    pub topic: TopicId,
    /// The peer.
    pub peer_id: PeerId,
    /// The agent that reported this peer.
    pub owner: PublicKey,
    /// The transport session, if connected.
    pub session: Option<SessionId>,
}

/// Events of a [`PeerTopology`] for locally owned peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// A peer was added.
    PeerAdded(Peer),
    /// A peer was removed.
    PeerDeleted(Peer),
}

#[derive(Debug, Default)]
struct Inner {
    peers: BTreeMap<(TopicId, PeerId), Peer>,
    by_topic: BTreeMap<TopicId, BTreeSet<PeerId>>,
    by_owner: BTreeMap<PublicKey, BTreeSet<(TopicId, PeerId)>>,
}

impl Inner {
    fn insert(&mut self, peer: Peer) -> Option<Peer> {
        let key = (peer.topic, peer.peer_id);
        let previous = self.remove(&key);
        self.by_topic
            .entry(peer.topic)
            .or_default()
            .insert(peer.peer_id);
        self.by_owner.entry(peer.owner).or_default().insert(key);
        self.peers.insert(key, peer);
        previous
    }

    fn remove(&mut self, key: &(TopicId, PeerId)) -> Option<Peer> {
        let peer = self.peers.remove(key)?;
        if let Some(set) = self.by_topic.get_mut(&peer.topic) {
            set.remove(&peer.peer_id);
            if set.is_empty() {
                self.by_topic.remove(&peer.topic);
            }
        }
        if let Some(set) = self.by_owner.get_mut(&peer.owner) {
            set.remove(key);
            if set.is_empty() {
                self.by_owner.remove(&peer.owner);
            }
        }
        Some(peer)
    }
}

/// Live peers grouped by topic and by owner.
///
/// Cloning yields another handle to the same registry. All mutation goes through the
/// methods of this type; lookups return copies.
#[derive(Debug, Clone)]
pub struct PeerTopology {
    local_owner: PublicKey,
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<TopologyEvent>,
}

impl PeerTopology {
    /// Create an empty topology for the agent `local_owner`.
    pub fn new(local_owner: PublicKey) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        Self {
            local_owner,
            inner: Default::default(),
            events,
        }
    }

    /// The local agent.
    pub fn local_owner(&self) -> PublicKey {
        self.local_owner
    }

    /// Subscribe to events for locally owned peers.
    ///
    /// Events are sent while the registry is locked, so they arrive in mutation order.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    /// Register `peer_id` under `topic`, reported by `owner`.
    ///
    /// Re-adding a peer under the same owner keeps its entry and session. A new owner
    /// replaces the entry.
    pub fn add_peer(&self, topic: TopicId, peer_id: PeerId, owner: PublicKey) -> Peer {
        let mut inner = self.inner.write().expect("poisoned");
        if let Some(existing) = inner.peers.get(&(topic, peer_id)) {
            if existing.owner == owner {
                return existing.clone();
            }
        }
        let peer = Peer {
            topic,
            peer_id,
            owner,
            session: None,
        };
        if let Some(previous) = inner.insert(peer.clone()) {
            if previous.owner != owner {
                self.emit_deleted(previous);
            } else {
                return peer;
            }
        }
        self.emit_added(peer.clone());
        peer
    }

    /// Remove `peer_id` from `topic`. Returns false if it was not registered.
    pub fn remove_peer(&self, topic: TopicId, peer_id: PeerId) -> bool {
        let mut inner = self.inner.write().expect("poisoned");
        match inner.remove(&(topic, peer_id)) {
            Some(peer) => {
                self.emit_deleted(peer);
                true
            }
            None => false,
        }
    }

    /// Set the session handle of a registered peer. Returns false if it is not registered.
    pub fn update_peer(&self, topic: TopicId, peer_id: PeerId, session: Option<SessionId>) -> bool {
        let mut inner = self.inner.write().expect("poisoned");
        match inner.peers.get_mut(&(topic, peer_id)) {
            Some(peer) => {
                peer.session = session;
                true
            }
            None => false,
        }
    }

    /// Look up a single peer.
    pub fn get(&self, topic: TopicId, peer_id: PeerId) -> Option<Peer> {
        let inner = self.inner.read().expect("poisoned");
        inner.peers.get(&(topic, peer_id)).cloned()
    }

    /// The peers reachable under `topic`.
    pub fn peers_for_topic(&self, topic: TopicId) -> Vec<Peer> {
        let inner = self.inner.read().expect("poisoned");
        inner
            .by_topic
            .get(&topic)
            .into_iter()
            .flatten()
            .filter_map(|peer_id| inner.peers.get(&(topic, *peer_id)).cloned())
            .collect()
    }

    /// The peers reported by `owner`.
    pub fn peers_for_owner(&self, owner: PublicKey) -> Vec<Peer> {
        let inner = self.inner.read().expect("poisoned");
        inner
            .by_owner
            .get(&owner)
            .into_iter()
            .flatten()
            .filter_map(|key| inner.peers.get(key).cloned())
            .collect()
    }

    /// Replace every peer reported by `owner` with `peers`.
    ///
    /// The swap is atomic. Peers present before and after keep their entry and emit no
    /// events.
    pub fn replace_peers_for_owner(
        &self,
        owner: PublicKey,
        peers: impl IntoIterator<Item = (TopicId, PeerId)>,
    ) {
        let next: BTreeSet<(TopicId, PeerId)> = peers.into_iter().collect();
        let mut inner = self.inner.write().expect("poisoned");
        let previous = inner.by_owner.get(&owner).cloned().unwrap_or_default();
        for key in previous.difference(&next) {
            if let Some(peer) = inner.remove(key) {
                self.emit_deleted(peer);
            }
        }
        for (topic, peer_id) in next.difference(&previous) {
            let peer = Peer {
                topic: *topic,
                peer_id: *peer_id,
                owner,
                session: None,
            };
            if let Some(displaced) = inner.insert(peer.clone()) {
                self.emit_deleted(displaced);
            }
            self.emit_added(peer);
        }
        trace!(owner = %owner.fmt_short(), count = next.len(), "replaced peers");
    }

    fn emit_added(&self, peer: Peer) {
        if peer.owner == self.local_owner {
            trace!(topic = ?peer.topic, peer = %peer.peer_id.fmt_short(), "peer added");
            self.events.send(TopologyEvent::PeerAdded(peer)).ok();
        }
    }

    fn emit_deleted(&self, peer: Peer) {
        if peer.owner == self.local_owner {
            trace!(topic = ?peer.topic, peer = %peer.peer_id.fmt_short(), "peer deleted");
            self.events.send(TopologyEvent::PeerDeleted(peer)).ok();
        }
    }
}
