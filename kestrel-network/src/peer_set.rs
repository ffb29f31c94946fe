//! The shared collection of live peer sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;

use kestrel_chain::block::Height;

use crate::peer::{Peer, PeerId, PeerState};
use crate::protocol::external::Message;

/// All live peer sessions, plus the observed network chain height.
///
/// Shared between the dispatcher, the connection tasks, and the maintenance
/// tick. The lock is held only for map operations, never across I/O.
#[derive(Default)]
pub struct PeerSet {
    peers: RwLock<HashMap<PeerId, Peer>>,
    next_id: AtomicUsize,
    /// The maximum chain height any peer has advertised, our best estimate
    /// of how long the network's chain is.
    network_height: AtomicU32,
}

impl PeerSet {
    pub fn new() -> PeerSet {
        PeerSet::default()
    }

    /// Create a session for a fresh connection and return its id.
    pub fn register(
        &self,
        addr: SocketAddr,
        outbound: bool,
        sender: mpsc::UnboundedSender<Message>,
    ) -> PeerId {
        let id = PeerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let peer = Peer::new(id, addr, outbound, sender);
        self.peers
            .write()
            .expect("peer set lock poisoned")
            .insert(id, peer);
        id
    }

    /// Remove a session, dropping its outbound channel; the connection task
    /// notices the closed channel and shuts the socket down.
    pub fn remove(&self, id: PeerId) -> Option<Peer> {
        let mut peer = self
            .peers
            .write()
            .expect("peer set lock poisoned")
            .remove(&id)?;
        peer.state = PeerState::Closed;
        Some(peer)
    }

    /// Run `f` against the mutable session, if it is still live.
    pub fn modify<T>(&self, id: PeerId, f: impl FnOnce(&mut Peer) -> T) -> Option<T> {
        self.peers
            .write()
            .expect("peer set lock poisoned")
            .get_mut(&id)
            .map(f)
    }

    /// Run `f` against the session, if it is still live.
    pub fn read<T>(&self, id: PeerId, f: impl FnOnce(&Peer) -> T) -> Option<T> {
        self.peers
            .read()
            .expect("peer set lock poisoned")
            .get(&id)
            .map(f)
    }

    pub fn send_to(&self, id: PeerId, msg: Message) {
        if let Some(peer) = self.peers.read().expect("peer set lock poisoned").get(&id) {
            peer.send(msg);
        }
    }

    /// Send `msg` to every Ready peer, returning how many were addressed.
    pub fn broadcast_ready(&self, msg: Message) -> usize {
        let peers = self.peers.read().expect("peer set lock poisoned");
        let mut sent = 0;
        for peer in peers.values().filter(|peer| peer.is_ready()) {
            peer.send(msg.clone());
            sent += 1;
        }
        sent
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .expect("peer set lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn ready_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .read()
            .expect("peer set lock poisoned")
            .values()
            .filter(|peer| peer.is_ready())
            .map(|peer| peer.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn outbound_count(&self) -> usize {
        self.peers
            .read()
            .expect("peer set lock poisoned")
            .values()
            .filter(|peer| peer.outbound)
            .count()
    }

    pub fn len(&self) -> usize {
        self.peers.read().expect("peer set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a chain height advertised by some peer.
    pub fn observe_network_height(&self, height: Height) {
        self.network_height
            .fetch_max(height.0, Ordering::Relaxed);
    }

    pub fn network_height(&self) -> Height {
        Height(self.network_height.load(Ordering::Relaxed))
    }
}
