//! The message dispatcher: one worker that turns parsed messages into
//! protocol responses, ban-score changes, and wallet work items.
//!
//! Handlers never return errors across the loop boundary; a misbehaving peer
//! is penalized and, past the ban threshold, disconnected.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use kestrel_chain::{block, transaction, transaction::Transaction};

use crate::address_book::AddressBook;
use crate::constants;
use crate::meta_addr::MetaAddr;
use crate::peer::{PeerEvent, PeerId};
use crate::peer_set::PeerSet;
use crate::protocol::external::types::{Nonce, PeerServices};
use crate::protocol::external::{InventoryHash, Message, RejectReason, Version};
use crate::sync::{RequestKind, RequestTracker};

/// Work items the dispatcher hands to the wallet layer.
///
/// Only chain types cross this boundary; the wallet crate knows nothing of
/// wire messages.
#[derive(Debug)]
pub enum InboundUpdate {
    /// A bare header from a `headers` message.
    Header(block::Header),
    /// A `merkleblock`: header plus the partial tree naming matched txids.
    MerkleBlock {
        header: block::Header,
        transaction_count: u32,
        hashes: Vec<transaction::Hash>,
        flags: Vec<u8>,
    },
    /// A transaction, solicited or relayed.
    Transaction(std::sync::Arc<Transaction>),
    /// A peer finished its handshake and can serve sync requests.
    PeerReady(PeerId),
}

/// The identity this node presents during handshakes.
#[derive(Clone)]
pub struct HandshakeParams {
    /// The services we advertise: none, we are a leaf.
    pub services: PeerServices,
    pub user_agent: String,
    /// Our current chain height, maintained by the wallet worker.
    pub local_height: Arc<AtomicU32>,
}

/// The message dispatcher and the shared state its handlers touch.
#[derive(Clone)]
pub struct Dispatcher {
    peer_set: Arc<PeerSet>,
    address_book: Arc<Mutex<AddressBook>>,
    requests: Arc<Mutex<RequestTracker>>,
    handshake: HandshakeParams,
    /// The current `filterload` message, rebuilt by the wallet when keys
    /// change, and replayed to every peer that completes a handshake.
    shared_filter: Arc<Mutex<Option<Message>>>,
    updates: mpsc::UnboundedSender<InboundUpdate>,
}

impl Dispatcher {
    pub fn new(
        peer_set: Arc<PeerSet>,
        address_book: Arc<Mutex<AddressBook>>,
        requests: Arc<Mutex<RequestTracker>>,
        handshake: HandshakeParams,
        shared_filter: Arc<Mutex<Option<Message>>>,
        updates: mpsc::UnboundedSender<InboundUpdate>,
    ) -> Dispatcher {
        Dispatcher {
            peer_set,
            address_book,
            requests,
            handshake,
            shared_filter,
            updates,
        }
    }

    /// Consume peer events until every connection task has hung up.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        debug!("peer event channel closed, dispatcher exiting");
    }

    fn handle(&self, event: PeerEvent) {
        match event {
            PeerEvent::Connected(id) => self.on_connected(id),
            PeerEvent::Message(id, msg) => self.on_message(id, msg),
            PeerEvent::ProtocolError(id, error) => {
                debug!(peer = %id, %error, "malformed traffic");
                self.penalize(id, constants::MISBEHAVIOR_PENALTY, RejectReason::Malformed, "");
            }
            PeerEvent::Disconnected(id) => self.on_disconnected(id),
        }
    }

    fn on_message(&self, id: PeerId, msg: Message) {
        trace!(peer = %id, %msg, "dispatching");
        self.peer_set.modify(id, |peer| {
            peer.last_message = Instant::now();
        });
        match msg {
            Message::Version(version) => self.on_version(id, version),
            Message::Verack => self.on_verack(id),
            Message::Ping(nonce) => self.peer_set.send_to(id, Message::Pong(nonce)),
            Message::Pong(nonce) => self.on_pong(id, nonce),
            Message::Addr(addrs) => self.on_addr(id, addrs),
            Message::GetAddr => self.on_getaddr(id),
            Message::Inv(items) => self.on_inv(id, items),
            Message::Headers(headers) => self.on_headers(id, headers),
            Message::MerkleBlock(merkle_block) => self.on_merkle_block(id, merkle_block),
            Message::Tx(tx) => self.on_tx(id, tx),
            Message::NotFound(items) => self.on_notfound(id, items),
            Message::Reject {
                message,
                ccode,
                reason,
                ..
            } => {
                warn!(peer = %id, %message, ?ccode, %reason, "peer rejected our message");
            }
            // We are a leaf node and serve no data.
            Message::GetData(items) => {
                self.peer_set.send_to(id, Message::NotFound(items));
            }
            Message::GetBlocks(_) | Message::GetHeaders(_) | Message::Mempool => {
                debug!(peer = %id, "ignoring data request, we serve none");
            }
            Message::FilterLoad { .. } => {
                debug!(peer = %id, "ignoring filterload from peer");
            }
        }
    }

    fn on_connected(&self, id: PeerId) {
        let outbound = match self.peer_set.read(id, |peer| peer.outbound) {
            Some(outbound) => outbound,
            None => return,
        };
        if outbound {
            self.send_our_version(id);
        }
        // Inbound peers speak first; we answer their version.
    }

    fn send_our_version(&self, id: PeerId) {
        let their_addr = match self.peer_set.read(id, |peer| peer.addr) {
            Some(addr) => addr,
            None => return,
        };
        let our_addr: SocketAddr = "0.0.0.0:0".parse().expect("unspecified address parses");
        let version = Version::new(
            constants::CURRENT_VERSION,
            their_addr,
            PeerServices::NODE_NETWORK | PeerServices::NODE_BLOOM,
            self.handshake.services,
            our_addr,
            Nonce::default(),
            self.handshake.user_agent.clone(),
            block::Height(self.handshake.local_height.load(Ordering::Relaxed)),
            // Stay quiet until our filterload is in place.
            false,
        );
        self.peer_set.modify(id, |peer| {
            peer.send(Message::Version(version));
            peer.sent_version = true;
            peer.recompute_state();
        });
    }

    fn on_version(&self, id: PeerId, version: Version) {
        if version.version < constants::MIN_PEER_VERSION {
            info!(peer = %id, version = version.version.0, "peer too old for BIP37, dropping");
            if version.version >= constants::MIN_REJECT_VERSION {
                self.peer_set.send_to(
                    id,
                    Message::Reject {
                        message: "version".to_owned(),
                        ccode: RejectReason::Obsolete,
                        reason: "bloom filtering requires protocol 70001".to_owned(),
                        data: None,
                    },
                );
            }
            self.disconnect(id);
            return;
        }

        if !self.peer_set.read(id, |peer| peer.sent_version).unwrap_or(false) {
            self.send_our_version(id);
        }

        let filter = self.shared_filter.lock().expect("filter lock poisoned").clone();
        let became_ready = self.peer_set.modify(id, |peer| {
            peer.got_version = true;
            peer.services = version.services;
            peer.version = Some(version.version);
            peer.best_block = version.best_block;
            peer.send(Message::Verack);
            if let Some(filter) = filter {
                peer.send(filter);
            }
            if peer.outbound {
                peer.send(Message::GetAddr);
            }
            peer.recompute_state();
            peer.is_ready()
        });
        self.peer_set.observe_network_height(version.best_block);

        if became_ready == Some(true) {
            self.on_ready(id);
        }
    }

    fn on_verack(&self, id: PeerId) {
        let became_ready = self.peer_set.modify(id, |peer| {
            peer.got_verack = true;
            peer.recompute_state();
            peer.is_ready()
        });
        if became_ready == Some(true) {
            self.on_ready(id);
        }
    }

    fn on_ready(&self, id: PeerId) {
        if let Some(addr) = self.peer_set.read(id, |peer| peer.addr) {
            self.address_book
                .lock()
                .expect("address book lock poisoned")
                .mark_connected(addr);
            info!(peer = %id, %addr, "handshake complete");
        }
        let _ = self.updates.send(InboundUpdate::PeerReady(id));
        self.dispatch_to_peer(id);
    }

    fn on_pong(&self, id: PeerId, nonce: Nonce) {
        self.peer_set.modify(id, |peer| {
            if let Some((expected, _)) = peer.outstanding_ping {
                if expected == nonce {
                    peer.outstanding_ping = None;
                }
            }
        });
    }

    fn on_addr(&self, id: PeerId, mut addrs: Vec<MetaAddr>) {
        addrs.truncate(constants::MAX_GOSSIPED_ADDRS);
        let added = self
            .address_book
            .lock()
            .expect("address book lock poisoned")
            .add_gossiped(&addrs);
        trace!(peer = %id, added, "processed addr gossip");
    }

    fn on_getaddr(&self, id: PeerId) {
        let sample = self
            .address_book
            .lock()
            .expect("address book lock poisoned")
            .gossip_sample(constants::MAX_GOSSIPED_ADDRS);
        if !sample.is_empty() {
            self.peer_set.send_to(id, Message::Addr(sample));
        }
    }

    /// Convert announced inventory into requests: transactions are fetched
    /// as-is, announced blocks are fetched as filtered blocks.
    fn on_inv(&self, id: PeerId, items: Vec<InventoryHash>) {
        {
            let mut requests = self.requests.lock().expect("request lock poisoned");
            for item in items {
                match item {
                    InventoryHash::Tx(hash) => {
                        requests.enqueue(RequestKind::Tx, hash.0, Some(id));
                    }
                    InventoryHash::Block(hash) | InventoryHash::FilteredBlock(hash) => {
                        requests.enqueue(RequestKind::FilteredBlock, hash.0, Some(id));
                    }
                    InventoryHash::Error => {}
                }
            }
        }
        // The announcing peer presumably has the data; ask it first.
        self.dispatch_to_peer(id);
    }

    fn on_headers(&self, id: PeerId, headers: Vec<block::CountedHeader>) {
        debug!(peer = %id, count = headers.len(), "received headers");
        for counted in headers {
            let _ = self.updates.send(InboundUpdate::Header(counted.header));
        }
    }

    fn on_merkle_block(
        &self,
        id: PeerId,
        merkle_block: crate::protocol::external::MerkleBlock,
    ) {
        let hash = merkle_block.block_header.hash();
        self.requests
            .lock()
            .expect("request lock poisoned")
            .complete(RequestKind::FilteredBlock, hash.0);
        let _ = self.updates.send(InboundUpdate::MerkleBlock {
            header: merkle_block.block_header,
            transaction_count: merkle_block.transaction_count,
            hashes: merkle_block.hashes,
            flags: merkle_block.flags,
        });
        // Room may have opened up for this peer.
        self.dispatch_to_peer(id);
    }

    fn on_tx(&self, id: PeerId, tx: std::sync::Arc<Transaction>) {
        self.requests
            .lock()
            .expect("request lock poisoned")
            .complete(RequestKind::Tx, tx.hash().0);
        let _ = self.updates.send(InboundUpdate::Transaction(tx));
        self.dispatch_to_peer(id);
    }

    fn on_notfound(&self, id: PeerId, items: Vec<InventoryHash>) {
        {
            let mut requests = self.requests.lock().expect("request lock poisoned");
            for item in items {
                match item {
                    InventoryHash::Tx(hash) => requests.notfound(RequestKind::Tx, hash.0),
                    InventoryHash::Block(hash) | InventoryHash::FilteredBlock(hash) => {
                        requests.notfound(RequestKind::FilteredBlock, hash.0)
                    }
                    InventoryHash::Error => {}
                }
            }
        }
        debug!(peer = %id, "peer lacked requested data, re-routing");
        self.dispatch_all();
    }

    fn on_disconnected(&self, id: PeerId) {
        if let Some(peer) = self.peer_set.remove(id) {
            self.address_book
                .lock()
                .expect("address book lock poisoned")
                .mark_disconnected(peer.addr);
        }
        self.requests
            .lock()
            .expect("request lock poisoned")
            .peer_gone(id);
        // Whatever was in flight to this peer can go to another right away.
        self.dispatch_all();
    }

    /// Bump a peer's ban score and, when its version allows, tell it why.
    fn penalize(&self, id: PeerId, points: u32, ccode: RejectReason, message: &str) {
        let supports_reject = self
            .peer_set
            .read(id, |peer| peer.supports_reject())
            .unwrap_or(false);
        if supports_reject {
            self.peer_set.send_to(
                id,
                Message::Reject {
                    message: message.to_owned(),
                    ccode,
                    reason: format!("{:?}", ccode).to_lowercase(),
                    data: None,
                },
            );
        }
        let crossed = self
            .peer_set
            .modify(id, |peer| peer.misbehaving(points))
            .unwrap_or(false);
        if crossed {
            info!(peer = %id, "ban threshold crossed, disconnecting");
            self.disconnect(id);
        }
    }

    fn disconnect(&self, id: PeerId) {
        if let Some(peer) = self.peer_set.remove(id) {
            self.address_book
                .lock()
                .expect("address book lock poisoned")
                .mark_disconnected(peer.addr);
        }
        self.requests
            .lock()
            .expect("request lock poisoned")
            .peer_gone(id);
    }

    /// Hand this peer pending requests until its in-flight window is full.
    pub fn dispatch_to_peer(&self, id: PeerId) {
        if !self.peer_set.read(id, |peer| peer.is_ready()).unwrap_or(false) {
            return;
        }
        let items = {
            let mut requests = self.requests.lock().expect("request lock poisoned");
            let mut items = Vec::new();
            while requests.in_flight_for(id) < constants::MAX_IN_FLIGHT_PER_PEER {
                match requests.next_for_peer(id) {
                    Some((kind, hash)) => items.push(kind.inventory(hash)),
                    None => break,
                }
            }
            items
        };
        if !items.is_empty() {
            trace!(peer = %id, count = items.len(), "sending getdata");
            self.peer_set.send_to(id, Message::GetData(items));
        }
    }

    pub fn dispatch_all(&self) {
        for id in self.peer_set.ready_ids() {
            self.dispatch_to_peer(id);
        }
    }

    /// Periodic upkeep, driven by the node's one second interval: request
    /// timeouts, exhausted-request pruning, and ping/idle liveness.
    pub fn tick(&self) {
        let now = Instant::now();
        {
            let mut requests = self.requests.lock().expect("request lock poisoned");
            if requests.expire(now, constants::REQUEST_TIMEOUT) > 0 {
                drop(requests);
                self.dispatch_all();
            } else {
                requests.prune_exhausted(&self.peer_set.ready_ids());
            }
        }

        for id in self.peer_set.ids() {
            let action = self.peer_set.modify(id, |peer| {
                let idle = now.duration_since(peer.last_message);
                if idle >= constants::IDLE_TIMEOUT {
                    return LivenessAction::Drop;
                }
                if idle >= constants::PING_INTERVAL && peer.outstanding_ping.is_none() {
                    let nonce = Nonce::default();
                    peer.outstanding_ping = Some((nonce, now));
                    return LivenessAction::Ping(nonce);
                }
                LivenessAction::None
            });
            match action {
                Some(LivenessAction::Drop) => {
                    info!(peer = %id, "idle timeout, disconnecting");
                    self.disconnect(id);
                }
                Some(LivenessAction::Ping(nonce)) => {
                    self.peer_set.send_to(id, Message::Ping(nonce));
                }
                _ => {}
            }
        }
    }
}

enum LivenessAction {
    None,
    Ping(Nonce),
    Drop,
}
