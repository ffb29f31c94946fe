//! Tracking of outstanding `getdata` requests across peers.
//!
//! Every transaction or filtered block we want lives in exactly one of two
//! lists: **pending** (not yet dispatched to any peer) or **processed**
//! (in flight to some peer). A `notfound`, a timeout, or a disconnect moves a
//! request back to pending for the next peer; once every live peer has been
//! tried, the request is dropped with a warning.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use kestrel_chain::{block, transaction};

use crate::peer::PeerId;
use crate::protocol::external::InventoryHash;

/// What kind of data a request asks for.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RequestKind {
    /// A transaction, by txid.
    Tx,
    /// A block delivered as a `merkleblock` plus matching transactions.
    FilteredBlock,
}

impl RequestKind {
    /// The `getdata` inventory entry for this request.
    pub fn inventory(self, hash: [u8; 32]) -> InventoryHash {
        match self {
            RequestKind::Tx => InventoryHash::Tx(transaction::Hash(hash)),
            RequestKind::FilteredBlock => InventoryHash::FilteredBlock(block::Hash(hash)),
        }
    }
}

/// One tracked request.
#[derive(Debug, Clone)]
pub struct PeerRequest {
    pub kind: RequestKind,
    pub hash: [u8; 32],
    /// Peers that have already been asked for this item.
    pub asked: HashSet<PeerId>,
    /// The peer whose `inv` produced this request, if any.
    pub origin: Option<PeerId>,
    /// The peer currently being waited on.
    pub assigned: Option<PeerId>,
    pub in_flight: bool,
    pub sent_at: Option<Instant>,
}

impl PeerRequest {
    fn new(kind: RequestKind, hash: [u8; 32], origin: Option<PeerId>) -> PeerRequest {
        PeerRequest {
            kind,
            hash,
            asked: HashSet::new(),
            origin,
            assigned: None,
            in_flight: false,
            sent_at: None,
        }
    }

    fn key(&self) -> (RequestKind, [u8; 32]) {
        (self.kind, self.hash)
    }
}

/// The pending and in-flight request lists.
#[derive(Debug, Default)]
pub struct RequestTracker {
    pending: VecDeque<PeerRequest>,
    processed: HashMap<(RequestKind, [u8; 32]), PeerRequest>,
}

impl RequestTracker {
    pub fn new() -> RequestTracker {
        RequestTracker::default()
    }

    /// Add a request unless the same (kind, hash) is already pending or in
    /// flight. Returns whether it was added.
    pub fn enqueue(&mut self, kind: RequestKind, hash: [u8; 32], origin: Option<PeerId>) -> bool {
        if self.is_tracked(kind, hash) {
            return false;
        }
        self.pending.push_back(PeerRequest::new(kind, hash, origin));
        true
    }

    pub fn is_tracked(&self, kind: RequestKind, hash: [u8; 32]) -> bool {
        self.processed.contains_key(&(kind, hash))
            || self
                .pending
                .iter()
                .any(|request| request.kind == kind && request.hash == hash)
    }

    /// Pop the oldest pending request this peer has not been asked for yet,
    /// marking it in flight to that peer.
    pub fn next_for_peer(&mut self, peer: PeerId) -> Option<(RequestKind, [u8; 32])> {
        let position = self
            .pending
            .iter()
            .position(|request| !request.asked.contains(&peer))?;
        let mut request = self.pending.remove(position).expect("position is valid");
        request.asked.insert(peer);
        request.assigned = Some(peer);
        request.in_flight = true;
        request.sent_at = Some(Instant::now());
        let key = request.key();
        self.processed.insert(key, request);
        Some(key)
    }

    /// How many requests are currently in flight to `peer`.
    pub fn in_flight_for(&self, peer: PeerId) -> usize {
        self.processed
            .values()
            .filter(|request| request.assigned == Some(peer))
            .count()
    }

    /// The requested item arrived; forget the request. Returns whether it was
    /// being tracked.
    pub fn complete(&mut self, kind: RequestKind, hash: [u8; 32]) -> bool {
        self.processed.remove(&(kind, hash)).is_some()
    }

    /// A peer answered `notfound`: put the request back in line for another
    /// peer. The asked set is preserved so the same peer is not retried.
    pub fn notfound(&mut self, kind: RequestKind, hash: [u8; 32]) {
        if let Some(mut request) = self.processed.remove(&(kind, hash)) {
            debug!(?kind, hash = %transaction::Hash(hash), "request returned notfound, re-queueing");
            request.assigned = None;
            request.in_flight = false;
            request.sent_at = None;
            self.pending.push_back(request);
        }
    }

    /// A peer disconnected: re-queue whatever was in flight to it and null
    /// out origin references.
    pub fn peer_gone(&mut self, peer: PeerId) {
        let keys: Vec<_> = self
            .processed
            .values()
            .filter(|request| request.assigned == Some(peer))
            .map(|request| request.key())
            .collect();
        for key in keys {
            if let Some(mut request) = self.processed.remove(&key) {
                request.assigned = None;
                request.in_flight = false;
                request.sent_at = None;
                self.pending.push_back(request);
            }
        }
        for request in self
            .pending
            .iter_mut()
            .chain(self.processed.values_mut())
        {
            if request.origin == Some(peer) {
                request.origin = None;
            }
        }
    }

    /// Move requests that have waited longer than `timeout` back to pending.
    /// Returns how many expired.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        let keys: Vec<_> = self
            .processed
            .values()
            .filter(|request| match request.sent_at {
                Some(at) => now.duration_since(at) >= timeout,
                None => false,
            })
            .map(|request| request.key())
            .collect();
        let expired = keys.len();
        for key in keys {
            if let Some(mut request) = self.processed.remove(&key) {
                debug!(kind = ?request.kind, hash = %transaction::Hash(request.hash),
                       "request timed out, re-queueing");
                request.assigned = None;
                request.in_flight = false;
                request.sent_at = None;
                self.pending.push_back(request);
            }
        }
        expired
    }

    /// Drop pending requests that every live peer has already been asked for.
    pub fn prune_exhausted(&mut self, live_peers: &[PeerId]) {
        if live_peers.is_empty() {
            return;
        }
        let before = self.pending.len();
        self.pending.retain(|request| {
            let exhausted = live_peers.iter().all(|peer| request.asked.contains(peer));
            if exhausted {
                warn!(kind = ?request.kind, hash = %transaction::Hash(request.hash),
                      "no peer could serve request, dropping");
            }
            !exhausted
        });
        if before != self.pending.len() {
            debug!(dropped = before - self.pending.len(), "pruned exhausted requests");
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.processed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: [u8; 32] = [0xAB; 32];

    #[test]
    fn duplicate_requests_are_discarded() {
        let mut tracker = RequestTracker::new();
        assert!(tracker.enqueue(RequestKind::Tx, HASH, Some(PeerId(1))));
        assert!(!tracker.enqueue(RequestKind::Tx, HASH, Some(PeerId(2))));
        // Same hash, different kind is a distinct request.
        assert!(tracker.enqueue(RequestKind::FilteredBlock, HASH, None));

        // Still deduplicated once in flight.
        assert!(tracker.next_for_peer(PeerId(1)).is_some());
        assert!(!tracker.enqueue(RequestKind::Tx, HASH, None));
    }

    #[test]
    fn notfound_reroutes_to_the_next_peer_then_drops() {
        let mut tracker = RequestTracker::new();
        tracker.enqueue(RequestKind::Tx, HASH, Some(PeerId(1)));

        assert_eq!(
            tracker.next_for_peer(PeerId(1)),
            Some((RequestKind::Tx, HASH))
        );
        tracker.notfound(RequestKind::Tx, HASH);

        // Peer 1 is not retried; peer 2 gets the request.
        assert_eq!(tracker.next_for_peer(PeerId(1)), None);
        assert_eq!(
            tracker.next_for_peer(PeerId(2)),
            Some((RequestKind::Tx, HASH))
        );
        tracker.notfound(RequestKind::Tx, HASH);

        // Both live peers exhausted: the request is dropped.
        tracker.prune_exhausted(&[PeerId(1), PeerId(2)]);
        assert_eq!(tracker.pending_len(), 0);
        assert_eq!(tracker.in_flight_len(), 0);
    }

    #[test]
    fn timeouts_requeue_requests() {
        let mut tracker = RequestTracker::new();
        tracker.enqueue(RequestKind::FilteredBlock, HASH, None);
        tracker.next_for_peer(PeerId(1));

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(tracker.expire(later, Duration::from_secs(60)), 1);
        assert_eq!(tracker.in_flight_len(), 0);
        assert_eq!(tracker.pending_len(), 1);
        // The timed-out peer is not retried.
        assert_eq!(tracker.next_for_peer(PeerId(1)), None);
    }

    #[test]
    fn disconnects_requeue_and_clear_origins() {
        let mut tracker = RequestTracker::new();
        tracker.enqueue(RequestKind::Tx, HASH, Some(PeerId(1)));
        tracker.next_for_peer(PeerId(1));

        tracker.peer_gone(PeerId(1));
        assert_eq!(tracker.in_flight_len(), 0);
        assert_eq!(tracker.pending_len(), 1);

        let handed = tracker.next_for_peer(PeerId(2));
        assert_eq!(handed, Some((RequestKind::Tx, HASH)));
    }

    #[test]
    fn per_peer_capacity_counts_only_that_peer() {
        let mut tracker = RequestTracker::new();
        for byte in 0..4u8 {
            tracker.enqueue(RequestKind::Tx, [byte; 32], None);
        }
        tracker.next_for_peer(PeerId(1));
        tracker.next_for_peer(PeerId(1));
        tracker.next_for_peer(PeerId(2));

        assert_eq!(tracker.in_flight_for(PeerId(1)), 2);
        assert_eq!(tracker.in_flight_for(PeerId(2)), 1);
        assert_eq!(tracker.pending_len(), 1);
    }
}
