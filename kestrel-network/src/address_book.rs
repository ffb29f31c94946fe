//! Candidate peer addresses and where they came from.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;

use crate::meta_addr::MetaAddr;
use crate::protocol::external::types::PeerServices;

/// How long a failed candidate is left alone before being offered again.
const RETRY_BACKOFF: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct AddressEntry {
    meta: MetaAddr,
    /// Entries from `connect=` configuration are pinned and never evicted.
    is_static: bool,
    connected: bool,
    last_attempt: Option<Instant>,
}

/// The set of peer addresses we could dial, fed by static configuration,
/// DNS seeds, and `addr` gossip.
#[derive(Debug, Default)]
pub struct AddressBook {
    entries: HashMap<SocketAddr, AddressEntry>,
    has_static: bool,
}

impl AddressBook {
    /// An address book seeded with the operator's `connect=` entries. When
    /// any are present, gossip and seeding are disabled: the operator chose
    /// the peers.
    pub fn new(static_peers: impl IntoIterator<Item = SocketAddr>) -> AddressBook {
        let mut book = AddressBook::default();
        for addr in static_peers {
            book.entries.insert(
                addr,
                AddressEntry {
                    meta: MetaAddr {
                        last_seen: Utc::now(),
                        services: PeerServices::NODE_NETWORK | PeerServices::NODE_BLOOM,
                        addr,
                    },
                    is_static: true,
                    connected: false,
                    last_attempt: None,
                },
            );
        }
        book.has_static = !book.entries.is_empty();
        book
    }

    /// Whether the peer list is operator-forced.
    pub fn has_static_entries(&self) -> bool {
        self.has_static
    }

    /// Record an address learned from a DNS seed.
    pub fn add_seeded(&mut self, addr: SocketAddr) {
        if self.has_static {
            return;
        }
        self.entries.entry(addr).or_insert(AddressEntry {
            meta: MetaAddr {
                last_seen: Utc::now(),
                services: PeerServices::NODE_NETWORK | PeerServices::NODE_BLOOM,
                addr,
            },
            is_static: false,
            connected: false,
            last_attempt: None,
        });
    }

    /// Merge gossiped addresses, keeping the freshest last-seen time and
    /// skipping peers whose services are useless to an SPV wallet. Returns
    /// how many entries were new.
    pub fn add_gossiped(&mut self, addrs: &[MetaAddr]) -> usize {
        if self.has_static {
            return 0;
        }
        let mut added = 0;
        for meta in addrs.iter().filter(|meta| meta.is_useful()) {
            match self.entries.get_mut(&meta.addr) {
                Some(entry) => {
                    if meta.last_seen > entry.meta.last_seen {
                        entry.meta.last_seen = meta.last_seen;
                    }
                    entry.meta.services = meta.services;
                }
                None => {
                    self.entries.insert(
                        meta.addr,
                        AddressEntry {
                            meta: *meta,
                            is_static: false,
                            connected: false,
                            last_attempt: None,
                        },
                    );
                    added += 1;
                }
            }
        }
        debug!(added, total = self.entries.len(), "merged gossiped addresses");
        added
    }

    /// Pick the next address to dial and mark it attempted.
    ///
    /// Recently-seen non-static entries are preferred over static ones, per
    /// the reconnect policy; entries that just failed wait out a backoff.
    pub fn next_candidate(&mut self, now: Instant) -> Option<SocketAddr> {
        let mut candidates: Vec<&AddressEntry> = self
            .entries
            .values()
            .filter(|entry| !entry.connected)
            .filter(|entry| match entry.last_attempt {
                Some(at) => now.duration_since(at) >= RETRY_BACKOFF,
                None => true,
            })
            .collect();
        candidates.sort_by_key(|entry| (entry.is_static, std::cmp::Reverse(entry.meta.last_seen)));
        let addr = candidates.first().map(|entry| entry.meta.addr)?;

        let entry = self.entries.get_mut(&addr).expect("candidate exists");
        entry.last_attempt = Some(now);
        Some(addr)
    }

    pub fn mark_connected(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            entry.connected = true;
            entry.meta.last_seen = Utc::now();
        }
    }

    pub fn mark_disconnected(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            entry.connected = false;
        }
    }

    /// A sample of known addresses to answer a `getaddr`.
    pub fn gossip_sample(&self, max: usize) -> Vec<MetaAddr> {
        let mut sample: Vec<MetaAddr> = self.entries.values().map(|entry| entry.meta).collect();
        sample.sort_by_key(|meta| std::cmp::Reverse(meta.last_seen));
        sample.truncate(max);
        sample
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
