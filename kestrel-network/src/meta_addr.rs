//! Peer addresses with the metadata peers gossip about each other.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};

use kestrel_chain::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

use crate::protocol::external::types::PeerServices;

/// An address of a peer on the network, together with the services it claims
/// to offer and the last time anyone reported hearing from it.
///
/// This is the element type of an `addr` message:
/// `time u32LE | services u64LE | 16 byte IPv4-in-IPv6 address | port u16BE`.
///
/// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#addr)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MetaAddr {
    /// The last time another peer claims to have seen this address.
    ///
    /// Gossiped, so it can lie; the address book only uses it to prefer
    /// recently seen candidates.
    pub last_seen: DateTime<Utc>,

    /// The services the peer at this address advertised.
    pub services: PeerServices,

    /// The address itself.
    pub addr: SocketAddr,
}

impl MetaAddr {
    /// Whether the advertised services are useful to an SPV wallet.
    pub fn is_useful(&self) -> bool {
        self.services
            .contains(PeerServices::NODE_NETWORK | PeerServices::NODE_BLOOM)
    }
}

impl BitcoinSerialize for MetaAddr {
    fn bitcoin_serialize<W: std::io::Write>(&self, mut target: W) -> Result<(), std::io::Error> {
        self.last_seen.bitcoin_serialize(&mut target)?;
        self.services.bitcoin_serialize(&mut target)?;
        self.addr.bitcoin_serialize(&mut target)
    }
}

impl BitcoinDeserialize for MetaAddr {
    fn bitcoin_deserialize<R: std::io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(MetaAddr {
            last_seen: <DateTime<Utc>>::bitcoin_deserialize(&mut reader)?,
            services: PeerServices::bitcoin_deserialize(&mut reader)?,
            addr: SocketAddr::bitcoin_deserialize(&mut reader)?,
        })
    }
}
