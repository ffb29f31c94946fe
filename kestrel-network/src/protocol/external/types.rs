//! Newtype wrappers for the primitive fields of wire messages.

use std::fmt;

use bitflags::bitflags;
use kestrel_chain::parameters::Network;
use kestrel_chain::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// A magic number identifying the network a message belongs to.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Magic(pub [u8; 4]);

impl fmt::Debug for Magic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Magic").field(&hex::encode(&self.0)).finish()
    }
}

impl From<Network> for Magic {
    fn from(network: Network) -> Self {
        Magic(network.magic_bytes())
    }
}

/// A protocol version number.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct ProtocolVersion(pub u32);

impl BitcoinSerialize for ProtocolVersion {
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error> {
        self.0.bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for ProtocolVersion {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(ProtocolVersion(u32::bitcoin_deserialize(reader)?))
    }
}

/// A nonce used in the networking layer to identify messages.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Nonce(pub u64);

impl Default for Nonce {
    fn default() -> Self {
        use rand::{thread_rng, Rng};
        Self(thread_rng().gen())
    }
}

impl BitcoinSerialize for Nonce {
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error> {
        self.0.bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for Nonce {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(Nonce(u64::bitcoin_deserialize(reader)?))
    }
}

bitflags! {
    /// The network services a peer advertises.
    ///
    /// An SPV wallet cares about two bits: `NODE_NETWORK`, promising the peer
    /// can serve historical blocks, and `NODE_BLOOM`, promising it honors
    /// BIP37 filters.
    #[derive(Default)]
    pub struct PeerServices: u64 {
        /// NODE_NETWORK means that the node is a full node capable of serving
        /// blocks, as opposed to a light client that makes network requests but
        /// does not provide network services.
        const NODE_NETWORK = 1;
        /// NODE_BLOOM means that the node supports BIP37 Bloom-filtered
        /// connections.
        const NODE_BLOOM = 4;
    }
}

impl BitcoinSerialize for PeerServices {
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error> {
        self.bits().bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for PeerServices {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        // Unknown service bits are routine and must not be a parse error.
        Ok(PeerServices::from_bits_truncate(u64::bitcoin_deserialize(
            reader,
        )?))
    }
}

/// The raw bit field of a BIP37 Bloom filter.
#[derive(Clone, Eq, PartialEq)]
pub struct Filter(pub Vec<u8>);

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Filter")
            .field(&format!("{} bytes", self.0.len()))
            .finish()
    }
}

/// A randomization seed mixed into a Bloom filter's hash functions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Tweak(pub u32);
