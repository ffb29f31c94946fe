use std::io::{Cursor, Read};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::serialization::sha256d;
use crate::work::{CompactDifficulty, Work};
use crate::{cached::Cached, BitcoinDeserialize, BitcoinSerialize, SerializationError};
use bitcoin_serde_derive::BtcSerialize;

use super::Hash;
use crate::block::merkle;
use crate::compactint::CompactInt;

/// A block header, containing metadata about a block.
///
/// How are blocks chained together? They are chained together via the
/// backwards reference (previous header hash) present in the block
/// header. Each block points backwards to its parent, all the way
/// back to the genesis block (the first block in the blockchain).
#[derive(Clone, Copy, Debug, Eq, PartialEq, BtcSerialize)]
pub struct Header {
    /// The block's version field.
    pub version: i32,

    /// The hash of the previous block, used to create a chain of blocks back to
    /// the genesis block.
    ///
    /// This ensures no previous block can be changed without also changing this
    /// block's header.
    pub previous_block_hash: Hash,

    /// The root of the transaction Merkle tree, binding the block header to
    /// the transactions in the block.
    ///
    /// An SPV wallet checks transactions it receives against this root using
    /// the partial tree carried by a `merkleblock` message.
    pub merkle_root: merkle::Root,

    /// The block timestamp is a Unix epoch time (UTC) when the miner
    /// started hashing the header (according to the miner).
    pub time: DateTime<Utc>,

    /// An encoded version of the target threshold this block's header
    /// hash must be less than or equal to, in the same nBits format
    /// used by Bitcoin.
    ///
    /// [Bitcoin-nBits](https://bitcoin.org/en/developer-reference#target-nbits)
    pub difficulty_threshold: CompactDifficulty,

    /// An arbitrary field that miners can change to modify the header
    /// hash in order to produce a hash less than or equal to the
    /// target threshold.
    pub nonce: u32,

    /// For efficiency, we cache the hash of this block after computing it the first time
    /// This field is not part of the consensus serialization
    hash: Cached<Hash>,
}

/// Raised for headers whose timestamp is too far ahead of the local clock.
#[derive(Error, Debug)]
pub enum BlockTimeError {
    #[error("invalid time {0:?} in block header {1:?}: block time is more than 2 hours in the future ({2:?}). Hint: check your machine's date, time, and time zone.")]
    InvalidBlockTime(DateTime<Utc>, Hash, DateTime<Utc>),
}

impl Header {
    // Returns length of serialized header in bytes
    pub const fn len() -> usize {
        80
    }

    pub fn new(
        version: i32,
        previous_block_hash: Hash,
        merkle_root: merkle::Root,
        time: DateTime<Utc>,
        difficulty_threshold: CompactDifficulty,
        nonce: u32,
    ) -> Header {
        Header {
            version,
            previous_block_hash,
            merkle_root,
            time,
            difficulty_threshold,
            nonce,
            hash: Cached::new(),
        }
    }

    /// Get the hash of this header, from the cache if it was deserialized.
    pub fn hash(&self) -> Hash {
        if let Some(hash) = self.hash.value() {
            return hash;
        }
        Hash::from(self)
    }

    /// The expected number of hash operations represented by this header.
    pub fn block_work(&self) -> Option<Work> {
        self.difficulty_threshold.block_work()
    }

    /// Check the drift policy: a header's time may not be more than two hours
    /// ahead of the local clock. Headers deep in the past are always valid,
    /// otherwise initial sync would reject the entire historical chain.
    pub fn time_is_valid_at(&self, now: DateTime<Utc>) -> Result<(), BlockTimeError> {
        let two_hours_in_the_future = now
            .checked_add_signed(Duration::hours(2))
            .expect("calculating 2 hours in the future does not overflow");
        if self.time <= two_hours_in_the_future {
            Ok(())
        } else {
            Err(BlockTimeError::InvalidBlockTime(
                self.time,
                self.hash(),
                two_hours_in_the_future,
            ))
        }
    }

    pub fn bitcoin_serialize_to_vec(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut out = Vec::with_capacity(Header::len());
        self.bitcoin_serialize(&mut out)?;
        Ok(out)
    }
}

/// Deserializes a header, hashing the raw 80 bytes once so that the hash
/// never needs to be recomputed from a reserialization.
impl BitcoinDeserialize for Header {
    fn bitcoin_deserialize<R: Read>(mut reader: R) -> Result<Self, SerializationError> {
        let mut raw = [0u8; 80];
        reader.read_exact(&mut raw)?;
        let own_hash = Hash(sha256d::digest(&raw));

        let mut src = Cursor::new(&raw[..]);
        Ok(Header {
            version: i32::bitcoin_deserialize(&mut src)?,
            previous_block_hash: Hash::bitcoin_deserialize(&mut src)?,
            merkle_root: merkle::Root::bitcoin_deserialize(&mut src)?,
            time: <DateTime<Utc>>::bitcoin_deserialize(&mut src)?,
            difficulty_threshold: CompactDifficulty::bitcoin_deserialize(&mut src)?,
            nonce: u32::bitcoin_deserialize(&mut src)?,
            hash: Cached::from(own_hash),
        })
    }
}

/// A header with a count of the number of transactions in its block.
///
/// This structure is used in the `headers` message of the Bitcoin network
/// protocol. The transaction count is always zero there; peers send the
/// transactions themselves only in response to `getdata`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountedHeader {
    pub header: Header,
    pub transaction_count: usize,
}

impl BitcoinSerialize for CountedHeader {
    fn bitcoin_serialize<W: std::io::Write>(&self, mut target: W) -> Result<(), std::io::Error> {
        self.header.bitcoin_serialize(&mut target)?;
        CompactInt::from(self.transaction_count).bitcoin_serialize(&mut target)?;
        Ok(())
    }
}

impl BitcoinDeserialize for CountedHeader {
    fn bitcoin_deserialize<R: Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(CountedHeader {
            header: Header::bitcoin_deserialize(&mut reader)?,
            transaction_count: CompactInt::bitcoin_deserialize(&mut reader)?.value() as usize,
        })
    }
}
