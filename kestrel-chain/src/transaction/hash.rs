use std::{fmt, io};

use crate::compactint::CompactInt;
use crate::serialization::{sha256d, BitcoinDeserialize, BitcoinSerialize, SerializationError};
use bitcoin_serde_derive::BtcSerialize;

use super::Transaction;

/// A transaction hash (txid), the sha256d digest of the serialized
/// transaction.
///
/// Note: Kestrel displays transaction and block hashes in big-endian
/// byte-order, following the u256 convention set by Bitcoin.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, BtcSerialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn from_bytes_exact(bytes: [u8; 32]) -> Hash {
        Hash(bytes)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut reversed_bytes = self.0;
        reversed_bytes.reverse();
        f.write_str(&hex::encode(&reversed_bytes))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut reversed_bytes = self.0;
        reversed_bytes.reverse();
        f.debug_tuple("transaction::Hash")
            .field(&hex::encode(&reversed_bytes))
            .finish()
    }
}

impl BitcoinDeserialize for Hash {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(Hash(<[u8; 32]>::bitcoin_deserialize(&mut reader)?))
    }
}

impl<'a> From<&'a Transaction> for Hash {
    fn from(tx: &'a Transaction) -> Self {
        let mut hash_writer = sha256d::Writer::default();
        tx.bitcoin_serialize(&mut hash_writer)
            .expect("Sha256dWriter is infallible");
        Self(hash_writer.finish())
    }
}

impl std::str::FromStr for Hash {
    type Err = SerializationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; 32];
        if hex::decode_to_slice(s, &mut bytes[..]).is_err() {
            Err(SerializationError::Parse("hex decoding error"))
        } else {
            bytes.reverse();
            Ok(Hash(bytes))
        }
    }
}

/// The normalized transaction id: the sha256d digest of the transaction
/// serialized with every input's signature script cleared.
///
/// A relay node can alter a signature without invalidating it, changing the
/// txid but not this hash, so wallet rows are keyed by it to collapse
/// malleated duplicates of the same payment.
#[derive(Copy, Clone, Eq, PartialEq, Hash, BtcSerialize)]
pub struct NormalizedId(pub [u8; 32]);

impl fmt::Debug for NormalizedId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut reversed_bytes = self.0;
        reversed_bytes.reverse();
        f.debug_tuple("transaction::NormalizedId")
            .field(&hex::encode(&reversed_bytes))
            .finish()
    }
}

impl BitcoinDeserialize for NormalizedId {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(NormalizedId(<[u8; 32]>::bitcoin_deserialize(&mut reader)?))
    }
}

impl<'a> From<&'a Transaction> for NormalizedId {
    fn from(tx: &'a Transaction) -> Self {
        let mut hash_writer = sha256d::Writer::default();
        tx.version
            .bitcoin_serialize(&mut hash_writer)
            .expect("Sha256dWriter is infallible");
        CompactInt::from(tx.inputs.len())
            .bitcoin_serialize(&mut hash_writer)
            .expect("Sha256dWriter is infallible");
        for input in tx.inputs.iter() {
            input
                .serialize_without_script(&mut hash_writer)
                .expect("Sha256dWriter is infallible");
        }
        tx.outputs
            .bitcoin_serialize(&mut hash_writer)
            .expect("Sha256dWriter is infallible");
        tx.lock_time
            .bitcoin_serialize(&mut hash_writer)
            .expect("Sha256dWriter is infallible");
        Self(hash_writer.finish())
    }
}
