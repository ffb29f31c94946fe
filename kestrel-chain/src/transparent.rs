//! Transaction inputs and outputs, and the scripts that lock them.
#![allow(clippy::unit_arg)]

mod address;
mod script;

pub use address::{hash160, Address};
pub use script::Script;

use std::io;

use crate::{
    compactint::CompactInt, BitcoinDeserialize, BitcoinSerialize, SerializationError,
};
use bitcoin_serde_derive::{BtcDeserialize, BtcSerialize};

use crate::{amount::Amount, transaction};

/// Arbitrary data inserted by miners into a coinbase transaction.
#[derive(Clone, Eq, PartialEq, BtcDeserialize, BtcSerialize)]
pub struct CoinbaseData(pub Vec<u8>);

impl AsRef<[u8]> for CoinbaseData {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl CoinbaseData {
    pub fn serialized_size(&self) -> usize {
        CompactInt::size(self.0.len()) + self.0.len()
    }
}

impl std::fmt::Debug for CoinbaseData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let escaped = String::from_utf8(
            self.0
                .iter()
                .cloned()
                .flat_map(std::ascii::escape_default)
                .collect(),
        )
        .expect("ascii::escape_default produces utf8");
        f.debug_tuple("CoinbaseData").field(&escaped).finish()
    }
}

/// OutPoint
///
/// A particular transaction output reference.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, BtcSerialize, BtcDeserialize)]
pub struct OutPoint {
    /// References the transaction that contains the UTXO being spent.
    pub hash: transaction::Hash,

    /// Identifies which UTXO from that transaction is referenced; the
    /// first output is 0, etc.
    pub index: u32,
}

impl OutPoint {
    #[inline]
    pub const fn len() -> usize {
        36
    }

    /// The sentinel outpoint carried by a coinbase input.
    fn null() -> OutPoint {
        OutPoint {
            hash: transaction::Hash([0; 32]),
            index: u32::MAX,
        }
    }

    fn is_null(&self) -> bool {
        self.hash.0 == [0; 32] && self.index == u32::MAX
    }
}

/// A transaction input: either a spend of a previous output, or the block
/// reward claim that can only appear first in a coinbase transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Input {
    /// A reference to an output of a previous transaction.
    PrevOut {
        /// The previous output transaction reference.
        outpoint: OutPoint,
        /// The script that authorizes spending `outpoint`.
        unlock_script: Script,
        /// The sequence number for the input.
        sequence: u32,
    },
    /// New coins created by the block reward.
    Coinbase {
        /// Free data inserted by miners.
        data: CoinbaseData,
        /// The sequence number for the input.
        sequence: u32,
    },
}

impl Input {
    pub fn len(&self) -> usize {
        match *self {
            Input::PrevOut {
                ref unlock_script, ..
            } => OutPoint::len() + unlock_script.serialized_size() + 4,
            Input::Coinbase { ref data, .. } => OutPoint::len() + data.serialized_size() + 4,
        }
    }

    /// The previous output this input spends, if it is not a coinbase claim.
    pub fn outpoint(&self) -> Option<OutPoint> {
        match self {
            Input::PrevOut { outpoint, .. } => Some(*outpoint),
            Input::Coinbase { .. } => None,
        }
    }

    /// Serialize with the signature script cleared, the form hashed into a
    /// normalized transaction id.
    pub fn serialize_without_script<W: io::Write>(
        &self,
        mut writer: W,
    ) -> Result<(), std::io::Error> {
        match self {
            Input::PrevOut {
                outpoint, sequence, ..
            } => {
                outpoint.bitcoin_serialize(&mut writer)?;
                CompactInt::from(0).bitcoin_serialize(&mut writer)?;
                sequence.bitcoin_serialize(&mut writer)
            }
            Input::Coinbase { sequence, .. } => {
                OutPoint::null().bitcoin_serialize(&mut writer)?;
                CompactInt::from(0).bitcoin_serialize(&mut writer)?;
                sequence.bitcoin_serialize(&mut writer)
            }
        }
    }
}

impl BitcoinSerialize for Input {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), std::io::Error> {
        match self {
            Input::PrevOut {
                outpoint,
                unlock_script,
                sequence,
            } => {
                outpoint.bitcoin_serialize(&mut writer)?;
                unlock_script.bitcoin_serialize(&mut writer)?;
                sequence.bitcoin_serialize(&mut writer)
            }
            Input::Coinbase { data, sequence } => {
                OutPoint::null().bitcoin_serialize(&mut writer)?;
                data.bitcoin_serialize(&mut writer)?;
                sequence.bitcoin_serialize(&mut writer)
            }
        }
    }
}

impl BitcoinDeserialize for Input {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let outpoint = OutPoint::bitcoin_deserialize(&mut reader)?;
        if outpoint.is_null() {
            Ok(Input::Coinbase {
                data: CoinbaseData::bitcoin_deserialize(&mut reader)?,
                sequence: u32::bitcoin_deserialize(&mut reader)?,
            })
        } else {
            Ok(Input::PrevOut {
                outpoint,
                unlock_script: Script::bitcoin_deserialize(&mut reader)?,
                sequence: u32::bitcoin_deserialize(&mut reader)?,
            })
        }
    }
}

/// A transaction output.
///
/// The most fundamental building block of a transaction is a transaction
/// output -- the coins a wallet owns are in fact a subset of unspent
/// transaction outputs of the global ledger.
///
/// Outputs are indivisible, discrete units of value which can only be
/// consumed in their entirety. Sending less than an output's value means
/// constructing a transaction that pays the remainder back to a change
/// address.
#[derive(Clone, Debug, Eq, PartialEq, Hash, BtcDeserialize, BtcSerialize)]
pub struct Output {
    /// Transaction value.
    // At https://en.bitcoin.it/wiki/Protocol_documentation#tx, this is an i64.
    pub value: Amount,

    /// The lock script defines the conditions under which this output can be spent.
    pub lock_script: Script,
}

impl Output {
    /// Returns the serialized length (in bytes) of this Output
    pub fn len(&self) -> usize {
        8 + self.lock_script.serialized_size()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_script.0.is_empty()
    }
}
