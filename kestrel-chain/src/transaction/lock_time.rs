use std::io;

use chrono::{DateTime, TimeZone, Utc};

use crate::block;
use crate::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// A transaction's lock time: either a block height or a Unix timestamp,
/// disambiguated by the 500,000,000 threshold.
///
/// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#tx)
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LockTime {
    /// Unlocked at or after this block height.
    Height(block::Height),
    /// Unlocked at or after this time.
    Time(DateTime<Utc>),
}

/// Raw lock time values below this threshold are heights, the rest are
/// timestamps.
pub(super) const LOCK_TIME_THRESHOLD: u32 = 500_000_000;

impl LockTime {
    /// The lock time of a transaction spendable immediately.
    pub fn unlocked() -> LockTime {
        LockTime::Height(block::Height(0))
    }
}

impl BitcoinSerialize for LockTime {
    fn bitcoin_serialize<W: io::Write>(&self, writer: W) -> Result<(), std::io::Error> {
        match self {
            LockTime::Height(height) => height.0.bitcoin_serialize(writer),
            LockTime::Time(time) => time.bitcoin_serialize(writer),
        }
    }
}

impl BitcoinDeserialize for LockTime {
    fn bitcoin_deserialize<R: io::Read>(reader: R) -> Result<Self, SerializationError> {
        let raw = u32::bitcoin_deserialize(reader)?;
        if raw < LOCK_TIME_THRESHOLD {
            Ok(LockTime::Height(block::Height(raw)))
        } else {
            Ok(LockTime::Time(
                Utc.timestamp_opt(raw as i64, 0)
                    .single()
                    .expect("all u32 values are valid timestamps"),
            ))
        }
    }
}
