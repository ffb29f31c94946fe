//! Compact difficulty targets and accumulated proof of work.

use std::fmt;
use std::ops::{Add, AddAssign};

use primitive_types::U256;

use crate::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// A difficulty target in the compact `nBits` format carried by block headers.
///
/// The format packs a 256-bit threshold into 32 bits: one byte of exponent
/// and three bytes of mantissa, with a sign bit that is never valid in a
/// block header.
///
/// [Bitcoin-nBits](https://bitcoin.org/en/developer-reference#target-nbits)
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CompactDifficulty(pub u32);

impl CompactDifficulty {
    /// Expand the compact form into the 256-bit threshold a block hash must
    /// not exceed.
    ///
    /// Returns `None` for encodings that are negative, zero, or overflow
    /// 256 bits; none of these occur in valid headers.
    pub fn to_target(&self) -> Option<U256> {
        let exponent = (self.0 >> 24) as usize;
        let mantissa = self.0 & 0x007f_ffff;

        if self.0 & 0x0080_0000 != 0 || mantissa == 0 {
            return None;
        }

        let target = if exponent <= 3 {
            U256::from(mantissa >> (8 * (3 - exponent)))
        } else {
            let shift = 8 * (exponent - 3);
            if shift > 256 - 24 {
                return None;
            }
            U256::from(mantissa) << shift
        };
        if target.is_zero() {
            None
        } else {
            Some(target)
        }
    }

    /// The expected number of hash operations needed to find a block at this
    /// difficulty: `floor(2^256 / (target + 1))`.
    pub fn block_work(&self) -> Option<Work> {
        let target = self.to_target()?;
        // 2^256 does not fit in a U256, so compute
        // (2^256 - target - 1) / (target + 1) + 1, which is equal for target > 0.
        Some(Work((!target) / (target + 1) + 1))
    }
}

impl BitcoinSerialize for CompactDifficulty {
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error> {
        self.0.bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for CompactDifficulty {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(CompactDifficulty(u32::bitcoin_deserialize(reader)?))
    }
}

/// Accumulated proof of work over a header chain, the tiebreaker between
/// competing chains.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct Work(pub U256);

impl Work {
    pub fn zero() -> Work {
        Work(U256::zero())
    }

    /// The chain work recorded for the genesis entry.
    ///
    /// Existing stores record `1` here rather than the value computed from
    /// the genesis target bits, and we stay compatible with them.
    pub fn genesis() -> Work {
        Work(U256::one())
    }

    pub fn to_big_endian_bytes(&self) -> [u8; 32] {
        let mut buffer = [0u8; 32];
        self.0.to_big_endian(&mut buffer);
        buffer
    }

    pub fn from_big_endian_bytes(bytes: [u8; 32]) -> Work {
        Work(U256::from_big_endian(&bytes))
    }
}

/// Stored as 32 big-endian bytes so that byte order matches numeric order.
impl BitcoinSerialize for Work {
    fn bitcoin_serialize<W: std::io::Write>(&self, mut target: W) -> Result<(), std::io::Error> {
        target.write_all(&self.to_big_endian_bytes())
    }
}

impl BitcoinDeserialize for Work {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(Work::from_big_endian_bytes(<[u8; 32]>::bitcoin_deserialize(
            reader,
        )?))
    }
}

impl Add for Work {
    type Output = Work;
    fn add(self, rhs: Work) -> Work {
        Work(self.0 + rhs.0)
    }
}

impl AddAssign for Work {
    fn add_assign(&mut self, rhs: Work) {
        self.0 = self.0 + rhs.0;
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Work").field(&self.0).finish()
    }
}
