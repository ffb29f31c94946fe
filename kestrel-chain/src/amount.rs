//! Monetary amounts, denominated in satoshi.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};

use crate::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// The number of satoshi in one bitcoin.
pub const COIN: i64 = 100_000_000;

/// Outputs below this value cost more in fees to spend than they are worth.
pub const DUST_THRESHOLD: Amount = Amount(546);

/// A quantity of satoshi.
///
/// Serialized as a little-endian i64, matching the `value` field of a
/// transaction output at https://en.bitcoin.it/wiki/Protocol_documentation#tx
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Amount(pub i64);

impl Amount {
    pub fn zero() -> Amount {
        Amount(0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        Amount(iter.map(|amount| amount.0).sum())
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} sat", self.0)
    }
}

impl BitcoinSerialize for Amount {
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error> {
        self.0.bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for Amount {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(Amount(i64::bitcoin_deserialize(reader)?))
    }
}
