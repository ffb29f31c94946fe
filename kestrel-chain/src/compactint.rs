use crate::{BitcoinDeserialize, BitcoinSerialize, SerializationError};
use byteorder::{LittleEndian, WriteBytesExt};

/// Bitcoin's variable-length integer encoding, used to prefix every
/// length-counted structure on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactInt(u64);

impl CompactInt {
    pub fn new() -> CompactInt {
        CompactInt(0)
    }

    pub fn from(value: usize) -> CompactInt {
        CompactInt(value as u64)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// The number of bytes the encoding of `value` occupies.
    pub fn size(value: usize) -> usize {
        if value < 0xFD {
            1
        } else if value <= 0xFFFF {
            3
        } else if value <= 0xFFFF_FFFF {
            5
        } else {
            9
        }
    }
}

impl Default for CompactInt {
    fn default() -> Self {
        CompactInt::new()
    }
}

impl BitcoinSerialize for CompactInt {
    fn bitcoin_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        if self.value() < 0xFD {
            target.write_all(&[self.value() as u8])
        } else if self.value() <= 0xFFFF {
            target.write_all(&[0xFD])?;
            target.write_u16::<LittleEndian>(self.value() as u16)
        } else if self.value() <= 0xFFFF_FFFF {
            target.write_all(&[0xFE])?;
            target.write_u32::<LittleEndian>(self.value() as u32)
        } else {
            target.write_all(&[0xFF])?;
            target.write_u64::<LittleEndian>(self.value())
        }
    }
}

impl BitcoinDeserialize for CompactInt {
    fn bitcoin_deserialize<R: std::io::Read>(
        mut target: R,
    ) -> Result<CompactInt, SerializationError> {
        let first = u8::bitcoin_deserialize(&mut target)?;
        if first < 0xFD {
            Ok(CompactInt(first as u64))
        } else if first == 0xFD {
            Ok(CompactInt(u16::bitcoin_deserialize(&mut target)? as u64))
        } else if first == 0xFE {
            Ok(CompactInt(u32::bitcoin_deserialize(&mut target)? as u64))
        } else {
            Ok(CompactInt(u64::bitcoin_deserialize(&mut target)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: u64, expected_len: usize) {
        let int = CompactInt(value);
        let bytes = int.bitcoin_serialize_to_vec().unwrap();
        assert_eq!(bytes.len(), expected_len);
        assert_eq!(CompactInt::size(value as usize), expected_len);
        let parsed = CompactInt::bitcoin_deserialize(&bytes[..]).unwrap();
        assert_eq!(parsed.value(), value);
    }

    #[test]
    fn compact_int_boundaries() {
        round_trip(0, 1);
        round_trip(0xFC, 1);
        round_trip(0xFD, 3);
        round_trip(0xFFFF, 3);
        round_trip(0x1_0000, 5);
        round_trip(0xFFFF_FFFF, 5);
        round_trip(0x1_0000_0000, 9);
    }

    #[test]
    fn truncated_compact_int_fails() {
        // 0xFE announces a u32 payload but only two bytes follow
        let bytes = [0xFEu8, 0x01, 0x02];
        assert!(CompactInt::bitcoin_deserialize(&bytes[..]).is_err());
    }
}
