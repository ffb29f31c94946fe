use crate::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// The height of a block, counted from the genesis block at height 0.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Height(pub u32);

impl Height {
    /// The largest height this wallet will track.
    pub const MAX: Height = Height(u32::MAX - 1);
}

impl BitcoinSerialize for Height {
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error> {
        self.0.bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for Height {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(Height(u32::bitcoin_deserialize(reader)?))
    }
}
