use kestrel_chain::{block, BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// The body of a `getheaders` message, after its protocol version prefix.
///
/// Identical in shape to `getblocks`, but the peer answers with a `headers`
/// message instead of an `inv`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GetHeaders {
    /// A list of the sender's best known block hashes, ordered from newest to oldest.
    pub block_header_hashes: Vec<block::Hash>,
    /// The stop hash; None requests as many headers as the peer will send.
    pub stop_hash: Option<block::Hash>,
}

impl BitcoinDeserialize for GetHeaders {
    fn bitcoin_deserialize<R: std::io::Read>(mut reader: R) -> Result<Self, SerializationError>
    where
        Self: Sized,
    {
        let block_header_hashes = Vec::bitcoin_deserialize(&mut reader)?;
        let raw_stop_hash = block::Hash::bitcoin_deserialize(&mut reader)?;
        let stop_hash = if raw_stop_hash.0 == [0u8; 32] {
            None
        } else {
            Some(raw_stop_hash)
        };
        Ok(GetHeaders {
            block_header_hashes,
            stop_hash,
        })
    }
}

impl BitcoinSerialize for GetHeaders {
    fn bitcoin_serialize<W: std::io::Write>(&self, mut target: W) -> Result<(), std::io::Error> {
        self.block_header_hashes.bitcoin_serialize(&mut target)?;
        match self.stop_hash {
            Some(hash) => hash.bitcoin_serialize(&mut target),
            None => [0u8; 32].bitcoin_serialize(&mut target),
        }
    }
}
