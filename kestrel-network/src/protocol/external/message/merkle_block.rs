use bitcoin_serde_derive::{BtcDeserialize, BtcSerialize};
use kestrel_chain::{
    block,
    block::merkle,
    compactint::CompactInt,
    transaction, BitcoinDeserialize, BitcoinSerialize, SerializationError,
};

/// A `merkleblock` message: the reply to a `getdata` that requested a block
/// with the filtered-block inventory type.
///
/// It is only part of the reply: the matching transactions themselves follow
/// as separate `tx` messages.
#[derive(BtcDeserialize, BtcSerialize, Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlock {
    /// The header of the block being proven.
    pub block_header: block::Header,
    /// The number of transactions in the full block, matched or not.
    pub transaction_count: u32,
    /// The hashes of the pruned subtrees and matched leaves, in depth-first
    /// order.
    pub hashes: Vec<transaction::Hash>,
    /// The depth-first traversal bits, least significant bit first.
    pub flags: Vec<u8>,
}

impl MerkleBlock {
    /// The partial tree to verify against `block_header.merkle_root`.
    pub fn partial_tree(&self) -> merkle::PartialTree {
        merkle::PartialTree::new(self.transaction_count, self.hashes.clone(), self.flags.clone())
    }

    fn serialized_size(&self) -> usize {
        block::Header::len()
            + 4
            + CompactInt::size(self.hashes.len())
            + (self.hashes.len() * 32)
            + CompactInt::size(self.flags.len())
            + self.flags.len()
    }
}

#[test]
fn serial_size() {
    let int1 = transaction::Hash::from_bytes_exact([0u8; 32]);
    let int2 = transaction::Hash::from_bytes_exact([1u8; 32]);
    let int3 = transaction::Hash::from_bytes_exact([3u8; 32]);
    let msg = MerkleBlock {
        block_header: kestrel_chain::parameters::genesis_header(
            kestrel_chain::parameters::Network::Mainnet,
        ),
        transaction_count: 113,
        hashes: vec![int1, int2, int3],
        flags: Vec::from([232u8, 11]),
    };
    let serial = msg
        .bitcoin_serialize_to_vec()
        .expect("Serializing into vec shouldn't fail");
    assert_eq!(serial.len(), msg.serialized_size());
}
