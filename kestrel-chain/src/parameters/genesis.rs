//! Genesis parameters for each Bitcoin network.

use chrono::{TimeZone, Utc};

use crate::block;
use crate::block::merkle;
use crate::parameters::Network;
use crate::work::CompactDifficulty;

/// The previous block hash for the genesis block.
///
/// All known networks use the Bitcoin `null` value for the parent of the
/// genesis block, `[0; 32]`.
pub const GENESIS_PREVIOUS_BLOCK_HASH: block::Hash = block::Hash([0; 32]);

/// Returns the hash for the genesis block in `network`.
pub fn genesis_hash(network: Network) -> block::Hash {
    match network {
        // bitcoin-cli getblockhash 0
        Network::Mainnet => "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        // bitcoin-cli -testnet getblockhash 0
        Network::Testnet => "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
    }
    .parse()
    .expect("hard-coded hash parses")
}

/// Returns the full genesis header for `network`, used to seed a fresh
/// wallet store.
pub fn genesis_header(network: Network) -> block::Header {
    // Both networks share the genesis coinbase, and so its Merkle root.
    let merkle_root_hex = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";
    let mut root = [0u8; 32];
    hex::decode_to_slice(merkle_root_hex, &mut root).expect("hard-coded root decodes");
    root.reverse();

    let (time, nonce) = match network {
        Network::Mainnet => (1_231_006_505, 2_083_236_893),
        Network::Testnet => (1_296_688_602, 414_098_458),
    };

    block::Header::new(
        1,
        GENESIS_PREVIOUS_BLOCK_HASH,
        merkle::Root(root),
        Utc.timestamp_opt(time, 0)
            .single()
            .expect("hard-coded timestamp is in range"),
        CompactDifficulty(0x1d00ffff),
        nonce,
    )
}
