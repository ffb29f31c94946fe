//! Network parameters: magic values, genesis blocks, checkpoints, seeds.

mod genesis;

pub use genesis::{genesis_hash, genesis_header, GENESIS_PREVIOUS_BLOCK_HASH};

use crate::block;

/// The production and test Bitcoin networks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    /// The production network.
    Mainnet,
    /// The regression/test network.
    Testnet,
}

impl Default for Network {
    fn default() -> Self {
        Network::Mainnet
    }
}

impl Network {
    /// The message-start magic, in wire byte order.
    pub fn magic_bytes(self) -> [u8; 4] {
        match self {
            // 0xD9B4BEF9 as a little-endian u32
            Network::Mainnet => [0xF9, 0xBE, 0xB4, 0xD9],
            // 0x0709110B as a little-endian u32
            Network::Testnet => [0x0B, 0x11, 0x09, 0x07],
        }
    }

    /// The default peer-to-peer port.
    pub fn default_port(self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
        }
    }

    /// The version byte of dumped private keys (WIF) on this network.
    pub fn wif_version(self) -> u8 {
        match self {
            Network::Mainnet => 128,
            Network::Testnet => 239,
        }
    }

    /// DNS seeds consulted on a cold start with no configured peers.
    pub fn dns_seeds(self) -> &'static [&'static str] {
        match self {
            Network::Mainnet => &[
                "seed.bitcoin.sipa.be",
                "dnsseed.bluematt.me",
                "dnsseed.bitcoin.dashjr.org",
                "seed.bitcoinstats.com",
                "seed.bitcoin.jonasschnelli.ch",
            ],
            Network::Testnet => &[
                "testnet-seed.bitcoin.jonasschnelli.ch",
                "seed.tbtc.petertodd.org",
            ],
        }
    }
}

impl std::str::FromStr for Network {
    type Err = crate::SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prod" | "mainnet" => Ok(Network::Mainnet),
            "test" | "testnet" => Ok(Network::Testnet),
            _ => Err(crate::SerializationError::Parse("unknown network name")),
        }
    }
}

/// The hard-coded checkpoint table for `network`.
///
/// A header chain claiming a different hash at one of these heights is
/// rejected outright, whatever its accumulated work.
pub fn checkpoints(network: Network) -> Vec<(block::Height, block::Hash)> {
    let table: &[(u32, &str)] = match network {
        Network::Mainnet => &[
            (
                11_111,
                "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
            ),
            (
                33_333,
                "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
            ),
            (
                74_000,
                "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20",
            ),
            (
                105_000,
                "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
            ),
            (
                134_444,
                "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe",
            ),
            (
                168_000,
                "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763",
            ),
        ],
        Network::Testnet => &[(
            546,
            "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
        )],
    };
    table
        .iter()
        .map(|(height, hash)| {
            (
                block::Height(*height),
                hash.parse().expect("hard-coded hash parses"),
            )
        })
        .collect()
}

/// The checkpoint hash for `height`, if that height is checkpointed.
pub fn checkpoint(network: Network, height: block::Height) -> Option<block::Hash> {
    checkpoints(network)
        .into_iter()
        .find(|(checkpoint_height, _)| *checkpoint_height == height)
        .map(|(_, hash)| hash)
}
