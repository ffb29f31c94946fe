//! Pay-to-pubkey-hash addresses.

use std::{fmt, io};

use ripemd160::{Digest, Ripemd160};
use sha2::{Digest as sha2Digest, Sha256};

use crate::{
    parameters::Network,
    serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError},
};

use super::Script;

/// Magic numbers used to identify what networks the Addresses
/// are associated with.
mod magics {
    pub mod p2pkh {
        pub const MAINNET: [u8; 1] = [0x00];
        pub const TESTNET: [u8; 1] = [0x6f];
    }
}

/// The RIPEMD-160 digest of the SHA-256 digest of `data`, the 20-byte key
/// hash that addresses and pay-to-pubkey-hash scripts carry.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(&sha);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&ripe[..]);
    hash
}

/// A pay-to-pubkey-hash Bitcoin address.
///
/// A single version byte is prepended to the key hash, the result is hashed
/// with sha256d, the first four bytes of the output are appended as a
/// checksum, and the result is Base58Check encoded.
///
/// https://en.bitcoin.it/wiki/Base58Check_encoding
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Address {
    /// Production or test network.
    pub network: Network,
    /// 20 bytes specifying a public key hash, which is a RIPEMD-160
    /// hash of a SHA-256 hash of a compressed ECDSA key encoding.
    pub pub_key_hash: [u8; 20],
}

impl Address {
    pub fn new(network: Network, pub_key_hash: [u8; 20]) -> Address {
        Address {
            network,
            pub_key_hash,
        }
    }

    /// The address paying the holder of `pub_key` (a 33- or 65-byte SEC
    /// encoding).
    pub fn from_pub_key(network: Network, pub_key: &[u8]) -> Address {
        Address {
            network,
            pub_key_hash: hash160(pub_key),
        }
    }

    /// The standard output script paying this address.
    pub fn lock_script(&self) -> Script {
        Script::new_pay_to_pubkey_hash(&self.pub_key_hash)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Address")
            .field("network", &self.network)
            .field("pub_key_hash", &hex::encode(&self.pub_key_hash))
            .finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut bytes = io::Cursor::new(Vec::new());
        let _ = self.bitcoin_serialize(&mut bytes);

        f.write_str(&bs58::encode(bytes.get_ref()).with_check().into_string())
    }
}

impl std::str::FromStr for Address {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = &bs58::decode(s).with_check(None).into_vec();

        match result {
            Ok(bytes) => Self::bitcoin_deserialize(&bytes[..]),
            Err(_) => Err(SerializationError::Parse("t-addr decoding error")),
        }
    }
}

impl BitcoinSerialize for Address {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), std::io::Error> {
        match self.network {
            Network::Mainnet => writer.write_all(&magics::p2pkh::MAINNET[..])?,
            Network::Testnet => writer.write_all(&magics::p2pkh::TESTNET[..])?,
        }
        writer.write_all(&self.pub_key_hash)?;
        Ok(())
    }
}

impl BitcoinDeserialize for Address {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let mut version_bytes = [0; 1];
        reader.read_exact(&mut version_bytes)?;

        let network = match version_bytes {
            magics::p2pkh::MAINNET => Network::Mainnet,
            magics::p2pkh::TESTNET => Network::Testnet,
            _ => {
                return Err(SerializationError::Parse(
                    "bad addr version/type byte",
                ))
            }
        };
        let mut pub_key_hash = [0; 20];
        reader.read_exact(&mut pub_key_hash)?;
        Ok(Address {
            network,
            pub_key_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_the_genesis_coinbase_address() {
        kestrel_test::init();

        // The hash160 behind the famous mainnet address.
        let hash: Vec<u8> = hex::decode("62e907b15cbf27d5425399ebf6f0fb50ebb88f18").unwrap();
        let mut pub_key_hash = [0u8; 20];
        pub_key_hash.copy_from_slice(&hash);

        let addr = Address::new(Network::Mainnet, pub_key_hash);
        assert_eq!(addr.to_string(), "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa");
    }

    #[test]
    fn address_string_roundtrip() {
        kestrel_test::init();

        let addr = Address::new(Network::Testnet, [0x42; 20]);
        let parsed: Address = addr.to_string().parse().expect("address should parse");
        assert_eq!(addr, parsed);
    }

    #[test]
    fn hash160_of_empty_input() {
        // ripemd160(sha256("")) = b472a266d0bd89c13706a4132ccfb16f7c3b9fcb
        assert_eq!(
            hex::encode(&hash160(b"")),
            "b472a266d0bd89c13706a4132ccfb16f7c3b9fcb"
        );
    }
}
