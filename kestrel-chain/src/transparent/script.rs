#![allow(clippy::unit_arg)]
use crate::{
    compactint::CompactInt,
    serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError},
};
use std::{
    fmt,
    io::{self, Read},
};

/// An encoding of a Bitcoin script.
#[derive(Clone, Default, Eq, PartialEq, Hash)]
pub struct Script(pub Vec<u8>);

// The opcodes appearing in a pay-to-pubkey-hash script.
const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;

impl Script {
    pub fn serialized_size(&self) -> usize {
        CompactInt::size(self.0.len()) + self.0.len()
    }

    /// The standard 25-byte script paying the holder of the key hashed to
    /// `pub_key_hash`: `OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG`.
    pub fn new_pay_to_pubkey_hash(pub_key_hash: &[u8; 20]) -> Script {
        let mut bytes = Vec::with_capacity(25);
        bytes.push(OP_DUP);
        bytes.push(OP_HASH160);
        bytes.push(20);
        bytes.extend_from_slice(pub_key_hash);
        bytes.push(OP_EQUALVERIFY);
        bytes.push(OP_CHECKSIG);
        Script(bytes)
    }

    /// If this is exactly the standard pay-to-pubkey-hash pattern, the 20-byte
    /// key hash it pays. This wallet recognizes no other output scripts.
    pub fn pay_to_pubkey_hash(&self) -> Option<[u8; 20]> {
        let bytes = &self.0;
        if bytes.len() == 25
            && bytes[0] == OP_DUP
            && bytes[1] == OP_HASH160
            && bytes[2] == 20
            && bytes[23] == OP_EQUALVERIFY
            && bytes[24] == OP_CHECKSIG
        {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&bytes[3..23]);
            Some(hash)
        } else {
            None
        }
    }

    /// The unlock script spending a pay-to-pubkey-hash output: a pushed
    /// signature (with sighash byte) followed by the pushed public key.
    pub fn new_pubkey_hash_unlock(signature: &[u8], pub_key: &[u8]) -> Script {
        let mut bytes = Vec::with_capacity(2 + signature.len() + pub_key.len());
        bytes.push(signature.len() as u8);
        bytes.extend_from_slice(signature);
        bytes.push(pub_key.len() as u8);
        bytes.extend_from_slice(pub_key);
        Script(bytes)
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Script")
            .field(&hex::encode(&self.0))
            .finish()
    }
}

impl BitcoinSerialize for Script {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        CompactInt::from(self.0.len()).bitcoin_serialize(&mut writer)?;
        writer.write_all(&self.0[..])?;
        Ok(())
    }
}

impl BitcoinDeserialize for Script {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let len = CompactInt::bitcoin_deserialize(&mut reader)?.value();
        let mut bytes = Vec::new();
        reader.take(len).read_to_end(&mut bytes)?;
        if (bytes.len() as u64) < len {
            return Err(SerializationError::Parse("script bytes were truncated"));
        }
        Ok(Script(bytes))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn script_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            kestrel_test::init();

            let script = Script(bytes);
            let mut serialized = Cursor::new(Vec::new());
            script.bitcoin_serialize(&mut serialized)?;

            serialized.set_position(0);
            let other_script = Script::bitcoin_deserialize(&mut serialized)?;

            prop_assert_eq![script, other_script];
        }
    }

    #[test]
    fn recognizes_own_pay_to_pubkey_hash() {
        kestrel_test::init();

        let hash = [7u8; 20];
        let script = Script::new_pay_to_pubkey_hash(&hash);
        assert_eq!(script.0.len(), 25);
        assert_eq!(script.pay_to_pubkey_hash(), Some(hash));
    }

    #[test]
    fn rejects_non_standard_scripts() {
        kestrel_test::init();

        // OP_RETURN data carrier
        assert_eq!(Script(vec![0x6a, 0x01, 0xff]).pay_to_pubkey_hash(), None);
        // Truncated p2pkh
        let mut bytes = Script::new_pay_to_pubkey_hash(&[7u8; 20]).0;
        bytes.pop();
        assert_eq!(Script(bytes).pay_to_pubkey_hash(), None);
    }
}
