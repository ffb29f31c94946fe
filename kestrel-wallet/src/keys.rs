//! Wallet keys: import, passphrase encryption, and the Bloom filter built
//! over them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use tracing::info;

use kestrel_chain::serialization::sha256d;

use crate::bloom::{BloomFilter, BLOOM_UPDATE_P2PUBKEY_ONLY};
use crate::error::{KeyError, WalletError};
use crate::records::{AddressEntry, KeyEntry};
use crate::store::WalletStore;

/// The false positive rate the filter is sized for. Small enough to keep
/// irrelevant traffic down, large enough to give a little plausible
/// deniability about which outputs are ours.
const FALSE_POSITIVE_RATE: f64 = 0.000_5;

/// The filter is sized for `2·keys + 15` elements so a handful of future
/// keys fit without an immediate resize.
const FILTER_HEADROOM: usize = 15;

/// Encrypts 32-byte secrets under a passphrase with AES-256-CBC.
///
/// The AES key is the doubled SHA-256 of the passphrase bytes; each
/// ciphertext carries its random IV as a prefix.
#[derive(Clone)]
pub struct KeyCrypter {
    key: [u8; 32],
}

impl KeyCrypter {
    pub fn from_passphrase(passphrase: &str) -> KeyCrypter {
        KeyCrypter {
            key: sha256d::digest(passphrase.as_bytes()),
        }
    }

    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};

        let iv: [u8; 16] = rand::random();
        let cipher = cbc::Encryptor::<aes::Aes256>::new(&self.key.into(), &iv.into());
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plain);

        let mut out = Vec::with_capacity(16 + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};

        if data.len() < 16 {
            return Err(KeyError::Crypt);
        }
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&data[..16]);
        let cipher = cbc::Decryptor::<aes::Aes256>::new(&self.key.into(), &iv.into());
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&data[16..])
            .map_err(|_| KeyError::Crypt)
    }
}

/// The in-memory mirror of the wallet's keys and watched addresses.
///
/// Loaded from the store at startup; every mutation writes through.
pub struct KeyStore {
    secp: Secp256k1<secp256k1::All>,
    keys: Vec<KeyEntry>,
    addresses: Vec<AddressEntry>,
    by_hash160: HashMap<[u8; 20], usize>,
}

impl KeyStore {
    pub fn load(store: &dyn WalletStore) -> Result<KeyStore, WalletError> {
        let keys = store.get_keys()?;
        let addresses = store.get_addresses()?;
        let by_hash160 = keys
            .iter()
            .enumerate()
            .map(|(at, key)| (key.hash160(), at))
            .collect();
        Ok(KeyStore {
            secp: Secp256k1::new(),
            keys,
            addresses,
            by_hash160,
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[KeyEntry] {
        &self.keys
    }

    pub fn find_by_hash160(&self, hash: &[u8; 20]) -> Option<&KeyEntry> {
        self.by_hash160.get(hash).map(|at| &self.keys[*at])
    }

    /// The single change key, if one has been imported.
    pub fn change_key(&self) -> Option<&KeyEntry> {
        self.keys.iter().find(|key| key.change)
    }

    /// The earliest key creation time, the floor for a rescan.
    pub fn earliest_creation_time(&self) -> Option<DateTime<Utc>> {
        self.keys.iter().map(|key| key.creation_time).min()
    }

    /// Import a 32-byte secret: derive its compressed public key, encrypt
    /// the secret under the wallet passphrase, and persist. The wallet holds
    /// exactly one change key, so a second `change` import is rejected.
    pub fn import_secret(
        &mut self,
        store: &dyn WalletStore,
        secret: &[u8; 32],
        creation_time: DateTime<Utc>,
        label: &str,
        change: bool,
        crypter: &KeyCrypter,
    ) -> Result<&KeyEntry, WalletError> {
        if change && self.change_key().is_some() {
            return Err(KeyError::ChangeKeyExists.into());
        }

        let secret_key = SecretKey::from_slice(secret).map_err(KeyError::Secp)?;
        let pub_key = PublicKey::from_secret_key(&self.secp, &secret_key)
            .serialize()
            .to_vec();

        let entry = KeyEntry {
            pub_key,
            encrypted_secret: crypter.encrypt(secret),
            creation_time,
            label: label.to_owned(),
            change,
        };
        store.store_key(&entry)?;
        info!(address = %hex::encode(entry.hash160()), change, "imported key");

        self.by_hash160.insert(entry.hash160(), self.keys.len());
        self.keys.push(entry);
        Ok(self.keys.last().expect("just pushed"))
    }

    /// Mint a fresh key from OS randomness.
    pub fn generate(
        &mut self,
        store: &dyn WalletStore,
        label: &str,
        change: bool,
        crypter: &KeyCrypter,
    ) -> Result<&KeyEntry, WalletError> {
        let mut secret: [u8; 32] = rand::random();
        // Rejection-sample the (astronomically unlikely) invalid scalars.
        while SecretKey::from_slice(&secret).is_err() {
            secret = rand::random();
        }
        self.import_secret(store, &secret, Utc::now(), label, change, crypter)
    }

    /// Watch an address the wallet does not hold keys for.
    pub fn watch_address(
        &mut self,
        store: &dyn WalletStore,
        hash: [u8; 20],
        label: &str,
    ) -> Result<(), WalletError> {
        let entry = AddressEntry {
            hash,
            label: label.to_owned(),
        };
        store.store_address(&entry)?;
        self.addresses.push(entry);
        Ok(())
    }

    pub fn addresses(&self) -> &[AddressEntry] {
        &self.addresses
    }

    /// Decrypt a key's secret and check it against the stored public key.
    pub fn decrypt_secret(
        &self,
        entry: &KeyEntry,
        crypter: &KeyCrypter,
    ) -> Result<SecretKey, KeyError> {
        let plain = crypter.decrypt(&entry.encrypted_secret)?;
        let secret_key = SecretKey::from_slice(&plain).map_err(|_| KeyError::BadPassphrase)?;
        let derived = PublicKey::from_secret_key(&self.secp, &secret_key);
        if derived.serialize()[..] != entry.pub_key[..] {
            return Err(KeyError::BadPassphrase);
        }
        Ok(secret_key)
    }

    /// Cheap startup check that the configured passphrase matches the store:
    /// decrypt one key and compare public keys. A wallet with no keys
    /// accepts any passphrase.
    pub fn verify_passphrase(&self, crypter: &KeyCrypter) -> Result<(), KeyError> {
        match self.keys.first() {
            Some(entry) => self.decrypt_secret(entry, crypter).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Build the Bloom filter over every key's public key and hash160, sized
    /// for `2·keys + 15` elements, in update-P2PUBKEY-only mode.
    pub fn build_filter(&self, tweak: u32) -> BloomFilter {
        let element_count = 2 * self.keys.len() + FILTER_HEADROOM;
        let mut filter = BloomFilter::new(
            element_count,
            FALSE_POSITIVE_RATE,
            tweak,
            BLOOM_UPDATE_P2PUBKEY_ONLY,
        );
        for key in &self.keys {
            filter.insert(&key.pub_key);
            filter.insert(&key.hash160());
        }
        for address in &self.addresses {
            filter.insert(&address.hash);
        }
        filter
    }

    pub fn secp(&self) -> &Secp256k1<secp256k1::All> {
        &self.secp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sled_store::SledStore;
    use chrono::TimeZone;
    use kestrel_chain::parameters::Network;
    use tempdir::TempDir;

    fn open() -> (TempDir, SledStore) {
        kestrel_test::init();
        let dir = TempDir::new("kestrel-keys-test").unwrap();
        let store = SledStore::open(dir.path(), Network::Mainnet).unwrap();
        (dir, store)
    }

    fn created_at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn crypter_round_trips_and_rejects_wrong_passphrase() {
        let crypter = KeyCrypter::from_passphrase("correct horse");
        let secret = [0x42u8; 32];
        let encrypted = crypter.encrypt(&secret);
        assert_ne!(&encrypted[16..], &secret[..]);
        assert_eq!(crypter.decrypt(&encrypted).unwrap(), secret.to_vec());

        let wrong = KeyCrypter::from_passphrase("battery staple");
        // CBC with random padding bytes usually fails outright; if padding
        // happens to parse, the secp pubkey check in decrypt_secret catches it.
        if let Ok(plain) = wrong.decrypt(&encrypted) {
            assert_ne!(plain, secret.to_vec());
        }
    }

    #[test]
    fn import_persists_and_indexes_keys() {
        let (_dir, store) = open();
        let crypter = KeyCrypter::from_passphrase("pass");
        let mut keys = KeyStore::load(&store).unwrap();

        let secret = [7u8; 32];
        let hash = {
            let entry = keys
                .import_secret(&store, &secret, created_at(1_400_000_000), "savings", false, &crypter)
                .unwrap();
            assert_eq!(entry.pub_key.len(), 33);
            entry.hash160()
        };
        assert!(keys.find_by_hash160(&hash).is_some());

        // A reload from the store sees the same key and can decrypt it.
        let reloaded = KeyStore::load(&store).unwrap();
        assert_eq!(reloaded.len(), 1);
        reloaded.verify_passphrase(&crypter).unwrap();
        assert!(matches!(
            reloaded.verify_passphrase(&KeyCrypter::from_passphrase("nope")),
            Err(KeyError::BadPassphrase) | Err(KeyError::Crypt)
        ));
    }

    #[test]
    fn only_one_change_key_is_allowed() {
        let (_dir, store) = open();
        let crypter = KeyCrypter::from_passphrase("pass");
        let mut keys = KeyStore::load(&store).unwrap();

        keys.import_secret(&store, &[1u8; 32], created_at(1), "change", true, &crypter)
            .unwrap();
        assert!(keys.change_key().is_some());
        assert!(matches!(
            keys.import_secret(&store, &[2u8; 32], created_at(2), "again", true, &crypter),
            Err(WalletError::Key(KeyError::ChangeKeyExists))
        ));
    }

    #[test]
    fn filter_covers_keys_and_addresses() {
        let (_dir, store) = open();
        let crypter = KeyCrypter::from_passphrase("pass");
        let mut keys = KeyStore::load(&store).unwrap();
        keys.import_secret(&store, &[3u8; 32], created_at(3), "", false, &crypter)
            .unwrap();
        keys.watch_address(&store, [0xAB; 20], "watched").unwrap();

        let filter = keys.build_filter(99);
        let entry = &keys.keys()[0];
        assert!(filter.contains(&entry.pub_key));
        assert!(filter.contains(&entry.hash160()));
        assert!(filter.contains(&[0xAB; 20]));
    }

    #[test]
    fn filter_is_sized_for_two_elements_per_key_plus_headroom() {
        let (_dir, store) = open();
        let crypter = KeyCrypter::from_passphrase("pass");
        let mut keys = KeyStore::load(&store).unwrap();
        for secret in 10u8..14 {
            keys.import_secret(&store, &[secret; 32], created_at(1), "", false, &crypter)
                .unwrap();
        }

        let built = keys.build_filter(0).to_filterload();
        let reference = crate::bloom::BloomFilter::new(
            2 * keys.len() + FILTER_HEADROOM,
            FALSE_POSITIVE_RATE,
            0,
            BLOOM_UPDATE_P2PUBKEY_ONLY,
        )
        .to_filterload();
        assert_eq!(built.filter.len(), reference.filter.len());
        assert_eq!(built.hash_functions_count, reference.hash_functions_count);
        assert_eq!(built.flags, BLOOM_UPDATE_P2PUBKEY_ONLY);
    }

    #[test]
    fn earliest_creation_time_is_the_rescan_floor() {
        let (_dir, store) = open();
        let crypter = KeyCrypter::from_passphrase("pass");
        let mut keys = KeyStore::load(&store).unwrap();
        assert_eq!(keys.earliest_creation_time(), None);

        keys.import_secret(&store, &[4u8; 32], created_at(2_000), "", false, &crypter)
            .unwrap();
        keys.import_secret(&store, &[5u8; 32], created_at(1_000), "", false, &crypter)
            .unwrap();
        assert_eq!(keys.earliest_creation_time(), Some(created_at(1_000)));
    }
}
