//! The primary [`WalletStore`] implementation, built on sled.
//!
//! Six logical collections plus two indexes, one sled tree each:
//!
//! - `headers`: [`HeaderEntry`] by block hash
//! - `block_chain`: block hash by big-endian height (on-chain blocks only)
//! - `received`: [`ReceiveRow`] by `tx_hash ∥ big-endian output index`
//! - `sent`: [`SendRow`] by tx hash
//! - `keys`: [`KeyEntry`] by public key
//! - `addresses`: [`AddressEntry`] by hash160
//! - `child`: child block hash by parent block hash (chain-stall resume)
//! - `meta`: the chain head
//!
//! Point reads go straight to sled; `set_chain_head` holds the store's head
//! lock so concurrent readers see either the old chain or the new one.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace};

use kestrel_chain::{
    block::{self, Height},
    parameters::{genesis_header, Network},
    transaction,
    work::Work,
    BitcoinDeserialize, BitcoinSerialize,
};

use crate::error::StoreError;
use crate::records::{AddressEntry, ChainHead, HeaderEntry, KeyEntry, ReceiveRow, SendRow};
use crate::store::WalletStore;

const CHAIN_HEAD_KEY: &[u8] = b"chain_head";

fn encode<T: BitcoinSerialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    value
        .bitcoin_serialize_to_vec()
        .map_err(|error| StoreError::Codec(error.into()))
}

fn decode<T: BitcoinDeserialize>(bytes: &[u8]) -> Result<T, StoreError> {
    T::bitcoin_deserialize(bytes).map_err(StoreError::Codec)
}

fn receive_key(tx_hash: transaction::Hash, output_index: u32) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[0..32].copy_from_slice(&tx_hash.0);
    key[32..36].copy_from_slice(&output_index.to_be_bytes());
    key
}

/// The sled-backed wallet store.
pub struct SledStore {
    _db: sled::Db,
    headers: sled::Tree,
    block_chain: sled::Tree,
    received: sled::Tree,
    sent: sled::Tree,
    keys: sled::Tree,
    addresses: sled::Tree,
    child: sled::Tree,
    meta: sled::Tree,
    /// Serializes chain-head swaps against each other and against multi-read
    /// operations like `get_junction`.
    head_lock: Mutex<()>,
}

impl SledStore {
    /// Open (or create) the wallet store under `path`, seeding the genesis
    /// entry for `network` on first run.
    pub fn open(path: &Path, network: Network) -> Result<SledStore, StoreError> {
        let db = sled::open(path)?;
        let store = SledStore {
            headers: db.open_tree(b"headers")?,
            block_chain: db.open_tree(b"block_chain")?,
            received: db.open_tree(b"received")?,
            sent: db.open_tree(b"sent")?,
            keys: db.open_tree(b"keys")?,
            addresses: db.open_tree(b"addresses")?,
            child: db.open_tree(b"child")?,
            meta: db.open_tree(b"meta")?,
            head_lock: Mutex::new(()),
            _db: db,
        };

        if store.meta.get(CHAIN_HEAD_KEY)?.is_none() {
            // A fresh store: the chain is just the genesis block. Its chain
            // work is recorded as 1 for compatibility with existing stores.
            let genesis = HeaderEntry {
                header: genesis_header(network),
                on_chain: true,
                height: Height(0),
                chain_work: Work::genesis(),
                matched: Vec::new(),
            };
            let hash = genesis.hash();
            info!(%hash, "seeding fresh wallet store at genesis");
            store.put_header(&genesis)?;
            store
                .block_chain
                .insert(&0u32.to_be_bytes(), &hash.0[..])?;
            store.meta.insert(
                CHAIN_HEAD_KEY,
                encode(&ChainHead {
                    hash,
                    height: Height(0),
                    chain_work: Work::genesis(),
                })?,
            )?;
        }

        Ok(store)
    }

    /// Flush pending writes to disk; called on shutdown.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.headers.flush()?;
        self.block_chain.flush()?;
        self.received.flush()?;
        self.sent.flush()?;
        self.keys.flush()?;
        self.addresses.flush()?;
        self.child.flush()?;
        self.meta.flush()?;
        Ok(())
    }

    fn set_receive_block(
        &self,
        tx_hash: transaction::Hash,
        block_hash: block::Hash,
    ) -> Result<(), StoreError> {
        for item in self.received.scan_prefix(&tx_hash.0) {
            let (key, value) = item?;
            let mut row: ReceiveRow = decode(&value)?;
            row.block_hash = block_hash;
            self.received.insert(key, encode(&row)?)?;
        }
        Ok(())
    }

    fn set_send_block(
        &self,
        tx_hash: transaction::Hash,
        block_hash: block::Hash,
    ) -> Result<(), StoreError> {
        if let Some(value) = self.sent.get(&tx_hash.0)? {
            let mut row: SendRow = decode(&value)?;
            row.block_hash = block_hash;
            self.sent.insert(&tx_hash.0, encode(&row)?)?;
        }
        Ok(())
    }

    fn modify_receive(
        &self,
        tx_hash: transaction::Hash,
        output_index: u32,
        f: impl FnOnce(&mut ReceiveRow),
    ) -> Result<(), StoreError> {
        let key = receive_key(tx_hash, output_index);
        if let Some(value) = self.received.get(&key)? {
            let mut row: ReceiveRow = decode(&value)?;
            f(&mut row);
            self.received.insert(&key, encode(&row)?)?;
        }
        Ok(())
    }
}

impl WalletStore for SledStore {
    fn put_header(&self, entry: &HeaderEntry) -> Result<(), StoreError> {
        let hash = entry.hash();
        trace!(%hash, on_chain = entry.on_chain, "storing header");
        self.headers.insert(&hash.0, encode(entry)?)?;
        self.child
            .insert(&entry.header.previous_block_hash.0, &hash.0[..])?;
        Ok(())
    }

    fn get_header(&self, hash: block::Hash) -> Result<Option<HeaderEntry>, StoreError> {
        match self.headers.get(&hash.0)? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    fn get_child_of(&self, prev_hash: block::Hash) -> Result<Option<block::Hash>, StoreError> {
        match self.child.get(&prev_hash.0)? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    fn get_block_at_height(&self, height: Height) -> Result<Option<HeaderEntry>, StoreError> {
        let hash = match self.block_chain.get(&height.0.to_be_bytes())? {
            Some(value) => decode::<block::Hash>(&value)?,
            None => return Ok(None),
        };
        self.get_header(hash)
    }

    fn is_new_block(&self, hash: block::Hash) -> Result<bool, StoreError> {
        Ok(!self.headers.contains_key(&hash.0)?)
    }

    fn is_new_tx(&self, hash: transaction::Hash) -> Result<bool, StoreError> {
        if self.sent.contains_key(&hash.0)? {
            return Ok(false);
        }
        Ok(self.received.scan_prefix(&hash.0).next().is_none())
    }

    fn update_matched(
        &self,
        hash: block::Hash,
        matched: &[transaction::Hash],
    ) -> Result<(), StoreError> {
        let mut entry = self
            .get_header(hash)?
            .ok_or(StoreError::BlockNotFound(hash))?;
        entry.matched = matched.to_vec();
        self.headers.insert(&hash.0, encode(&entry)?)?;
        Ok(())
    }

    fn store_key(&self, key: &KeyEntry) -> Result<(), StoreError> {
        self.keys.insert(&key.pub_key[..], encode(key)?)?;
        Ok(())
    }

    fn get_keys(&self) -> Result<Vec<KeyEntry>, StoreError> {
        let mut keys = Vec::new();
        for item in self.keys.iter() {
            let (_, value) = item?;
            keys.push(decode(&value)?);
        }
        Ok(keys)
    }

    fn set_key_label(&self, pub_key: &[u8], label: &str) -> Result<(), StoreError> {
        if let Some(value) = self.keys.get(pub_key)? {
            let mut key: KeyEntry = decode(&value)?;
            key.label = label.to_owned();
            self.keys.insert(pub_key, encode(&key)?)?;
        }
        Ok(())
    }

    fn store_address(&self, entry: &AddressEntry) -> Result<(), StoreError> {
        self.addresses.insert(&entry.hash, encode(entry)?)?;
        Ok(())
    }

    fn get_addresses(&self) -> Result<Vec<AddressEntry>, StoreError> {
        let mut addresses = Vec::new();
        for item in self.addresses.iter() {
            let (_, value) = item?;
            addresses.push(decode(&value)?);
        }
        Ok(addresses)
    }

    fn set_address_label(&self, hash: [u8; 20], label: &str) -> Result<(), StoreError> {
        if let Some(value) = self.addresses.get(&hash)? {
            let mut entry: AddressEntry = decode(&value)?;
            entry.label = label.to_owned();
            self.addresses.insert(&hash, encode(&entry)?)?;
        }
        Ok(())
    }

    fn store_receive(&self, row: &ReceiveRow) -> Result<(), StoreError> {
        let key = receive_key(row.tx_hash, row.output_index);
        if self.received.contains_key(&key)? {
            return Err(StoreError::DuplicateRow);
        }
        self.received.insert(&key, encode(row)?)?;
        Ok(())
    }

    fn store_send(&self, row: &SendRow) -> Result<(), StoreError> {
        if self.sent.contains_key(&row.tx_hash.0)? {
            return Err(StoreError::DuplicateRow);
        }
        self.sent.insert(&row.tx_hash.0, encode(row)?)?;
        Ok(())
    }

    fn get_receive(
        &self,
        tx_hash: transaction::Hash,
        output_index: u32,
    ) -> Result<Option<ReceiveRow>, StoreError> {
        match self.received.get(&receive_key(tx_hash, output_index))? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    fn get_receive_list(&self) -> Result<Vec<ReceiveRow>, StoreError> {
        let mut by_norm: HashMap<[u8; 32], usize> = HashMap::new();
        let mut rows: Vec<ReceiveRow> = Vec::new();
        for item in self.received.iter() {
            let (_, value) = item?;
            let row: ReceiveRow = decode(&value)?;
            match by_norm.get(&row.norm_id.0) {
                // A confirmed copy replaces an unconfirmed one; otherwise the
                // first encountered wins.
                Some(&at) => {
                    if rows[at].block_hash.is_zero() && !row.block_hash.is_zero() {
                        rows[at] = row;
                    }
                }
                None => {
                    by_norm.insert(row.norm_id.0, rows.len());
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    fn get_send_list(&self) -> Result<Vec<SendRow>, StoreError> {
        let mut by_norm: HashMap<[u8; 32], usize> = HashMap::new();
        let mut rows: Vec<SendRow> = Vec::new();
        for item in self.sent.iter() {
            let (_, value) = item?;
            let row: SendRow = decode(&value)?;
            match by_norm.get(&row.norm_id.0) {
                Some(&at) => {
                    if rows[at].block_hash.is_zero() && !row.block_hash.is_zero() {
                        rows[at] = row;
                    }
                }
                None => {
                    by_norm.insert(row.norm_id.0, rows.len());
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    fn set_receive_spent(
        &self,
        tx_hash: transaction::Hash,
        output_index: u32,
        spent: bool,
    ) -> Result<(), StoreError> {
        self.modify_receive(tx_hash, output_index, |row| row.spent = spent)
    }

    fn set_receive_safe(
        &self,
        tx_hash: transaction::Hash,
        output_index: u32,
        in_safe: bool,
    ) -> Result<(), StoreError> {
        self.modify_receive(tx_hash, output_index, |row| row.in_safe = in_safe)
    }

    fn set_receive_deleted(
        &self,
        tx_hash: transaction::Hash,
        output_index: u32,
        deleted: bool,
    ) -> Result<(), StoreError> {
        self.modify_receive(tx_hash, output_index, |row| row.deleted = deleted)
    }

    fn set_send_deleted(
        &self,
        tx_hash: transaction::Hash,
        deleted: bool,
    ) -> Result<(), StoreError> {
        if let Some(value) = self.sent.get(&tx_hash.0)? {
            let mut row: SendRow = decode(&value)?;
            row.deleted = deleted;
            self.sent.insert(&tx_hash.0, encode(&row)?)?;
        }
        Ok(())
    }

    fn tx_depth(&self, tx_hash: transaction::Hash) -> Result<u32, StoreError> {
        let block_hash = if let Some(item) = self.received.scan_prefix(&tx_hash.0).next() {
            let (_, value) = item?;
            decode::<ReceiveRow>(&value)?.block_hash
        } else if let Some(value) = self.sent.get(&tx_hash.0)? {
            decode::<SendRow>(&value)?.block_hash
        } else {
            return Ok(0);
        };

        if block_hash.is_zero() {
            return Ok(0);
        }
        let entry = match self.get_header(block_hash)? {
            Some(entry) if entry.on_chain => entry,
            _ => return Ok(0),
        };
        let head = self.chain_head()?;
        Ok(head.height.0 - entry.height.0 + 1)
    }

    fn rescan_height(&self, t: DateTime<Utc>) -> Result<Height, StoreError> {
        for item in self.block_chain.iter().rev() {
            let (key, value) = item?;
            let hash: block::Hash = decode(&value)?;
            let entry = self
                .get_header(hash)?
                .ok_or(StoreError::BlockNotFound(hash))?;
            if entry.header.time < t {
                let mut height_bytes = [0u8; 4];
                height_bytes.copy_from_slice(&key);
                return Ok(Height(u32::from_be_bytes(height_bytes)));
            }
        }
        Ok(Height(0))
    }

    fn get_junction(&self, starting_hash: block::Hash) -> Result<Vec<HeaderEntry>, StoreError> {
        let _guard = self.head_lock.lock().expect("head lock poisoned");
        let mut path = Vec::new();
        let mut cursor = starting_hash;
        loop {
            let entry = self
                .get_header(cursor)?
                .ok_or(StoreError::BlockNotFound(cursor))?;
            let reached_chain = entry.on_chain;
            let prev = entry.header.previous_block_hash;
            path.push(entry);
            if reached_chain {
                break;
            }
            cursor = prev;
        }
        path.reverse();
        Ok(path)
    }

    fn chain_head(&self) -> Result<ChainHead, StoreError> {
        let value = self
            .meta
            .get(CHAIN_HEAD_KEY)?
            .expect("store was seeded with a chain head at open");
        decode(&value)
    }

    fn set_chain_head(&self, path: &[HeaderEntry]) -> Result<(), StoreError> {
        let junction = match path.first() {
            Some(junction) => junction,
            None => return Ok(()),
        };
        let _guard = self.head_lock.lock().expect("head lock poisoned");
        let old_head = self.chain_head()?;

        // Unwind the old chain back to (but not including) the junction.
        let mut cursor = old_head.hash;
        while cursor != junction.hash() {
            let mut entry = self
                .get_header(cursor)?
                .ok_or(StoreError::BlockNotFound(cursor))?;
            debug!(hash = %cursor, height = entry.height.0, "unwinding stale block");
            for tx_hash in &entry.matched {
                self.set_receive_block(*tx_hash, block::Hash::zero())?;
                self.set_send_block(*tx_hash, block::Hash::zero())?;
            }
            self.block_chain.remove(&entry.height.0.to_be_bytes())?;
            let prev = entry.header.previous_block_hash;
            entry.on_chain = false;
            entry.height = Height(0);
            entry.chain_work = Work::zero();
            self.headers.insert(&cursor.0, encode(&entry)?)?;
            cursor = prev;
        }

        // Connect the new chain above the junction.
        for entry in &path[1..] {
            let hash = entry.hash();
            debug!(%hash, height = entry.height.0, "connecting block");
            self.put_header(entry)?;
            self.block_chain
                .insert(&entry.height.0.to_be_bytes(), &hash.0[..])?;
            for tx_hash in &entry.matched {
                self.set_receive_block(*tx_hash, hash)?;
                self.set_send_block(*tx_hash, hash)?;
            }
        }

        let new_head = path.last().expect("path is non-empty");
        self.meta.insert(
            CHAIN_HEAD_KEY,
            encode(&ChainHead {
                hash: new_head.hash(),
                height: new_head.height,
                chain_work: new_head.chain_work,
            })?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ReceiveRow;
    use chrono::{Duration, TimeZone, Utc};
    use kestrel_chain::amount::Amount;
    use kestrel_chain::block::merkle;
    use kestrel_chain::transaction::NormalizedId;
    use kestrel_chain::transparent::Script;
    use kestrel_chain::work::CompactDifficulty;
    use tempdir::TempDir;

    fn open_store() -> (TempDir, SledStore) {
        kestrel_test::init();
        let dir = TempDir::new("kestrel-store-test").unwrap();
        let store = SledStore::open(dir.path(), Network::Mainnet).unwrap();
        (dir, store)
    }

    fn child_header(parent: block::Hash, nonce: u32) -> block::Header {
        block::Header::new(
            1,
            parent,
            merkle::Root([nonce as u8; 32]),
            Utc.timestamp_opt(1_300_000_000 + nonce as i64 * 600, 0)
                .single()
                .unwrap(),
            CompactDifficulty(0x1d00ffff),
            nonce,
        )
    }

    fn receive_row(tx_byte: u8, index: u32, norm_byte: u8) -> ReceiveRow {
        ReceiveRow {
            norm_id: NormalizedId([norm_byte; 32]),
            tx_hash: transaction::Hash([tx_byte; 32]),
            output_index: index,
            time: Utc.timestamp_opt(1_300_000_000, 0).single().unwrap(),
            block_hash: block::Hash::zero(),
            address: [9u8; 20],
            value: Amount(5_000),
            script_bytes: Script::new_pay_to_pubkey_hash(&[9u8; 20]),
            spent: false,
            change: false,
            coinbase: false,
            in_safe: false,
            deleted: false,
        }
    }

    #[test]
    fn fresh_store_opens_at_genesis() {
        let (_dir, store) = open_store();
        let head = store.chain_head().unwrap();
        assert_eq!(head.height, Height(0));
        assert_eq!(
            head.hash,
            kestrel_chain::parameters::genesis_hash(Network::Mainnet)
        );
        assert_eq!(head.chain_work, Work::genesis());

        let genesis = store.get_block_at_height(Height(0)).unwrap().unwrap();
        assert!(genesis.on_chain);
    }

    #[test]
    fn duplicate_receive_rows_are_rejected() {
        let (_dir, store) = open_store();
        let row = receive_row(1, 0, 1);
        store.store_receive(&row).unwrap();
        assert!(matches!(
            store.store_receive(&row),
            Err(StoreError::DuplicateRow)
        ));
        // A different output index of the same transaction is fine.
        store.store_receive(&receive_row(1, 1, 1)).unwrap();
    }

    #[test]
    fn norm_id_collapsing_prefers_confirmed_rows() {
        let (_dir, store) = open_store();

        // Two malleated copies of the same payment: same norm id, different
        // tx hashes; the second is confirmed.
        let unconfirmed = receive_row(1, 0, 7);
        let mut confirmed = receive_row(2, 0, 7);
        confirmed.block_hash = block::Hash([0xCC; 32]);
        store.store_receive(&unconfirmed).unwrap();
        store.store_receive(&confirmed).unwrap();

        let list = store.get_receive_list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].tx_hash, confirmed.tx_hash);

        // With no confirmed copy, the first encountered wins.
        store.store_receive(&receive_row(3, 0, 8)).unwrap();
        store.store_receive(&receive_row(4, 0, 8)).unwrap();
        let list = store.get_receive_list().unwrap();
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn child_index_resumes_a_stalled_chain() {
        let (_dir, store) = open_store();
        let genesis_hash = store.chain_head().unwrap().hash;
        let header = child_header(genesis_hash, 1);
        store
            .put_header(&HeaderEntry::detached(header, Vec::new()))
            .unwrap();
        assert_eq!(
            store.get_child_of(genesis_hash).unwrap(),
            Some(header.hash())
        );
        assert_eq!(store.get_child_of(header.hash()).unwrap(), None);
    }

    #[test]
    fn junction_walk_stops_at_the_active_chain() {
        let (_dir, store) = open_store();
        let genesis_hash = store.chain_head().unwrap().hash;

        let a = child_header(genesis_hash, 1);
        let b = child_header(a.hash(), 2);
        store
            .put_header(&HeaderEntry::detached(a, Vec::new()))
            .unwrap();
        store
            .put_header(&HeaderEntry::detached(b, Vec::new()))
            .unwrap();

        let path = store.get_junction(b.hash()).unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path[0].hash(), genesis_hash);
        assert!(path[0].on_chain);
        assert_eq!(path[1].hash(), a.hash());
        assert_eq!(path[2].hash(), b.hash());

        // A dangling header reports its missing predecessor.
        let orphan = child_header(block::Hash([0xEE; 32]), 3);
        store
            .put_header(&HeaderEntry::detached(orphan, Vec::new()))
            .unwrap();
        assert!(matches!(
            store.get_junction(orphan.hash()),
            Err(StoreError::BlockNotFound(hash)) if hash == block::Hash([0xEE; 32])
        ));
    }

    #[test]
    fn tx_depth_counts_from_the_head() {
        let (_dir, store) = open_store();
        let genesis_hash = store.chain_head().unwrap().hash;

        let a = child_header(genesis_hash, 1);
        let b = child_header(a.hash(), 2);
        let work = a.block_work().unwrap();

        let tx_hash = transaction::Hash([0x11; 32]);
        let mut row = receive_row(0x11, 0, 1);
        row.block_hash = a.hash();
        store.store_receive(&row).unwrap();

        let junction = store.get_header(genesis_hash).unwrap().unwrap();
        let path = vec![
            junction,
            HeaderEntry {
                header: a,
                on_chain: true,
                height: Height(1),
                chain_work: Work::genesis() + work,
                matched: vec![tx_hash],
            },
            HeaderEntry {
                header: b,
                on_chain: true,
                height: Height(2),
                chain_work: Work::genesis() + work + work,
                matched: Vec::new(),
            },
        ];
        store.put_header(&path[1]).unwrap();
        store.put_header(&path[2]).unwrap();
        store.set_chain_head(&path).unwrap();

        // Block at height 1, head at height 2: depth 2.
        assert_eq!(store.tx_depth(tx_hash).unwrap(), 2);
        assert_eq!(store.tx_depth(transaction::Hash([0x99; 32])).unwrap(), 0);
    }

    #[test]
    fn rescan_height_finds_the_latest_block_before_t() {
        let (_dir, store) = open_store();
        let genesis_hash = store.chain_head().unwrap().hash;

        let a = child_header(genesis_hash, 1);
        let b = child_header(a.hash(), 2);
        let work = a.block_work().unwrap();
        let junction = store.get_header(genesis_hash).unwrap().unwrap();
        let path = vec![
            junction,
            HeaderEntry {
                header: a,
                on_chain: true,
                height: Height(1),
                chain_work: Work::genesis() + work,
                matched: Vec::new(),
            },
            HeaderEntry {
                header: b,
                on_chain: true,
                height: Height(2),
                chain_work: Work::genesis() + work + work,
                matched: Vec::new(),
            },
        ];
        store.put_header(&path[1]).unwrap();
        store.put_header(&path[2]).unwrap();
        store.set_chain_head(&path).unwrap();

        // Between block 1 and block 2.
        let t = b.time - Duration::seconds(30);
        assert_eq!(store.rescan_height(t).unwrap(), Height(1));
        // Before every block.
        let early = Utc.timestamp_opt(1, 0).single().unwrap();
        assert_eq!(store.rescan_height(early).unwrap(), Height(0));
        // After every block.
        let late = b.time + Duration::seconds(30);
        assert_eq!(store.rescan_height(late).unwrap(), Height(2));
    }
}
