//! The storage-agnostic wallet store interface.
//!
//! Any backend with ordered scans can satisfy this trait; the wallet ships
//! with [`crate::sled_store::SledStore`]. Implementations must serialize
//! [`set_chain_head`](WalletStore::set_chain_head) against readers of header
//! state; point reads may be lock-free if the backend supports them.

use chrono::{DateTime, Utc};

use kestrel_chain::{
    block::{self, Height},
    transaction,
};

use crate::error::StoreError;
use crate::records::{AddressEntry, ChainHead, HeaderEntry, KeyEntry, ReceiveRow, SendRow};

pub trait WalletStore: Send + Sync {
    // ---- headers ----

    /// Insert or overwrite a header entry, keyed by block hash, and index it
    /// under its parent for [`get_child_of`](WalletStore::get_child_of).
    fn put_header(&self, entry: &HeaderEntry) -> Result<(), StoreError>;

    fn get_header(&self, hash: block::Hash) -> Result<Option<HeaderEntry>, StoreError>;

    /// The single known child of `prev_hash`, if any. Used to resume a chain
    /// that stalled on an out-of-order delivery.
    fn get_child_of(&self, prev_hash: block::Hash) -> Result<Option<block::Hash>, StoreError>;

    /// Only returns blocks with `on_chain = true`.
    fn get_block_at_height(&self, height: Height) -> Result<Option<HeaderEntry>, StoreError>;

    fn is_new_block(&self, hash: block::Hash) -> Result<bool, StoreError>;

    /// Whether no receive or send row references this transaction yet.
    fn is_new_tx(&self, hash: transaction::Hash) -> Result<bool, StoreError>;

    /// Replace the matched-transaction list of a header already present.
    fn update_matched(
        &self,
        hash: block::Hash,
        matched: &[transaction::Hash],
    ) -> Result<(), StoreError>;

    // ---- keys and addresses ----

    /// Idempotent write, keyed by public key.
    fn store_key(&self, key: &KeyEntry) -> Result<(), StoreError>;

    fn get_keys(&self) -> Result<Vec<KeyEntry>, StoreError>;

    fn set_key_label(&self, pub_key: &[u8], label: &str) -> Result<(), StoreError>;

    /// Idempotent write, keyed by hash160.
    fn store_address(&self, entry: &AddressEntry) -> Result<(), StoreError>;

    fn get_addresses(&self) -> Result<Vec<AddressEntry>, StoreError>;

    fn set_address_label(&self, hash: [u8; 20], label: &str) -> Result<(), StoreError>;

    // ---- wallet rows ----

    /// Insert; fails with [`StoreError::DuplicateRow`] if
    /// `(tx_hash, output_index)` exists.
    fn store_receive(&self, row: &ReceiveRow) -> Result<(), StoreError>;

    /// Insert; fails with [`StoreError::DuplicateRow`] if `tx_hash` exists.
    fn store_send(&self, row: &SendRow) -> Result<(), StoreError>;

    fn get_receive(
        &self,
        tx_hash: transaction::Hash,
        output_index: u32,
    ) -> Result<Option<ReceiveRow>, StoreError>;

    /// All receive rows, collapsed by `norm_id`: a row with a non-zero
    /// `block_hash` beats rows without one; otherwise the first encountered
    /// wins.
    fn get_receive_list(&self) -> Result<Vec<ReceiveRow>, StoreError>;

    /// All send rows, collapsed by `norm_id` under the same rule.
    fn get_send_list(&self) -> Result<Vec<SendRow>, StoreError>;

    fn set_receive_spent(
        &self,
        tx_hash: transaction::Hash,
        output_index: u32,
        spent: bool,
    ) -> Result<(), StoreError>;

    fn set_receive_safe(
        &self,
        tx_hash: transaction::Hash,
        output_index: u32,
        in_safe: bool,
    ) -> Result<(), StoreError>;

    fn set_receive_deleted(
        &self,
        tx_hash: transaction::Hash,
        output_index: u32,
        deleted: bool,
    ) -> Result<(), StoreError>;

    fn set_send_deleted(&self, tx_hash: transaction::Hash, deleted: bool)
        -> Result<(), StoreError>;

    // ---- chain queries ----

    /// `0` if the transaction is unconfirmed or sits in a stale block, else
    /// `chain_height - block_height + 1`.
    fn tx_depth(&self, tx_hash: transaction::Hash) -> Result<u32, StoreError>;

    /// The height of the latest on-chain block with `time < t`, or 0.
    fn rescan_height(&self, t: DateTime<Utc>) -> Result<Height, StoreError>;

    /// Walk backward from `starting_hash` via `previous_block_hash` until an
    /// on-chain header is reached; return the path from the junction up to
    /// and including `starting_hash`. Fails with
    /// [`StoreError::BlockNotFound`] naming the first absent predecessor.
    fn get_junction(&self, starting_hash: block::Hash) -> Result<Vec<HeaderEntry>, StoreError>;

    fn chain_head(&self) -> Result<ChainHead, StoreError>;

    /// Atomically swap the active chain to `path`.
    ///
    /// `path[0]` must be the junction (already on-chain); the remaining
    /// entries must carry their recomputed height and chain work. Headers
    /// between the old head and the junction are marked off-chain with
    /// cleared heights, and the `block_hash` of every receive and send row
    /// named in their matched lists is reset to zero; the new path's matched
    /// rows get their block hashes set. Readers of header state never
    /// observe a half-applied swap.
    fn set_chain_head(&self, path: &[HeaderEntry]) -> Result<(), StoreError>;
}
