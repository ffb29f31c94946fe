//! The records the wallet persists.

use chrono::{DateTime, Utc};

use bitcoin_serde_derive::{BtcDeserialize, BtcSerialize};
use kestrel_chain::{
    amount::Amount,
    block::{self, Height},
    transaction::{self, NormalizedId},
    transparent::Script,
    work::Work,
    BitcoinDeserialize, BitcoinSerialize, SerializationError,
};

/// A stored block header with its position in (or off) the active chain.
///
/// `height` and `chain_work` are meaningful only while `on_chain` is true;
/// the chain engine rewrites all three during a reorg.
#[derive(Clone, Debug, PartialEq, Eq, BtcSerialize, BtcDeserialize)]
pub struct HeaderEntry {
    pub header: block::Header,
    pub on_chain: bool,
    pub height: Height,
    pub chain_work: Work,
    /// The transactions SPV filtering flagged in this block, in block order.
    pub matched: Vec<transaction::Hash>,
}

impl HeaderEntry {
    /// A freshly received header, not yet connected to the chain.
    pub fn detached(header: block::Header, matched: Vec<transaction::Hash>) -> HeaderEntry {
        HeaderEntry {
            header,
            on_chain: false,
            height: Height(0),
            chain_work: Work::zero(),
            matched,
        }
    }

    pub fn hash(&self) -> block::Hash {
        self.header.hash()
    }
}

/// An output paying one of the wallet's keys.
///
/// Keyed by `(tx_hash, output_index)`; rows sharing a `norm_id` are collapsed
/// on read.
#[derive(Clone, Debug, PartialEq, Eq, BtcSerialize, BtcDeserialize)]
pub struct ReceiveRow {
    pub norm_id: NormalizedId,
    pub tx_hash: transaction::Hash,
    pub output_index: u32,
    /// When the wallet first saw the transaction.
    pub time: DateTime<Utc>,
    /// The containing block, or zero while unconfirmed.
    pub block_hash: block::Hash,
    /// The hash160 the output pays.
    pub address: [u8; 20],
    pub value: Amount,
    pub script_bytes: Script,
    pub spent: bool,
    /// Paid to the wallet's change key.
    pub change: bool,
    pub coinbase: bool,
    /// Marked by the user as ineligible for automatic spending.
    pub in_safe: bool,
    pub deleted: bool,
}

/// A payment out of the wallet.
///
/// Keyed by `tx_hash`.
#[derive(Clone, Debug, PartialEq, Eq, BtcSerialize, BtcDeserialize)]
pub struct SendRow {
    pub norm_id: NormalizedId,
    pub tx_hash: transaction::Hash,
    /// Backdated 15 seconds from receipt so a send sorts ahead of its own
    /// change or self-payment.
    pub time: DateTime<Utc>,
    /// The containing block, or zero while unconfirmed.
    pub block_hash: block::Hash,
    /// The first output paying an address that is not ours, or zero for a
    /// pure self-send.
    pub address: [u8; 20],
    pub value: Amount,
    /// Inputs-we-spent minus all outputs. Exact for wallet-built
    /// transactions; an approximation when some inputs were signed
    /// elsewhere.
    pub fee: Amount,
    pub deleted: bool,
    /// The full serialized transaction, kept for rebroadcast.
    pub tx_bytes: Vec<u8>,
}

/// A wallet key: public part in the clear, private part encrypted under the
/// wallet passphrase.
#[derive(Clone, Debug, PartialEq, Eq, BtcSerialize, BtcDeserialize)]
pub struct KeyEntry {
    /// SEC-encoded public key, 33 bytes compressed or 65 uncompressed.
    pub pub_key: Vec<u8>,
    /// IV followed by the AES-256-CBC ciphertext of the 32-byte secret.
    pub encrypted_secret: Vec<u8>,
    /// When the key was created; the rescan floor.
    pub creation_time: DateTime<Utc>,
    pub label: String,
    /// The wallet holds exactly one change key.
    pub change: bool,
}

impl KeyEntry {
    pub fn hash160(&self) -> [u8; 20] {
        kestrel_chain::transparent::hash160(&self.pub_key)
    }
}

/// A watched address: a bare hash160 plus a label.
#[derive(Clone, Debug, PartialEq, Eq, BtcSerialize, BtcDeserialize)]
pub struct AddressEntry {
    pub hash: [u8; 20],
    pub label: String,
}

/// The persisted chain head.
#[derive(Copy, Clone, Debug, PartialEq, Eq, BtcSerialize, BtcDeserialize)]
pub struct ChainHead {
    pub hash: block::Hash,
    pub height: Height,
    pub chain_work: Work,
}
