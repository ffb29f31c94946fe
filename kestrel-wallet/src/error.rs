//! The wallet error taxonomy.
//!
//! Parse failures live in `kestrel_chain::SerializationError`; everything
//! here is either semantically invalid data, a persistence failure, or a key
//! problem. Handlers log and surface these — they never crash the process.

use thiserror::Error;

use kestrel_chain::{amount::Amount, block, SerializationError};

/// A persistent-state failure.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A header's predecessor is not stored yet. Recoverable: fetch the
    /// missing block and retry.
    #[error("block {0} has no stored predecessor")]
    BlockNotFound(block::Hash),

    /// An insert would overwrite an existing row's primary key.
    #[error("a row with this key already exists")]
    DuplicateRow,

    /// The backend failed.
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),

    /// A stored record failed to decode; the store is corrupt.
    #[error("stored record was corrupt: {0}")]
    Codec(#[from] SerializationError),
}

/// Why received data was semantically rejected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InvalidReason {
    /// A merkle block's reconstructed root did not match its header.
    BadMerkleRoot,
    /// A partial merkle tree that does not parse as a tree at all.
    BadMerkleTree,
    /// A header whose compact difficulty is not a valid target.
    BadDifficulty,
    /// A header chain that contradicts a hard-coded checkpoint.
    Checkpoint,
    /// A header timestamp too far ahead of the local clock.
    TimeDrift,
}

/// Semantically invalid data: the wallet's `Invalid` error, carrying what a
/// `reject` message needs.
#[derive(Error, Debug)]
#[error("verification failed: {reason:?}")]
pub struct VerificationError {
    pub reason: InvalidReason,
    /// The hash of the offending object, when there is one.
    pub hash: Option<[u8; 32]>,
}

/// A key-management failure.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("wrong wallet passphrase")]
    BadPassphrase,

    #[error("the wallet already has a change key")]
    ChangeKeyExists,

    #[error("secp256k1 rejected the key material: {0}")]
    Secp(#[from] secp256k1::Error),

    #[error("private key decryption failed")]
    Crypt,
}

/// A failure to assemble an outgoing payment.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("insufficient confirmed funds: have {available}, need {needed}")]
    InsufficientFunds { available: Amount, needed: Amount },

    #[error("the wallet has no change key")]
    NoChangeKey,

    #[error("no key is held for a selected output")]
    MissingKey,

    #[error("payment would be dust after fees")]
    Dust,
}

/// Any wallet-layer failure.
#[derive(Error, Debug)]
pub enum WalletError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] SerializationError),
}
