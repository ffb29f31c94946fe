//! The wallet core of Kestrel: durable state, the header-chain engine, and
//! SPV transaction matching.
//!
//! Everything here operates on [`kestrel_chain`] types; the network layer
//! feeds headers, merkle blocks, and transactions in through the
//! [`worker::WalletWorker`] and reacts to the events it emits.

pub mod bloom;
pub mod builder;
pub mod chain;
pub mod error;
pub mod keys;
pub mod matcher;
pub mod records;
pub mod sled_store;
pub mod store;
pub mod worker;

pub use error::{BuildError, InvalidReason, KeyError, StoreError, VerificationError, WalletError};
pub use records::{AddressEntry, ChainHead, HeaderEntry, KeyEntry, ReceiveRow, SendRow};
pub use sled_store::SledStore;
pub use store::WalletStore;
