//! Consensus-critical chain types for Kestrel, an SPV Bitcoin wallet.
//!
//! This crate holds the data structures an SPV wallet needs to agree with the
//! rest of the network about: block headers, transactions, scripts, amounts,
//! difficulty, and the serialization rules that bind them to the wire.

pub mod amount;
pub mod block;
pub mod cached;
pub mod compactint;
pub mod parameters;
pub mod serialization;
pub mod transaction;
pub mod transparent;
pub mod work;

pub use serialization::{
    BitcoinDeserialize, BitcoinDeserializeInto, BitcoinSerialize, SerializationError,
};
