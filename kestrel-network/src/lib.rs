//! Peer-to-peer networking for the Kestrel SPV wallet.
//!
//! This crate speaks the Bitcoin wire protocol to a small set of peers,
//! keeps per-peer session state (handshake progress, ban score, liveness),
//! and tracks which transactions and filtered blocks have been requested
//! from whom. Everything that touches the wallet store is handed off through
//! an update channel; this crate never blocks on persistence.

pub mod address_book;
pub mod connection;
pub mod constants;
pub mod dispatcher;
pub mod meta_addr;
pub mod peer;
pub mod peer_set;
pub mod protocol;
pub mod sync;

pub use dispatcher::{Dispatcher, InboundUpdate};
pub use peer::{PeerEvent, PeerId};
pub use protocol::external::{Codec, InventoryHash, Message};
