//! Definitions of constants.

use std::time::Duration;

use crate::protocol::external::types::ProtocolVersion;

/// The protocol version we speak.
pub const CURRENT_VERSION: ProtocolVersion = ProtocolVersion(70002);

/// The lowest protocol version we accept: peers below 70001 cannot serve
/// Bloom-filtered blocks and are useless to an SPV wallet.
pub const MIN_PEER_VERSION: ProtocolVersion = ProtocolVersion(70001);

/// `reject` messages may only be sent to peers at or above this version.
pub const MIN_REJECT_VERSION: ProtocolVersion = ProtocolVersion(70002);

/// The user agent advertised in our `version` messages.
pub const USER_AGENT: &str = "/kestrel:0.1.0/";

/// How many outbound connections the wallet tries to keep open.
pub const TARGET_OUTBOUND_PEERS: usize = 8;

/// The most `getdata` items allowed in flight to a single peer.
pub const MAX_IN_FLIGHT_PER_PEER: usize = 50;

/// An outstanding request is re-routed to another peer after this long.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A TCP connect attempt is abandoned after this long.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(90);

/// An idle peer is pinged after this long without traffic.
pub const PING_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A peer that stays silent this long (ping included) is dropped.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// A peer whose ban score reaches this threshold is disconnected.
pub const BAN_THRESHOLD: u32 = 100;

/// The ban score added for each malformed or invalid message.
pub const MISBEHAVIOR_PENALTY: u32 = 5;

/// The most recent headers included in a block locator before the spacing
/// starts doubling, and the cap on how far back a locator reaches.
pub const LOCATOR_DENSE_PREFIX: u32 = 10;
pub const LOCATOR_MAX_SPAN: u32 = 500;

/// The most addresses accepted from a single `addr` message.
pub const MAX_GOSSIPED_ADDRS: usize = 1000;
