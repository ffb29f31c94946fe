//! Per-connection peer session state.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::trace;

use kestrel_chain::block::Height;
use kestrel_chain::SerializationError;

use crate::constants;
use crate::protocol::external::types::{Nonce, PeerServices, ProtocolVersion};
use crate::protocol::external::Message;

/// An opaque identifier for one connection to one peer.
///
/// Reconnecting to the same address produces a fresh id, so request tracking
/// never confuses two incarnations of a peer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub usize);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// The handshake and liveness state of a peer session.
///
/// Sessions move strictly forward:
/// `Connecting → VersionSent → VersionExchanged → Ready → Closing → Closed`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PeerState {
    /// The socket is being established.
    Connecting,
    /// We have sent our `version` and await the peer's.
    VersionSent,
    /// Both `version`s have been exchanged; waiting on `verack`.
    VersionExchanged,
    /// Handshake complete; the peer is eligible for request routing.
    Ready,
    /// The session is being torn down (ban threshold or idle timeout).
    Closing,
    /// The socket is gone.
    Closed,
}

/// Events a connection task reports to the dispatcher.
#[derive(Debug)]
pub enum PeerEvent {
    /// The socket connected; the session should begin its handshake.
    Connected(PeerId),
    /// A complete, checksummed message arrived.
    Message(PeerId, Message),
    /// The peer sent bytes that did not frame or parse.
    ProtocolError(PeerId, SerializationError),
    /// The socket closed or errored.
    Disconnected(PeerId),
}

/// One peer session.
///
/// Owned by the [`PeerSet`](crate::peer_set::PeerSet); the connection task
/// holds only the receiving half of the outbound message channel.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    /// Whether we dialed this peer (as opposed to accepting it).
    pub outbound: bool,
    pub state: PeerState,
    /// The services the peer advertised in its `version`.
    pub services: PeerServices,
    /// The protocol version the peer advertised, once known.
    pub version: Option<ProtocolVersion>,
    /// The chain height the peer advertised in its `version`.
    pub best_block: Height,
    /// Misbehavior score; the session closes at [`constants::BAN_THRESHOLD`].
    pub ban_score: u32,
    pub sent_version: bool,
    pub got_version: bool,
    pub got_verack: bool,
    /// When we last heard anything from this peer.
    pub last_message: Instant,
    /// An unanswered ping, if one is outstanding.
    pub outstanding_ping: Option<(Nonce, Instant)>,
    sender: mpsc::UnboundedSender<Message>,
}

impl Peer {
    pub fn new(
        id: PeerId,
        addr: SocketAddr,
        outbound: bool,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Peer {
        Peer {
            id,
            addr,
            outbound,
            state: PeerState::Connecting,
            services: PeerServices::empty(),
            version: None,
            best_block: Height(0),
            ban_score: 0,
            sent_version: false,
            got_version: false,
            got_verack: false,
            last_message: Instant::now(),
            outstanding_ping: None,
            sender,
        }
    }

    /// Queue a message for the connection task to write.
    ///
    /// A closed channel means the connection task already exited; the session
    /// is on its way to `Closed` and the message can be dropped.
    pub fn send(&self, msg: Message) {
        trace!(peer = %self.id, msg = %msg, "queueing outbound message");
        let _ = self.sender.send(msg);
    }

    pub fn is_ready(&self) -> bool {
        self.state == PeerState::Ready
    }

    /// Whether this peer may be sent `reject` messages.
    pub fn supports_reject(&self) -> bool {
        matches!(self.version, Some(v) if v >= constants::MIN_REJECT_VERSION)
    }

    /// Add misbehavior points. Returns true when the session crossed the ban
    /// threshold and should be torn down.
    pub fn misbehaving(&mut self, points: u32) -> bool {
        self.ban_score = self.ban_score.saturating_add(points);
        if self.ban_score >= constants::BAN_THRESHOLD && self.state != PeerState::Closing {
            self.state = PeerState::Closing;
            true
        } else {
            false
        }
    }

    /// Advance the handshake state from the `sent_version`/`got_version`/
    /// `got_verack` flags. Never leaves `Closing` or `Closed`.
    pub fn recompute_state(&mut self) {
        if matches!(self.state, PeerState::Closing | PeerState::Closed) {
            return;
        }
        self.state = if self.sent_version && self.got_version && self.got_verack {
            PeerState::Ready
        } else if self.sent_version && self.got_version {
            PeerState::VersionExchanged
        } else if self.sent_version {
            PeerState::VersionSent
        } else {
            PeerState::Connecting
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> (Peer, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Peer::new(PeerId(1), "203.0.113.1:8333".parse().unwrap(), true, tx),
            rx,
        )
    }

    #[test]
    fn handshake_walks_the_state_machine() {
        let (mut peer, _rx) = test_peer();
        assert_eq!(peer.state, PeerState::Connecting);

        peer.sent_version = true;
        peer.recompute_state();
        assert_eq!(peer.state, PeerState::VersionSent);

        peer.got_version = true;
        peer.recompute_state();
        assert_eq!(peer.state, PeerState::VersionExchanged);

        peer.got_verack = true;
        peer.recompute_state();
        assert_eq!(peer.state, PeerState::Ready);
        assert!(peer.is_ready());
    }

    #[test]
    fn twenty_offenses_cross_the_ban_threshold() {
        let (mut peer, _rx) = test_peer();
        for _ in 0..19 {
            assert!(!peer.misbehaving(constants::MISBEHAVIOR_PENALTY));
        }
        assert!(peer.misbehaving(constants::MISBEHAVIOR_PENALTY));
        assert_eq!(peer.state, PeerState::Closing);

        // Closing is terminal; the handshake flags cannot resurrect it.
        peer.recompute_state();
        assert_eq!(peer.state, PeerState::Closing);
    }

    #[test]
    fn reject_support_requires_70002() {
        let (mut peer, _rx) = test_peer();
        assert!(!peer.supports_reject());
        peer.version = Some(ProtocolVersion(70001));
        assert!(!peer.supports_reject());
        peer.version = Some(ProtocolVersion(70002));
        assert!(peer.supports_reject());
    }
}
