//! TCP connection tasks.
//!
//! A connection task only frames: inbound bytes become [`PeerEvent`]s, and
//! messages queued on the peer's channel are written out. All protocol logic
//! lives in the dispatcher, so a slow handler can never block a socket, and a
//! closed peer channel is the signal to shut the socket down.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use kestrel_chain::parameters::Network;

use crate::constants;
use crate::peer::PeerEvent;
use crate::peer_set::PeerSet;
use crate::protocol::external::Codec;

/// Dial `addr` and run the connection until either side closes.
pub fn spawn_outbound(
    addr: SocketAddr,
    network: Network,
    peer_set: Arc<PeerSet>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    tokio::spawn(async move {
        let stream = match timeout(constants::CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                debug!(%addr, %error, "outbound connect failed");
                return;
            }
            Err(_) => {
                debug!(%addr, "outbound connect timed out");
                return;
            }
        };
        info!(%addr, "connected outbound");
        serve_peer(stream, addr, true, network, peer_set, events).await;
    });
}

/// Accept inbound connections forever.
pub fn spawn_listener(
    listener: TcpListener,
    network: Network,
    peer_set: Arc<PeerSet>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!(%addr, "accepted inbound connection");
                    let peer_set = peer_set.clone();
                    let events = events.clone();
                    tokio::spawn(async move {
                        serve_peer(stream, addr, false, network, peer_set, events).await;
                    });
                }
                Err(error) => {
                    warn!(%error, "inbound accept failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    });
}

async fn serve_peer(
    stream: TcpStream,
    addr: SocketAddr,
    outbound: bool,
    network: Network,
    peer_set: Arc<PeerSet>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let codec = Codec::builder().for_network(network).finish();
    let framed = Framed::new(stream, codec);
    let (mut sink, mut messages) = framed.split();

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let id = peer_set.register(addr, outbound, msg_tx);
    if events.send(PeerEvent::Connected(id)).is_err() {
        peer_set.remove(id);
        return;
    }

    loop {
        tokio::select! {
            queued = msg_rx.recv() => match queued {
                Some(msg) => {
                    if let Err(error) = sink.send(msg).await {
                        debug!(peer = %id, %error, "write failed");
                        break;
                    }
                }
                // The dispatcher dropped the session: graceful close.
                None => break,
            },
            frame = messages.next() => match frame {
                Some(Ok(msg)) => {
                    if events.send(PeerEvent::Message(id, msg)).is_err() {
                        break;
                    }
                }
                Some(Err(error)) => {
                    // The framing layer cannot resynchronize after a bad
                    // frame, so report the offense and drop the socket.
                    let _ = events.send(PeerEvent::ProtocolError(id, error));
                    break;
                }
                None => break,
            },
        }
    }

    debug!(peer = %id, %addr, "connection closed");
    peer_set.remove(id);
    let _ = events.send(PeerEvent::Disconnected(id));
}
