//! Per-connection plumbing: a reader task that reassembles frames into
//! events for the node loop, and a writer task that drains an outbound
//! queue. The socket is owned entirely by these two tasks; everything else
//! talks to the peer through its [`PeerChannel`].

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::crypto::Hash32;
use crate::network::gossip::PeerId;
use crate::network::protocol::{decode_payload, wrap_message, FrameBuffer, NetMessage};
use crate::node::Event;

/// Protocol violations a peer can rack up before being dropped.
pub const STRIKE_LIMIT: u32 = 3;

/// Event-loop-side bookkeeping for one connected peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub version: u32,
    pub handshaked: bool,
    /// Last height/headerhash the peer reported (MB/CB).
    pub chain_height: u64,
    pub chain_headerhash: Hash32,
    pub last_seen: i64,
    pub strikes: u32,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            version: 0,
            handshaked: false,
            chain_height: 0,
            chain_headerhash: [0u8; 32],
            last_seen: chrono::Utc::now().timestamp(),
            strikes: 0,
        }
    }
}

/// Outbound half of a peer as seen from the event loop.
#[derive(Clone)]
pub struct PeerChannel {
    pub id: PeerId,
    pub addr: SocketAddr,
    tx: mpsc::UnboundedSender<NetMessage>,
}

impl PeerChannel {
    pub fn send(&self, msg: NetMessage) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Socketless channel whose outbound messages land in the returned
    /// receiver; lets tests stand in for a remote peer.
    #[cfg(test)]
    pub fn for_test(id: PeerId, addr: SocketAddr) -> (Self, mpsc::UnboundedReceiver<NetMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, addr, tx }, rx)
    }
}

/// Split the socket into reader/writer tasks and hand back the channel.
/// The reader posts `Event::PeerMessage` per decoded frame and a final
/// `Event::PeerDisconnected`; an undecodable payload posts
/// `Event::PeerMisbehaved` and closes the connection.
pub fn spawn_peer_tasks(
    id: PeerId,
    stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
) -> PeerChannel {
    let (tx, mut rx) = mpsc::unbounded_channel::<NetMessage>();
    let (mut read_half, mut write_half) = stream.into_split();

    // Writer: frame and flush until the channel closes.
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let bytes = match wrap_message(&msg) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(peer = id, "refusing to send unframeable message: {err}");
                    continue;
                }
            };
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Reader: bytes -> frames -> events.
    tokio::spawn(async move {
        let mut frames = FrameBuffer::default();
        let mut buf = vec![0u8; 64 * 1024];
        'conn: loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    frames.push(&buf[..n]);
                    while let Some(payload) = frames.next_frame() {
                        match decode_payload(&payload) {
                            Ok(msg) => {
                                if events.send(Event::PeerMessage { peer: id, msg }).is_err() {
                                    break 'conn;
                                }
                            }
                            Err(err) => {
                                debug!(peer = id, "invalid structure from peer: {err}");
                                let _ = events.send(Event::PeerMisbehaved {
                                    peer: id,
                                    reason: "undecodable payload",
                                });
                                break 'conn;
                            }
                        }
                    }
                }
            }
        }
        let _ = events.send(Event::PeerDisconnected { peer: id });
    });

    PeerChannel { id, addr, tx }
}
