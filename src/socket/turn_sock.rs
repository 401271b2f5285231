use std::net::SocketAddr;

use stun::agent::TransactionId;
use stun::fingerprint::FINGERPRINT;
use stun::message::*;
use turn::proto::data::Data;
use turn::proto::peeraddr::PeerAddress;

use super::SocketId;
use crate::error::*;

/// A relayed pseudo-socket. Outbound payloads are wrapped in TURN Send
/// indications towards the server over the base socket; inbound Data
/// indications from the server are unwrapped by the dispatcher and
/// re-attributed to this socket with the real peer as source.
pub struct TurnSocket {
    /// The socket the allocation was created over.
    pub inner: SocketId,
    pub server_addr: SocketAddr,
    /// The relayed transport address the server allocated for us.
    pub relayed_addr: SocketAddr,
    /// Set when a selected pair carries this relay, so keepalives and
    /// application data follow the nominated remote.
    pub peer: Option<SocketAddr>,
}

impl TurnSocket {
    pub(crate) fn new(inner: SocketId, server_addr: SocketAddr, relayed_addr: SocketAddr) -> Self {
        Self {
            inner,
            server_addr,
            relayed_addr,
            peer: None,
        }
    }

    /// Wraps one payload in a Send indication for `peer`.
    pub(crate) fn encapsulate(&self, payload: &[u8], peer: SocketAddr) -> Result<Vec<u8>> {
        let mut msg = Message::new();
        msg.build(&[
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_SEND, CLASS_INDICATION)),
            Box::new(PeerAddress {
                ip: peer.ip(),
                port: peer.port(),
            }),
            Box::new(Data(payload.to_vec())),
            Box::new(FINGERPRINT),
        ])?;
        Ok(msg.raw)
    }

    /// Unwraps a Data indication from the server, yielding the remote
    /// peer and the carried payload. Returns `None` for anything that is
    /// not a Data indication.
    pub(crate) fn decapsulate(msg: &Message) -> Option<(SocketAddr, Vec<u8>)> {
        if msg.typ.method != METHOD_DATA || msg.typ.class != CLASS_INDICATION {
            return None;
        }

        let mut peer = PeerAddress::default();
        peer.get_from(msg).ok()?;
        let mut data = Data::default();
        data.get_from(msg).ok()?;

        Some((SocketAddr::new(peer.ip, peer.port), data.0))
    }
}
