#[cfg(test)]
mod socket_test;

pub mod framing;
pub mod proxy;
pub mod tcp_active;
pub mod tcp_established;
pub mod tcp_passive;
pub mod turn_sock;
pub mod udp;

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::arena::{Arena, Id};
use crate::error::*;
use tcp_active::TcpActiveSocket;
use tcp_established::TcpEstablishedSocket;
use tcp_passive::TcpPassiveSocket;
use turn_sock::TurnSocket;
use udp::UdpSocketWrap;

pub(crate) const RECEIVE_MTU: usize = 8192;

pub type SocketId = Id<Socket>;

/// Everything socket reader/writer tasks report back into the agent task.
/// Sockets never touch agent state themselves.
#[derive(Debug)]
pub(crate) enum NetEvent {
    /// A datagram (or one de-framed TCP packet) arrived.
    Packet {
        socket: SocketId,
        from: SocketAddr,
        data: Vec<u8>,
    },
    /// A passive listener accepted a connection.
    TcpAccepted {
        listener: SocketId,
        stream: tokio::net::TcpStream,
        from: SocketAddr,
    },
    /// An active connect attempt finished.
    TcpConnected {
        active: SocketId,
        to: SocketAddr,
        stream: tokio::net::TcpStream,
    },
    TcpConnectFailed {
        active: SocketId,
        to: SocketAddr,
    },
    /// The TCP (possibly proxied) transport towards a TURN server came
    /// up; the placeholder socket can be promoted.
    TurnTcpReady {
        socket: SocketId,
        stream: tokio::net::TcpStream,
    },
    TurnTcpFailed {
        socket: SocketId,
        server: SocketAddr,
    },
    /// The reader side of the socket died; established TCP siblings stay
    /// alive.
    SocketClosed {
        socket: SocketId,
    },
    /// A bounded TCP send queue drained after having overflowed.
    Writable {
        socket: SocketId,
    },
    /// A bounded TCP send queue dropped a packet.
    Overflow {
        socket: SocketId,
    },
}

pub(crate) type NetEventTx = mpsc::UnboundedSender<NetEvent>;

/// The socket variants the agent can send and receive through.
pub enum SocketKind {
    Udp(UdpSocketWrap),
    TcpActive(TcpActiveSocket),
    TcpPassive(TcpPassiveSocket),
    TcpEstablished(TcpEstablishedSocket),
    Turn(TurnSocket),
}

impl SocketKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Udp(_) => "udp",
            Self::TcpActive(_) => "tcp-act",
            Self::TcpPassive(_) => "tcp-pass",
            Self::TcpEstablished(_) => "tcp-est",
            Self::Turn(_) => "turn",
        }
    }
}

/// One registered socket: the component it belongs to (for inbound
/// routing) and the variant-specific state.
pub struct Socket {
    pub stream_id: u32,
    pub component_id: u16,
    /// Set on a base socket that a TURN socket encapsulates over, so
    /// traffic from the TURN server can be rerouted to the wrapper.
    pub turn_wrapper: Option<SocketId>,
    /// For established TCP connections, the listener or active factory
    /// they were spawned from; inbound checks resolve their local
    /// candidate through it.
    pub parent: Option<SocketId>,
    pub kind: SocketKind,
}

impl Socket {
    pub(crate) fn new(stream_id: u32, component_id: u16, kind: SocketKind) -> Self {
        Self {
            stream_id,
            component_id,
            turn_wrapper: None,
            parent: None,
            kind,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match &self.kind {
            SocketKind::Udp(s) => s.local_addr,
            SocketKind::TcpActive(s) => s.local_addr,
            SocketKind::TcpPassive(s) => s.local_addr,
            SocketKind::TcpEstablished(s) => s.local_addr,
            SocketKind::Turn(s) => s.relayed_addr,
        }
    }
}

/// Whether the transport retransmits on its own. TURN sockets inherit
/// from the socket they encapsulate over.
pub(crate) fn socket_is_reliable(sockets: &Arena<Socket>, mut id: SocketId) -> bool {
    loop {
        let entry = match sockets.get(id) {
            Some(entry) => entry,
            None => return false,
        };
        match &entry.kind {
            SocketKind::Udp(_) => return false,
            SocketKind::TcpActive(_)
            | SocketKind::TcpPassive(_)
            | SocketKind::TcpEstablished(_) => return true,
            SocketKind::Turn(t) => id = t.inner,
        }
    }
}

/// Sends `data` towards `to` through socket `id`, resolving TURN
/// encapsulation down to the base transport. TCP sends are queued and
/// return the queued byte count.
pub(crate) async fn send_on_socket(
    sockets: &mut Arena<Socket>,
    mut id: SocketId,
    data: &[u8],
    mut to: SocketAddr,
) -> Result<usize> {
    let mut buf: Cow<'_, [u8]> = Cow::Borrowed(data);

    loop {
        let entry = sockets.get_mut(id).ok_or(Error::ErrSendPacket)?;
        match &mut entry.kind {
            SocketKind::Turn(t) => {
                let wrapped = t.encapsulate(&buf, to)?;
                to = t.server_addr;
                id = t.inner;
                buf = Cow::Owned(wrapped);
            }
            SocketKind::Udp(u) => {
                let conn = Arc::clone(&u.conn);
                let n = conn
                    .send_to(&buf, to)
                    .await
                    .map_err(|e| Error::Other(e.to_string()))?;
                return Ok(n);
            }
            SocketKind::TcpEstablished(t) => return t.enqueue(&buf),
            SocketKind::TcpActive(a) => {
                // Reuse a live connection towards the destination; only
                // connect when none exists.
                match a.established.get(&to).copied() {
                    Some(established) => id = established,
                    None => return a.send_to(id, &buf, to),
                }
            }
            SocketKind::TcpPassive(_) => return Err(Error::ErrSendPacket),
        }
    }
}

/// Closes the socket's tasks and underlying transport.
pub(crate) async fn close_socket(sockets: &mut Arena<Socket>, id: SocketId) {
    if let Some(entry) = sockets.get_mut(id) {
        match &mut entry.kind {
            SocketKind::Udp(u) => u.close().await,
            SocketKind::TcpActive(a) => a.close(),
            SocketKind::TcpPassive(p) => p.close(),
            SocketKind::TcpEstablished(t) => t.close(),
            SocketKind::Turn(_) => {}
        }
    }
}
