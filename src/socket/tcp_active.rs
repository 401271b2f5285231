use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::net::TcpSocket;

use super::{NetEvent, NetEventTx, SocketId};
use crate::error::*;

/// A connecting ("active") ICE TCP socket: a factory of established
/// connections. Sends towards a peer with no live connection trigger a
/// connect; the packets are queued until the connection is up.
pub struct TcpActiveSocket {
    pub local_addr: SocketAddr,
    /// Live connections by remote address.
    pub established: HashMap<SocketAddr, SocketId>,
    /// Packets queued while a connect attempt is in flight.
    connecting: HashMap<SocketAddr, Vec<Vec<u8>>>,
    net_tx: NetEventTx,
    closed: bool,
}

impl TcpActiveSocket {
    pub(crate) fn new(local_addr: SocketAddr, net_tx: NetEventTx) -> Self {
        Self {
            local_addr,
            established: HashMap::new(),
            connecting: HashMap::new(),
            net_tx,
            closed: false,
        }
    }

    /// Queues a packet towards `to`, starting a connection when none is
    /// in flight yet. Established connections are addressed directly by
    /// the caller through the id returned from `established`.
    pub(crate) fn send_to(&mut self, self_id: SocketId, buf: &[u8], to: SocketAddr) -> Result<usize> {
        if self.closed {
            return Err(Error::ErrWriting);
        }

        if let Some(queued) = self.connecting.get_mut(&to) {
            queued.push(buf.to_vec());
            return Ok(buf.len());
        }

        self.connecting.insert(to, vec![buf.to_vec()]);
        self.spawn_connect(self_id, to);
        Ok(buf.len())
    }

    fn spawn_connect(&self, self_id: SocketId, to: SocketAddr) {
        let local = self.local_addr;
        let net_tx = self.net_tx.clone();

        tokio::spawn(async move {
            let attempt = async {
                let socket = if to.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.set_reuseaddr(true)?;
                // Bind to the advertised base so the peer sees the
                // candidate's address as the connection source.
                socket.bind(local)?;
                socket.connect(to).await
            };

            match attempt.await {
                Ok(stream) => {
                    let _ = net_tx.send(NetEvent::TcpConnected {
                        active: self_id,
                        to,
                        stream,
                    });
                }
                Err(err) => {
                    log::debug!("tcp connect {local} -> {to} failed: {err}");
                    let _ = net_tx.send(NetEvent::TcpConnectFailed {
                        active: self_id,
                        to,
                    });
                }
            }
        });
    }

    /// Called when a connect attempt finishes; returns the packets that
    /// were queued towards the remote.
    pub(crate) fn take_pending(&mut self, to: &SocketAddr) -> Vec<Vec<u8>> {
        self.connecting.remove(to).unwrap_or_default()
    }

    /// Records an established connection for future sends. An existing
    /// entry is replaced; the caller closes the stale socket.
    pub(crate) fn register_established(
        &mut self,
        to: SocketAddr,
        socket: SocketId,
    ) -> Option<SocketId> {
        self.established.insert(to, socket)
    }

    pub(crate) fn forget_established(&mut self, socket: SocketId) {
        self.established.retain(|_, id| *id != socket);
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.connecting.clear();
    }
}
