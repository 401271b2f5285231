use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use waitgroup::Worker;

use super::{NetEvent, NetEventTx, SocketId};

/// A listening ("passive") ICE TCP socket. Accepted connections are
/// registered as established sockets on the same component.
pub struct TcpPassiveSocket {
    pub local_addr: SocketAddr,
    closed_tx: Option<broadcast::Sender<()>>,
}

impl TcpPassiveSocket {
    pub(crate) fn new(local_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            closed_tx: None,
        }
    }

    pub(crate) fn start(
        &mut self,
        id: SocketId,
        listener: TcpListener,
        net_tx: NetEventTx,
        worker: Worker,
    ) {
        let (closed_tx, mut closed_rx) = broadcast::channel(1);
        self.closed_tx = Some(closed_tx);

        tokio::spawn(async move {
            let _w = worker;
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, from)) => {
                            let _ = net_tx.send(NetEvent::TcpAccepted {
                                listener: id,
                                stream,
                                from,
                            });
                        }
                        Err(err) => {
                            log::debug!("tcp accept on {id} failed: {err}");
                            let _ = net_tx.send(NetEvent::SocketClosed { socket: id });
                            return;
                        }
                    },
                    _ = closed_rx.recv() => return,
                }
            }
        });
    }

    pub(crate) fn close(&mut self) {
        self.closed_tx.take();
    }
}
