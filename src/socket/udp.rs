use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use util::Conn;
use waitgroup::Worker;

use super::{NetEvent, NetEventTx, SocketId, RECEIVE_MTU};

/// A bound UDP socket. The `Conn` abstraction keeps virtual networks
/// usable in tests.
pub struct UdpSocketWrap {
    pub conn: Arc<dyn Conn + Send + Sync>,
    pub local_addr: SocketAddr,
    closed_tx: Option<broadcast::Sender<()>>,
}

impl UdpSocketWrap {
    pub(crate) fn new(conn: Arc<dyn Conn + Send + Sync>, local_addr: SocketAddr) -> Self {
        Self {
            conn,
            local_addr,
            closed_tx: None,
        }
    }

    /// Spawns the reader task posting inbound datagrams to the agent.
    pub(crate) fn start(&mut self, id: SocketId, net_tx: NetEventTx, worker: Worker) {
        let (closed_tx, mut closed_rx) = broadcast::channel(1);
        self.closed_tx = Some(closed_tx);

        let conn = Arc::clone(&self.conn);
        tokio::spawn(async move {
            let _w = worker;
            let mut buffer = vec![0u8; RECEIVE_MTU];
            loop {
                tokio::select! {
                    result = conn.recv_from(&mut buffer) => {
                        match result {
                            Ok((n, from)) => {
                                let _ = net_tx.send(NetEvent::Packet {
                                    socket: id,
                                    from,
                                    data: buffer[..n].to_vec(),
                                });
                            }
                            Err(err) => {
                                log::debug!("udp reader for {id} exiting: {err}");
                                let _ = net_tx.send(NetEvent::SocketClosed { socket: id });
                                return;
                            }
                        }
                    }
                    _ = closed_rx.recv() => return,
                }
            }
        });
    }

    pub(crate) async fn close(&mut self) {
        self.closed_tx.take();
        let _ = self.conn.close().await;
    }
}
