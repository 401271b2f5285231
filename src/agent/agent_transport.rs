use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use stun::message::is_message;
use tokio::sync::{mpsc, oneshot, Mutex};
use util::Conn;

use super::agent_internal::Cmd;
use super::{Agent, SelectedPair, SelectedPairs};
use crate::error::*;
use crate::stream::DataPacket;

impl Agent {
    /// Wraps one component as a `Conn`, the shape the rest of the stack
    /// plugs transports in as. Reads deliver the component's application
    /// data; writes go over the selected pair.
    pub async fn component_conn(
        &self,
        stream_id: u32,
        component_id: u16,
    ) -> Result<Arc<ComponentConn>> {
        let rx = self.attach_recv(stream_id, component_id).await?;
        Ok(Arc::new(ComponentConn {
            cmd_tx: self.cmd_tx(),
            stream_id,
            component_id,
            selected_pairs: self.selected_pairs_handle(),
            rx: Mutex::new(rx),
        }))
    }

    pub(crate) fn cmd_tx(&self) -> mpsc::Sender<Cmd> {
        self.cmd_tx.clone()
    }

    pub(crate) fn selected_pairs_handle(&self) -> SelectedPairs {
        Arc::clone(&self.selected_pairs)
    }
}

/// A `Conn` view of one component: datagram reads and writes bound to the
/// component's selected pair.
pub struct ComponentConn {
    cmd_tx: mpsc::Sender<Cmd>,
    stream_id: u32,
    component_id: u16,
    selected_pairs: SelectedPairs,
    rx: Mutex<mpsc::UnboundedReceiver<DataPacket>>,
}

impl ComponentConn {
    fn selected(&self) -> Option<SelectedPair> {
        let snapshot = self.selected_pairs.load();
        snapshot.as_ref().and_then(|pairs| {
            pairs
                .iter()
                .find(|p| p.stream_id == self.stream_id && p.component_id == self.component_id)
                .cloned()
        })
    }
}

#[async_trait]
impl Conn for ComponentConn {
    async fn connect(&self, _addr: SocketAddr) -> std::result::Result<(), util::Error> {
        Err(io::Error::new(io::ErrorKind::Other, "Not applicable").into())
    }

    async fn recv(&self, buf: &mut [u8]) -> std::result::Result<usize, util::Error> {
        let (n, _) = self.recv_from(buf).await?;
        Ok(n)
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> std::result::Result<(usize, SocketAddr), util::Error> {
        let mut rx = self.rx.lock().await;
        let packet = rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "Conn is closed"))
            .map_err(util::Error::from)?;
        let n = packet.data.len().min(buf.len());
        buf[..n].copy_from_slice(&packet.data[..n]);
        Ok((n, packet.from))
    }

    async fn send(&self, buf: &[u8]) -> std::result::Result<usize, util::Error> {
        // STUN belongs to the agent, not the application.
        if is_message(buf) {
            return Err(util::Error::Other("ErrIceWriteStunMessage".into()));
        }

        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Send {
                stream_id: self.stream_id,
                component_id: self.component_id,
                data: buf.to_vec(),
                reply: tx,
            })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "Conn is closed"))
            .map_err(util::Error::from)?;
        let sent = rx
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "Conn is closed"))
            .map_err(util::Error::from)?;
        sent.map_err(|e| util::Error::Other(e.to_string()))
    }

    async fn send_to(
        &self,
        _buf: &[u8],
        _target: SocketAddr,
    ) -> std::result::Result<usize, util::Error> {
        Err(io::Error::new(io::ErrorKind::Other, "Not applicable").into())
    }

    async fn local_addr(&self) -> std::result::Result<SocketAddr, util::Error> {
        if let Some(pair) = self.selected() {
            Ok(pair.local.addr)
        } else {
            Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "Addr Not Available").into())
        }
    }

    async fn remote_addr(&self) -> Option<SocketAddr> {
        self.selected().map(|pair| pair.remote.addr)
    }

    async fn close(&self) -> std::result::Result<(), util::Error> {
        Ok(())
    }
}
