use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};
use waitgroup::Worker;

use super::framing::{frame_len, frame_rfc4571, strip_rfc4571, TcpFraming};
use super::{NetEvent, NetEventTx, SocketId, RECEIVE_MTU};
use crate::error::*;

/// Appends to a bounded queue, discarding the oldest queued packet when
/// full. Returns whether a packet was dropped. The in-flight head is not
/// part of the queue and thus never a drop victim.
pub(crate) fn push_bounded(
    queue: &mut VecDeque<Vec<u8>>,
    max_queue: usize,
    framed: Vec<u8>,
) -> bool {
    let dropped = queue.len() >= max_queue;
    if dropped {
        queue.pop_front();
    }
    queue.push_back(framed);
    dropped
}

struct TxState {
    queue: VecDeque<Vec<u8>>,
    max_queue: usize,
    overflowed: bool,
    closed: bool,
}

struct TxShared {
    state: Mutex<TxState>,
    notify: Notify,
}

/// An established, framed TCP connection between two candidates (or to a
/// TURN server). Outbound packets go through a bounded queue drained by a
/// writer task; inbound bytes are re-assembled into whole packets by a
/// reader task.
pub struct TcpEstablishedSocket {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub framing: TcpFraming,
    tx: Arc<TxShared>,
    net_tx: NetEventTx,
    id: SocketId,
    closed_tx: Option<broadcast::Sender<()>>,
}

impl TcpEstablishedSocket {
    pub(crate) fn start(
        stream: TcpStream,
        id: SocketId,
        framing: TcpFraming,
        max_queue: usize,
        net_tx: NetEventTx,
        worker: Worker,
    ) -> Result<Self> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let tx = Arc::new(TxShared {
            state: Mutex::new(TxState {
                queue: VecDeque::new(),
                max_queue,
                overflowed: false,
                closed: false,
            }),
            notify: Notify::new(),
        });

        let (closed_tx, closed_rx) = broadcast::channel(1);

        let sock = Self {
            local_addr,
            remote_addr,
            framing,
            tx: Arc::clone(&tx),
            net_tx: net_tx.clone(),
            id,
            closed_tx: Some(closed_tx),
        };

        sock.spawn_reader(read_half, closed_rx, worker.clone());
        sock.spawn_writer(write_half, tx, net_tx, worker);

        Ok(sock)
    }

    fn spawn_reader(
        &self,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        mut closed_rx: broadcast::Receiver<()>,
        worker: Worker,
    ) {
        let id = self.id;
        let framing = self.framing;
        let remote = self.remote_addr;
        let net_tx = self.net_tx.clone();

        tokio::spawn(async move {
            let _w = worker;
            let mut chunk = vec![0u8; RECEIVE_MTU];
            let mut pending: Vec<u8> = vec![];
            loop {
                let n = tokio::select! {
                    result = read_half.read(&mut chunk) => match result {
                        Ok(0) | Err(_) => {
                            let _ = net_tx.send(NetEvent::SocketClosed { socket: id });
                            return;
                        }
                        Ok(n) => n,
                    },
                    _ = closed_rx.recv() => return,
                };

                pending.extend_from_slice(&chunk[..n]);
                while let Some(total) = frame_len(framing, &pending) {
                    let frame: Vec<u8> = pending.drain(..total).collect();
                    let data = match framing {
                        TcpFraming::Rfc4571 => strip_rfc4571(&frame).to_vec(),
                        TcpFraming::Turn => frame,
                    };
                    let _ = net_tx.send(NetEvent::Packet {
                        socket: id,
                        from: remote,
                        data,
                    });
                }
            }
        });
    }

    fn spawn_writer(
        &self,
        mut write_half: tokio::net::tcp::OwnedWriteHalf,
        tx: Arc<TxShared>,
        net_tx: NetEventTx,
        worker: Worker,
    ) {
        let id = self.id;
        tokio::spawn(async move {
            let _w = worker;
            loop {
                let next = {
                    let mut state = tx.state.lock().unwrap();
                    if state.closed {
                        return;
                    }
                    let popped = state.queue.pop_front();
                    if popped.is_none() && state.overflowed {
                        // Queue fully drained after an overflow.
                        state.overflowed = false;
                        let _ = net_tx.send(NetEvent::Writable { socket: id });
                    }
                    popped
                };

                match next {
                    Some(packet) => {
                        if write_half.write_all(&packet).await.is_err() {
                            let mut state = tx.state.lock().unwrap();
                            state.closed = true;
                            let _ = net_tx.send(NetEvent::SocketClosed { socket: id });
                            return;
                        }
                    }
                    None => tx.notify.notified().await,
                }
            }
        });
    }

    /// Queues one packet for transmission, applying stream framing.
    /// When the queue is full the oldest queued packet is discarded (the
    /// in-flight head lives in the writer and is never dropped) and an
    /// overflow event is raised.
    pub(crate) fn enqueue(&mut self, payload: &[u8]) -> Result<usize> {
        if payload.len() > u16::MAX as usize {
            return Err(Error::ErrWriting);
        }

        let framed = match self.framing {
            TcpFraming::Rfc4571 => frame_rfc4571(payload),
            TcpFraming::Turn => payload.to_vec(),
        };

        {
            let mut guard = self.tx.state.lock().unwrap();
            let state = &mut *guard;
            if state.closed {
                return Err(Error::ErrWriting);
            }
            if push_bounded(&mut state.queue, state.max_queue, framed) && !state.overflowed {
                state.overflowed = true;
                let _ = self.net_tx.send(NetEvent::Overflow { socket: self.id });
            }
        }
        self.tx.notify.notify_one();

        Ok(payload.len())
    }

    pub(crate) fn tx_queue_len(&self) -> usize {
        self.tx.state.lock().unwrap().queue.len()
    }

    pub(crate) fn close(&mut self) {
        self.closed_tx.take();
        {
            let mut state = self.tx.state.lock().unwrap();
            state.closed = true;
            state.queue.clear();
        }
        self.tx.notify.notify_one();
    }
}
