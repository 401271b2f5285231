use std::net::SocketAddr;

use stun::attributes::*;
use stun::error_code::{
    ErrorCodeAttribute, CODE_BAD_REQUEST, CODE_UNAUTHORIZED, CODE_UNKNOWN_ATTRIBUTE,
};
use stun::fingerprint::FINGERPRINT;
use stun::message::*;
use stun::uattrs::UnknownAttributes;

use super::agent_internal::*;
use super::AgentEvent;
use crate::socket::framing::TcpFraming;
use crate::socket::tcp_established::TcpEstablishedSocket;
use crate::socket::turn_sock::TurnSocket;
use crate::socket::{send_on_socket, NetEvent, Socket, SocketId, SocketKind};
use crate::stream::DataPacket;

/// Comprehension-required attributes this agent understands in peer
/// checks. Anything else below 0x8000 draws a 420.
const KNOWN_REQUIRED_ATTRS: &[AttrType] = &[
    ATTR_MAPPED_ADDRESS,
    ATTR_USERNAME,
    ATTR_MESSAGE_INTEGRITY,
    ATTR_ERROR_CODE,
    ATTR_UNKNOWN_ATTRIBUTES,
    ATTR_REALM,
    ATTR_NONCE,
    ATTR_XORMAPPED_ADDRESS,
    ATTR_PRIORITY,
    ATTR_USE_CANDIDATE,
];

impl AgentInternal {
    /// Everything the socket tasks report lands here.
    pub(crate) async fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Packet { socket, from, data } => {
                self.route_packet(socket, from, data).await;
            }
            NetEvent::TcpAccepted {
                listener,
                stream,
                from,
            } => {
                self.on_tcp_accepted(listener, stream, from);
            }
            NetEvent::TcpConnected { active, to, stream } => {
                self.on_tcp_connected(active, to, stream).await;
            }
            NetEvent::TcpConnectFailed { active, to } => {
                self.on_tcp_connect_failed(active, to);
            }
            NetEvent::TurnTcpReady { socket, stream } => {
                self.on_turn_tcp_ready(socket, stream);
            }
            NetEvent::TurnTcpFailed { socket, server } => {
                self.on_turn_tcp_failed(socket, Some(server));
            }
            NetEvent::SocketClosed { socket } => {
                self.on_socket_closed(socket);
            }
            NetEvent::Writable { socket } => {
                if let Some((stream_id, component_id)) = self.socket_component(socket) {
                    if let Some(component) = self.component_mut(stream_id, component_id) {
                        component.writable = true;
                    }
                    self.emit(AgentEvent::ReliableTransportWritable {
                        stream_id,
                        component_id,
                    });
                }
            }
            NetEvent::Overflow { socket } => {
                if let Some((stream_id, component_id)) = self.socket_component(socket) {
                    if let Some(component) = self.component_mut(stream_id, component_id) {
                        component.writable = false;
                    }
                    self.emit(AgentEvent::ReliableTransportOverflow {
                        stream_id,
                        component_id,
                    });
                }
            }
        }
    }

    fn socket_component(&self, socket: SocketId) -> Option<(u32, u16)> {
        self.sockets
            .get(socket)
            .map(|s| (s.stream_id, s.component_id))
    }

    /// Framing check and classification for one inbound packet. Invalid
    /// STUN is application data and goes to the attached sink.
    pub(crate) fn route_packet(
        &mut self,
        socket: SocketId,
        from: SocketAddr,
        data: Vec<u8>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        let (stream_id, component_id, turn_wrapper) = match self.sockets.get(socket) {
            Some(s) => (s.stream_id, s.component_id, s.turn_wrapper),
            None => return,
        };

        if !stun::message::is_message(&data) || data.len() > super::agent_config::MAX_STUN_PAYLOAD {
            self.deliver_app_data(stream_id, component_id, from, data);
            return;
        }

        let mut msg = Message::new();
        if msg.write(&data).is_err() {
            self.deliver_app_data(stream_id, component_id, from, data);
            return;
        }

        // Traffic from the TURN server on a wrapped base socket: unwrap
        // Data indications back onto the relay socket, everything else is
        // server signalling handled below.
        if let Some(wrapper) = turn_wrapper {
            let is_server = self
                .sockets
                .get(wrapper)
                .map(|s| match &s.kind {
                    SocketKind::Turn(t) => t.server_addr == from,
                    _ => false,
                })
                .unwrap_or(false);
            if is_server {
                if let Some((peer, payload)) = TurnSocket::decapsulate(&msg) {
                    // Re-enter with the relay socket as the receiving
                    // socket and the true peer as the source.
                    self.route_packet(wrapper, peer, payload).await;
                    return;
                }
            }
        }

        if msg.typ.class == CLASS_REQUEST {
            self.handle_inbound_request(socket, stream_id, component_id, from, &mut msg)
                .await;
        } else if msg.typ.class == CLASS_INDICATION {
            // Binding indications are keepalives; nothing to answer.
            log::trace!(
                "[{}]: keepalive indication from {} on stream {}",
                self.get_name(),
                from,
                stream_id
            );
        } else if msg.typ.class == CLASS_SUCCESS_RESPONSE
            || msg.typ.class == CLASS_ERROR_RESPONSE
        {
            self.handle_inbound_response(from, &mut msg).await;
        }
        })
    }

    fn deliver_app_data(
        &mut self,
        stream_id: u32,
        component_id: u16,
        from: SocketAddr,
        data: Vec<u8>,
    ) {
        if let Some(component) = self.component_mut(stream_id, component_id) {
            if let Some(tx) = &component.data_tx {
                let _ = tx.send(DataPacket { data, from });
            } else {
                log::trace!(
                    "[{}]: dropping {} bytes, no receive sink attached",
                    self.get_name(),
                    data.len()
                );
            }
        }
    }

    /// Validates an inbound request and feeds it to the check engine,
    /// answering protocol errors per STUN semantics.
    async fn handle_inbound_request(
        &mut self,
        socket: SocketId,
        stream_id: u32,
        component_id: u16,
        from: SocketAddr,
        msg: &mut Message,
    ) {
        if msg.typ.method != METHOD_BINDING {
            log::trace!(
                "[{}]: unhandled STUN method {} from {}",
                self.get_name(),
                msg.typ.method,
                from
            );
            return;
        }

        // Unknown comprehension-required attributes draw a 420 listing
        // them.
        let unknown: Vec<AttrType> = msg
            .attributes
            .0
            .iter()
            .map(|a| a.typ)
            .filter(|t| t.required() && !KNOWN_REQUIRED_ATTRS.contains(t))
            .collect();
        if !unknown.is_empty() {
            self.send_error_response(
                socket,
                from,
                msg,
                CODE_UNKNOWN_ATTRIBUTE,
                Some(UnknownAttributes(unknown)),
            )
            .await;
            return;
        }

        // The username prefix picks the credential set: a per-candidate
        // username first, the stream ufrag otherwise.
        let prefix = crate::util::username_prefix(msg);
        let password = prefix.as_deref().and_then(|p| self.password_for_ufrag(stream_id, p));
        let password = match password {
            Some(pwd) => pwd,
            None => {
                log::warn!(
                    "[{}]: discarding request from {}, unknown username",
                    self.get_name(),
                    from
                );
                self.send_error_response(socket, from, msg, CODE_BAD_REQUEST, None)
                    .await;
                return;
            }
        };

        if crate::util::assert_inbound_message_integrity(msg, password.as_bytes()).is_err() {
            log::warn!(
                "[{}]: integrity check failed for request from {}",
                self.get_name(),
                from
            );
            self.send_error_response(socket, from, msg, CODE_UNAUTHORIZED, None)
                .await;
            return;
        }

        self.handle_inbound_check(stream_id, component_id, socket, from, msg)
            .await;
    }

    /// The password a peer must have used given the receiver-side ufrag
    /// it put in USERNAME.
    fn password_for_ufrag(&self, stream_id: u32, ufrag: &str) -> Option<String> {
        let stream = self.stream(stream_id)?;
        for component in &stream.components {
            for id in &component.local_candidates {
                if let Some(candidate) = self.candidates.get(*id) {
                    if candidate.username.as_deref() == Some(ufrag) {
                        return candidate.password.clone();
                    }
                }
            }
        }
        if stream.local_credentials.ufrag == ufrag {
            return Some(stream.local_credentials.pwd.clone());
        }
        None
    }

    /// Routes a response by transaction id across the subsystems that
    /// may be waiting on it. A forgotten id matches nothing and the
    /// response dies here.
    async fn handle_inbound_response(&mut self, from: SocketAddr, msg: &mut Message) {
        let owner = match self.transactions.take(&msg.transaction_id) {
            Some(owner) => owner,
            None => {
                log::trace!(
                    "[{}]: response from {} with unknown transaction id",
                    self.get_name(),
                    from
                );
                return;
            }
        };

        match owner {
            TransactionOwner::Pair(pair_id) => {
                // Conncheck answers are short-term authenticated with the
                // remote password.
                let pwd = self
                    .pairs
                    .get(pair_id)
                    .and_then(|p| {
                        let stream = self.stream(p.stream_id)?;
                        let remote = self.candidates.get(p.remote)?;
                        Some(
                            remote
                                .password
                                .clone()
                                .unwrap_or_else(|| stream.remote_credentials.pwd.clone()),
                        )
                    })
                    .unwrap_or_default();
                if msg.typ.class == CLASS_SUCCESS_RESPONSE
                    && !pwd.is_empty()
                    && crate::util::assert_inbound_message_integrity(msg, pwd.as_bytes()).is_err()
                {
                    log::warn!(
                        "[{}]: discarding response from {}, bad integrity",
                        self.get_name(),
                        from
                    );
                    return;
                }
                self.handle_check_response(pair_id, msg, from).await;
            }
            TransactionOwner::Discovery(id) => {
                self.handle_discovery_response(id, msg, from).await;
            }
            TransactionOwner::Refresh(id) => {
                self.handle_refresh_response(id, msg, from).await;
            }
            TransactionOwner::Keepalive { stream_id, .. } => {
                log::trace!(
                    "[{}]: keepalive answer from {} on stream {}",
                    self.get_name(),
                    from,
                    stream_id
                );
            }
        }
    }

    async fn send_error_response(
        &mut self,
        socket: SocketId,
        from: SocketAddr,
        request: &Message,
        code: stun::error_code::ErrorCode,
        unknown: Option<UnknownAttributes>,
    ) {
        let mut out = Message::new();
        let built = {
            let mut setters: Vec<Box<dyn Setter>> = vec![
                Box::new(request.clone()),
                Box::new(BINDING_ERROR),
                Box::new(ErrorCodeAttribute {
                    code,
                    reason: vec![],
                }),
            ];
            if let Some(unknown) = unknown {
                setters.push(Box::new(unknown));
            }
            setters.push(Box::new(FINGERPRINT));
            out.build(&setters).is_ok()
        };
        if built {
            let _ = send_on_socket(&mut self.sockets, socket, &out.raw, from).await;
        }
    }

    // ---- TCP lifecycle -------------------------------------------------

    fn on_tcp_accepted(
        &mut self,
        listener: SocketId,
        stream: tokio::net::TcpStream,
        from: SocketAddr,
    ) {
        let (stream_id, component_id) = match self.socket_component(listener) {
            Some(ids) => ids,
            None => return,
        };
        let max_queue = self
            .stream(stream_id)
            .map(|s| s.max_tcp_queue_size)
            .unwrap_or(crate::stream::DEFAULT_MAX_TCP_QUEUE_SIZE);

        log::debug!(
            "[{}]: accepted tcp connection from {} on stream {}",
            self.get_name(),
            from,
            stream_id
        );

        // Register first so the reader task reports under the right id.
        let mut placeholder = Socket::new(
            stream_id,
            component_id,
            SocketKind::TcpPassive(crate::socket::tcp_passive::TcpPassiveSocket::new(from)),
        );
        placeholder.parent = Some(listener);
        let socket_id = self.register_socket(placeholder);
        match TcpEstablishedSocket::start(
            stream,
            socket_id,
            TcpFraming::Rfc4571,
            max_queue,
            self.net_tx.clone(),
            self.socket_tasks.worker(),
        ) {
            Ok(established) => {
                if let Some(entry) = self.sockets.get_mut(socket_id) {
                    entry.kind = SocketKind::TcpEstablished(established);
                }
            }
            Err(err) => {
                log::warn!("[{}]: failed to adopt tcp conn: {}", self.get_name(), err);
                self.sockets.remove(socket_id);
            }
        }
    }

    async fn on_tcp_connected(
        &mut self,
        active: SocketId,
        to: SocketAddr,
        stream: tokio::net::TcpStream,
    ) {
        let (stream_id, component_id) = match self.socket_component(active) {
            Some(ids) => ids,
            None => return,
        };
        let max_queue = self
            .stream(stream_id)
            .map(|s| s.max_tcp_queue_size)
            .unwrap_or(crate::stream::DEFAULT_MAX_TCP_QUEUE_SIZE);

        let mut placeholder = Socket::new(
            stream_id,
            component_id,
            SocketKind::TcpPassive(crate::socket::tcp_passive::TcpPassiveSocket::new(to)),
        );
        placeholder.parent = Some(active);
        let socket_id = self.register_socket(placeholder);
        let established = match TcpEstablishedSocket::start(
            stream,
            socket_id,
            TcpFraming::Rfc4571,
            max_queue,
            self.net_tx.clone(),
            self.socket_tasks.worker(),
        ) {
            Ok(established) => established,
            Err(err) => {
                log::warn!("[{}]: failed to adopt tcp conn: {}", self.get_name(), err);
                self.sockets.remove(socket_id);
                self.on_tcp_connect_failed(active, to);
                return;
            }
        };
        if let Some(entry) = self.sockets.get_mut(socket_id) {
            entry.kind = SocketKind::TcpEstablished(established);
        }

        // Flush the packets queued while connecting.
        let (pending, stale) = match self.sockets.get_mut(active) {
            Some(entry) => match &mut entry.kind {
                SocketKind::TcpActive(a) => {
                    (a.take_pending(&to), a.register_established(to, socket_id))
                }
                _ => (vec![], None),
            },
            None => (vec![], None),
        };
        if let Some(stale) = stale {
            log::debug!(
                "[{}]: replacing stale tcp conn towards {}",
                self.get_name(),
                to
            );
            crate::socket::close_socket(&mut self.sockets, stale).await;
            self.sockets.remove(stale);
        }
        for packet in pending {
            let _ = send_on_socket(&mut self.sockets, socket_id, &packet, to).await;
        }
    }

    fn on_tcp_connect_failed(&mut self, active: SocketId, to: SocketAddr) {
        if let Some(entry) = self.sockets.get_mut(active) {
            if let SocketKind::TcpActive(a) = &mut entry.kind {
                let dropped = a.take_pending(&to);
                log::debug!(
                    "[{}]: tcp connect to {} failed, {} packet(s) dropped",
                    self.get_name(),
                    to,
                    dropped.len()
                );
            }
        }

        // Pairs towards that remote can never complete on this socket.
        let affected: Vec<crate::candidate::PairId> = self
            .pairs
            .iter()
            .filter(|(_, p)| {
                let local_socket = self
                    .candidates
                    .get(p.local)
                    .and_then(|c| c.socket);
                let remote_addr = self.candidates.get(p.remote).map(|c| c.addr);
                local_socket == Some(active) && remote_addr == Some(to)
            })
            .map(|(id, _)| id)
            .collect();
        for pair_id in affected {
            let info = {
                if let Some(pair) = self.pairs.get_mut(pair_id) {
                    pair.state = crate::state::CandidatePairState::Failed;
                    let txn = pair.transaction.take();
                    Some((pair.stream_id, pair.component_id, txn))
                } else {
                    None
                }
            };
            if let Some((stream_id, component_id, txn)) = info {
                if let Some(txn) = txn {
                    self.transactions.forget(&txn.id);
                }
                self.update_component_readiness(stream_id, component_id);
            }
        }
    }

    fn on_socket_closed(&mut self, socket: SocketId) {
        // Only the closed connection goes away; sibling connections of
        // the same active socket keep running.
        let is_established = self
            .sockets
            .get(socket)
            .map(|s| matches!(s.kind, SocketKind::TcpEstablished(_)))
            .unwrap_or(false);
        if !is_established {
            return;
        }

        let active_ids: Vec<SocketId> = self
            .sockets
            .iter()
            .filter(|(_, s)| matches!(s.kind, SocketKind::TcpActive(_)))
            .map(|(id, _)| id)
            .collect();
        for id in active_ids {
            if let Some(entry) = self.sockets.get_mut(id) {
                if let SocketKind::TcpActive(a) = &mut entry.kind {
                    a.forget_established(socket);
                }
            }
        }

        if let Some((stream_id, component_id)) = self.socket_component(socket) {
            if let Some(component) = self.component_mut(stream_id, component_id) {
                component.sockets.retain(|id| *id != socket);
            }
        }
        self.sockets.remove(socket);
    }
}
