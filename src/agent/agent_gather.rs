use std::net::SocketAddr;
use std::sync::Arc;

use stun::addr::MappedAddress;
use stun::agent::TransactionId;
use stun::error_code::ErrorCodeAttribute;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::{Nonce, Realm, Username};
use stun::xoraddr::XorMappedAddress;
use tokio::time::{Duration, Instant};
use turn::proto::lifetime::Lifetime;
use turn::proto::relayaddr::RelayedAddress;
use turn::proto::reqtrans::RequestedTransport;
use turn::proto::PROTO_UDP;

use super::agent_config::DISCOVERY_RTO;
use super::agent_internal::*;
use super::AgentEvent;
use crate::candidate::*;
use crate::compat::TurnCompatibility;
use crate::error::*;
use crate::socket::framing::TcpFraming;
use crate::socket::tcp_established::TcpEstablishedSocket;
use crate::socket::udp::UdpSocketWrap;
use crate::socket::{
    send_on_socket, socket_is_reliable, NetEvent, Socket, SocketId, SocketKind,
};
use crate::state::ComponentState;
use crate::stream::PortRange;
use crate::transaction::{
    StunTimer, StunTransaction, TimerCheck, STUN_TIMER_DEFAULT_MAX_RETRANSMISSIONS,
};

const TURN_TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Seconds subtracted from the allocation lifetime when scheduling the
/// next refresh.
pub(crate) const ALLOCATION_REFRESH_MARGIN_SECS: u32 = 30;

impl AgentInternal {
    /// Binds host sockets, creates host candidates and queues the
    /// server-reflexive and relay discoveries. The pacing tick drives the
    /// queued items afterwards.
    pub(crate) async fn gather_candidates(&mut self, stream_id: u32) -> Result<bool> {
        if self.stream(stream_id).is_none() {
            return Err(Error::ErrStreamNotFound);
        }
        if self.local_addresses.is_empty() {
            log::warn!(
                "[{}]: gather without local addresses, nothing to do",
                self.get_name()
            );
            return Ok(false);
        }

        {
            let stream = self.stream_mut(stream_id).unwrap();
            stream.gathering = true;
            stream.gathering_started = true;
        }

        let component_ids: Vec<u16> = self
            .stream(stream_id)
            .map(|s| s.components.iter().map(|c| c.id).collect())
            .unwrap_or_default();

        for component_id in component_ids {
            self.set_component_state(stream_id, component_id, ComponentState::Gathering);
            self.gather_component(stream_id, component_id).await;
        }

        // Nothing queued: gathering is already complete.
        self.check_gathering_done();
        Ok(true)
    }

    async fn gather_component(&mut self, stream_id: u32, component_id: u16) {
        let addresses = self.local_addresses.clone();
        let (enable_udp, enable_tcp_active, enable_tcp_passive, udp_range, tcp_range) = {
            let component = match self.component(stream_id, component_id) {
                Some(c) => c,
                None => return,
            };
            (
                component.enable_udp,
                component.enable_tcp_active,
                component.enable_tcp_passive,
                component.udp_port_range,
                component.tcp_active_port_range,
            )
        };

        for ip in addresses {
            if enable_udp {
                if let Err(err) = self
                    .gather_host_udp(stream_id, component_id, ip, udp_range)
                    .await
                {
                    log::warn!(
                        "[{}]: could not gather udp host on {}: {}",
                        self.get_name(),
                        ip,
                        err
                    );
                }
            }
            if enable_tcp_passive {
                if let Err(err) = self
                    .gather_host_tcp_passive(stream_id, component_id, ip, tcp_range)
                    .await
                {
                    log::warn!(
                        "[{}]: could not gather tcp-pass host on {}: {}",
                        self.get_name(),
                        ip,
                        err
                    );
                }
            }
            if enable_tcp_active {
                self.gather_host_tcp_active(stream_id, component_id, ip);
            }
        }

        self.queue_discoveries(stream_id, component_id).await;
    }

    async fn gather_host_udp(
        &mut self,
        stream_id: u32,
        component_id: u16,
        ip: std::net::IpAddr,
        range: PortRange,
    ) -> Result<()> {
        let conn = crate::util::listen_udp_in_port_range(
            &self.net,
            range,
            SocketAddr::new(ip, 0),
        )
        .await?;
        let local_addr = conn.local_addr().await?;

        let socket = Socket::new(
            stream_id,
            component_id,
            SocketKind::Udp(UdpSocketWrap::new(conn, local_addr)),
        );
        let socket_id = self.register_socket(socket);
        if let SocketKind::Udp(u) = &mut self.sockets.get_mut(socket_id).unwrap().kind {
            u.start(socket_id, self.net_tx.clone(), self.socket_tasks.worker());
        }

        self.add_local_candidate(Candidate {
            id: crate::rand::generate_cand_id(),
            kind: CandidateKind::Host,
            transport: TransportType::Udp,
            addr: local_addr,
            base_addr: local_addr,
            priority: 0,
            foundation: String::new(),
            local_foundation: 0,
            stream_id,
            component_id,
            username: None,
            password: None,
            turn: None,
            socket: Some(socket_id),
        });
        Ok(())
    }

    async fn gather_host_tcp_passive(
        &mut self,
        stream_id: u32,
        component_id: u16,
        ip: std::net::IpAddr,
        range: PortRange,
    ) -> Result<()> {
        let listener = bind_tcp_in_port_range(ip, range).await?;
        let local_addr = listener.local_addr()?;

        let socket = Socket::new(
            stream_id,
            component_id,
            SocketKind::TcpPassive(crate::socket::tcp_passive::TcpPassiveSocket::new(local_addr)),
        );
        let socket_id = self.register_socket(socket);
        if let SocketKind::TcpPassive(p) = &mut self.sockets.get_mut(socket_id).unwrap().kind {
            p.start(
                socket_id,
                listener,
                self.net_tx.clone(),
                self.socket_tasks.worker(),
            );
        }

        self.add_local_candidate(Candidate {
            id: crate::rand::generate_cand_id(),
            kind: CandidateKind::Host,
            transport: TransportType::TcpPassive,
            addr: local_addr,
            base_addr: local_addr,
            priority: 0,
            foundation: String::new(),
            local_foundation: 0,
            stream_id,
            component_id,
            username: None,
            password: None,
            turn: None,
            socket: Some(socket_id),
        });
        Ok(())
    }

    /// Active TCP candidates advertise the discard port; connections are
    /// opened on demand from an ephemeral local port.
    fn gather_host_tcp_active(&mut self, stream_id: u32, component_id: u16, ip: std::net::IpAddr) {
        let local_addr = SocketAddr::new(ip, 0);
        let socket = Socket::new(
            stream_id,
            component_id,
            SocketKind::TcpActive(crate::socket::tcp_active::TcpActiveSocket::new(
                local_addr,
                self.net_tx.clone(),
            )),
        );
        let socket_id = self.register_socket(socket);

        self.add_local_candidate(Candidate {
            id: crate::rand::generate_cand_id(),
            kind: CandidateKind::Host,
            transport: TransportType::TcpActive,
            addr: SocketAddr::new(ip, crate::addr::DISCARD_PORT),
            base_addr: SocketAddr::new(ip, crate::addr::DISCARD_PORT),
            priority: 0,
            foundation: String::new(),
            local_foundation: 0,
            stream_id,
            component_id,
            username: None,
            password: None,
            turn: None,
            socket: Some(socket_id),
        });
    }

    pub(crate) fn register_socket(&mut self, socket: Socket) -> SocketId {
        let stream_id = socket.stream_id;
        let component_id = socket.component_id;
        let id = self.sockets.insert(socket);
        if let Some(component) = self.component_mut(stream_id, component_id) {
            component.sockets.push(id);
        }
        id
    }

    /// Queues server-reflexive and relay discovery items for every UDP
    /// host candidate of the component.
    async fn queue_discoveries(&mut self, stream_id: u32, component_id: u16) {
        let stun_server = self
            .component(stream_id, component_id)
            .and_then(|c| c.stun_server)
            .or(self.stun_server);
        let mut turn_servers: Vec<Arc<TurnServer>> = self
            .component(stream_id, component_id)
            .map(|c| c.turn_servers.clone())
            .unwrap_or_default();
        if turn_servers.is_empty() {
            turn_servers = self.turn_servers.clone();
        }

        let host_sockets: Vec<(SocketId, TransportType)> = self
            .component(stream_id, component_id)
            .map(|c| c.local_candidates.clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| self.candidates.get(id))
            .filter(|c| c.kind == CandidateKind::Host && c.transport == TransportType::Udp)
            .filter_map(|c| c.socket.map(|s| (s, c.transport)))
            .collect();

        for (socket, transport) in &host_sockets {
            if let Some(server) = stun_server {
                self.discoveries.insert(DiscoveryItem {
                    kind: DiscoveryKind::ServerReflexive,
                    socket: *socket,
                    server,
                    turn: None,
                    stream_id,
                    component_id,
                    transport: *transport,
                    pending: false,
                    done: false,
                    transport_ready: true,
                    transaction: None,
                    realm: None,
                    nonce: None,
                });
            }
        }

        for turn in turn_servers {
            match turn.relay_type {
                RelayType::Udp => {
                    for (socket, transport) in &host_sockets {
                        self.discoveries.insert(DiscoveryItem {
                            kind: DiscoveryKind::Relayed,
                            socket: *socket,
                            server: turn.addr,
                            turn: Some(Arc::clone(&turn)),
                            stream_id,
                            component_id,
                            transport: *transport,
                            pending: false,
                            done: false,
                            transport_ready: true,
                            transaction: None,
                            realm: None,
                            nonce: None,
                        });
                    }
                }
                RelayType::Tcp | RelayType::Tls => {
                    self.queue_tcp_relay_discovery(stream_id, component_id, Arc::clone(&turn));
                }
            }
        }
    }

    /// Queues an Allocate discovery whose TCP (optionally proxied)
    /// transport is still being connected by a background task. The item
    /// stays off the pacing schedule until the transport reports in.
    fn queue_tcp_relay_discovery(
        &mut self,
        stream_id: u32,
        component_id: u16,
        turn: Arc<TurnServer>,
    ) {
        let proxy = self.proxy.clone();
        let connect_to = proxy.as_ref().map(|p| p.server).unwrap_or(turn.addr);
        let server = turn.addr;
        let tls = turn.relay_type == RelayType::Tls;

        // Placeholder entry; promoted to the established connection when
        // the connect task reports back.
        let placeholder = Socket::new(
            stream_id,
            component_id,
            SocketKind::TcpActive(crate::socket::tcp_active::TcpActiveSocket::new(
                crate::addr::any_addr_for(&server),
                self.net_tx.clone(),
            )),
        );
        let socket_id = self.register_socket(placeholder);

        self.discoveries.insert(DiscoveryItem {
            kind: DiscoveryKind::Relayed,
            socket: socket_id,
            server,
            turn: Some(turn),
            stream_id,
            component_id,
            transport: TransportType::Udp,
            pending: false,
            done: false,
            transport_ready: false,
            transaction: None,
            realm: None,
            nonce: None,
        });

        let net_tx = self.net_tx.clone();
        let worker = self.socket_tasks.worker();
        tokio::spawn(async move {
            let _w = worker;
            let attempt = async {
                let mut stream = tokio::net::TcpStream::connect(connect_to)
                    .await
                    .map_err(Error::from)?;
                if let Some(proxy) = &proxy {
                    crate::socket::proxy::proxy_connect(proxy, &mut stream, server).await?;
                }
                if tls {
                    crate::socket::proxy::pseudo_ssl_client(&mut stream).await?;
                }
                Ok::<_, Error>(stream)
            };

            match tokio::time::timeout(TURN_TCP_CONNECT_TIMEOUT, attempt).await {
                Ok(Ok(stream)) => {
                    let _ = net_tx.send(NetEvent::TurnTcpReady {
                        socket: socket_id,
                        stream,
                    });
                }
                Ok(Err(err)) => {
                    log::warn!("turn tcp transport to {server} failed: {err}");
                    let _ = net_tx.send(NetEvent::TurnTcpFailed {
                        socket: socket_id,
                        server,
                    });
                }
                Err(_) => {
                    log::warn!("turn tcp transport to {server} timed out");
                    let _ = net_tx.send(NetEvent::TurnTcpFailed {
                        socket: socket_id,
                        server,
                    });
                }
            }
        });
    }

    /// The connect task delivered the TURN TCP transport: promote the
    /// placeholder socket and put the Allocate on the pacing schedule.
    pub(crate) fn on_turn_tcp_ready(&mut self, socket_id: SocketId, stream: tokio::net::TcpStream) {
        let (stream_id, _component_id) = match self.sockets.get(socket_id) {
            Some(s) => (s.stream_id, s.component_id),
            None => return,
        };
        let max_queue = self
            .stream(stream_id)
            .map(|s| s.max_tcp_queue_size)
            .unwrap_or(crate::stream::DEFAULT_MAX_TCP_QUEUE_SIZE);

        match TcpEstablishedSocket::start(
            stream,
            socket_id,
            TcpFraming::Turn,
            max_queue,
            self.net_tx.clone(),
            self.socket_tasks.worker(),
        ) {
            Ok(established) => {
                if let Some(entry) = self.sockets.get_mut(socket_id) {
                    entry.kind = SocketKind::TcpEstablished(established);
                }
                for (_, item) in self.discoveries.iter_mut() {
                    if item.socket == socket_id {
                        item.transport_ready = true;
                    }
                }
            }
            Err(err) => {
                log::warn!("[{}]: failed to adopt turn tcp conn: {}", self.get_name(), err);
                self.on_turn_tcp_failed(socket_id, None);
            }
        }
    }

    pub(crate) fn on_turn_tcp_failed(&mut self, socket_id: SocketId, _server: Option<SocketAddr>) {
        let mut failed: Vec<(u32, u16, SocketAddr)> = vec![];
        for (_, item) in self.discoveries.iter_mut() {
            if item.socket == socket_id && !item.done {
                item.done = true;
                failed.push((item.stream_id, item.component_id, item.server));
            }
        }
        for (stream_id, component_id, server) in failed {
            self.emit(AgentEvent::TurnAllocationFailed {
                stream_id,
                component_id,
                server,
            });
        }
        self.check_gathering_done();
    }

    // ---- pacing --------------------------------------------------------

    /// One Ta step of the discovery engine: start at most one fresh item,
    /// then drive the retransmission timers of everything in flight.
    pub(crate) async fn discovery_tick(&mut self, now: Instant) {
        let fresh = self
            .discoveries
            .iter()
            .find(|(_, d)| !d.pending && !d.done && d.transport_ready)
            .map(|(id, _)| id);
        if let Some(id) = fresh {
            self.start_discovery(id, now).await;
        }

        let in_flight: Vec<DiscoveryId> = self
            .discoveries
            .iter()
            .filter(|(_, d)| d.pending && !d.done && d.transaction.is_some())
            .map(|(id, _)| id)
            .collect();
        for id in in_flight {
            self.refresh_discovery_timer(id, now).await;
        }

        self.check_gathering_done();
    }

    async fn start_discovery(&mut self, id: DiscoveryId, now: Instant) {
        let (kind, socket, server, stream_id, component_id, turn, realm, nonce) = {
            let item = match self.discoveries.get_mut(id) {
                Some(item) => item,
                None => return,
            };
            item.pending = true;
            (
                item.kind,
                item.socket,
                item.server,
                item.stream_id,
                item.component_id,
                item.turn.clone(),
                item.realm.clone(),
                item.nonce.clone(),
            )
        };

        let msg = match kind {
            DiscoveryKind::ServerReflexive => build_binding_discovery(),
            DiscoveryKind::Relayed => {
                build_allocate(turn.as_deref(), realm.as_deref(), nonce.as_deref())
            }
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                log::warn!("[{}]: failed to build discovery: {}", self.get_name(), err);
                if let Some(item) = self.discoveries.get_mut(id) {
                    item.done = true;
                }
                return;
            }
        };

        let timer = if socket_is_reliable(&self.sockets, socket) {
            StunTimer::start_reliable(now)
        } else {
            StunTimer::start(now, DISCOVERY_RTO, STUN_TIMER_DEFAULT_MAX_RETRANSMISSIONS)
        };

        self.transactions
            .register(msg.transaction_id, TransactionOwner::Discovery(id));
        if let Some(item) = self.discoveries.get_mut(id) {
            item.transaction = Some(StunTransaction::new(
                msg.transaction_id,
                msg.raw.clone(),
                timer,
            ));
        }

        log::debug!(
            "[{}]: discovery {:?} -> {} for stream {} component {}",
            self.get_name(),
            kind,
            server,
            stream_id,
            component_id
        );
        if let Err(err) = send_on_socket(&mut self.sockets, socket, &msg.raw, server).await {
            log::warn!("[{}]: discovery send failed: {}", self.get_name(), err);
        }
    }

    async fn refresh_discovery_timer(&mut self, id: DiscoveryId, now: Instant) {
        let (check, socket, server, buffer) = {
            let item = match self.discoveries.get_mut(id) {
                Some(item) => item,
                None => return,
            };
            let txn = match item.transaction.as_mut() {
                Some(txn) => txn,
                None => return,
            };
            (
                txn.timer.refresh(now),
                item.socket,
                item.server,
                txn.buffer.clone(),
            )
        };

        match check {
            TimerCheck::Pending => {}
            TimerCheck::Retransmit => {
                if let Err(err) = send_on_socket(&mut self.sockets, socket, &buffer, server).await {
                    log::debug!("[{}]: discovery resend failed: {}", self.get_name(), err);
                }
            }
            TimerCheck::Timeout => {
                let (kind, stream_id, component_id, txn_id) = {
                    let item = self.discoveries.get_mut(id).unwrap();
                    item.done = true;
                    let txn_id = item.transaction.take().map(|t| t.id);
                    (item.kind, item.stream_id, item.component_id, txn_id)
                };
                if let Some(txn_id) = txn_id {
                    self.transactions.forget(&txn_id);
                }
                log::debug!("[{}]: discovery timed out", self.get_name());
                if kind == DiscoveryKind::Relayed {
                    self.emit(AgentEvent::TurnAllocationFailed {
                        stream_id,
                        component_id,
                        server,
                    });
                }
            }
        }
    }

    /// When no unfinished discovery remains for a gathering stream, the
    /// stream is done and the completion event fires.
    pub(crate) fn check_gathering_done(&mut self) {
        let mut finished: Vec<u32> = vec![];
        for stream in &self.streams {
            if !(stream.gathering && stream.gathering_started) {
                continue;
            }
            let unfinished = self
                .discoveries
                .iter()
                .any(|(_, d)| d.stream_id == stream.id && !d.done);
            if !unfinished {
                finished.push(stream.id);
            }
        }

        for stream_id in finished {
            if let Some(stream) = self.stream_mut(stream_id) {
                stream.gathering = false;
            }
            log::info!("[{}]: gathering done on stream {}", self.get_name(), stream_id);
            self.emit(AgentEvent::CandidateGatheringDone { stream_id });
        }
    }

    // ---- responses -----------------------------------------------------

    /// Routes a response that matched a discovery transaction.
    pub(crate) async fn handle_discovery_response(
        &mut self,
        id: DiscoveryId,
        msg: &Message,
        from: SocketAddr,
    ) {
        let kind = match self.discoveries.get(id) {
            Some(item) => item.kind,
            None => return,
        };
        match kind {
            DiscoveryKind::ServerReflexive => self.handle_srflx_response(id, msg, from),
            DiscoveryKind::Relayed => self.handle_allocate_response(id, msg, from).await,
        }
        self.check_gathering_done();
    }

    fn handle_srflx_response(&mut self, id: DiscoveryId, msg: &Message, _from: SocketAddr) {
        let (socket, stream_id, component_id, transport) = {
            let item = match self.discoveries.get_mut(id) {
                Some(item) => item,
                None => return,
            };
            item.transaction = None;
            (item.socket, item.stream_id, item.component_id, item.transport)
        };

        if msg.typ.class == CLASS_ERROR_RESPONSE {
            // An alternate server re-targets the item and replays it.
            let mut alternate = MappedAddress::default();
            if alternate
                .get_from_as(msg, stun::attributes::ATTR_ALTERNATE_SERVER)
                .is_ok()
            {
                if let Some(item) = self.discoveries.get_mut(id) {
                    item.server = SocketAddr::new(alternate.ip, alternate.port);
                    item.pending = false;
                }
                return;
            }
            if let Some(item) = self.discoveries.get_mut(id) {
                item.done = true;
            }
            return;
        }

        let mut mapped = XorMappedAddress::default();
        if mapped.get_from(msg).is_err() {
            if let Some(item) = self.discoveries.get_mut(id) {
                item.done = true;
            }
            return;
        }

        let base_addr = self
            .sockets
            .get(socket)
            .map(|s| s.local_addr())
            .unwrap_or_else(|| SocketAddr::new(mapped.ip, 0));

        self.add_local_candidate(Candidate {
            id: crate::rand::generate_cand_id(),
            kind: CandidateKind::ServerReflexive,
            transport,
            addr: SocketAddr::new(mapped.ip, mapped.port),
            base_addr,
            priority: 0,
            foundation: String::new(),
            local_foundation: 0,
            stream_id,
            component_id,
            username: None,
            password: None,
            turn: None,
            socket: Some(socket),
        });

        if let Some(item) = self.discoveries.get_mut(id) {
            item.done = true;
        }
    }

    async fn handle_allocate_response(&mut self, id: DiscoveryId, msg: &Message, from: SocketAddr) {
        let (socket, stream_id, component_id, turn, had_realm) = {
            let item = match self.discoveries.get_mut(id) {
                Some(item) => item,
                None => return,
            };
            item.transaction = None;
            (
                item.socket,
                item.stream_id,
                item.component_id,
                item.turn.clone(),
                item.realm.is_some(),
            )
        };
        let turn = match turn {
            Some(turn) => turn,
            None => return,
        };

        if msg.typ.class == CLASS_ERROR_RESPONSE {
            let mut code = ErrorCodeAttribute::default();
            let code_value = code.get_from(msg).map(|_| code.code.0).unwrap_or(0);

            if (code_value == 401 || code_value == 438) && !had_realm {
                // Authentication round: remember realm and nonce, requeue
                // the item so the next tick replays with credentials.
                let realm = Realm::get_from_as(msg, stun::attributes::ATTR_REALM).ok();
                let nonce = Nonce::get_from_as(msg, stun::attributes::ATTR_NONCE).ok();
                if let (Some(realm), Some(nonce)) = (realm, nonce) {
                    if let Some(item) = self.discoveries.get_mut(id) {
                        item.realm = Some(realm.text);
                        item.nonce = Some(nonce.text);
                        item.pending = false;
                    }
                    return;
                }
            }

            log::warn!(
                "[{}]: allocate failed with error {} from {}",
                self.get_name(),
                code_value,
                from
            );
            if let Some(item) = self.discoveries.get_mut(id) {
                item.done = true;
            }
            self.emit(AgentEvent::TurnAllocationFailed {
                stream_id,
                component_id,
                server: turn.addr,
            });
            return;
        }

        let mut relayed = RelayedAddress::default();
        if relayed.get_from(msg).is_err() {
            if let Some(item) = self.discoveries.get_mut(id) {
                item.done = true;
            }
            self.emit(AgentEvent::TurnAllocationFailed {
                stream_id,
                component_id,
                server: turn.addr,
            });
            return;
        }
        let relayed_addr = SocketAddr::new(relayed.ip, relayed.port);

        let mut lifetime = Lifetime::default();
        let lifetime_secs = lifetime
            .get_from(msg)
            .map(|_| lifetime.0.as_secs() as u32)
            .unwrap_or(600);

        // The relay socket rides on the discovery's base socket.
        let turn_socket = Socket::new(
            stream_id,
            component_id,
            SocketKind::Turn(crate::socket::turn_sock::TurnSocket::new(
                socket,
                turn.addr,
                relayed_addr,
            )),
        );
        let relay_socket_id = self.register_socket(turn_socket);
        if let Some(base) = self.sockets.get_mut(socket) {
            base.turn_wrapper = Some(relay_socket_id);
        }

        let base_addr = self
            .sockets
            .get(socket)
            .map(|s| s.local_addr())
            .unwrap_or(relayed_addr);

        let (username, password) = if self.turn_compatibility == TurnCompatibility::Oc2007 {
            (Some(turn.username.clone()), Some(turn.password.clone()))
        } else {
            (None, None)
        };

        let relay_candidate_id = self.add_local_candidate(Candidate {
            id: crate::rand::generate_cand_id(),
            kind: CandidateKind::Relayed,
            transport: TransportType::Udp,
            addr: relayed_addr,
            base_addr: relayed_addr,
            priority: 0,
            foundation: String::new(),
            local_foundation: 0,
            stream_id,
            component_id,
            username,
            password,
            turn: Some(Arc::clone(&turn)),
            socket: Some(relay_socket_id),
        });

        let (realm, nonce) = {
            let item = self.discoveries.get(id);
            (
                item.and_then(|i| i.realm.clone()).unwrap_or_default(),
                item.and_then(|i| i.nonce.clone()).unwrap_or_default(),
            )
        };

        if let Some(candidate) = relay_candidate_id {
            let refresh_after = lifetime_secs.saturating_sub(ALLOCATION_REFRESH_MARGIN_SECS);
            self.refreshes.insert(RefreshItem {
                turn: Arc::clone(&turn),
                stream_id,
                component_id,
                base_socket: socket,
                relay_socket: relay_socket_id,
                candidate,
                realm,
                nonce,
                lifetime_secs,
                next_refresh: Instant::now() + Duration::from_secs(u64::from(refresh_after)),
                transaction: None,
                retried_auth: false,
            });
        }

        // A mapped address in the Allocate response doubles as a
        // server-reflexive discovery when the base socket is unreliable.
        let mut mapped = XorMappedAddress::default();
        if mapped.get_from(msg).is_ok() && !socket_is_reliable(&self.sockets, socket) {
            let mapped_addr = SocketAddr::new(mapped.ip, mapped.port);
            self.add_local_candidate(Candidate {
                id: crate::rand::generate_cand_id(),
                kind: CandidateKind::ServerReflexive,
                transport: TransportType::Udp,
                addr: mapped_addr,
                base_addr,
                priority: 0,
                foundation: String::new(),
                local_foundation: 0,
                stream_id,
                component_id,
                username: None,
                password: None,
                turn: None,
                socket: Some(socket),
            });

            let tcp_active_base: Option<(CandidateId, SocketId)> = self
                .component(stream_id, component_id)
                .map(|c| c.local_candidates.clone())
                .unwrap_or_default()
                .into_iter()
                .filter_map(|cid| self.candidates.get(cid).map(|c| (cid, c)))
                .find(|(_, c)| {
                    c.kind == CandidateKind::Host && c.transport == TransportType::TcpActive
                })
                .and_then(|(cid, c)| c.socket.map(|s| (cid, s)));
            if let Some((_, tcp_socket)) = tcp_active_base {
                let tcp_base = self
                    .sockets
                    .get(tcp_socket)
                    .map(|s| s.local_addr())
                    .unwrap_or(base_addr);
                self.add_local_candidate(Candidate {
                    id: crate::rand::generate_cand_id(),
                    kind: CandidateKind::ServerReflexive,
                    transport: TransportType::TcpActive,
                    addr: SocketAddr::new(mapped_addr.ip(), crate::addr::DISCARD_PORT),
                    base_addr: tcp_base,
                    priority: 0,
                    foundation: String::new(),
                    local_foundation: 0,
                    stream_id,
                    component_id,
                    username: None,
                    password: None,
                    turn: None,
                    socket: Some(tcp_socket),
                });
            }
        }

        if let Some(item) = self.discoveries.get_mut(id) {
            item.done = true;
        }
    }
}

fn build_binding_discovery() -> Result<Message> {
    let mut msg = Message::new();
    msg.build(&[
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(FINGERPRINT),
    ])?;
    Ok(msg)
}

fn build_allocate(
    turn: Option<&TurnServer>,
    realm: Option<&str>,
    nonce: Option<&str>,
) -> Result<Message> {
    let mut setters: Vec<Box<dyn Setter>> = vec![
        Box::new(TransactionId::new()),
        Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_REQUEST)),
        Box::new(RequestedTransport {
            protocol: PROTO_UDP,
        }),
    ];

    if let (Some(turn), Some(realm), Some(nonce)) = (turn, realm, nonce) {
        setters.push(Box::new(Username::new(
            stun::attributes::ATTR_USERNAME,
            turn.username.clone(),
        )));
        setters.push(Box::new(Realm::new(
            stun::attributes::ATTR_REALM,
            realm.to_owned(),
        )));
        setters.push(Box::new(Nonce::new(
            stun::attributes::ATTR_NONCE,
            nonce.to_owned(),
        )));
        setters.push(Box::new(MessageIntegrity::new_long_term_integrity(
            turn.username.clone(),
            realm.to_owned(),
            turn.password.clone(),
        )));
    }
    setters.push(Box::new(FINGERPRINT));

    let mut msg = Message::new();
    msg.build(&setters)?;
    Ok(msg)
}

async fn bind_tcp_in_port_range(
    ip: std::net::IpAddr,
    range: PortRange,
) -> Result<tokio::net::TcpListener> {
    if range.is_unconstrained() {
        return Ok(tokio::net::TcpListener::bind(SocketAddr::new(ip, 0)).await?);
    }
    if range.min > range.max {
        return Err(Error::ErrInvalidPortRange);
    }

    let span = range.max - range.min + 1;
    let start = rand::random::<u16>() % span + range.min;
    let mut port = start;
    loop {
        match tokio::net::TcpListener::bind(SocketAddr::new(ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(err) => log::debug!("failed to listen tcp {ip}:{port}: {err}"),
        }
        port = if port == range.max { range.min } else { port + 1 };
        if port == start {
            break;
        }
    }
    Err(Error::ErrPortRangeExhausted)
}
