use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use util::vnet::net::*;
use waitgroup::WaitGroup;

use super::agent_config::*;
use super::{AgentEvent, SelectedPair, SelectedPairs};
use crate::arena::{Arena, Id};
use crate::candidate::*;
use crate::compat::{IceCompatibility, TurnCompatibility};
use crate::control::Role;
use crate::error::*;
use crate::socket::proxy::ProxyConfig;
use crate::socket::{close_socket, NetEvent, NetEventTx, Socket, SocketId};
use crate::state::ComponentState;
use crate::stats::{CandidatePairStats, CandidateStats, ComponentStats};
use crate::stream::*;
use crate::transaction::{StunTransaction, TransactionTable};

/// Who is waiting for the response to an outstanding transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TransactionOwner {
    Pair(PairId),
    Discovery(DiscoveryId),
    Refresh(RefreshId),
    Keepalive { stream_id: u32, component_id: u16 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DiscoveryKind {
    ServerReflexive,
    Relayed,
}

/// One scheduled gathering transaction: a Binding request towards a STUN
/// server or an Allocate towards a TURN server.
pub(crate) struct DiscoveryItem {
    pub(crate) kind: DiscoveryKind,
    pub(crate) socket: SocketId,
    pub(crate) server: SocketAddr,
    pub(crate) turn: Option<Arc<TurnServer>>,
    pub(crate) stream_id: u32,
    pub(crate) component_id: u16,
    pub(crate) transport: TransportType,
    pub(crate) pending: bool,
    pub(crate) done: bool,
    /// False while a TCP transport towards the server is still being
    /// established; the pacing tick skips the item until then.
    pub(crate) transport_ready: bool,
    pub(crate) transaction: Option<StunTransaction>,
    /// Long-term credential state picked up from a 401/438 answer.
    pub(crate) realm: Option<String>,
    pub(crate) nonce: Option<String>,
}

pub(crate) type DiscoveryId = Id<DiscoveryItem>;

/// Keeps one TURN allocation alive with periodic Refresh transactions.
pub(crate) struct RefreshItem {
    pub(crate) turn: Arc<TurnServer>,
    pub(crate) stream_id: u32,
    pub(crate) component_id: u16,
    pub(crate) base_socket: SocketId,
    pub(crate) relay_socket: SocketId,
    pub(crate) candidate: CandidateId,
    pub(crate) realm: String,
    pub(crate) nonce: String,
    pub(crate) lifetime_secs: u32,
    pub(crate) next_refresh: Instant,
    pub(crate) transaction: Option<StunTransaction>,
    /// A 438/new-realm answer is replayed exactly once.
    pub(crate) retried_auth: bool,
}

pub(crate) type RefreshId = Id<RefreshItem>;

type Reply<T> = oneshot::Sender<T>;

/// Commands posted from the facade into the agent task.
pub(crate) enum Cmd {
    AddStream {
        n_components: u16,
        reply: Reply<u32>,
    },
    RemoveStream {
        stream_id: u32,
        reply: Reply<Result<()>>,
    },
    AddLocalAddress {
        ip: IpAddr,
        reply: Reply<Result<()>>,
    },
    SetPortRange {
        stream_id: u32,
        component_id: u16,
        range: PortRange,
        tcp_active: bool,
        reply: Reply<Result<()>>,
    },
    SetTransport {
        stream_id: u32,
        component_id: u16,
        transport: TransportType,
        enabled: bool,
        reply: Reply<Result<()>>,
    },
    SetRelayInfo {
        stream_id: u32,
        component_id: u16,
        server: SocketAddr,
        username: String,
        password: String,
        relay_type: RelayType,
        reply: Reply<Result<()>>,
    },
    SetStunInfo {
        stream_id: u32,
        component_id: u16,
        server: SocketAddr,
        reply: Reply<Result<()>>,
    },
    SetLocalCredentials {
        stream_id: u32,
        ufrag: String,
        pwd: String,
        reply: Reply<Result<()>>,
    },
    SetRemoteCredentials {
        stream_id: u32,
        ufrag: String,
        pwd: String,
        reply: Reply<Result<()>>,
    },
    GetLocalCredentials {
        stream_id: u32,
        reply: Reply<Result<(String, String)>>,
    },
    GatherCandidates {
        stream_id: u32,
        reply: Reply<Result<bool>>,
    },
    GetLocalCandidates {
        stream_id: u32,
        component_id: u16,
        reply: Reply<Result<Vec<Candidate>>>,
    },
    SetRemoteCandidates {
        stream_id: u32,
        component_id: u16,
        candidates: Vec<RemoteCandidate>,
        reply: Reply<Result<i32>>,
    },
    EndOfCandidates {
        stream_id: u32,
        component_id: u16,
        reply: Reply<Result<()>>,
    },
    AttachRecv {
        stream_id: u32,
        component_id: u16,
        reply: Reply<Result<mpsc::UnboundedReceiver<DataPacket>>>,
    },
    Send {
        stream_id: u32,
        component_id: u16,
        data: Vec<u8>,
        reply: Reply<Result<usize>>,
    },
    SetSelectedPair {
        stream_id: u32,
        component_id: u16,
        local_foundation: String,
        remote_foundation: String,
        reply: Reply<Result<bool>>,
    },
    SetSelectedRemoteCandidate {
        stream_id: u32,
        component_id: u16,
        remote: RemoteCandidate,
        reply: Reply<Result<bool>>,
    },
    Restart {
        reply: Reply<Result<bool>>,
    },
    RestartStream {
        stream_id: u32,
        reply: Reply<Result<bool>>,
    },
    SetStreamRtcpMux {
        stream_id: u32,
        rtcp_mux: bool,
        reply: Reply<Result<()>>,
    },
    SetStreamTrickleIce {
        stream_id: u32,
        trickle: bool,
        reply: Reply<Result<()>>,
    },
    SetStreamTos {
        stream_id: u32,
        tos: u8,
        reply: Reply<Result<()>>,
    },
    SetStreamMaxTcpQueueSize {
        stream_id: u32,
        size: usize,
        reply: Reply<Result<()>>,
    },
    GetPairStats {
        reply: Reply<Vec<CandidatePairStats>>,
    },
    GetCandidateStats {
        remote: bool,
        reply: Reply<Vec<CandidateStats>>,
    },
    GetComponentStats {
        reply: Reply<Vec<ComponentStats>>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// The single-threaded heart of the agent. Owns every stream, candidate,
/// pair, socket, discovery and refresh item; all mutation happens on its
/// task, so ordering guarantees fall out of the message order.
pub(crate) struct AgentInternal {
    pub(crate) compatibility: IceCompatibility,
    pub(crate) turn_compatibility: TurnCompatibility,
    pub(crate) role: Role,
    pub(crate) aggressive_nomination: bool,
    pub(crate) tie_breaker: u64,

    pub(crate) streams: Vec<Stream>,
    pub(crate) candidates: Arena<Candidate>,
    pub(crate) pairs: Arena<CandidatePair>,
    pub(crate) sockets: Arena<Socket>,
    pub(crate) discoveries: Arena<DiscoveryItem>,
    pub(crate) refreshes: Arena<RefreshItem>,
    pub(crate) transactions: TransactionTable<TransactionOwner>,

    pub(crate) local_addresses: Vec<IpAddr>,
    pub(crate) stun_server: Option<SocketAddr>,
    pub(crate) turn_servers: Vec<Arc<TurnServer>>,
    pub(crate) proxy: Option<ProxyConfig>,

    pub(crate) net: Arc<Net>,
    pub(crate) net_tx: NetEventTx,
    pub(crate) net_rx: Option<mpsc::UnboundedReceiver<NetEvent>>,
    pub(crate) event_tx: mpsc::UnboundedSender<AgentEvent>,
    pub(crate) selected_pairs: SelectedPairs,
    pub(crate) socket_tasks: WaitGroup,

    pub(crate) next_stream_id: u32,
    pub(crate) next_foundation: u32,
    pub(crate) next_prflx_foundation: u32,

    // Populated by AgentConfig::init_with_defaults.
    pub(crate) timer_ta: tokio::time::Duration,
    pub(crate) timer_tr: tokio::time::Duration,
    pub(crate) max_connectivity_checks: usize,
    pub(crate) conncheck_rto: tokio::time::Duration,
    pub(crate) conncheck_max_retransmissions: u32,
    pub(crate) regular_nomination_timeout: tokio::time::Duration,
}

impl AgentInternal {
    pub(crate) fn new(
        config: &AgentConfig,
        event_tx: mpsc::UnboundedSender<AgentEvent>,
        selected_pairs: SelectedPairs,
    ) -> Self {
        let (net_tx, net_rx) = mpsc::unbounded_channel();

        let net = config
            .net
            .clone()
            .unwrap_or_else(|| Arc::new(Net::new(None)));

        let mut ai = Self {
            compatibility: config.ice_compatibility,
            turn_compatibility: config.turn_compatibility,
            role: if config.is_controlling {
                Role::Controlling
            } else {
                Role::Controlled
            },
            aggressive_nomination: !config.regular_nomination,
            tie_breaker: config
                .tie_breaker
                .unwrap_or_else(crate::rand::generate_tie_breaker),

            streams: vec![],
            candidates: Arena::new(),
            pairs: Arena::new(),
            sockets: Arena::new(),
            discoveries: Arena::new(),
            refreshes: Arena::new(),
            transactions: TransactionTable::new(),

            local_addresses: config.local_addresses.clone(),
            stun_server: config.stun_server,
            turn_servers: config.turn_servers.iter().cloned().map(Arc::new).collect(),
            proxy: config.proxy.clone(),

            net,
            net_tx,
            net_rx: Some(net_rx),
            event_tx,
            selected_pairs,
            socket_tasks: WaitGroup::new(),

            next_stream_id: 1,
            next_foundation: 1,
            next_prflx_foundation: PEER_REFLEXIVE_FOUNDATION_BASE,

            timer_ta: DEFAULT_TIMER_TA,
            timer_tr: DEFAULT_TIMER_TR,
            max_connectivity_checks: DEFAULT_MAX_CONNECTIVITY_CHECKS,
            conncheck_rto: crate::transaction::STUN_TIMER_DEFAULT_TIMEOUT,
            conncheck_max_retransmissions:
                crate::transaction::STUN_TIMER_DEFAULT_MAX_RETRANSMISSIONS,
            regular_nomination_timeout: DEFAULT_REGULAR_NOMINATION_TIMEOUT,
        };
        config.init_with_defaults(&mut ai);
        ai
    }

    pub(crate) fn is_controlling(&self) -> bool {
        self.role == Role::Controlling
    }

    pub(crate) fn get_name(&self) -> &'static str {
        match self.role {
            Role::Controlling => "controlling",
            Role::Controlled => "controlled",
        }
    }

    /// The agent task: commands, socket traffic and both timers feed one
    /// loop until `Close`.
    pub(crate) async fn run(mut self, mut cmd_rx: mpsc::Receiver<Cmd>) {
        let mut net_rx = self.net_rx.take().expect("run called once");

        let mut ta = tokio::time::interval(self.timer_ta);
        ta.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tr = tokio::time::interval(self.timer_tr);
        tr.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_cmd(cmd).await {
                            return;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                event = net_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_net_event(event).await;
                    }
                },
                _ = ta.tick() => self.on_ta_tick().await,
                _ = tr.tick() => self.on_tr_tick().await,
            }
        }
    }

    /// Applies one command; returns true when the agent should stop.
    async fn handle_cmd(&mut self, cmd: Cmd) -> bool {
        match cmd {
            Cmd::AddStream {
                n_components,
                reply,
            } => {
                let id = self.add_stream(n_components);
                let _ = reply.send(id);
            }
            Cmd::RemoveStream { stream_id, reply } => {
                let _ = reply.send(self.remove_stream(stream_id).await);
            }
            Cmd::AddLocalAddress { ip, reply } => {
                if !self.local_addresses.contains(&ip) {
                    self.local_addresses.push(ip);
                }
                let _ = reply.send(Ok(()));
            }
            Cmd::SetPortRange {
                stream_id,
                component_id,
                range,
                tcp_active,
                reply,
            } => {
                let _ = reply.send(self.with_component(stream_id, component_id, |c| {
                    if tcp_active {
                        c.tcp_active_port_range = range;
                    } else {
                        c.udp_port_range = range;
                    }
                }));
            }
            Cmd::SetTransport {
                stream_id,
                component_id,
                transport,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.with_component(stream_id, component_id, |c| {
                    match transport {
                        TransportType::Udp => c.enable_udp = enabled,
                        TransportType::TcpActive => c.enable_tcp_active = enabled,
                        TransportType::TcpPassive => c.enable_tcp_passive = enabled,
                    }
                }));
            }
            Cmd::SetRelayInfo {
                stream_id,
                component_id,
                server,
                username,
                password,
                relay_type,
                reply,
            } => {
                let result = if username.is_empty() {
                    Err(Error::ErrUsernameEmpty)
                } else if password.is_empty() {
                    Err(Error::ErrPasswordEmpty)
                } else {
                    self.with_component(stream_id, component_id, |c| {
                        c.turn_servers.push(Arc::new(TurnServer {
                            addr: server,
                            username,
                            password,
                            relay_type,
                        }));
                    })
                };
                let _ = reply.send(result);
            }
            Cmd::SetStunInfo {
                stream_id,
                component_id,
                server,
                reply,
            } => {
                let _ = reply.send(self.with_component(stream_id, component_id, |c| {
                    c.stun_server = Some(server);
                }));
            }
            Cmd::SetLocalCredentials {
                stream_id,
                ufrag,
                pwd,
                reply,
            } => {
                let result = if !(UFRAG_MIN_LEN..=UFRAG_MAX_LEN).contains(&ufrag.len()) {
                    Err(Error::ErrLocalUfragInvalidLength)
                } else if !(PWD_MIN_LEN..=PWD_MAX_LEN).contains(&pwd.len()) {
                    Err(Error::ErrLocalPwdInvalidLength)
                } else {
                    self.with_stream(stream_id, |s| {
                        s.local_credentials = Credentials { ufrag, pwd };
                    })
                };
                let _ = reply.send(result);
            }
            Cmd::SetRemoteCredentials {
                stream_id,
                ufrag,
                pwd,
                reply,
            } => {
                // Empty remote credentials are tolerated for interop.
                let _ = reply.send(self.with_stream(stream_id, |s| {
                    s.remote_credentials = Credentials { ufrag, pwd };
                }));
            }
            Cmd::GetLocalCredentials { stream_id, reply } => {
                let result = self
                    .stream(stream_id)
                    .map(|s| {
                        (
                            s.local_credentials.ufrag.clone(),
                            s.local_credentials.pwd.clone(),
                        )
                    })
                    .ok_or(Error::ErrStreamNotFound);
                let _ = reply.send(result);
            }
            Cmd::GatherCandidates { stream_id, reply } => {
                let _ = reply.send(self.gather_candidates(stream_id).await);
            }
            Cmd::GetLocalCandidates {
                stream_id,
                component_id,
                reply,
            } => {
                let result = self.local_candidates_of(stream_id, component_id);
                let _ = reply.send(result);
            }
            Cmd::SetRemoteCandidates {
                stream_id,
                component_id,
                candidates,
                reply,
            } => {
                let result = self
                    .set_remote_candidates(stream_id, component_id, candidates)
                    .await;
                let _ = reply.send(result);
            }
            Cmd::EndOfCandidates {
                stream_id,
                component_id,
                reply,
            } => {
                let result = self.with_component(stream_id, component_id, |c| {
                    c.peer_gathering_done = true;
                });
                if result.is_ok() {
                    self.update_component_readiness(stream_id, component_id);
                }
                let _ = reply.send(result);
            }
            Cmd::AttachRecv {
                stream_id,
                component_id,
                reply,
            } => {
                let result = self.attach_recv(stream_id, component_id);
                let _ = reply.send(result);
            }
            Cmd::Send {
                stream_id,
                component_id,
                data,
                reply,
            } => {
                let result = self.send_app_data(stream_id, component_id, &data).await;
                let _ = reply.send(result);
            }
            Cmd::SetSelectedPair {
                stream_id,
                component_id,
                local_foundation,
                remote_foundation,
                reply,
            } => {
                let result = self
                    .force_selected_pair(
                        stream_id,
                        component_id,
                        &local_foundation,
                        &remote_foundation,
                    )
                    .await;
                let _ = reply.send(result);
            }
            Cmd::SetSelectedRemoteCandidate {
                stream_id,
                component_id,
                remote,
                reply,
            } => {
                let result = self
                    .force_selected_remote(stream_id, component_id, remote)
                    .await;
                let _ = reply.send(result);
            }
            Cmd::Restart { reply } => {
                self.tie_breaker = crate::rand::generate_tie_breaker();
                let ids: Vec<u32> = self.streams.iter().map(|s| s.id).collect();
                let mut ok = true;
                for id in ids {
                    ok &= self.restart_stream(id).await.unwrap_or(false);
                }
                let _ = reply.send(Ok(ok));
            }
            Cmd::RestartStream { stream_id, reply } => {
                let _ = reply.send(self.restart_stream(stream_id).await);
            }
            Cmd::SetStreamRtcpMux {
                stream_id,
                rtcp_mux,
                reply,
            } => {
                let _ = reply.send(self.with_stream(stream_id, |s| s.rtcp_mux = rtcp_mux));
            }
            Cmd::SetStreamTrickleIce {
                stream_id,
                trickle,
                reply,
            } => {
                let _ = reply.send(self.with_stream(stream_id, |s| s.trickle_ice = trickle));
            }
            Cmd::SetStreamTos {
                stream_id,
                tos,
                reply,
            } => {
                let _ = reply.send(self.with_stream(stream_id, |s| s.tos = tos));
            }
            Cmd::SetStreamMaxTcpQueueSize {
                stream_id,
                size,
                reply,
            } => {
                let _ =
                    reply.send(self.with_stream(stream_id, |s| s.max_tcp_queue_size = size));
            }
            Cmd::GetPairStats { reply } => {
                let _ = reply.send(self.pair_stats());
            }
            Cmd::GetCandidateStats { remote, reply } => {
                let _ = reply.send(self.candidate_stats(remote));
            }
            Cmd::GetComponentStats { reply } => {
                let _ = reply.send(self.component_stats());
            }
            Cmd::Close { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    // ---- stream/component accessors ------------------------------------

    pub(crate) fn stream(&self, stream_id: u32) -> Option<&Stream> {
        self.streams.iter().find(|s| s.id == stream_id)
    }

    pub(crate) fn stream_mut(&mut self, stream_id: u32) -> Option<&mut Stream> {
        self.streams.iter_mut().find(|s| s.id == stream_id)
    }

    pub(crate) fn component(&self, stream_id: u32, component_id: u16) -> Option<&Component> {
        self.stream(stream_id).and_then(|s| s.component(component_id))
    }

    pub(crate) fn component_mut(
        &mut self,
        stream_id: u32,
        component_id: u16,
    ) -> Option<&mut Component> {
        self.stream_mut(stream_id)
            .and_then(|s| s.component_mut(component_id))
    }

    fn with_stream(&mut self, stream_id: u32, f: impl FnOnce(&mut Stream)) -> Result<()> {
        match self.stream_mut(stream_id) {
            Some(stream) => {
                f(stream);
                Ok(())
            }
            None => Err(Error::ErrStreamNotFound),
        }
    }

    fn with_component(
        &mut self,
        stream_id: u32,
        component_id: u16,
        f: impl FnOnce(&mut Component),
    ) -> Result<()> {
        if self.stream(stream_id).is_none() {
            return Err(Error::ErrStreamNotFound);
        }
        match self.component_mut(stream_id, component_id) {
            Some(component) => {
                f(component);
                Ok(())
            }
            None => Err(Error::ErrComponentNotFound),
        }
    }

    // ---- events and state ----------------------------------------------

    pub(crate) fn emit(&self, event: AgentEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Advances a component's state, enforcing monotonicity, and emits
    /// the change.
    pub(crate) fn set_component_state(
        &mut self,
        stream_id: u32,
        component_id: u16,
        state: ComponentState,
    ) {
        let current = match self.component(stream_id, component_id) {
            Some(c) => c.state,
            None => return,
        };
        if !current.can_transition_to(state) {
            return;
        }

        log::info!(
            "[{}]: stream {} component {} state {} -> {}",
            self.get_name(),
            stream_id,
            component_id,
            current,
            state
        );
        if let Some(component) = self.component_mut(stream_id, component_id) {
            component.state = state;
        }
        self.emit(AgentEvent::ComponentStateChanged {
            stream_id,
            component_id,
            state,
        });
    }

    /// Publishes the selected-pair snapshot read by the facade.
    pub(crate) fn publish_selected_pairs(&mut self) {
        let mut snapshot = vec![];
        for stream in &self.streams {
            for component in &stream.components {
                let pair_id = match component.selected_pair {
                    Some(id) => id,
                    None => continue,
                };
                let pair = match self.pairs.get(pair_id) {
                    Some(p) => p,
                    None => continue,
                };
                let (local, remote) = match (
                    self.candidates.get(pair.local),
                    self.candidates.get(pair.remote),
                ) {
                    (Some(l), Some(r)) => (l, r),
                    _ => continue,
                };
                snapshot.push(SelectedPair {
                    stream_id: stream.id,
                    component_id: component.id,
                    local: super::agent_stats::candidate_stats(local),
                    remote: super::agent_stats::candidate_stats(remote),
                    priority: pair.priority,
                });
            }
        }
        self.selected_pairs.store(Some(Arc::new(snapshot)));
    }

    // ---- streams -------------------------------------------------------

    fn add_stream(&mut self, n_components: u16) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        self.streams.push(Stream::new(id, n_components.max(1)));
        log::info!(
            "[{}]: added stream {} with {} component(s)",
            self.get_name(),
            id,
            n_components.max(1)
        );
        id
    }

    async fn remove_stream(&mut self, stream_id: u32) -> Result<()> {
        if self.stream(stream_id).is_none() {
            return Err(Error::ErrStreamNotFound);
        }

        self.prune_stream_state(stream_id, None).await;
        self.streams.retain(|s| s.id != stream_id);
        self.publish_selected_pairs();
        Ok(())
    }

    /// Tears down pairs, discoveries, refreshes, candidates and sockets
    /// of a stream. Anything listed in `keep` survives; used by restarts
    /// to carry the selected pair over.
    pub(crate) async fn prune_stream_state(
        &mut self,
        stream_id: u32,
        keep: Option<&KeepSet>,
    ) {
        let empty = KeepSet::default();
        let keep = keep.unwrap_or(&empty);

        // Pairs first: their transactions must be forgotten before the
        // candidates and sockets below them go away.
        let pair_ids: Vec<PairId> = self
            .pairs
            .iter()
            .filter(|(id, p)| p.stream_id == stream_id && !keep.pairs.contains(id))
            .map(|(id, _)| id)
            .collect();
        for id in pair_ids {
            self.discard_pair(id);
        }

        let discovery_ids: Vec<DiscoveryId> = self
            .discoveries
            .iter()
            .filter(|(_, d)| d.stream_id == stream_id)
            .map(|(id, _)| id)
            .collect();
        for id in discovery_ids {
            if let Some(item) = self.discoveries.remove(id) {
                if let Some(txn) = item.transaction {
                    self.transactions.forget(&txn.id);
                }
            }
        }

        let refresh_ids: Vec<RefreshId> = self
            .refreshes
            .iter()
            .filter(|(id, r)| r.stream_id == stream_id && !keep.refreshes.contains(id))
            .map(|(id, _)| id)
            .collect();
        for id in refresh_ids {
            if let Some(item) = self.refreshes.remove(id) {
                if let Some(txn) = item.transaction {
                    self.transactions.forget(&txn.id);
                }
            }
        }

        let candidate_ids: Vec<CandidateId> = self
            .candidates
            .iter()
            .filter(|(id, c)| c.stream_id == stream_id && !keep.candidates.contains(id))
            .map(|(id, _)| id)
            .collect();
        for id in candidate_ids {
            self.candidates.remove(id);
        }

        // Sockets last, after everything referencing them is gone.
        let socket_ids: Vec<SocketId> = self
            .sockets
            .iter()
            .filter(|(id, s)| s.stream_id == stream_id && !keep.sockets.contains(id))
            .map(|(id, _)| id)
            .collect();
        for id in socket_ids {
            close_socket(&mut self.sockets, id).await;
            self.sockets.remove(id);
        }

        if let Some(stream) = self.stream_mut(stream_id) {
            stream.conncheck_list.retain(|id| keep.pairs.contains(id));
            stream.valid_list.retain(|id| keep.pairs.contains(id));
            for component in &mut stream.components {
                component
                    .local_candidates
                    .retain(|id| keep.candidates.contains(id));
                component
                    .remote_candidates
                    .retain(|id| keep.candidates.contains(id));
                component
                    .validated_remotes
                    .retain(|id| keep.candidates.contains(id));
                component.incoming_checks.clear();
                component
                    .sockets
                    .retain(|id| keep.sockets.contains(id));
                if let Some(selected) = component.selected_pair {
                    if !keep.pairs.contains(&selected) {
                        component.selected_pair = None;
                    }
                }
            }
        }
    }

    /// Drops one pair from the arena and both stream lists, forgetting
    /// its transaction.
    pub(crate) fn discard_pair(&mut self, pair_id: PairId) {
        if let Some(pair) = self.pairs.remove(pair_id) {
            if let Some(txn) = pair.transaction {
                self.transactions.forget(&txn.id);
            }
            if let Some(stream) = self.stream_mut(pair.stream_id) {
                stream.conncheck_list.retain(|id| *id != pair_id);
                stream.valid_list.retain(|id| *id != pair_id);
                for component in &mut stream.components {
                    if component.selected_pair == Some(pair_id) {
                        component.selected_pair = None;
                    }
                }
            }
        }
    }

    async fn restart_stream(&mut self, stream_id: u32) -> Result<bool> {
        if self.stream(stream_id).is_none() {
            return Err(Error::ErrStreamNotFound);
        }

        // The selected pair survives the restart; media keeps flowing on
        // it while the new session is negotiated.
        let mut keep = KeepSet::default();
        let mut restart_remotes: Vec<(u16, CandidateId)> = vec![];
        if let Some(stream) = self.stream(stream_id) {
            for component in &stream.components {
                if let Some(pair_id) = component.selected_pair {
                    if let Some(pair) = self.pairs.get(pair_id) {
                        keep.pairs.push(pair_id);
                        keep.candidates.push(pair.local);
                        keep.candidates.push(pair.remote);
                        restart_remotes.push((component.id, pair.remote));
                        if let Some(local) = self.candidates.get(pair.local) {
                            if let Some(socket) = local.socket {
                                keep.sockets.push(socket);
                                self.collect_socket_chain(socket, &mut keep.sockets);
                            }
                        }
                    }
                }
                // Relay allocations backing the kept pair stay refreshed.
                for (refresh_id, refresh) in self.refreshes.iter() {
                    if refresh.stream_id == stream_id
                        && keep.candidates.contains(&refresh.candidate)
                    {
                        keep.refreshes.push(refresh_id);
                        keep.sockets.push(refresh.base_socket);
                        keep.sockets.push(refresh.relay_socket);
                    }
                }
            }
        }

        self.prune_stream_state(stream_id, Some(&keep)).await;

        if let Some(stream) = self.stream_mut(stream_id) {
            stream.restart();
        }
        for (component_id, remote) in restart_remotes {
            if let Some(component) = self.component_mut(stream_id, component_id) {
                component.restart_candidate = Some(remote);
            }
        }

        self.publish_selected_pairs();
        Ok(true)
    }

    /// TURN sockets keep their base socket alive; walk the chain.
    fn collect_socket_chain(&self, socket: SocketId, into: &mut Vec<SocketId>) {
        let mut current = socket;
        while let Some(entry) = self.sockets.get(current) {
            if let crate::socket::SocketKind::Turn(t) = &entry.kind {
                if !into.contains(&t.inner) {
                    into.push(t.inner);
                }
                current = t.inner;
            } else {
                break;
            }
        }
    }

    // ---- candidates ----------------------------------------------------

    fn local_candidates_of(
        &self,
        stream_id: u32,
        component_id: u16,
    ) -> Result<Vec<Candidate>> {
        if self.stream(stream_id).is_none() {
            return Err(Error::ErrStreamNotFound);
        }
        let component = self
            .component(stream_id, component_id)
            .ok_or(Error::ErrComponentNotFound)?;
        Ok(component
            .local_candidates
            .iter()
            .filter_map(|id| self.candidates.get(*id))
            .map(Candidate::copy)
            .collect())
    }

    /// Assigns a foundation: reuse the foundation (and per-candidate
    /// credentials) of any existing local candidate that behaves
    /// identically, otherwise mint a fresh numeric one.
    pub(crate) fn assign_foundation(&mut self, candidate: &mut Candidate) {
        for (_, existing) in self.candidates.iter() {
            if existing.socket.is_none() {
                // Remote candidates have their own foundation space.
                continue;
            }
            if candidate.shares_foundation_with(existing) {
                candidate.foundation = existing.foundation.clone();
                candidate.local_foundation = existing.local_foundation;
                if existing.username.is_some() {
                    candidate.username = existing.username.clone();
                }
                if existing.password.is_some() {
                    candidate.password = existing.password.clone();
                }
                return;
            }
        }

        let foundation = self.next_foundation;
        self.next_foundation += 1;
        candidate.local_foundation = foundation;
        candidate.foundation = foundation.to_string();
    }

    pub(crate) fn next_peer_reflexive_foundation(&mut self) -> u32 {
        let foundation = self.next_prflx_foundation;
        self.next_prflx_foundation += 1;
        foundation
    }

    /// Registers a gathered local candidate: de-duplicates, finalizes
    /// foundation and priority, pairs it against known remotes and
    /// announces it. Returns `None` for redundant candidates.
    pub(crate) fn add_local_candidate(&mut self, mut candidate: Candidate) -> Option<CandidateId> {
        let stream_id = candidate.stream_id;
        let component_id = candidate.component_id;

        let existing_locals: Vec<CandidateId> = self
            .component(stream_id, component_id)?
            .local_candidates
            .clone();
        for id in &existing_locals {
            if let Some(existing) = self.candidates.get(*id) {
                if candidate.redundant_with(existing) {
                    log::debug!(
                        "[{}]: dropping redundant local candidate {}",
                        self.get_name(),
                        candidate
                    );
                    return None;
                }
            }
        }

        self.assign_foundation(&mut candidate);
        if candidate.priority == 0 {
            candidate.priority = candidate_priority(
                self.compatibility,
                candidate.kind,
                candidate.transport,
                crate::addr::is_ipv6(&candidate.base_addr),
                candidate.local_foundation,
                candidate.component_id,
            );
        }

        let foundation = candidate.foundation.clone();
        let candidate_id = self.candidates.insert(candidate);
        self.component_mut(stream_id, component_id)?
            .local_candidates
            .push(candidate_id);

        let remotes: Vec<CandidateId> = self
            .component(stream_id, component_id)?
            .remote_candidates
            .clone();
        for remote_id in remotes {
            self.try_add_pair(candidate_id, remote_id);
        }

        self.emit(AgentEvent::NewCandidate {
            stream_id,
            component_id,
            foundation,
        });
        Some(candidate_id)
    }

    /// Registers a remote candidate, honoring the per-component cap and
    /// de-duplication; pairs it against the local candidates.
    pub(crate) fn add_remote_candidate(
        &mut self,
        candidate: Candidate,
        announce: bool,
    ) -> Option<CandidateId> {
        let stream_id = candidate.stream_id;
        let component_id = candidate.component_id;
        let component = self.component(stream_id, component_id)?;

        if component.remote_candidates.len() >= MAX_REMOTE_CANDIDATES {
            log::warn!(
                "[{}]: remote candidate limit reached on stream {} component {}",
                self.get_name(),
                stream_id,
                component_id
            );
            return None;
        }
        for id in &component.remote_candidates {
            if let Some(existing) = self.candidates.get(*id) {
                if existing.equal(&candidate) {
                    return None;
                }
            }
        }

        let foundation = candidate.foundation.clone();
        let candidate_id = self.candidates.insert(candidate);
        self.component_mut(stream_id, component_id)?
            .remote_candidates
            .push(candidate_id);

        let locals: Vec<CandidateId> = self
            .component(stream_id, component_id)?
            .local_candidates
            .clone();
        for local_id in locals {
            self.try_add_pair(local_id, candidate_id);
        }

        if announce {
            self.emit(AgentEvent::NewRemoteCandidate {
                stream_id,
                component_id,
                foundation,
            });
        }
        Some(candidate_id)
    }

    async fn set_remote_candidates(
        &mut self,
        stream_id: u32,
        component_id: u16,
        candidates: Vec<RemoteCandidate>,
    ) -> Result<i32> {
        if self.stream(stream_id).is_none() {
            return Err(Error::ErrStreamNotFound);
        }
        if self.component(stream_id, component_id).is_none() {
            return Err(Error::ErrComponentNotFound);
        }

        let mut added = 0;
        for remote in candidates {
            if remote.transport == TransportType::TcpActive {
                // Active remotes probe our passive candidates themselves.
                log::info!(
                    "[{}]: ignoring remote candidate with tcp-act transport",
                    self.get_name()
                );
                continue;
            }
            let candidate = remote.into_candidate(stream_id, component_id);
            if self.add_remote_candidate(candidate, false).is_some() {
                added += 1;
            }
        }

        if added > 0 {
            self.on_remote_candidates_added(stream_id, component_id).await;
        }
        Ok(added)
    }

    // ---- pairs ---------------------------------------------------------

    /// Creates the pair for (local, remote) if the two are compatible and
    /// no equal pair exists, keeping the check list sorted and capped.
    pub(crate) fn try_add_pair(
        &mut self,
        local_id: CandidateId,
        remote_id: CandidateId,
    ) -> Option<PairId> {
        let (local, remote) = match (self.candidates.get(local_id), self.candidates.get(remote_id))
        {
            (Some(l), Some(r)) => (l, r),
            _ => return None,
        };
        if !can_pair(local, remote) {
            return None;
        }

        let stream_id = local.stream_id;
        if let Some(stream) = self.stream(stream_id) {
            for pair_id in &stream.conncheck_list {
                if let Some(pair) = self.pairs.get(*pair_id) {
                    if pair.local == local_id && pair.remote == remote_id {
                        return None;
                    }
                }
            }
        }

        let pair = CandidatePair::new(local, local_id, remote, remote_id, self.is_controlling());
        log::debug!("[{}]: new {}", self.get_name(), pair);
        let pair_id = self.pairs.insert(pair);
        self.insert_pair_sorted(stream_id, pair_id);
        self.enforce_check_cap(stream_id);
        Some(pair_id)
    }

    pub(crate) fn insert_pair_sorted(&mut self, stream_id: u32, pair_id: PairId) {
        let priority = match self.pairs.get(pair_id) {
            Some(p) => p.priority,
            None => return,
        };
        let pairs = &self.pairs;
        if let Some(stream) = self.streams.iter_mut().find(|s| s.id == stream_id) {
            let pos = stream
                .conncheck_list
                .iter()
                .position(|id| pairs.get(*id).map(|p| p.priority < priority).unwrap_or(true))
                .unwrap_or(stream.conncheck_list.len());
            stream.conncheck_list.insert(pos, pair_id);
        }
    }

    /// Keeps the check list within the configured cap by discarding the
    /// lowest-priority pairs.
    pub(crate) fn enforce_check_cap(&mut self, stream_id: u32) {
        loop {
            let over = match self.stream(stream_id) {
                Some(s) => s.conncheck_list.len() > self.max_connectivity_checks,
                None => false,
            };
            if !over {
                return;
            }
            let last = self
                .stream(stream_id)
                .and_then(|s| s.conncheck_list.last().copied());
            if let Some(pair_id) = last {
                log::debug!(
                    "[{}]: over the check cap, discarding lowest-priority pair",
                    self.get_name()
                );
                self.discard_pair(pair_id);
            } else {
                return;
            }
        }
    }

    pub(crate) fn sort_pair_list(pairs: &Arena<CandidatePair>, list: &mut Vec<PairId>) {
        list.sort_by(|a, b| {
            let pa = pairs.get(*a).map(|p| p.priority).unwrap_or(0);
            let pb = pairs.get(*b).map(|p| p.priority).unwrap_or(0);
            pb.cmp(&pa)
        });
    }

    pub(crate) fn find_pair(
        &self,
        stream_id: u32,
        local_id: CandidateId,
        remote_id: CandidateId,
    ) -> Option<PairId> {
        let stream = self.stream(stream_id)?;
        for list in [&stream.conncheck_list, &stream.valid_list] {
            for pair_id in list {
                if let Some(pair) = self.pairs.get(*pair_id) {
                    if pair.local == local_id && pair.remote == remote_id {
                        return Some(*pair_id);
                    }
                }
            }
        }
        None
    }

    // ---- application data ----------------------------------------------

    fn attach_recv(
        &mut self,
        stream_id: u32,
        component_id: u16,
    ) -> Result<mpsc::UnboundedReceiver<DataPacket>> {
        if self.stream(stream_id).is_none() {
            return Err(Error::ErrStreamNotFound);
        }
        let component = self
            .component_mut(stream_id, component_id)
            .ok_or(Error::ErrComponentNotFound)?;
        if component.data_tx.is_some() {
            return Err(Error::ErrRecvAlreadyAttached);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        component.data_tx = Some(tx);
        Ok(rx)
    }

    async fn send_app_data(
        &mut self,
        stream_id: u32,
        component_id: u16,
        data: &[u8],
    ) -> Result<usize> {
        let component = self
            .component(stream_id, component_id)
            .ok_or(Error::ErrStreamNotFound)?;
        let pair_id = component.selected_pair.ok_or(Error::ErrNoSelectedPair)?;
        let pair = self.pairs.get(pair_id).ok_or(Error::ErrNoSelectedPair)?;
        let local = self
            .candidates
            .get(pair.local)
            .ok_or(Error::ErrNoSelectedPair)?;
        let remote_addr = self
            .candidates
            .get(pair.remote)
            .ok_or(Error::ErrNoSelectedPair)?
            .addr;
        let socket = local.socket.ok_or(Error::ErrNoSelectedPair)?;

        crate::socket::send_on_socket(&mut self.sockets, socket, data, remote_addr).await
    }

    // ---- shutdown ------------------------------------------------------

    async fn shutdown(&mut self) {
        let ids: Vec<u32> = self.streams.iter().map(|s| s.id).collect();
        for id in ids {
            let _ = self.remove_stream(id).await;
        }
        self.transactions.clear();
        self.selected_pairs.store(None);

        // Socket tasks exit once their sockets closed above; don't hang
        // on a straggler (e.g. a connect still inside its own timeout).
        let tasks = std::mem::replace(&mut self.socket_tasks, WaitGroup::new());
        let _ = tokio::time::timeout(tokio::time::Duration::from_secs(1), tasks.wait()).await;
        log::info!("[{}]: agent closed", self.get_name());
    }
}

/// State that survives a stream restart or prune.
#[derive(Default)]
pub(crate) struct KeepSet {
    pub(crate) pairs: Vec<PairId>,
    pub(crate) candidates: Vec<CandidateId>,
    pub(crate) sockets: Vec<SocketId>,
    pub(crate) refreshes: Vec<RefreshId>,
}
