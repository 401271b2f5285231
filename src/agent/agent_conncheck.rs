use std::collections::HashMap;
use std::net::SocketAddr;

use stun::agent::TransactionId;
use stun::error_code::{ErrorCodeAttribute, CODE_ROLE_CONFLICT};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::Username;
use stun::xoraddr::XorMappedAddress;
use tokio::time::Instant;

use super::agent_internal::*;
use super::AgentEvent;
use crate::addr::DISCARD_PORT;
use crate::candidate::*;
use crate::compat::IceCompatibility;
use crate::control::{AttrControl, AttrControlled, AttrControlling, Role};
use crate::msattrs::{CandidateIdentifierAttr, MsImplementationVersionAttr, MS_IMPLEMENTATION_VERSION};
use crate::priority::PriorityAttr;
use crate::socket::{send_on_socket, SocketId};
use crate::state::{CandidatePairState, ComponentState};
use crate::stream::{IncomingCheck, MAX_REMOTE_CANDIDATES};
use crate::transaction::{StunTimer, StunTransaction, TimerCheck};
use crate::use_candidate::UseCandidateAttr;

impl AgentInternal {
    /// One pacing tick: discoveries first, then the check list, then the
    /// relay refresh sub-timers and component failure detection.
    pub(crate) async fn on_ta_tick(&mut self) {
        let now = Instant::now();
        self.discovery_tick(now).await;
        self.conncheck_tick(now).await;
        self.refresh_tick(now).await;
        self.detect_component_failures();
    }

    /// Checks begin when both candidate lists are non-empty.
    pub(crate) async fn on_remote_candidates_added(&mut self, stream_id: u32, component_id: u16) {
        if let Some(stream) = self.stream_mut(stream_id) {
            if stream.conncheck_started.is_none() {
                stream.conncheck_started = Some(Instant::now());
            }
        }
        self.set_component_state(stream_id, component_id, ComponentState::Connecting);
        self.initial_unfreeze(stream_id);
        self.replay_incoming_checks(stream_id, component_id).await;
    }

    /// RFC 5245 5.7.4 initial unfreezing: per foundation group, the pair
    /// with the lowest component id (highest priority breaking ties)
    /// becomes Waiting. Applied only while the whole list is frozen.
    pub(crate) fn initial_unfreeze(&mut self, stream_id: u32) {
        let list: Vec<PairId> = match self.stream(stream_id) {
            Some(s) => s.conncheck_list.clone(),
            None => return,
        };
        let all_frozen = list.iter().all(|id| {
            self.pairs
                .get(*id)
                .map(|p| p.state == CandidatePairState::Frozen)
                .unwrap_or(true)
        });
        if !all_frozen {
            return;
        }

        // The list is priority-descending, so the first pair seen for a
        // foundation at the lowest component id is the one to unfreeze.
        let mut best_per_foundation: HashMap<String, PairId> = HashMap::new();
        for pair_id in &list {
            if let Some(pair) = self.pairs.get(*pair_id) {
                match best_per_foundation.get(&pair.foundation) {
                    Some(existing) => {
                        let existing_component = self
                            .pairs
                            .get(*existing)
                            .map(|p| p.component_id)
                            .unwrap_or(u16::MAX);
                        if pair.component_id < existing_component {
                            best_per_foundation.insert(pair.foundation.clone(), *pair_id);
                        }
                    }
                    None => {
                        best_per_foundation.insert(pair.foundation.clone(), *pair_id);
                    }
                }
            }
        }

        for pair_id in best_per_foundation.into_values() {
            if let Some(pair) = self.pairs.get_mut(pair_id) {
                pair.state = CandidatePairState::Waiting;
            }
        }
    }

    /// One Ta step of the check list across all streams: drive the
    /// retransmission timers, then either send the highest-priority
    /// waiting check or thaw the next frozen pair.
    pub(crate) async fn conncheck_tick(&mut self, now: Instant) {
        self.drive_check_timers(now).await;

        let stream_ids: Vec<u32> = self.streams.iter().map(|s| s.id).collect();
        for stream_id in &stream_ids {
            if let Some(stream) = self.stream_mut(*stream_id) {
                if stream.conncheck_started.is_some() {
                    stream.conncheck_ticks += 1;
                }
            }
        }

        // A single new transmission per tick, highest priority first.
        let mut next_waiting: Option<PairId> = None;
        for stream_id in &stream_ids {
            let stream = match self.stream(*stream_id) {
                Some(s) => s,
                None => continue,
            };
            for pair_id in &stream.conncheck_list {
                if let Some(pair) = self.pairs.get(*pair_id) {
                    if pair.state == CandidatePairState::Waiting {
                        next_waiting = Some(*pair_id);
                        break;
                    }
                }
            }
            if next_waiting.is_some() {
                break;
            }
        }

        if let Some(pair_id) = next_waiting {
            self.start_check(pair_id, now).await;
        } else {
            // Nothing waiting: thaw the first frozen pair encountered in
            // priority order.
            'outer: for stream_id in &stream_ids {
                let stream = match self.stream(*stream_id) {
                    Some(s) => s,
                    None => continue,
                };
                for pair_id in stream.conncheck_list.clone() {
                    if let Some(pair) = self.pairs.get_mut(pair_id) {
                        if pair.state == CandidatePairState::Frozen {
                            pair.state = CandidatePairState::Waiting;
                            break 'outer;
                        }
                    }
                }
            }
        }

        for stream_id in stream_ids {
            self.regular_nomination_tick(stream_id, now).await;
        }
    }

    async fn drive_check_timers(&mut self, now: Instant) {
        let in_progress: Vec<PairId> = self
            .pairs
            .iter()
            .filter(|(_, p)| {
                p.state == CandidatePairState::InProgress && p.transaction.is_some()
            })
            .map(|(id, _)| id)
            .collect();

        for pair_id in in_progress {
            let (check, buffer, socket, remote_addr, txn_id) = {
                let pair = match self.pairs.get_mut(pair_id) {
                    Some(p) => p,
                    None => continue,
                };
                let txn = match pair.transaction.as_mut() {
                    Some(t) => t,
                    None => continue,
                };
                let check = txn.timer.refresh(now);
                let buffer = txn.buffer.clone();
                let txn_id = txn.id;
                let socket = self
                    .candidates
                    .get(pair.local)
                    .and_then(|c| c.socket);
                let remote_addr = self.candidates.get(pair.remote).map(|c| c.addr);
                (check, buffer, socket, remote_addr, txn_id)
            };

            match check {
                TimerCheck::Pending => {}
                TimerCheck::Retransmit => {
                    if let (Some(socket), Some(remote_addr)) = (socket, remote_addr) {
                        if remote_addr.port() != DISCARD_PORT {
                            let _ =
                                send_on_socket(&mut self.sockets, socket, &buffer, remote_addr)
                                    .await;
                        }
                    }
                }
                TimerCheck::Timeout => {
                    self.transactions.forget(&txn_id);
                    let name = self.get_name().to_string();
                    if let Some(pair) = self.pairs.get_mut(pair_id) {
                        pair.transaction = None;
                        pair.state = CandidatePairState::Failed;
                        log::debug!("[{}]: check timed out: {}", name, pair);
                    }
                    let (stream_id, component_id) = match self.pairs.get(pair_id) {
                        Some(p) => (p.stream_id, p.component_id),
                        None => continue,
                    };
                    self.update_component_readiness(stream_id, component_id);
                }
            }
        }
    }

    /// Transitions the pair to InProgress and transmits its check.
    pub(crate) async fn start_check(&mut self, pair_id: PairId, now: Instant) {
        let msg = match self.build_check_message(pair_id) {
            Some(msg) => msg,
            None => return,
        };

        let (socket, remote_addr) = {
            let pair = match self.pairs.get(pair_id) {
                Some(p) => p,
                None => return,
            };
            let socket = self.candidates.get(pair.local).and_then(|c| c.socket);
            let remote_addr = self.candidates.get(pair.remote).map(|c| c.addr);
            match (socket, remote_addr) {
                (Some(s), Some(r)) => (s, r),
                _ => return,
            }
        };

        let reliable = crate::socket::socket_is_reliable(&self.sockets, socket);
        let timer = if reliable {
            StunTimer::start_reliable(now)
        } else {
            StunTimer::start(now, self.conncheck_rto, self.conncheck_max_retransmissions)
        };

        self.transactions
            .register(msg.transaction_id, TransactionOwner::Pair(pair_id));
        if let Some(pair) = self.pairs.get_mut(pair_id) {
            pair.state = CandidatePairState::InProgress;
            pair.transaction = Some(StunTransaction::new(
                msg.transaction_id,
                msg.raw.clone(),
                timer,
            ));
        }

        // Checks towards the discard port are armed but never sent.
        if remote_addr.port() == DISCARD_PORT {
            return;
        }

        if let Err(err) = send_on_socket(&mut self.sockets, socket, &msg.raw, remote_addr).await {
            log::debug!("[{}]: check send failed: {}", self.get_name(), err);
        }
    }

    /// The priority a peer-reflexive candidate discovered through this
    /// local candidate would get.
    pub(crate) fn prflx_priority(&self, local: &Candidate) -> u32 {
        candidate_priority(
            self.compatibility,
            CandidateKind::PeerReflexive,
            local.transport,
            crate::addr::is_ipv6(&local.base_addr),
            local.local_foundation,
            local.component_id,
        )
    }

    /// In OC2007R2 checks the candidate identifier carries the matching
    /// server-reflexive foundation when a UDP host candidate probes a
    /// relayed remote.
    fn candidate_identifier_for(&self, pair: &CandidatePair) -> Option<String> {
        let local = self.candidates.get(pair.local)?;
        let remote = self.candidates.get(pair.remote)?;

        if local.kind == CandidateKind::Host
            && local.transport == TransportType::Udp
            && remote.kind == CandidateKind::Relayed
        {
            let component = self.component(pair.stream_id, pair.component_id)?;
            for id in &component.local_candidates {
                if let Some(c) = self.candidates.get(*id) {
                    if c.kind == CandidateKind::ServerReflexive
                        && c.transport == TransportType::Udp
                        && crate::addr::addr_equal_no_port(&c.base_addr, &local.base_addr)
                    {
                        return Some(c.foundation.clone());
                    }
                }
            }
        }
        Some(local.foundation.clone())
    }

    fn build_check_message(&mut self, pair_id: PairId) -> Option<Message> {
        let pair = self.pairs.get(pair_id)?;
        let stream = self.stream(pair.stream_id)?;
        let local = self.candidates.get(pair.local)?;
        let remote = self.candidates.get(pair.remote)?;

        let local_ufrag = local
            .username
            .clone()
            .unwrap_or_else(|| stream.local_credentials.ufrag.clone());
        let remote_ufrag = remote
            .username
            .clone()
            .unwrap_or_else(|| stream.remote_credentials.ufrag.clone());
        let remote_pwd = remote
            .password
            .clone()
            .unwrap_or_else(|| stream.remote_credentials.pwd.clone());
        let username = format!("{remote_ufrag}:{local_ufrag}");

        let use_candidate =
            self.is_controlling() && (self.aggressive_nomination || pair.use_candidate);
        let priority = self.prflx_priority(local);

        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(BINDING_REQUEST),
            Box::new(TransactionId::new()),
            Box::new(Username::new(stun::attributes::ATTR_USERNAME, username)),
        ];
        if use_candidate {
            setters.push(Box::new(UseCandidateAttr::new()));
        }
        setters.push(Box::new(PriorityAttr(priority)));
        if self.is_controlling() {
            setters.push(Box::new(AttrControlling(self.tie_breaker)));
        } else {
            setters.push(Box::new(AttrControlled(self.tie_breaker)));
        }
        if self.compatibility == IceCompatibility::Oc2007R2 {
            if let Some(identifier) = self.candidate_identifier_for(pair) {
                setters.push(Box::new(CandidateIdentifierAttr::new(identifier)));
            }
            setters.push(Box::new(MsImplementationVersionAttr(
                MS_IMPLEMENTATION_VERSION,
            )));
        }
        setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
            remote_pwd,
        )));
        if self.compatibility == IceCompatibility::Rfc5245 {
            setters.push(Box::new(FINGERPRINT));
        }

        if use_candidate {
            // Aggressive nomination marks the pair up front; a successful
            // answer then promotes it directly.
            if let Some(pair) = self.pairs.get_mut(pair_id) {
                pair.nominated = true;
            }
        }

        let mut msg = Message::new();
        if let Err(err) = msg.build(&setters) {
            log::error!("[{}]: failed to build check: {}", self.get_name(), err);
            return None;
        }
        Some(msg)
    }

    // ---- responses to our checks ---------------------------------------

    /// RFC 5245 7.1.3 processing of a response that matched an
    /// outstanding check transaction.
    pub(crate) async fn handle_check_response(
        &mut self,
        pair_id: PairId,
        msg: &mut Message,
        from: SocketAddr,
    ) {
        let (stream_id, component_id, remote_id) = {
            let pair = match self.pairs.get_mut(pair_id) {
                Some(p) => p,
                None => return,
            };
            pair.transaction = None;
            (pair.stream_id, pair.component_id, pair.remote)
        };

        let remote_addr = match self.candidates.get(remote_id) {
            Some(r) => r.addr,
            None => return,
        };

        // The response must come back from the address the request went
        // to; a mismatch means a symmetric NAT rewrote it.
        if from != remote_addr {
            log::debug!(
                "[{}]: response source {} does not match {}; failing pair",
                self.get_name(),
                from,
                remote_addr
            );
            if let Some(pair) = self.pairs.get_mut(pair_id) {
                pair.state = CandidatePairState::Failed;
            }
            self.update_component_readiness(stream_id, component_id);
            return;
        }

        if msg.typ.class == CLASS_ERROR_RESPONSE {
            let mut code = ErrorCodeAttribute::default();
            let code_value = code
                .get_from(msg)
                .map(|_| code.code)
                .unwrap_or(stun::error_code::ErrorCode(0));
            if code_value == CODE_ROLE_CONFLICT {
                log::info!(
                    "[{}]: role conflict signalled by peer, flipping role",
                    self.get_name()
                );
                self.flip_role();
                if let Some(pair) = self.pairs.get_mut(pair_id) {
                    pair.state = CandidatePairState::Waiting;
                }
            } else if let Some(pair) = self.pairs.get_mut(pair_id) {
                pair.state = CandidatePairState::Failed;
            }
            self.update_component_readiness(stream_id, component_id);
            return;
        }

        // Mapped address discovery, RFC 5245 7.1.3.2.1.
        let mut mapped = XorMappedAddress::default();
        let valid_pair_id = if mapped.get_from(msg).is_err() {
            // No mapped address: the checked pair is itself the valid
            // pair.
            pair_id
        } else {
            let mapped_addr = SocketAddr::new(mapped.ip, mapped.port);
            self.valid_pair_for_mapped(pair_id, mapped_addr)
        };

        {
            let pairs = &self.pairs;
            if let Some(stream) = self.streams.iter_mut().find(|s| s.id == stream_id) {
                if !stream.valid_list.contains(&valid_pair_id) {
                    stream.valid_list.push(valid_pair_id);
                    Self::sort_pair_list(pairs, &mut stream.valid_list);
                }
            }
        }

        let nominated = {
            let originating_nominated = self
                .pairs
                .get(pair_id)
                .map(|p| p.nominated)
                .unwrap_or(false);
            if let Some(valid) = self.pairs.get_mut(valid_pair_id) {
                valid.nominated |= originating_nominated;
                valid.state = CandidatePairState::Succeeded;
            }
            if let Some(pair) = self.pairs.get_mut(pair_id) {
                pair.state = CandidatePairState::Succeeded;
                pair.valid_pair = Some(valid_pair_id);
            }
            self.pairs
                .get(valid_pair_id)
                .map(|p| p.nominated)
                .unwrap_or(false)
        };

        if let Some(component) = self.component_mut(stream_id, component_id) {
            component.remember_validated(remote_id);
        }

        log::debug!(
            "[{}]: check succeeded for stream {} component {}",
            self.get_name(),
            stream_id,
            component_id
        );

        self.unfreeze_related(stream_id, pair_id);
        self.set_component_state(stream_id, component_id, ComponentState::Connected);

        if nominated {
            self.promote_selected_pair(stream_id, component_id, valid_pair_id)
                .await;
        }
        self.update_component_readiness(stream_id, component_id);
    }

    /// Finds or creates the valid pair for a discovered mapped address.
    fn valid_pair_for_mapped(&mut self, pair_id: PairId, mapped_addr: SocketAddr) -> PairId {
        let (stream_id, component_id, local_id, remote_id, transport) = {
            let pair = match self.pairs.get(pair_id) {
                Some(p) => p,
                None => return pair_id,
            };
            let transport = self
                .candidates
                .get(pair.local)
                .map(|c| c.transport)
                .unwrap_or_default();
            (
                pair.stream_id,
                pair.component_id,
                pair.local,
                pair.remote,
                transport,
            )
        };

        // A local candidate already advertising the mapped address means
        // the path is direct; otherwise the NAT invented a mapping and a
        // peer-reflexive local is synthesized for it.
        let mut mapped_local: Option<CandidateId> = None;
        if let Some(component) = self.component(stream_id, component_id) {
            for id in &component.local_candidates {
                if let Some(c) = self.candidates.get(*id) {
                    if c.addr == mapped_addr && c.transport == transport {
                        mapped_local = Some(*id);
                        break;
                    }
                }
            }
        }

        let mapped_local = mapped_local.unwrap_or_else(|| {
            let (base_addr, socket, local_foundation) = self
                .candidates
                .get(local_id)
                .map(|c| (c.base_addr, c.socket, c.local_foundation))
                .unwrap_or((mapped_addr, None, 0));
            let priority = candidate_priority(
                self.compatibility,
                CandidateKind::PeerReflexive,
                transport,
                crate::addr::is_ipv6(&base_addr),
                local_foundation,
                component_id,
            );
            let foundation = self.next_peer_reflexive_foundation();
            let candidate = Candidate {
                id: crate::rand::generate_cand_id(),
                kind: CandidateKind::PeerReflexive,
                transport,
                addr: mapped_addr,
                base_addr,
                priority,
                foundation: foundation.to_string(),
                local_foundation: foundation,
                stream_id,
                component_id,
                username: None,
                password: None,
                turn: None,
                socket,
            };
            log::debug!(
                "[{}]: discovered peer-reflexive local {}",
                self.get_name(),
                candidate
            );
            let id = self.candidates.insert(candidate);
            if let Some(component) = self.component_mut(stream_id, component_id) {
                component.local_candidates.push(id);
            }
            id
        });

        if let Some(existing) = self.find_pair(stream_id, mapped_local, remote_id) {
            return existing;
        }

        let controlling = self.is_controlling();
        let (local, remote) = (
            self.candidates.get(mapped_local).cloned(),
            self.candidates.get(remote_id).cloned(),
        );
        match (local, remote) {
            (Some(local), Some(remote)) => {
                let pair =
                    CandidatePair::new(&local, mapped_local, &remote, remote_id, controlling);
                self.pairs.insert(pair)
            }
            _ => pair_id,
        }
    }

    /// Unfreezes pairs related by foundation, RFC 5245 7.1.3.3, within
    /// the stream and, when every component holds a valid pair, across
    /// the other streams.
    pub(crate) fn unfreeze_related(&mut self, stream_id: u32, pair_id: PairId) {
        let foundation = match self.pairs.get(pair_id) {
            Some(p) => p.foundation.clone(),
            None => return,
        };

        if let Some(stream) = self.stream(stream_id) {
            let list = stream.conncheck_list.clone();
            for id in list {
                if let Some(pair) = self.pairs.get_mut(id) {
                    if pair.state == CandidatePairState::Frozen && pair.foundation == foundation {
                        pair.state = CandidatePairState::Waiting;
                    }
                }
            }
        }

        // Cross-stream unfreezing only once this stream is fully valid.
        let all_components_valid = match self.stream(stream_id) {
            Some(stream) => stream.components.iter().all(|component| {
                stream.valid_list.iter().any(|id| {
                    self.pairs
                        .get(*id)
                        .map(|p| p.component_id == component.id)
                        .unwrap_or(false)
                })
            }),
            None => false,
        };
        if !all_components_valid {
            return;
        }

        let other_streams: Vec<u32> = self
            .streams
            .iter()
            .map(|s| s.id)
            .filter(|id| *id != stream_id)
            .collect();
        for other_id in other_streams {
            let (list, active) = match self.stream(other_id) {
                Some(s) => {
                    let active = s.conncheck_list.iter().any(|id| {
                        self.pairs
                            .get(*id)
                            .map(|p| {
                                matches!(
                                    p.state,
                                    CandidatePairState::Waiting | CandidatePairState::InProgress
                                )
                            })
                            .unwrap_or(false)
                    });
                    (s.conncheck_list.clone(), active)
                }
                None => continue,
            };

            if active {
                for id in list {
                    if let Some(pair) = self.pairs.get_mut(id) {
                        if pair.state == CandidatePairState::Frozen
                            && pair.foundation == foundation
                        {
                            pair.state = CandidatePairState::Waiting;
                        }
                    }
                }
            } else {
                self.initial_unfreeze(other_id);
            }
        }
    }

    /// Swaps the agent role after a conflict, re-deriving every pair
    /// priority and re-sorting both lists of every stream.
    pub(crate) fn flip_role(&mut self) {
        self.role = match self.role {
            Role::Controlling => Role::Controlled,
            Role::Controlled => Role::Controlling,
        };
        let controlling = self.is_controlling();

        let pair_ids: Vec<PairId> = self.pairs.iter().map(|(id, _)| id).collect();
        for id in pair_ids {
            let (local_prio, remote_prio) = match self.pairs.get(id) {
                Some(p) => (
                    self.candidates.get(p.local).map(|c| c.priority).unwrap_or(0),
                    self.candidates
                        .get(p.remote)
                        .map(|c| c.priority)
                        .unwrap_or(0),
                ),
                None => continue,
            };
            if let Some(pair) = self.pairs.get_mut(id) {
                pair.reprioritize(controlling, local_prio, remote_prio);
            }
        }

        for stream in &mut self.streams {
            Self::sort_pair_list(&self.pairs, &mut stream.conncheck_list);
            Self::sort_pair_list(&self.pairs, &mut stream.valid_list);
        }
    }

    // ---- inbound checks ------------------------------------------------

    /// Full handling of a validated inbound Binding request, RFC 5245
    /// 7.2: role conflict resolution, the success response, remote
    /// peer-reflexive learning and the triggered check.
    pub(crate) async fn handle_inbound_check(
        &mut self,
        stream_id: u32,
        component_id: u16,
        local_socket: SocketId,
        from: SocketAddr,
        msg: &Message,
    ) {
        // Role conflict, RFC 5245 7.2.1.1.
        if let Some(control) = AttrControl::from_message(msg) {
            let conflict = match (self.role, control.role) {
                (Role::Controlling, Role::Controlling) => true,
                (Role::Controlled, Role::Controlled) => true,
                _ => false,
            };
            if conflict {
                if self.tie_breaker >= control.tie_breaker {
                    self.send_role_conflict_error(stream_id, local_socket, from, msg)
                        .await;
                    return;
                }
                // The lower tie-breaker yields and answers normally.
                self.flip_role();
            }
        }

        let first_request = match self.stream_mut(stream_id) {
            Some(stream) => {
                let first = !stream.initial_binding_request_received;
                stream.initial_binding_request_received = true;
                first
            }
            None => return,
        };
        if first_request {
            self.emit(AgentEvent::InitialBindingRequestReceived { stream_id });
        }

        self.send_binding_success(stream_id, local_socket, from, msg)
            .await;

        let use_candidate = UseCandidateAttr::is_set(msg);
        let mut priority_attr = PriorityAttr::default();
        let priority = priority_attr.get_from(msg).map(|_| priority_attr.0).ok();

        // Too early: remote candidates unknown, remember the check.
        let no_remotes = self
            .component(stream_id, component_id)
            .map(|c| c.remote_candidates.is_empty())
            .unwrap_or(true);
        if no_remotes {
            self.queue_incoming_check(stream_id, component_id, local_socket, from, msg);
            return;
        }

        let remote_id = self.find_or_learn_remote(stream_id, component_id, from, priority);
        let remote_id = match remote_id {
            Some(id) => id,
            None => return,
        };

        self.triggered_check(stream_id, component_id, local_socket, remote_id, use_candidate)
            .await;
    }

    fn queue_incoming_check(
        &mut self,
        stream_id: u32,
        component_id: u16,
        local_socket: SocketId,
        from: SocketAddr,
        msg: &Message,
    ) {
        let mut priority_attr = PriorityAttr::default();
        let priority = priority_attr.get_from(msg).map(|_| priority_attr.0).unwrap_or(0);
        let use_candidate = UseCandidateAttr::is_set(msg);
        let username = msg
            .get(stun::attributes::ATTR_USERNAME)
            .unwrap_or_default();

        if let Some(component) = self.component_mut(stream_id, component_id) {
            if component.incoming_checks.len() >= MAX_REMOTE_CANDIDATES {
                log::warn!(
                    "[{}]: dropping early check from {}, queue full",
                    self.get_name(),
                    from
                );
                return;
            }
            component.incoming_checks.push(IncomingCheck {
                from,
                local_socket,
                priority,
                use_candidate,
                username,
            });
        }
    }

    /// Replays early checks once the remote candidate list exists.
    pub(crate) async fn replay_incoming_checks(&mut self, stream_id: u32, component_id: u16) {
        let queued: Vec<IncomingCheck> = match self.component_mut(stream_id, component_id) {
            Some(component) => component.incoming_checks.drain(..).collect(),
            None => return,
        };

        for check in queued {
            let remote_id = self.find_or_learn_remote(
                stream_id,
                component_id,
                check.from,
                Some(check.priority).filter(|p| *p != 0),
            );
            if let Some(remote_id) = remote_id {
                self.triggered_check(
                    stream_id,
                    component_id,
                    check.local_socket,
                    remote_id,
                    check.use_candidate,
                )
                .await;
            }
        }
    }

    /// Looks up the remote candidate for a source address, learning a
    /// peer-reflexive one when it is unknown.
    fn find_or_learn_remote(
        &mut self,
        stream_id: u32,
        component_id: u16,
        from: SocketAddr,
        priority: Option<u32>,
    ) -> Option<CandidateId> {
        if let Some(component) = self.component(stream_id, component_id) {
            for id in &component.remote_candidates {
                if let Some(c) = self.candidates.get(*id) {
                    if c.addr == from && c.transport != TransportType::TcpActive {
                        return Some(*id);
                    }
                }
            }
        }

        let foundation = self.next_peer_reflexive_foundation();
        let priority = priority.unwrap_or_else(|| {
            candidate_priority(
                self.compatibility,
                CandidateKind::PeerReflexive,
                TransportType::Udp,
                crate::addr::is_ipv6(&from),
                foundation,
                component_id,
            )
        });
        let candidate = Candidate {
            id: crate::rand::generate_cand_id(),
            kind: CandidateKind::PeerReflexive,
            transport: TransportType::Udp,
            addr: from,
            base_addr: from,
            priority,
            foundation: foundation.to_string(),
            local_foundation: foundation,
            stream_id,
            component_id,
            username: None,
            password: None,
            turn: None,
            socket: None,
        };
        log::debug!(
            "[{}]: adding a new peer-reflexive remote candidate {}",
            self.get_name(),
            from
        );
        self.add_remote_candidate(candidate, true)
    }

    /// The triggered-check ladder for an inbound request on a known
    /// remote.
    async fn triggered_check(
        &mut self,
        stream_id: u32,
        component_id: u16,
        local_socket: SocketId,
        remote_id: CandidateId,
        use_candidate: bool,
    ) {
        // The local candidate is identified by the receiving socket.
        let local_id = match self.local_candidate_for_socket(stream_id, component_id, local_socket)
        {
            Some(id) => id,
            None => return,
        };

        let pair_id = match self.find_pair(stream_id, local_id, remote_id) {
            Some(id) => id,
            None => match self.try_add_pair(local_id, remote_id) {
                Some(id) => id,
                None => return,
            },
        };

        let state = match self.pairs.get(pair_id) {
            Some(p) => p.state,
            None => return,
        };
        let now = Instant::now();

        match state {
            CandidatePairState::Frozen | CandidatePairState::Waiting => {
                self.start_check(pair_id, now).await;
            }
            CandidatePairState::InProgress => {
                // Keep the outstanding transaction but allow its timer a
                // single fresh budget; cancelling converges slower.
                let rto = self.conncheck_rto;
                let budget = self.conncheck_max_retransmissions;
                if let Some(pair) = self.pairs.get_mut(pair_id) {
                    if !pair.timer_restarted {
                        pair.timer_restarted = true;
                        if let Some(txn) = pair.transaction.as_mut() {
                            txn.timer.restart(now, rto, budget);
                        }
                    }
                }
            }
            CandidatePairState::Succeeded => {
                if self.is_controlling() {
                    // Help aggressive nomination converge on both sides.
                    self.start_check(pair_id, now).await;
                }
            }
            CandidatePairState::Failed => {
                self.start_check(pair_id, now).await;
            }
            CandidatePairState::Cancelled => {}
        }

        if use_candidate {
            self.mark_pair_nominated(stream_id, component_id, pair_id).await;
        }
    }

    pub(crate) fn local_candidate_for_socket(
        &self,
        stream_id: u32,
        component_id: u16,
        socket: SocketId,
    ) -> Option<CandidateId> {
        let component = self.component(stream_id, component_id)?;

        let find = |wanted: SocketId| {
            // Prefer the exact socket match; host candidates and the
            // srflx candidates derived from them share a socket, the
            // host one wins.
            component
                .local_candidates
                .iter()
                .copied()
                .find(|id| {
                    self.candidates
                        .get(*id)
                        .map(|c| {
                            c.socket == Some(wanted)
                                && c.kind != CandidateKind::ServerReflexive
                        })
                        .unwrap_or(false)
                })
                .or_else(|| {
                    component.local_candidates.iter().copied().find(|id| {
                        self.candidates
                            .get(*id)
                            .map(|c| c.socket == Some(wanted))
                            .unwrap_or(false)
                    })
                })
        };

        find(socket).or_else(|| {
            // Established TCP connections resolve through the listener
            // or active factory they came from.
            let parent = self.sockets.get(socket).and_then(|s| s.parent)?;
            find(parent)
        })
    }

    // ---- responses to inbound requests ---------------------------------

    async fn send_binding_success(
        &mut self,
        stream_id: u32,
        local_socket: SocketId,
        from: SocketAddr,
        request: &Message,
    ) {
        let local_pwd = match self.stream(stream_id) {
            Some(s) => s.local_credentials.pwd.clone(),
            None => return,
        };

        let mut out = Message::new();
        {
            let mut setters: Vec<Box<dyn Setter>> = vec![
                Box::new(request.clone()),
                Box::new(BINDING_SUCCESS),
                Box::new(XorMappedAddress {
                    ip: from.ip(),
                    port: from.port(),
                }),
                Box::new(MessageIntegrity::new_short_term_integrity(local_pwd)),
            ];
            if self.compatibility == IceCompatibility::Rfc5245 {
                setters.push(Box::new(FINGERPRINT));
            }

            if let Err(err) = out.build(&setters) {
                log::warn!(
                    "[{}]: failed to build binding success: {}",
                    self.get_name(),
                    err
                );
                return;
            }
        }
        if let Err(err) = send_on_socket(&mut self.sockets, local_socket, &out.raw, from).await {
            log::debug!("[{}]: success response send failed: {}", self.get_name(), err);
        }
    }

    async fn send_role_conflict_error(
        &mut self,
        stream_id: u32,
        local_socket: SocketId,
        from: SocketAddr,
        request: &Message,
    ) {
        let local_pwd = match self.stream(stream_id) {
            Some(s) => s.local_credentials.pwd.clone(),
            None => return,
        };

        let mut out = Message::new();
        let result = out.build(&[
            Box::new(request.clone()),
            Box::new(BINDING_ERROR),
            Box::new(ErrorCodeAttribute {
                code: CODE_ROLE_CONFLICT,
                reason: vec![],
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(local_pwd)),
            Box::new(FINGERPRINT),
        ]);
        if result.is_ok() {
            let _ = send_on_socket(&mut self.sockets, local_socket, &out.raw, from).await;
        }
    }
}
