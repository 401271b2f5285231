use std::net::SocketAddr;

use stun::agent::TransactionId;
use stun::error_code::ErrorCodeAttribute;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::{Nonce, Realm, Username};
use tokio::time::{Duration, Instant};
use turn::proto::lifetime::Lifetime;

use super::agent_gather::ALLOCATION_REFRESH_MARGIN_SECS;
use super::agent_internal::*;
use super::AgentEvent;
use crate::candidate::{CandidateKind, TransportType};
use crate::compat::IceCompatibility;
use crate::socket::{send_on_socket, SocketId};
use crate::state::ComponentState;
use crate::transaction::{
    StunTimer, StunTransaction, TimerCheck, STUN_TIMER_DEFAULT_MAX_RETRANSMISSIONS,
    STUN_TIMER_DEFAULT_TIMEOUT,
};

impl AgentInternal {
    /// The Tr tick: a Binding indication on every selected pair, plus a
    /// Binding request towards the STUN server for components that still
    /// depend on their reflexive mapping staying alive.
    pub(crate) async fn on_tr_tick(&mut self) {
        let mut selected: Vec<(SocketId, SocketAddr)> = vec![];
        let mut nat_keepalives: Vec<(u32, u16, SocketId, SocketAddr)> = vec![];

        for stream in &self.streams {
            for component in &stream.components {
                if let Some(pair_id) = component.selected_pair {
                    if let Some(pair) = self.pairs.get(pair_id) {
                        let socket = self.candidates.get(pair.local).and_then(|c| c.socket);
                        let remote = self.candidates.get(pair.remote).map(|c| c.addr);
                        if let (Some(socket), Some(remote)) = (socket, remote) {
                            selected.push((socket, remote));
                        }
                    }
                }

                let keepalive_state = matches!(
                    component.state,
                    ComponentState::Gathering
                        | ComponentState::Connecting
                        | ComponentState::Connected
                );
                let stun_server = component.stun_server.or(self.stun_server);
                if keepalive_state {
                    if let Some(server) = stun_server {
                        let host_socket = component
                            .local_candidates
                            .iter()
                            .filter_map(|id| self.candidates.get(*id))
                            .find(|c| {
                                c.kind == CandidateKind::Host
                                    && c.transport == TransportType::Udp
                            })
                            .and_then(|c| c.socket);
                        if let Some(socket) = host_socket {
                            nat_keepalives.push((stream.id, component.id, socket, server));
                        }
                    }
                }
            }
        }

        for (socket, remote) in selected {
            if let Err(err) = self.send_binding_indication(socket, remote).await {
                log::debug!("[{}]: keepalive send failed: {}", self.get_name(), err);
            }
        }

        for (stream_id, component_id, socket, server) in nat_keepalives {
            let mut msg = Message::new();
            let built = msg.build(&[
                Box::new(TransactionId::new()),
                Box::new(BINDING_REQUEST),
                Box::new(FINGERPRINT),
            ]);
            if built.is_err() {
                continue;
            }
            self.transactions.register(
                msg.transaction_id,
                TransactionOwner::Keepalive {
                    stream_id,
                    component_id,
                },
            );
            if let Err(err) = send_on_socket(&mut self.sockets, socket, &msg.raw, server).await {
                log::debug!("[{}]: nat keepalive send failed: {}", self.get_name(), err);
                self.transactions.forget(&msg.transaction_id);
            }
        }
    }

    async fn send_binding_indication(
        &mut self,
        socket: SocketId,
        remote: SocketAddr,
    ) -> crate::error::Result<()> {
        let mut msg = Message::new();
        {
            let mut setters: Vec<Box<dyn Setter>> = vec![
                Box::new(TransactionId::new()),
                Box::new(MessageType::new(METHOD_BINDING, CLASS_INDICATION)),
            ];
            if self.compatibility == IceCompatibility::Rfc5245 {
                setters.push(Box::new(FINGERPRINT));
            }
            msg.build(&setters)?;
        }
        send_on_socket(&mut self.sockets, socket, &msg.raw, remote).await?;
        Ok(())
    }

    // ---- TURN refresh --------------------------------------------------

    /// Drives refresh deadlines and their retransmission sub-timers; part
    /// of the Ta tick.
    pub(crate) async fn refresh_tick(&mut self, now: Instant) {
        let ids: Vec<RefreshId> = self.refreshes.iter().map(|(id, _)| id).collect();
        for id in ids {
            let has_txn = self
                .refreshes
                .get(id)
                .map(|r| r.transaction.is_some())
                .unwrap_or(false);
            if has_txn {
                self.drive_refresh_timer(id, now).await;
            } else {
                let due = self
                    .refreshes
                    .get(id)
                    .map(|r| now >= r.next_refresh)
                    .unwrap_or(false);
                if due {
                    self.send_refresh(id, now).await;
                }
            }
        }
    }

    async fn send_refresh(&mut self, id: RefreshId, now: Instant) {
        let (turn, realm, nonce, base_socket, server) = match self.refreshes.get(id) {
            Some(r) => (
                r.turn.clone(),
                r.realm.clone(),
                r.nonce.clone(),
                r.base_socket,
                r.turn.addr,
            ),
            None => return,
        };

        let mut msg = Message::new();
        let built = msg.build(&[
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_REFRESH, CLASS_REQUEST)),
            Box::new(Username::new(
                stun::attributes::ATTR_USERNAME,
                turn.username.clone(),
            )),
            Box::new(Realm::new(stun::attributes::ATTR_REALM, realm.clone())),
            Box::new(Nonce::new(stun::attributes::ATTR_NONCE, nonce)),
            Box::new(MessageIntegrity::new_long_term_integrity(
                turn.username.clone(),
                realm,
                turn.password.clone(),
            )),
            Box::new(FINGERPRINT),
        ]);
        if built.is_err() {
            return;
        }

        self.transactions
            .register(msg.transaction_id, TransactionOwner::Refresh(id));
        if let Some(refresh) = self.refreshes.get_mut(id) {
            refresh.transaction = Some(StunTransaction::new(
                msg.transaction_id,
                msg.raw.clone(),
                StunTimer::start(
                    now,
                    STUN_TIMER_DEFAULT_TIMEOUT,
                    STUN_TIMER_DEFAULT_MAX_RETRANSMISSIONS,
                ),
            ));
        }

        log::debug!("[{}]: refreshing allocation on {}", self.get_name(), server);
        if let Err(err) = send_on_socket(&mut self.sockets, base_socket, &msg.raw, server).await {
            log::debug!("[{}]: refresh send failed: {}", self.get_name(), err);
        }
    }

    async fn drive_refresh_timer(&mut self, id: RefreshId, now: Instant) {
        let (check, buffer, base_socket, server, txn_id) = {
            let refresh = match self.refreshes.get_mut(id) {
                Some(r) => r,
                None => return,
            };
            let txn = match refresh.transaction.as_mut() {
                Some(t) => t,
                None => return,
            };
            (
                txn.timer.refresh(now),
                txn.buffer.clone(),
                refresh.base_socket,
                refresh.turn.addr,
                txn.id,
            )
        };

        match check {
            TimerCheck::Pending => {}
            TimerCheck::Retransmit => {
                let _ = send_on_socket(&mut self.sockets, base_socket, &buffer, server).await;
            }
            TimerCheck::Timeout => {
                self.transactions.forget(&txn_id);
                self.fail_refresh(id).await;
            }
        }
    }

    /// An allocation that can no longer be refreshed is surfaced and torn
    /// down.
    async fn fail_refresh(&mut self, id: RefreshId) {
        let (stream_id, component_id, server) = match self.refreshes.remove(id) {
            Some(refresh) => {
                if let Some(txn) = refresh.transaction {
                    self.transactions.forget(&txn.id);
                }
                (refresh.stream_id, refresh.component_id, refresh.turn.addr)
            }
            None => return,
        };
        log::warn!(
            "[{}]: allocation lost on {} for stream {} component {}",
            self.get_name(),
            server,
            stream_id,
            component_id
        );
        self.emit(AgentEvent::TurnAllocationFailed {
            stream_id,
            component_id,
            server,
        });
    }

    /// A response matching a refresh transaction: success re-arms the
    /// deadline, a 438 with a fresh realm replays once, everything else
    /// kills the allocation.
    pub(crate) async fn handle_refresh_response(
        &mut self,
        id: RefreshId,
        msg: &Message,
        from: SocketAddr,
    ) {
        if let Some(refresh) = self.refreshes.get_mut(id) {
            refresh.transaction = None;
        } else {
            return;
        }

        if msg.typ.class == CLASS_SUCCESS_RESPONSE {
            let mut lifetime = Lifetime::default();
            let lifetime_secs = lifetime
                .get_from(msg)
                .map(|_| lifetime.0.as_secs() as u32)
                .unwrap_or_else(|_| {
                    self.refreshes
                        .get(id)
                        .map(|r| r.lifetime_secs)
                        .unwrap_or(600)
                });
            let interval = lifetime_secs.saturating_sub(ALLOCATION_REFRESH_MARGIN_SECS);
            if let Some(refresh) = self.refreshes.get_mut(id) {
                refresh.lifetime_secs = lifetime_secs;
                refresh.next_refresh =
                    Instant::now() + Duration::from_secs(u64::from(interval));
                refresh.retried_auth = false;
            }
            log::debug!(
                "[{}]: allocation refreshed, next in {}s",
                self.get_name(),
                interval
            );
            return;
        }

        let mut code = ErrorCodeAttribute::default();
        let code_value = code.get_from(msg).map(|_| code.code.0).unwrap_or(0);

        if code_value == 438 || code_value == 401 {
            let realm = Realm::get_from_as(msg, stun::attributes::ATTR_REALM).ok();
            let nonce = Nonce::get_from_as(msg, stun::attributes::ATTR_NONCE).ok();
            let retry = {
                let refresh = match self.refreshes.get_mut(id) {
                    Some(r) => r,
                    None => return,
                };
                if refresh.retried_auth {
                    false
                } else {
                    refresh.retried_auth = true;
                    if let Some(realm) = realm {
                        refresh.realm = realm.text;
                    }
                    if let Some(nonce) = nonce {
                        refresh.nonce = nonce.text;
                    }
                    true
                }
            };
            if retry {
                // Authentication handshake: replay immediately with the
                // returned realm and nonce.
                self.send_refresh(id, Instant::now()).await;
                return;
            }
        }

        log::warn!(
            "[{}]: refresh rejected with {} by {}",
            self.get_name(),
            code_value,
            from
        );
        self.fail_refresh(id).await;
    }
}
