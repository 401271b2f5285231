use tokio::time::Instant;

use super::agent_internal::*;
use super::AgentEvent;
use crate::candidate::*;
use crate::compat::IceCompatibility;
use crate::error::*;
use crate::socket::SocketKind;
use crate::state::{CandidatePairState, ComponentState};

impl AgentInternal {
    /// Regular-nomination decision, run once per pacing tick for the
    /// controlling agent: wait for the best pair, settle for any
    /// succeeded pair after the timeout.
    pub(crate) async fn regular_nomination_tick(&mut self, stream_id: u32, now: Instant) {
        if !self.is_controlling() || self.aggressive_nomination {
            return;
        }

        let (component_id, started) = match self.stream(stream_id) {
            Some(stream) => {
                let component_id = match stream.components.first() {
                    Some(c) => c.id,
                    None => return,
                };
                (component_id, stream.conncheck_started)
            }
            None => return,
        };
        let started = match started {
            Some(started) => started,
            None => return,
        };

        // Stand down once something is nominated.
        let any_nominated = self.pairs_of_component(stream_id, component_id).iter().any(|id| {
            self.pairs.get(*id).map(|p| p.nominated).unwrap_or(false)
        });
        if any_nominated {
            return;
        }

        let succeeded: Vec<PairId> = self
            .pairs_of_component(stream_id, component_id)
            .into_iter()
            .filter(|id| {
                self.pairs
                    .get(*id)
                    .map(|p| p.state == CandidatePairState::Succeeded)
                    .unwrap_or(false)
            })
            .collect();
        if succeeded.is_empty() {
            return;
        }

        let overdue = now.checked_duration_since(started).unwrap_or_default()
            > self.regular_nomination_timeout;

        let to_nominate = if overdue {
            // Timeout: any succeeded pair is good enough, pick the best.
            succeeded.into_iter().max_by_key(|id| {
                self.pairs.get(*id).map(|p| p.priority).unwrap_or(0)
            })
        } else {
            self.best_pair_if_succeeded(stream_id, component_id)
        };

        if let Some(pair_id) = to_nominate {
            log::info!(
                "[{}]: nominating pair on stream {} component {}",
                self.get_name(),
                stream_id,
                component_id
            );
            if let Some(pair) = self.pairs.get_mut(pair_id) {
                pair.use_candidate = true;
            }
            self.start_check(pair_id, now).await;
        }
    }

    fn pairs_of_component(&self, stream_id: u32, component_id: u16) -> Vec<PairId> {
        self.stream(stream_id)
            .map(|s| {
                s.conncheck_list
                    .iter()
                    .copied()
                    .filter(|id| {
                        self.pairs
                            .get(*id)
                            .map(|p| p.component_id == component_id)
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The highest-priority pair of the component, when it already
    /// succeeded. A TCP-active pair against a peer-reflexive remote may
    /// stand in for its passive sibling that actually carried the check.
    fn best_pair_if_succeeded(&self, stream_id: u32, component_id: u16) -> Option<PairId> {
        let ordered = self.pairs_of_component(stream_id, component_id);
        let best = *ordered.first()?;
        let best_pair = self.pairs.get(best)?;

        if best_pair.state == CandidatePairState::Succeeded {
            return Some(best);
        }

        let local = self.candidates.get(best_pair.local)?;
        let remote = self.candidates.get(best_pair.remote)?;
        if local.transport == TransportType::TcpActive
            && remote.kind == CandidateKind::PeerReflexive
        {
            // Same remote address, passive local side.
            for id in &ordered {
                if let Some(p) = self.pairs.get(*id) {
                    if p.state != CandidatePairState::Succeeded {
                        continue;
                    }
                    let p_local = self.candidates.get(p.local);
                    let p_remote = self.candidates.get(p.remote);
                    if let (Some(pl), Some(pr)) = (p_local, p_remote) {
                        if pl.transport == TransportType::TcpPassive && pr.addr == remote.addr {
                            return Some(*id);
                        }
                    }
                }
            }
        }
        None
    }

    /// Inbound USE-CANDIDATE handling: nominate now when the pair has
    /// already been validated, or flag it so validation promotes it.
    pub(crate) async fn mark_pair_nominated(
        &mut self,
        stream_id: u32,
        component_id: u16,
        pair_id: PairId,
    ) {
        let (state, valid_pair) = match self.pairs.get(pair_id) {
            Some(p) => (p.state, p.valid_pair),
            None => return,
        };

        if let Some(pair) = self.pairs.get_mut(pair_id) {
            pair.nominated = true;
        }

        if state == CandidatePairState::Succeeded {
            let target = valid_pair.unwrap_or(pair_id);
            if let Some(pair) = self.pairs.get_mut(target) {
                pair.nominated = true;
            }
            self.promote_selected_pair(stream_id, component_id, target)
                .await;
            self.update_component_readiness(stream_id, component_id);
        }
    }

    /// Installs a newly nominated valid pair as the selected pair when it
    /// outranks the current one, RFC 5245 8.1.2, then prunes the check
    /// list.
    pub(crate) async fn promote_selected_pair(
        &mut self,
        stream_id: u32,
        component_id: u16,
        pair_id: PairId,
    ) {
        let new_priority = match self.pairs.get(pair_id) {
            Some(p) => p.priority,
            None => return,
        };

        let current = self
            .component(stream_id, component_id)
            .and_then(|c| c.selected_pair);
        if let Some(current_id) = current {
            if current_id == pair_id {
                return;
            }
            let current_priority = self
                .pairs
                .get(current_id)
                .map(|p| p.priority)
                .unwrap_or(0);
            if current_priority >= new_priority {
                return;
            }
        }

        if let Some(component) = self.component_mut(stream_id, component_id) {
            component.selected_pair = Some(pair_id);
            component.writable = true;
        }

        // A relayed selection retargets the TURN socket at the nominated
        // remote.
        let (local_id, remote_id) = match self.pairs.get(pair_id) {
            Some(p) => (p.local, p.remote),
            None => return,
        };
        let remote_addr = self.candidates.get(remote_id).map(|c| c.addr);
        if let (Some(local), Some(remote_addr)) = (self.candidates.get(local_id), remote_addr) {
            if local.is_relayed() {
                if let Some(socket_id) = local.socket {
                    if let Some(entry) = self.sockets.get_mut(socket_id) {
                        if let SocketKind::Turn(turn) = &mut entry.kind {
                            turn.peer = Some(remote_addr);
                        }
                    }
                }
            }
        }

        let (local_stats, remote_stats) = match (
            self.candidates.get(local_id),
            self.candidates.get(remote_id),
        ) {
            (Some(l), Some(r)) => (
                super::agent_stats::candidate_stats(l),
                super::agent_stats::candidate_stats(r),
            ),
            _ => return,
        };

        log::info!(
            "[{}]: selected pair on stream {} component {}: {} -> {}",
            self.get_name(),
            stream_id,
            component_id,
            local_stats.addr,
            remote_stats.addr
        );
        self.emit(AgentEvent::NewSelectedPair {
            stream_id,
            component_id,
            local: local_stats,
            remote: remote_stats,
        });
        self.publish_selected_pairs();

        self.prune_after_nomination(stream_id, component_id);
        self.update_component_readiness(stream_id, component_id);
    }

    /// Prunes the check list once a pair is nominated. Regular
    /// controlling cancels everything unchecked for the component;
    /// otherwise only pairs that can no longer win are cancelled, and an
    /// OC2007R2 controlled agent stops entirely once its TCP RTP pair is
    /// nominated.
    pub(crate) fn prune_after_nomination(&mut self, stream_id: u32, component_id: u16) {
        let regular_controlling = self.is_controlling() && !self.aggressive_nomination;

        let nominated_priority = self
            .pairs_of_component(stream_id, component_id)
            .into_iter()
            .filter_map(|id| self.pairs.get(id))
            .filter(|p| p.nominated)
            .map(|p| p.priority)
            .max()
            .unwrap_or(0);

        let stop_everything = self.compatibility == IceCompatibility::Oc2007R2
            && !self.is_controlling()
            && component_id == 1
            && {
                let selected = self
                    .component(stream_id, component_id)
                    .and_then(|c| c.selected_pair);
                selected
                    .and_then(|id| self.pairs.get(id))
                    .and_then(|p| self.candidates.get(p.local))
                    .map(|c| c.transport.is_tcp())
                    .unwrap_or(false)
            };

        let ids = self.pairs_of_component(stream_id, component_id);
        for id in ids {
            let pair = match self.pairs.get_mut(id) {
                Some(p) => p,
                None => continue,
            };
            match pair.state {
                CandidatePairState::Frozen | CandidatePairState::Waiting => {
                    if regular_controlling
                        || stop_everything
                        || pair.priority < nominated_priority
                    {
                        pair.state = CandidatePairState::Cancelled;
                    }
                }
                CandidatePairState::InProgress => {
                    if pair.nominated {
                        continue;
                    }
                    if regular_controlling
                        || stop_everything
                        || pair.priority < nominated_priority
                    {
                        pair.state = CandidatePairState::Cancelled;
                        let txn = pair.transaction.take();
                        if let Some(txn) = txn {
                            self.transactions.forget(&txn.id);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Ready once a nominated pair exists and nothing is left in flight.
    pub(crate) fn update_component_readiness(&mut self, stream_id: u32, component_id: u16) {
        let ids = self.pairs_of_component(stream_id, component_id);
        let mut any_nominated = false;
        let mut any_in_progress = false;
        for id in &ids {
            if let Some(pair) = self.pairs.get(*id) {
                any_nominated |= pair.nominated
                    && matches!(
                        pair.state,
                        CandidatePairState::Succeeded | CandidatePairState::InProgress
                    );
                any_in_progress |= pair.state == CandidatePairState::InProgress
                    || pair.state == CandidatePairState::Waiting;
            }
        }

        let has_selected = self
            .component(stream_id, component_id)
            .map(|c| c.selected_pair.is_some())
            .unwrap_or(false);

        if has_selected && any_nominated && !any_in_progress {
            self.set_component_state(stream_id, component_id, ComponentState::Ready);
        }
    }

    /// A component with remote candidates but nothing validated fails
    /// once every timer has run out.
    pub(crate) fn detect_component_failures(&mut self) {
        let mut failures: Vec<(u32, u16)> = vec![];
        for stream in &self.streams {
            if stream.gathering {
                continue;
            }
            let discovery_pending = self
                .discoveries
                .iter()
                .any(|(_, d)| d.stream_id == stream.id && !d.done);
            if discovery_pending {
                continue;
            }

            for component in &stream.components {
                if component.remote_candidates.is_empty()
                    || component.selected_pair.is_some()
                    || component.state == ComponentState::Failed
                    || component.state == ComponentState::Disconnected
                {
                    continue;
                }
                if !component.peer_gathering_done {
                    continue;
                }

                let pairs: Vec<&CandidatePair> = stream
                    .conncheck_list
                    .iter()
                    .filter_map(|id| self.pairs.get(*id))
                    .filter(|p| p.component_id == component.id)
                    .collect();
                if pairs.is_empty() {
                    continue;
                }
                let still_working = pairs.iter().any(|p| {
                    matches!(
                        p.state,
                        CandidatePairState::Frozen
                            | CandidatePairState::Waiting
                            | CandidatePairState::InProgress
                    )
                });
                let any_succeeded = pairs
                    .iter()
                    .any(|p| p.state == CandidatePairState::Succeeded);
                if !still_working && !any_succeeded {
                    failures.push((stream.id, component.id));
                }
            }
        }

        for (stream_id, component_id) in failures {
            log::warn!(
                "[{}]: stream {} component {} failed, no working pair",
                self.get_name(),
                stream_id,
                component_id
            );
            self.set_component_state(stream_id, component_id, ComponentState::Failed);
        }
    }

    // ---- forced selection ----------------------------------------------

    /// Forces the selected pair by foundations and turns further ICE
    /// processing for the component off. Keepalives continue.
    pub(crate) async fn force_selected_pair(
        &mut self,
        stream_id: u32,
        component_id: u16,
        local_foundation: &str,
        remote_foundation: &str,
    ) -> Result<bool> {
        if self.stream(stream_id).is_none() {
            return Err(Error::ErrStreamNotFound);
        }
        let component = self
            .component(stream_id, component_id)
            .ok_or(Error::ErrComponentNotFound)?;

        let local_id = component
            .local_candidates
            .iter()
            .copied()
            .find(|id| {
                self.candidates
                    .get(*id)
                    .map(|c| c.foundation == local_foundation)
                    .unwrap_or(false)
            })
            .ok_or(Error::ErrFoundationNotFound)?;
        let remote_id = component
            .remote_candidates
            .iter()
            .copied()
            .find(|id| {
                self.candidates
                    .get(*id)
                    .map(|c| c.foundation == remote_foundation)
                    .unwrap_or(false)
            })
            .ok_or(Error::ErrFoundationNotFound)?;

        let pair_id = match self.find_pair(stream_id, local_id, remote_id) {
            Some(id) => id,
            None => self
                .try_add_pair(local_id, remote_id)
                .ok_or(Error::ErrNoCandidatePairs)?,
        };

        if let Some(pair) = self.pairs.get_mut(pair_id) {
            pair.nominated = true;
            pair.state = CandidatePairState::Succeeded;
        }
        if let Some(component) = self.component_mut(stream_id, component_id) {
            component.fallback_mode = true;
            component.selected_pair = Some(pair_id);
            component.writable = true;
        }

        // Stand the check engine down for this component.
        let ids = self.pairs_of_component(stream_id, component_id);
        for id in ids {
            if id == pair_id {
                continue;
            }
            if let Some(pair) = self.pairs.get_mut(id) {
                if pair.is_unchecked() || pair.state == CandidatePairState::InProgress {
                    pair.state = CandidatePairState::Cancelled;
                    let txn = pair.transaction.take();
                    if let Some(txn) = txn {
                        self.transactions.forget(&txn.id);
                    }
                }
            }
        }

        self.promote_selected_pair(stream_id, component_id, pair_id).await;
        self.publish_selected_pairs();
        Ok(true)
    }

    /// Forces selection towards a remote candidate, picking the best
    /// local candidate able to reach it.
    pub(crate) async fn force_selected_remote(
        &mut self,
        stream_id: u32,
        component_id: u16,
        remote: RemoteCandidate,
    ) -> Result<bool> {
        if self.stream(stream_id).is_none() {
            return Err(Error::ErrStreamNotFound);
        }
        if self.component(stream_id, component_id).is_none() {
            return Err(Error::ErrComponentNotFound);
        }

        let candidate = remote.into_candidate(stream_id, component_id);
        let remote_foundation = candidate.foundation.clone();
        let remote_id = match self.add_remote_candidate(candidate, false) {
            Some(id) => id,
            None => {
                // Already known: find it by foundation.
                self.component(stream_id, component_id)
                    .and_then(|c| {
                        c.remote_candidates.iter().copied().find(|id| {
                            self.candidates
                                .get(*id)
                                .map(|c| c.foundation == remote_foundation)
                                .unwrap_or(false)
                        })
                    })
                    .ok_or(Error::ErrFoundationNotFound)?
            }
        };

        // The best local candidate that can pair with the remote.
        let local_id = {
            let remote = self.candidates.get(remote_id).cloned();
            let remote = match remote {
                Some(r) => r,
                None => return Err(Error::ErrFoundationNotFound),
            };
            self.component(stream_id, component_id)
                .map(|c| c.local_candidates.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|id| {
                    self.candidates
                        .get(*id)
                        .map(|local| can_pair(local, &remote))
                        .unwrap_or(false)
                })
                .max_by_key(|id| self.candidates.get(*id).map(|c| c.priority).unwrap_or(0))
        };
        let local_id = local_id.ok_or(Error::ErrNoCandidatePairs)?;

        let local_foundation = self
            .candidates
            .get(local_id)
            .map(|c| c.foundation.clone())
            .unwrap_or_default();
        self.force_selected_pair(stream_id, component_id, &local_foundation, &remote_foundation)
            .await
    }
}
