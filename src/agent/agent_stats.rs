use super::agent_internal::AgentInternal;
use crate::candidate::Candidate;
use crate::stats::{CandidatePairStats, CandidateStats, ComponentStats};

pub(crate) fn candidate_stats(candidate: &Candidate) -> CandidateStats {
    CandidateStats {
        id: candidate.id.clone(),
        stream_id: candidate.stream_id,
        component_id: candidate.component_id,
        kind: candidate.kind,
        transport: candidate.transport,
        addr: candidate.addr,
        base_addr: candidate.base_addr,
        priority: candidate.priority,
        foundation: candidate.foundation.clone(),
    }
}

impl AgentInternal {
    /// Snapshots every pair in every check list.
    pub(crate) fn pair_stats(&self) -> Vec<CandidatePairStats> {
        let mut stats = vec![];
        for stream in &self.streams {
            for pair_id in &stream.conncheck_list {
                let pair = match self.pairs.get(*pair_id) {
                    Some(p) => p,
                    None => continue,
                };
                let local_foundation = self
                    .candidates
                    .get(pair.local)
                    .map(|c| c.foundation.clone())
                    .unwrap_or_default();
                let remote_foundation = self
                    .candidates
                    .get(pair.remote)
                    .map(|c| c.foundation.clone())
                    .unwrap_or_default();
                let selected = stream
                    .component(pair.component_id)
                    .map(|c| c.selected_pair == Some(*pair_id))
                    .unwrap_or(false);
                stats.push(CandidatePairStats {
                    stream_id: stream.id,
                    component_id: pair.component_id,
                    local_foundation,
                    remote_foundation,
                    priority: pair.priority,
                    state: pair.state,
                    nominated: pair.nominated,
                    selected,
                });
            }
        }
        stats
    }

    pub(crate) fn candidate_stats(&self, remote: bool) -> Vec<CandidateStats> {
        let mut stats = vec![];
        for stream in &self.streams {
            for component in &stream.components {
                let list = if remote {
                    &component.remote_candidates
                } else {
                    &component.local_candidates
                };
                for id in list {
                    if let Some(candidate) = self.candidates.get(*id) {
                        stats.push(candidate_stats(candidate));
                    }
                }
            }
        }
        stats
    }

    pub(crate) fn component_stats(&self) -> Vec<ComponentStats> {
        let mut stats = vec![];
        for stream in &self.streams {
            for component in &stream.components {
                stats.push(ComponentStats {
                    stream_id: stream.id,
                    component_id: component.id,
                    state: component.state,
                    local_candidates: component.local_candidates.len(),
                    remote_candidates: component.remote_candidates.len(),
                    writable: component.writable,
                });
            }
        }
        stats
    }
}
