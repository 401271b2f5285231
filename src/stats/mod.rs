use std::net::SocketAddr;

use serde::Serialize;

use crate::candidate::{CandidateKind, TransportType};
use crate::state::{CandidatePairState, ComponentState};

/// Snapshot of one candidate, local or remote.
#[derive(Clone, Debug, Serialize)]
pub struct CandidateStats {
    pub id: String,
    pub stream_id: u32,
    pub component_id: u16,
    pub kind: CandidateKind,
    pub transport: TransportType,
    pub addr: SocketAddr,
    pub base_addr: SocketAddr,
    pub priority: u32,
    pub foundation: String,
}

/// Snapshot of one candidate pair in the check list.
#[derive(Clone, Debug, Serialize)]
pub struct CandidatePairStats {
    pub stream_id: u32,
    pub component_id: u16,
    pub local_foundation: String,
    pub remote_foundation: String,
    pub priority: u64,
    pub state: CandidatePairState,
    pub nominated: bool,
    pub selected: bool,
}

/// Snapshot of a component's connectivity.
#[derive(Clone, Debug, Serialize)]
pub struct ComponentStats {
    pub stream_id: u32,
    pub component_id: u16,
    pub state: ComponentState,
    pub local_candidates: usize,
    pub remote_candidates: usize,
    pub writable: bool,
}
