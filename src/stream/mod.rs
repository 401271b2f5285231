#[cfg(test)]
mod stream_test;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::candidate::{CandidateId, PairId, TurnServer};
use crate::socket::SocketId;
use crate::state::ComponentState;

/// Hard upper bound of remote candidates accepted per component.
pub const MAX_REMOTE_CANDIDATES: usize = 25;

/// How many recently validated remote candidates a component remembers.
pub const MAX_VALIDATED_REMOTES: usize = 50;

/// Default cap on queued outbound packets per established TCP connection.
pub const DEFAULT_MAX_TCP_QUEUE_SIZE: usize = 50;

/// Application data delivered through an attached receive sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPacket {
    pub data: Vec<u8>,
    pub from: SocketAddr,
}

/// A connectivity check that arrived before the remote candidate list was
/// known. Replayed once candidates show up.
#[derive(Clone, Debug)]
pub struct IncomingCheck {
    pub from: SocketAddr,
    pub local_socket: SocketId,
    pub priority: u32,
    pub use_candidate: bool,
    pub username: Vec<u8>,
}

/// Inclusive port range, `(0, 0)` meaning "any".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn is_unconstrained(&self) -> bool {
        self.min == 0 && self.max == 0
    }
}

/// One transport path of a stream (RTP and RTCP being the classic two).
pub struct Component {
    pub id: u16,
    pub state: ComponentState,

    pub local_candidates: Vec<CandidateId>,
    pub remote_candidates: Vec<CandidateId>,
    /// FIFO of remotes that answered or produced a validated check.
    pub validated_remotes: VecDeque<CandidateId>,
    pub selected_pair: Option<PairId>,
    pub incoming_checks: Vec<IncomingCheck>,

    /// Per-component server overrides; the agent defaults apply when
    /// unset.
    pub stun_server: Option<SocketAddr>,
    pub turn_servers: Vec<Arc<TurnServer>>,

    pub enable_udp: bool,
    pub enable_tcp_active: bool,
    pub enable_tcp_passive: bool,
    pub writable: bool,
    pub peer_gathering_done: bool,
    /// Selection was forced from outside; the check engine stands down
    /// and only keepalives continue.
    pub fallback_mode: bool,

    pub udp_port_range: PortRange,
    pub tcp_active_port_range: PortRange,

    pub sockets: Vec<SocketId>,
    pub data_tx: Option<mpsc::UnboundedSender<DataPacket>>,

    /// Across a restart, the remote candidate of the previously selected
    /// pair survives so media can keep flowing.
    pub restart_candidate: Option<CandidateId>,
}

impl Component {
    #[must_use]
    pub fn new(id: u16) -> Self {
        Self {
            id,
            state: ComponentState::Disconnected,
            local_candidates: vec![],
            remote_candidates: vec![],
            validated_remotes: VecDeque::new(),
            selected_pair: None,
            incoming_checks: vec![],
            stun_server: None,
            turn_servers: vec![],
            enable_udp: true,
            enable_tcp_active: false,
            enable_tcp_passive: false,
            writable: false,
            peer_gathering_done: false,
            fallback_mode: false,
            udp_port_range: PortRange::default(),
            tcp_active_port_range: PortRange::default(),
            sockets: vec![],
            data_tx: None,
            restart_candidate: None,
        }
    }

    /// Remembers a remote as recently validated, bounded FIFO.
    pub fn remember_validated(&mut self, remote: CandidateId) {
        if self.validated_remotes.contains(&remote) {
            return;
        }
        if self.validated_remotes.len() >= MAX_VALIDATED_REMOTES {
            self.validated_remotes.pop_front();
        }
        self.validated_remotes.push_back(remote);
    }
}

/// ICE credentials of one side of a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub ufrag: String,
    pub pwd: String,
}

/// A bundle of components sharing one ICE session and credentials.
pub struct Stream {
    pub id: u32,
    pub components: Vec<Component>,

    pub local_credentials: Credentials,
    pub remote_credentials: Credentials,

    /// All candidate pairs of all components, priority descending.
    pub conncheck_list: Vec<PairId>,
    /// Pairs proven by a connectivity check, priority descending.
    pub valid_list: Vec<PairId>,

    pub gathering: bool,
    pub gathering_started: bool,
    pub rtcp_mux: bool,
    pub trickle_ice: bool,
    pub initial_binding_request_received: bool,

    pub tos: u8,
    pub max_tcp_queue_size: usize,

    /// When the first check of the current session was scheduled; drives
    /// the regular-nomination timeout.
    pub conncheck_started: Option<Instant>,
    /// Ta ticks consumed by the check list so far.
    pub conncheck_ticks: u64,
}

impl Stream {
    #[must_use]
    pub fn new(id: u32, n_components: u16) -> Self {
        let components = (1..=n_components).map(Component::new).collect();
        Self {
            id,
            components,
            local_credentials: Credentials {
                ufrag: crate::rand::generate_ufrag(),
                pwd: crate::rand::generate_pwd(),
            },
            remote_credentials: Credentials::default(),
            conncheck_list: vec![],
            valid_list: vec![],
            gathering: false,
            gathering_started: false,
            rtcp_mux: false,
            trickle_ice: false,
            initial_binding_request_received: false,
            tos: 0,
            max_tcp_queue_size: DEFAULT_MAX_TCP_QUEUE_SIZE,
            conncheck_started: None,
            conncheck_ticks: 0,
        }
    }

    pub fn component(&self, component_id: u16) -> Option<&Component> {
        self.components.iter().find(|c| c.id == component_id)
    }

    pub fn component_mut(&mut self, component_id: u16) -> Option<&mut Component> {
        self.components.iter_mut().find(|c| c.id == component_id)
    }

    /// Regenerates local credentials and resets per-session check state.
    /// Candidate and socket teardown is the agent's job; the selected
    /// pair is deliberately left in place.
    pub fn restart(&mut self) {
        self.local_credentials = Credentials {
            ufrag: crate::rand::generate_ufrag(),
            pwd: crate::rand::generate_pwd(),
        };
        self.remote_credentials = Credentials::default();
        self.conncheck_list.clear();
        self.valid_list.clear();
        self.initial_binding_request_received = false;
        self.gathering = false;
        self.gathering_started = false;
        self.conncheck_started = None;
        self.conncheck_ticks = 0;

        for component in &mut self.components {
            component.local_candidates.clear();
            component.remote_candidates.clear();
            component.validated_remotes.clear();
            component.incoming_checks.clear();
            component.peer_gathering_done = false;
        }
    }
}
