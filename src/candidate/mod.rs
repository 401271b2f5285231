
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;

use crate::addr::{addr_equal_no_port, same_family};
use crate::arena::Id;
use crate::compat::IceCompatibility;
use crate::state::CandidatePairState;
use crate::transaction::StunTransaction;

pub use crate::socket::SocketId;

pub type CandidateId = Id<Candidate>;

/// Maximum length of a candidate foundation, RFC 5245 15.1.
pub const MAX_FOUNDATION_LEN: usize = 32;

/// Peer-reflexive foundations are numbered from here upwards so they can
/// never collide with gathered candidates, which count from zero.
pub const PEER_REFLEXIVE_FOUNDATION_BASE: u32 = 100;

/// The type of an ICE candidate, RFC 5245 4.1.1.1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CandidateKind {
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "relay")]
    Relayed,
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relayed => "relay",
        };
        write!(f, "{s}")
    }
}

/// Transport of a candidate. TCP candidates are either the connecting
/// ("active") or the listening ("passive") end, RFC 6544.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TransportType {
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "tcp-act")]
    TcpActive,
    #[serde(rename = "tcp-pass")]
    TcpPassive,
}

impl Default for TransportType {
    fn default() -> Self {
        Self::Udp
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Udp => "udp",
            Self::TcpActive => "tcp-act",
            Self::TcpPassive => "tcp-pass",
        };
        write!(f, "{s}")
    }
}

impl TransportType {
    pub fn is_tcp(&self) -> bool {
        !matches!(self, Self::Udp)
    }

    /// Whether a local candidate of transport `self` can form a pair with
    /// a remote candidate of transport `remote`: UDP pairs with UDP, and
    /// a TCP active end pairs with a passive end.
    #[must_use]
    pub fn pairs_with(&self, remote: TransportType) -> bool {
        matches!(
            (self, remote),
            (Self::Udp, TransportType::Udp)
                | (Self::TcpActive, TransportType::TcpPassive)
                | (Self::TcpPassive, TransportType::TcpActive)
        )
    }
}

/// How the relay allocation reaches the TURN server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RelayType {
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "tls")]
    Tls,
}

/// A configured TURN server. Relayed candidates keep a shared reference
/// back to the server they were allocated on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnServer {
    pub addr: SocketAddr,
    pub username: String,
    pub password: String,
    pub relay_type: RelayType,
}

/// A single ICE candidate, local or remote. Local candidates carry the
/// socket they send from; remote candidates have `socket == None`.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub id: String,
    pub kind: CandidateKind,
    pub transport: TransportType,
    /// The transport address the peer sees.
    pub addr: SocketAddr,
    /// The local source address used to send. Equals `addr` for host
    /// candidates.
    pub base_addr: SocketAddr,
    pub priority: u32,
    pub foundation: String,
    /// Numeric foundation identifier, feeds the priority formula.
    pub local_foundation: u32,
    pub stream_id: u32,
    pub component_id: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub turn: Option<Arc<TurnServer>>,
    pub socket: Option<SocketId>,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} (base {})",
            self.transport, self.kind, self.addr, self.base_addr
        )
    }
}

impl Candidate {
    /// Deep-copies credentials, shallow-copies the TURN back-reference.
    #[must_use]
    pub fn copy(&self) -> Candidate {
        self.clone()
    }

    /// Exact equality over the wire-visible identity of the candidate.
    #[must_use]
    pub fn equal(&self, other: &Candidate) -> bool {
        self.kind == other.kind
            && self.transport == other.transport
            && self.addr == other.addr
            && self.base_addr == other.base_addr
    }

    /// Port-insensitive equality, used for de-duplication.
    #[must_use]
    pub fn equal_no_port(&self, other: &Candidate) -> bool {
        self.kind == other.kind
            && self.transport == other.transport
            && addr_equal_no_port(&self.addr, &other.addr)
            && addr_equal_no_port(&self.base_addr, &other.base_addr)
    }

    /// Whether `self` shares a foundation with `other` under the grouping
    /// rules: same type, same transport, same base address ignoring the
    /// port, and, for server reflexive and relayed candidates, the same
    /// apparent address (and relay type) as well.
    #[must_use]
    pub fn shares_foundation_with(&self, other: &Candidate) -> bool {
        if self.kind != other.kind
            || self.transport != other.transport
            || !addr_equal_no_port(&self.base_addr, &other.base_addr)
        {
            return false;
        }

        match self.kind {
            CandidateKind::ServerReflexive => addr_equal_no_port(&self.addr, &other.addr),
            CandidateKind::Relayed => {
                let same_relay_type = match (&self.turn, &other.turn) {
                    (Some(a), Some(b)) => a.relay_type == b.relay_type,
                    (None, None) => true,
                    _ => false,
                };
                same_relay_type && addr_equal_no_port(&self.addr, &other.addr)
            }
            _ => true,
        }
    }

    /// Whether adding `self` next to existing candidate `other` would be
    /// redundant: same kind and transport with port-insensitively equal
    /// apparent and base addresses.
    #[must_use]
    pub fn redundant_with(&self, other: &Candidate) -> bool {
        self.equal_no_port(other)
    }

    pub fn is_relayed(&self) -> bool {
        self.kind == CandidateKind::Relayed
    }
}

/// A candidate received from the peer through signaling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCandidate {
    pub kind: CandidateKind,
    pub transport: TransportType,
    pub addr: SocketAddr,
    pub priority: u32,
    pub foundation: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RemoteCandidate {
    /// Materializes the signaled candidate for a component. Remote
    /// candidates have no socket and their base is taken to be their
    /// address.
    #[must_use]
    pub(crate) fn into_candidate(self, stream_id: u32, component_id: u16) -> Candidate {
        let mut foundation = self.foundation;
        foundation.truncate(MAX_FOUNDATION_LEN);
        Candidate {
            id: crate::rand::generate_cand_id(),
            kind: self.kind,
            transport: self.transport,
            addr: self.addr,
            base_addr: self.addr,
            priority: self.priority,
            foundation,
            local_foundation: 0,
            stream_id,
            component_id,
            username: self.username,
            password: self.password,
            turn: None,
            socket: None,
        }
    }
}

/// Computes the candidate priority, RFC 5245 4.1.2.1 with the profile's
/// type preference table.
///
/// The "other preference" half of the local preference encodes the address
/// family and the numeric foundation so that multi-homed hosts get unique
/// priorities per interface.
#[must_use]
pub fn candidate_priority(
    compat: IceCompatibility,
    kind: CandidateKind,
    transport: TransportType,
    base_is_ipv6: bool,
    local_foundation: u32,
    component_id: u16,
) -> u32 {
    let other_pref: u32 = if base_is_ipv6 {
        local_foundation
    } else {
        (1 << 10) | local_foundation
    };

    let direction_pref: u32 = match transport {
        TransportType::Udp => 7,
        TransportType::TcpActive => {
            if kind == CandidateKind::Host || kind == CandidateKind::Relayed {
                6
            } else {
                4
            }
        }
        TransportType::TcpPassive => {
            if kind == CandidateKind::Host || kind == CandidateKind::Relayed {
                4
            } else {
                2
            }
        }
    };

    let type_pref = u32::from(compat.type_preference(kind, transport));
    let local_pref = (2 << 13) * direction_pref + other_pref;

    0x100_0000 * type_pref + 0x100 * local_pref + (0x100 - u32::from(component_id))
}

/// Computes the pair priority, RFC 5245 5.7.2: `G` is the controlling
/// side's candidate priority and `D` the controlled side's.
#[must_use]
pub fn pair_priority(g: u32, d: u32) -> u64 {
    let (min, max) = if g < d { (g, d) } else { (d, g) };
    (1u64 << 32) * u64::from(min) + 2 * u64::from(max) + u64::from(g > d)
}

/// A connectivity check between one local and one remote candidate.
pub struct CandidatePair {
    pub local: CandidateId,
    pub remote: CandidateId,
    pub stream_id: u32,
    pub component_id: u16,
    /// `local_foundation ":" remote_foundation`, the unfreezing group key.
    pub foundation: String,
    pub priority: u64,
    pub state: CandidatePairState,
    pub nominated: bool,
    /// Snapshot of the agent role when the pair was (re)prioritized.
    pub controlling: bool,
    /// Set when a check on this pair produced a valid pair.
    pub valid_pair: Option<PairId>,
    /// The outstanding check transaction, if any.
    pub transaction: Option<StunTransaction>,
    /// An inbound triggered check may restart the retransmission timer of
    /// an in-progress pair exactly once.
    pub timer_restarted: bool,
    /// The next outgoing check on this pair carries USE-CANDIDATE.
    pub use_candidate: bool,
}

pub type PairId = Id<CandidatePair>;

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pair {} prio {} state {} nominated {}",
            self.foundation, self.priority, self.state, self.nominated
        )
    }
}

impl CandidatePair {
    #[must_use]
    pub fn new(
        local: &Candidate,
        local_id: CandidateId,
        remote: &Candidate,
        remote_id: CandidateId,
        controlling: bool,
    ) -> Self {
        let (g, d) = if controlling {
            (local.priority, remote.priority)
        } else {
            (remote.priority, local.priority)
        };

        Self {
            local: local_id,
            remote: remote_id,
            stream_id: local.stream_id,
            component_id: local.component_id,
            foundation: format!("{}:{}", local.foundation, remote.foundation),
            priority: pair_priority(g, d),
            state: CandidatePairState::Frozen,
            nominated: false,
            controlling,
            valid_pair: None,
            transaction: None,
            timer_restarted: false,
            use_candidate: false,
        }
    }

    /// Re-derives the pair priority after a role change.
    pub fn reprioritize(&mut self, controlling: bool, local_prio: u32, remote_prio: u32) {
        let (g, d) = if controlling {
            (local_prio, remote_prio)
        } else {
            (remote_prio, local_prio)
        };
        self.controlling = controlling;
        self.priority = pair_priority(g, d);
    }

    pub fn is_unchecked(&self) -> bool {
        matches!(
            self.state,
            CandidatePairState::Frozen | CandidatePairState::Waiting
        )
    }
}

/// Whether a local and a remote candidate may be paired at all: matching
/// component, compatible transports and the same address family. Server
/// reflexive locals are never paired, their host base covers the same
/// path.
#[must_use]
pub fn can_pair(local: &Candidate, remote: &Candidate) -> bool {
    local.component_id == remote.component_id
        && local.kind != CandidateKind::ServerReflexive
        && local.transport.pairs_with(remote.transport)
        && same_family(&local.addr, &remote.addr)
}
