use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::time::Duration;
use util::vnet::net::*;

use super::agent_internal::AgentInternal;
use crate::candidate::TurnServer;
use crate::compat::{IceCompatibility, TurnCompatibility};
use crate::socket::proxy::ProxyConfig;

/// Pacing timer Ta: one discovery or check transmission per tick.
pub(crate) const DEFAULT_TIMER_TA: Duration = Duration::from_millis(20);

/// Keepalive timer Tr.
pub(crate) const DEFAULT_TIMER_TR: Duration = Duration::from_secs(25);

/// Lower bound a configured Tr is clamped to.
pub(crate) const MIN_TIMER_TR: Duration = Duration::from_secs(15);

/// Cap on concurrent candidate pairs per stream; the lowest-priority
/// pairs are pruned beyond it.
pub(crate) const DEFAULT_MAX_CONNECTIVITY_CHECKS: usize = 80;

/// How long regular nomination holds out for the best pair before it
/// settles for any succeeded one.
pub(crate) const DEFAULT_REGULAR_NOMINATION_TIMEOUT: Duration = Duration::from_millis(3000);

/// Initial RTO for server-reflexive and relay discovery transactions
/// over unreliable sockets.
pub(crate) const DISCOVERY_RTO: Duration = Duration::from_millis(200);

/// Largest STUN payload the dispatcher will look at.
pub(crate) const MAX_STUN_PAYLOAD: usize = 1300;

pub(crate) const UFRAG_MIN_LEN: usize = 4;
pub(crate) const UFRAG_MAX_LEN: usize = 256;
pub(crate) const PWD_MIN_LEN: usize = 22;
pub(crate) const PWD_MAX_LEN: usize = 256;

/// Collects the arguments to `Agent` construction into a single
/// structure, for future-proofness of the interface.
#[derive(Default)]
pub struct AgentConfig {
    /// Which ICE dialect to speak; affects candidate priorities, check
    /// attributes and nomination pruning.
    pub ice_compatibility: IceCompatibility,
    pub turn_compatibility: TurnCompatibility,

    /// Whether this agent starts in the controlling role.
    pub is_controlling: bool,

    /// Aggressive nomination attaches USE-CANDIDATE to every check; the
    /// default. Regular nomination delays it until a pair is chosen.
    pub regular_nomination: bool,

    /// Role tie-breaker; random unless supplied.
    pub tie_breaker: Option<u64>,

    /// Pacing timer Ta, defaults to 20 ms.
    pub timer_ta: Option<Duration>,

    /// Keepalive timer Tr, defaults to 25 s and is clamped to 15 s min.
    pub timer_tr: Option<Duration>,

    /// Cap on candidate pairs per stream, defaults to 80.
    pub max_connectivity_checks: Option<usize>,

    /// Initial RTO of a connectivity check transaction.
    pub conncheck_rto: Option<Duration>,

    /// Retransmission budget of a connectivity check transaction.
    pub conncheck_max_retransmissions: Option<u32>,

    /// Regular-nomination fallback timeout, defaults to 3000 ms.
    pub regular_nomination_timeout: Option<Duration>,

    /// Agent-wide default STUN server; components may override.
    pub stun_server: Option<SocketAddr>,

    /// Agent-wide default TURN servers; components may override.
    pub turn_servers: Vec<TurnServer>,

    /// Proxy used when establishing TURN allocations over TCP.
    pub proxy: Option<ProxyConfig>,

    /// Local addresses to gather host candidates on. Interface
    /// enumeration happens outside this crate.
    pub local_addresses: Vec<IpAddr>,

    /// Abstracted network for tests (virtual networks); the real network
    /// when unset.
    pub net: Option<Arc<Net>>,
}

impl AgentConfig {
    /// Populates an agent and falls back to defaults if fields are unset.
    pub(crate) fn init_with_defaults(&self, a: &mut AgentInternal) {
        a.timer_ta = self.timer_ta.unwrap_or(DEFAULT_TIMER_TA);

        let tr = self.timer_tr.unwrap_or(DEFAULT_TIMER_TR);
        a.timer_tr = if tr < MIN_TIMER_TR { MIN_TIMER_TR } else { tr };

        a.max_connectivity_checks = self
            .max_connectivity_checks
            .unwrap_or(DEFAULT_MAX_CONNECTIVITY_CHECKS);

        a.conncheck_rto = self
            .conncheck_rto
            .unwrap_or(crate::transaction::STUN_TIMER_DEFAULT_TIMEOUT);

        a.conncheck_max_retransmissions = self
            .conncheck_max_retransmissions
            .unwrap_or(crate::transaction::STUN_TIMER_DEFAULT_MAX_RETRANSMISSIONS);

        a.regular_nomination_timeout = self
            .regular_nomination_timeout
            .unwrap_or(DEFAULT_REGULAR_NOMINATION_TIMEOUT);
    }
}
