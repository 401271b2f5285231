use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use stun::message::*;
use stun::textattrs::TextAttribute;
use stun::xoraddr::XorMappedAddress;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use turn::proto::lifetime::Lifetime;
use turn::proto::relayaddr::RelayedAddress;

use super::agent_config::AgentConfig;
use super::agent_internal::*;
use super::AgentEvent;
use crate::candidate::{CandidateKind, RelayType, TransportType, TurnServer};
use crate::error::Result;
use crate::socket::SocketKind;
use crate::state::ComponentState;

pub(crate) fn make_internal(
    config: AgentConfig,
) -> (AgentInternal, mpsc::UnboundedReceiver<AgentEvent>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let internal = AgentInternal::new(&config, event_tx, Arc::new(ArcSwapOption::empty()));
    (internal, event_rx)
}

fn localhost_config() -> AgentConfig {
    AgentConfig {
        local_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_gather_creates_udp_host_candidate() -> Result<()> {
    let (mut internal, _events) = make_internal(localhost_config());
    internal.streams.push(crate::stream::Stream::new(1, 1));
    let stream_id = 1;

    assert!(internal.gather_candidates(stream_id).await?);

    let component = internal.component(stream_id, 1).unwrap();
    assert_eq!(component.state, ComponentState::Gathering);
    assert_eq!(component.local_candidates.len(), 1);

    let candidate = internal
        .candidates
        .get(component.local_candidates[0])
        .unwrap();
    assert_eq!(candidate.kind, CandidateKind::Host);
    assert_eq!(candidate.transport, TransportType::Udp);
    assert_eq!(candidate.addr, candidate.base_addr);
    assert_eq!(candidate.foundation, "1");
    assert!(candidate.socket.is_some());
    assert!(candidate.priority > 0);
    Ok(())
}

#[tokio::test]
async fn test_gather_without_addresses_is_a_no_op() -> Result<()> {
    let (mut internal, _events) = make_internal(AgentConfig::default());
    internal.streams.push(crate::stream::Stream::new(1, 1));

    assert!(!internal.gather_candidates(1).await?);
    assert!(internal
        .component(1, 1)
        .unwrap()
        .local_candidates
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn test_gather_respects_udp_port_range() -> Result<()> {
    let (mut internal, _events) = make_internal(localhost_config());
    internal.streams.push(crate::stream::Stream::new(1, 1));
    internal
        .component_mut(1, 1)
        .unwrap()
        .udp_port_range = crate::stream::PortRange {
        min: 42200,
        max: 42210,
    };

    internal.gather_candidates(1).await?;

    let component = internal.component(1, 1).unwrap();
    let candidate = internal
        .candidates
        .get(component.local_candidates[0])
        .unwrap();
    assert!((42200..=42210).contains(&candidate.addr.port()));
    Ok(())
}

#[tokio::test]
async fn test_gathering_done_fires_after_discoveries_finish() -> Result<()> {
    let (mut internal, mut events) = make_internal(localhost_config());
    internal.streams.push(crate::stream::Stream::new(1, 1));

    internal.gather_candidates(1).await?;

    // No STUN/TURN servers configured: gathering completes immediately.
    let mut done = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, AgentEvent::CandidateGatheringDone { stream_id: 1 }) {
            done = true;
        }
    }
    assert!(done);
    assert!(!internal.stream(1).unwrap().gathering);
    Ok(())
}

#[tokio::test]
async fn test_srflx_discovery_queued_with_stun_server() -> Result<()> {
    let mut config = localhost_config();
    config.stun_server = Some(SocketAddr::from_str("203.0.113.10:3478").unwrap());
    let (mut internal, _events) = make_internal(config);
    internal.streams.push(crate::stream::Stream::new(1, 1));

    internal.gather_candidates(1).await?;

    assert_eq!(internal.discoveries.len(), 1);
    let (_, item) = internal.discoveries.iter().next().unwrap();
    assert_eq!(item.kind, DiscoveryKind::ServerReflexive);
    assert!(!item.pending && !item.done);
    assert!(internal.stream(1).unwrap().gathering);

    // The first pacing tick sends the Binding and registers the
    // transaction.
    internal.discovery_tick(Instant::now()).await;
    let (_, item) = internal.discoveries.iter().next().unwrap();
    assert!(item.pending);
    assert!(item.transaction.is_some());
    assert_eq!(internal.transactions.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_srflx_response_creates_candidate() -> Result<()> {
    let mut config = localhost_config();
    config.stun_server = Some(SocketAddr::from_str("203.0.113.10:3478").unwrap());
    let (mut internal, _events) = make_internal(config);
    internal.streams.push(crate::stream::Stream::new(1, 1));
    internal.gather_candidates(1).await?;
    internal.discovery_tick(Instant::now()).await;

    let (discovery_id, txn_id) = {
        let (id, item) = internal.discoveries.iter().next().unwrap();
        (id, item.transaction.as_ref().unwrap().id)
    };

    // Fabricate the server's answer.
    let mapped = SocketAddr::from_str("198.51.100.7:31000").unwrap();
    let mut resp = Message::new();
    resp.build(&[
        Box::new(txn_id),
        Box::new(BINDING_SUCCESS),
        Box::new(XorMappedAddress {
            ip: mapped.ip(),
            port: mapped.port(),
        }),
    ])?;

    internal
        .handle_discovery_response(
            discovery_id,
            &resp,
            SocketAddr::from_str("203.0.113.10:3478").unwrap(),
        )
        .await;

    let component = internal.component(1, 1).unwrap();
    assert_eq!(component.local_candidates.len(), 2);
    let srflx = component
        .local_candidates
        .iter()
        .filter_map(|id| internal.candidates.get(*id))
        .find(|c| c.kind == CandidateKind::ServerReflexive)
        .expect("srflx candidate");
    assert_eq!(srflx.addr, mapped);
    // The base is the host socket the request left from.
    assert_eq!(srflx.base_addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert!(!internal.stream(1).unwrap().gathering);
    Ok(())
}

fn turn_server() -> TurnServer {
    TurnServer {
        addr: SocketAddr::from_str("10.1.0.1:3478").unwrap(),
        username: "turnuser".to_owned(),
        password: "turnpass".to_owned(),
        relay_type: RelayType::Udp,
    }
}

async fn gather_with_turn() -> (AgentInternal, mpsc::UnboundedReceiver<AgentEvent>, DiscoveryId) {
    let mut config = localhost_config();
    config.turn_servers = vec![turn_server()];
    let (mut internal, events) = make_internal(config);
    internal.streams.push(crate::stream::Stream::new(1, 1));
    internal.gather_candidates(1).await.unwrap();
    internal.discovery_tick(Instant::now()).await;
    let id = internal.discoveries.iter().next().unwrap().0;
    (internal, events, id)
}

#[tokio::test]
async fn test_allocate_401_requeues_with_credentials() -> Result<()> {
    let (mut internal, _events, discovery_id) = gather_with_turn().await;
    let txn_id = internal
        .discoveries
        .get(discovery_id)
        .unwrap()
        .transaction
        .as_ref()
        .unwrap()
        .id;

    let mut resp = Message::new();
    resp.build(&[
        Box::new(txn_id),
        Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_ERROR_RESPONSE)),
        Box::new(stun::error_code::ErrorCodeAttribute {
            code: stun::error_code::CODE_UNAUTHORIZED,
            reason: vec![],
        }),
        Box::new(TextAttribute::new(
            stun::attributes::ATTR_REALM,
            "example.org".to_owned(),
        )),
        Box::new(TextAttribute::new(
            stun::attributes::ATTR_NONCE,
            "nonce123".to_owned(),
        )),
    ])?;

    internal
        .handle_discovery_response(discovery_id, &resp, turn_server().addr)
        .await;

    let item = internal.discoveries.get(discovery_id).unwrap();
    assert!(!item.done, "401 with realm keeps the item alive");
    assert!(!item.pending, "item is requeued for the next tick");
    assert_eq!(item.realm.as_deref(), Some("example.org"));
    assert_eq!(item.nonce.as_deref(), Some("nonce123"));

    // The next tick replays the Allocate with long-term credentials.
    internal.discovery_tick(Instant::now()).await;
    let item = internal.discoveries.get(discovery_id).unwrap();
    assert!(item.pending && item.transaction.is_some());
    Ok(())
}

#[tokio::test]
async fn test_allocate_success_creates_relay_and_refresh() -> Result<()> {
    let (mut internal, _events, discovery_id) = gather_with_turn().await;
    let txn_id = internal
        .discoveries
        .get(discovery_id)
        .unwrap()
        .transaction
        .as_ref()
        .unwrap()
        .id;

    let relayed = SocketAddr::from_str("203.0.113.5:40000").unwrap();
    let mapped = SocketAddr::from_str("198.51.100.7:31000").unwrap();
    let mut resp = Message::new();
    resp.build(&[
        Box::new(txn_id),
        Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_SUCCESS_RESPONSE)),
        Box::new(RelayedAddress {
            ip: relayed.ip(),
            port: relayed.port(),
        }),
        Box::new(XorMappedAddress {
            ip: mapped.ip(),
            port: mapped.port(),
        }),
        Box::new(Lifetime(Duration::from_secs(600))),
    ])?;

    internal
        .handle_discovery_response(discovery_id, &resp, turn_server().addr)
        .await;

    let component = internal.component(1, 1).unwrap();
    let candidates: Vec<_> = component
        .local_candidates
        .iter()
        .filter_map(|id| internal.candidates.get(*id))
        .collect();

    let relay = candidates
        .iter()
        .find(|c| c.kind == CandidateKind::Relayed)
        .expect("relay candidate");
    assert_eq!(relay.addr, relayed);
    assert!(relay.turn.is_some());
    let relay_socket = relay.socket.expect("relay socket");
    assert!(matches!(
        internal.sockets.get(relay_socket).unwrap().kind,
        SocketKind::Turn(_)
    ));

    // An unreliable base also yields the srflx sibling.
    assert!(candidates
        .iter()
        .any(|c| c.kind == CandidateKind::ServerReflexive && c.addr == mapped));

    assert_eq!(internal.refreshes.len(), 1);
    let (_, refresh) = internal.refreshes.iter().next().unwrap();
    assert_eq!(refresh.lifetime_secs, 600);
    let until = refresh
        .next_refresh
        .checked_duration_since(Instant::now())
        .unwrap_or_default();
    // (lifetime - 30)s, give the test a generous margin.
    assert!(until > Duration::from_secs(560) && until <= Duration::from_secs(570));
    Ok(())
}

#[tokio::test]
async fn test_allocate_hard_error_fails_discovery() -> Result<()> {
    let (mut internal, mut events, discovery_id) = gather_with_turn().await;
    let txn_id = internal
        .discoveries
        .get(discovery_id)
        .unwrap()
        .transaction
        .as_ref()
        .unwrap()
        .id;

    let mut resp = Message::new();
    resp.build(&[
        Box::new(txn_id),
        Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_ERROR_RESPONSE)),
        Box::new(stun::error_code::ErrorCodeAttribute {
            code: stun::error_code::ErrorCode(508),
            reason: vec![],
        }),
    ])?;

    internal
        .handle_discovery_response(discovery_id, &resp, turn_server().addr)
        .await;

    assert!(internal.discoveries.get(discovery_id).unwrap().done);
    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, AgentEvent::TurnAllocationFailed { .. }) {
            failed = true;
        }
    }
    assert!(failed);
    Ok(())
}

#[tokio::test]
async fn test_foundation_reused_across_components() -> Result<()> {
    let (mut internal, _events) = make_internal(localhost_config());
    internal.streams.push(crate::stream::Stream::new(1, 2));

    internal.gather_candidates(1).await?;

    let f1 = {
        let c = internal.component(1, 1).unwrap();
        internal
            .candidates
            .get(c.local_candidates[0])
            .unwrap()
            .foundation
            .clone()
    };
    let f2 = {
        let c = internal.component(1, 2).unwrap();
        internal
            .candidates
            .get(c.local_candidates[0])
            .unwrap()
            .foundation
            .clone()
    };
    // Same type, transport and base address: both components share one
    // foundation.
    assert_eq!(f1, f2);
    Ok(())
}

#[tokio::test]
async fn test_transaction_is_forgotten_after_timeout() -> Result<()> {
    let mut config = localhost_config();
    config.stun_server = Some(SocketAddr::from_str("203.0.113.10:3478").unwrap());
    let (mut internal, _events) = make_internal(config);
    internal.streams.push(crate::stream::Stream::new(1, 1));
    internal.gather_candidates(1).await?;

    let start = Instant::now();
    internal.discovery_tick(start).await;
    assert_eq!(internal.transactions.len(), 1);

    // Walk past every retransmission; 200ms, 400ms, 800ms, 1600ms.
    let mut now = start;
    for _ in 0..8 {
        now += Duration::from_secs(2);
        internal.discovery_tick(now).await;
    }

    assert_eq!(internal.transactions.len(), 0, "timed out id is forgotten");
    assert!(internal.discoveries.iter().next().unwrap().1.done);
    Ok(())
}
