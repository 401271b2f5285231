use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use stun::agent::TransactionId;
use stun::message::*;
use stun::xoraddr::XorMappedAddress;
use tokio::time::{Duration, Instant};

use super::agent_config::AgentConfig;
use super::agent_gather_test::make_internal;
use super::agent_internal::*;
use super::AgentEvent;
use crate::candidate::*;
use crate::control::{AttrControlling, Role};
use crate::error::Result;
use crate::priority::PriorityAttr;
use crate::state::CandidatePairState;
use crate::stream::MAX_REMOTE_CANDIDATES;
use crate::transaction::{StunTimer, StunTransaction};
use crate::use_candidate::UseCandidateAttr;

fn localhost_config() -> AgentConfig {
    AgentConfig {
        is_controlling: true,
        local_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        ..Default::default()
    }
}

fn remote(addr: &str, foundation: &str, priority: u32) -> Candidate {
    RemoteCandidate {
        kind: CandidateKind::Host,
        transport: TransportType::Udp,
        addr: SocketAddr::from_str(addr).unwrap(),
        priority,
        foundation: foundation.to_owned(),
        username: None,
        password: None,
    }
    .into_candidate(1, 1)
}

/// A stream with one gathered UDP host candidate on loopback.
async fn internal_with_local(
    config: AgentConfig,
) -> (
    AgentInternal,
    tokio::sync::mpsc::UnboundedReceiver<AgentEvent>,
    CandidateId,
) {
    let (mut internal, events) = make_internal(config);
    internal.streams.push(crate::stream::Stream::new(1, 1));
    internal.gather_candidates(1).await.unwrap();
    let local = internal.component(1, 1).unwrap().local_candidates[0];
    (internal, events, local)
}

#[tokio::test]
async fn test_conncheck_list_sorted_and_capped() -> Result<()> {
    let mut config = localhost_config();
    config.max_connectivity_checks = Some(5);
    let (mut internal, _events, _local) = internal_with_local(config).await;

    for n in 0..10u32 {
        internal.add_remote_candidate(remote(&format!("10.0.0.2:{}", 6000 + n), &n.to_string(), 1000 + n), false);
    }

    let stream = internal.stream(1).unwrap();
    assert_eq!(stream.conncheck_list.len(), 5);

    let priorities: Vec<u64> = stream
        .conncheck_list
        .iter()
        .map(|id| internal.pairs.get(*id).unwrap().priority)
        .collect();
    let mut sorted = priorities.clone();
    sorted.sort_by(|a, b| b.cmp(a));
    assert_eq!(priorities, sorted, "conncheck_list must be sorted");

    // The survivors are the pairs built from the highest-priority
    // remotes.
    let remote_prios: Vec<u32> = stream
        .conncheck_list
        .iter()
        .map(|id| {
            let pair = internal.pairs.get(*id).unwrap();
            internal.candidates.get(pair.remote).unwrap().priority
        })
        .collect();
    assert!(remote_prios.iter().all(|p| *p >= 1005));
    Ok(())
}

#[tokio::test]
async fn test_initial_unfreeze_picks_lowest_component_per_foundation() -> Result<()> {
    let (mut internal, _events) = make_internal(localhost_config());
    internal.streams.push(crate::stream::Stream::new(1, 2));
    internal.gather_candidates(1).await?;

    for component_id in [1u16, 2u16] {
        let candidate = RemoteCandidate {
            kind: CandidateKind::Host,
            transport: TransportType::Udp,
            addr: SocketAddr::from_str(&format!("10.0.0.2:{}", 6000 + component_id)).unwrap(),
            priority: 1000,
            foundation: "9".to_owned(),
            username: None,
            password: None,
        }
        .into_candidate(1, component_id);
        internal.add_remote_candidate(candidate, false);
    }

    internal.initial_unfreeze(1);

    let stream = internal.stream(1).unwrap();
    assert_eq!(stream.conncheck_list.len(), 2);
    for pair_id in &stream.conncheck_list {
        let pair = internal.pairs.get(*pair_id).unwrap();
        // Locals of both components share a foundation, so both pairs
        // share one too; only the RTP pair thaws.
        if pair.component_id == 1 {
            assert_eq!(pair.state, CandidatePairState::Waiting);
        } else {
            assert_eq!(pair.state, CandidatePairState::Frozen);
        }
    }
    Ok(())
}

fn arm_pair(internal: &mut AgentInternal, pair_id: PairId) -> TransactionId {
    let txn_id = TransactionId::new();
    let pair = internal.pairs.get_mut(pair_id).unwrap();
    pair.state = CandidatePairState::InProgress;
    pair.transaction = Some(StunTransaction::new(
        txn_id,
        vec![],
        StunTimer::start(Instant::now(), Duration::from_millis(600), 3),
    ));
    internal
        .transactions
        .register(txn_id, TransactionOwner::Pair(pair_id));
    txn_id
}

#[tokio::test]
async fn test_response_from_wrong_source_fails_pair() -> Result<()> {
    let (mut internal, _events, _local) = internal_with_local(localhost_config()).await;
    internal.add_remote_candidate(remote("10.0.0.2:6000", "1", 1000), false);

    let pair_id = internal.stream(1).unwrap().conncheck_list[0];
    let txn_id = arm_pair(&mut internal, pair_id);

    let mut resp = Message::new();
    resp.build(&[Box::new(txn_id), Box::new(BINDING_SUCCESS)])?;

    // Source does not match the remote candidate: symmetric NAT.
    internal
        .handle_check_response(pair_id, &mut resp, SocketAddr::from_str("10.9.9.9:1234").unwrap())
        .await;

    assert_eq!(
        internal.pairs.get(pair_id).unwrap().state,
        CandidatePairState::Failed
    );
    assert!(internal.stream(1).unwrap().valid_list.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_role_conflict_response_flips_and_requeues() -> Result<()> {
    let (mut internal, _events, _local) = internal_with_local(localhost_config()).await;
    internal.add_remote_candidate(remote("10.0.0.2:6000", "1", 1000), false);

    assert_eq!(internal.role, Role::Controlling);
    let pair_id = internal.stream(1).unwrap().conncheck_list[0];
    let old_priority = internal.pairs.get(pair_id).unwrap().priority;
    let txn_id = arm_pair(&mut internal, pair_id);

    let mut resp = Message::new();
    resp.build(&[
        Box::new(txn_id),
        Box::new(BINDING_ERROR),
        Box::new(stun::error_code::ErrorCodeAttribute {
            code: stun::error_code::CODE_ROLE_CONFLICT,
            reason: vec![],
        }),
    ])?;

    internal
        .handle_check_response(pair_id, &mut resp, SocketAddr::from_str("10.0.0.2:6000").unwrap())
        .await;

    assert_eq!(internal.role, Role::Controlled);
    let pair = internal.pairs.get(pair_id).unwrap();
    assert_eq!(pair.state, CandidatePairState::Waiting);
    assert!(!pair.controlling);
    assert_ne!(pair.priority, old_priority, "priority re-derived after flip");
    Ok(())
}

#[tokio::test]
async fn test_success_response_builds_valid_pair_once() -> Result<()> {
    let (mut internal, _events, local) = internal_with_local(localhost_config()).await;
    internal.add_remote_candidate(remote("127.0.0.1:6000", "1", 1000), false);

    let local_addr = internal.candidates.get(local).unwrap().addr;
    let pair_id = internal.stream(1).unwrap().conncheck_list[0];
    let txn_id = arm_pair(&mut internal, pair_id);

    let mut resp = Message::new();
    resp.build(&[
        Box::new(txn_id),
        Box::new(BINDING_SUCCESS),
        Box::new(XorMappedAddress {
            ip: local_addr.ip(),
            port: local_addr.port(),
        }),
    ])?;

    let from = SocketAddr::from_str("127.0.0.1:6000").unwrap();
    internal.handle_check_response(pair_id, &mut resp, from).await;

    let pair = internal.pairs.get(pair_id).unwrap();
    assert_eq!(pair.state, CandidatePairState::Succeeded);
    // The mapped address matches the host candidate: the pair validates
    // itself.
    assert_eq!(pair.valid_pair, Some(pair_id));
    assert_eq!(internal.stream(1).unwrap().valid_list, vec![pair_id]);

    // A retransmitted response cannot double-count.
    internal.handle_check_response(pair_id, &mut resp, from).await;
    assert_eq!(internal.stream(1).unwrap().valid_list.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_mapped_address_synthesizes_prflx_local() -> Result<()> {
    let (mut internal, _events, local) = internal_with_local(localhost_config()).await;
    internal.add_remote_candidate(remote("127.0.0.1:6000", "1", 1000), false);

    let pair_id = internal.stream(1).unwrap().conncheck_list[0];
    let txn_id = arm_pair(&mut internal, pair_id);

    // A NAT mapping nobody advertised.
    let mapped = SocketAddr::from_str("198.51.100.3:31000").unwrap();
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
        .handle_check_response(pair_id, &mut resp, SocketAddr::from_str("127.0.0.1:6000").unwrap())
        .await;

    let component = internal.component(1, 1).unwrap();
    let prflx = component
        .local_candidates
        .iter()
        .filter_map(|id| internal.candidates.get(*id))
        .find(|c| c.kind == CandidateKind::PeerReflexive)
        .expect("peer-reflexive local");
    assert_eq!(prflx.addr, mapped);
    // Peer-reflexive foundations are numbered from 100.
    assert!(prflx.foundation.parse::<u32>().unwrap() >= 100);
    // Its base is the socket the original check left from.
    assert_eq!(
        prflx.base_addr,
        internal.candidates.get(local).unwrap().base_addr
    );

    let pair = internal.pairs.get(pair_id).unwrap();
    assert_eq!(pair.state, CandidatePairState::Succeeded);
    let valid = pair.valid_pair.expect("valid pair");
    assert_ne!(valid, pair_id);
    assert!(internal.stream(1).unwrap().valid_list.contains(&valid));
    Ok(())
}

#[tokio::test]
async fn test_inbound_check_learns_prflx_remote() -> Result<()> {
    let (mut internal, mut events, _local) = internal_with_local(localhost_config()).await;
    internal.add_remote_candidate(remote("127.0.0.1:6000", "1", 1000), false);

    let socket = internal.component(1, 1).unwrap().sockets[0];
    let from = SocketAddr::from_str("127.0.0.1:39999").unwrap();

    let mut request = Message::new();
    request.build(&[
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(PriorityAttr(123_456)),
    ])?;

    internal
        .handle_inbound_check(1, 1, socket, from, &request)
        .await;

    let component = internal.component(1, 1).unwrap();
    assert_eq!(component.remote_candidates.len(), 2);
    let prflx = component
        .remote_candidates
        .iter()
        .filter_map(|id| internal.candidates.get(*id))
        .find(|c| c.kind == CandidateKind::PeerReflexive)
        .expect("prflx remote");
    assert_eq!(prflx.addr, from);
    assert_eq!(prflx.priority, 123_456, "priority taken from the request");
    assert!(prflx.foundation.parse::<u32>().unwrap() >= 100);

    let mut announced = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, AgentEvent::NewRemoteCandidate { .. }) {
            announced = true;
        }
    }
    assert!(announced);
    Ok(())
}

#[tokio::test]
async fn test_inbound_check_role_conflict_yields_when_lower() -> Result<()> {
    let mut config = localhost_config();
    config.tie_breaker = Some(1);
    let (mut internal, _events, _local) = internal_with_local(config).await;
    internal.add_remote_candidate(remote("127.0.0.1:6000", "1", 1000), false);
    let socket = internal.component(1, 1).unwrap().sockets[0];

    // Both sides claim controlling; the peer's tie-breaker is larger.
    let mut request = Message::new();
    request.build(&[
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(AttrControlling(2)),
        Box::new(PriorityAttr(1000)),
    ])?;

    internal
        .handle_inbound_check(1, 1, socket, SocketAddr::from_str("127.0.0.1:6000").unwrap(), &request)
        .await;

    // The lower tie-breaker flips and keeps processing the request.
    assert_eq!(internal.role, Role::Controlled);
    assert!(internal.stream(1).unwrap().initial_binding_request_received);
    Ok(())
}

#[tokio::test]
async fn test_inbound_check_role_conflict_rejects_when_higher() -> Result<()> {
    let mut config = localhost_config();
    config.tie_breaker = Some(0xffff_ffff_ffff_ffff);
    let (mut internal, _events, _local) = internal_with_local(config).await;
    internal.add_remote_candidate(remote("127.0.0.1:6000", "1", 1000), false);
    let socket = internal.component(1, 1).unwrap().sockets[0];

    let mut request = Message::new();
    request.build(&[
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(AttrControlling(2)),
    ])?;

    internal
        .handle_inbound_check(1, 1, socket, SocketAddr::from_str("127.0.0.1:6000").unwrap(), &request)
        .await;

    // We keep the role and the request is answered with an error, so the
    // session state does not advance.
    assert_eq!(internal.role, Role::Controlling);
    assert!(!internal.stream(1).unwrap().initial_binding_request_received);
    Ok(())
}

#[tokio::test]
async fn test_early_checks_queued_and_bounded() -> Result<()> {
    let (mut internal, _events, _local) = internal_with_local(localhost_config()).await;
    let socket = internal.component(1, 1).unwrap().sockets[0];

    let mut request = Message::new();
    request.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])?;

    for n in 0..(MAX_REMOTE_CANDIDATES + 5) {
        let from = SocketAddr::from_str(&format!("127.0.0.1:{}", 40000 + n)).unwrap();
        internal.handle_inbound_check(1, 1, socket, from, &request).await;
    }

    let component = internal.component(1, 1).unwrap();
    assert_eq!(component.incoming_checks.len(), MAX_REMOTE_CANDIDATES);
    assert!(component.remote_candidates.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_early_check_replayed_after_remotes_arrive() -> Result<()> {
    let (mut internal, _events, _local) = internal_with_local(localhost_config()).await;
    let socket = internal.component(1, 1).unwrap().sockets[0];
    let peer = "127.0.0.1:41000";

    let mut request = Message::new();
    request.build(&[
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(UseCandidateAttr::new()),
        Box::new(PriorityAttr(2000)),
    ])?;
    internal
        .handle_inbound_check(1, 1, socket, SocketAddr::from_str(peer).unwrap(), &request)
        .await;
    assert_eq!(internal.component(1, 1).unwrap().incoming_checks.len(), 1);

    internal.add_remote_candidate(remote(peer, "1", 2000), false);
    internal.on_remote_candidates_added(1, 1).await;

    let component = internal.component(1, 1).unwrap();
    assert!(component.incoming_checks.is_empty(), "queue drained");
    assert_eq!(internal.stream(1).unwrap().conncheck_list.len(), 1);

    // The replayed USE-CANDIDATE left the pair nominated.
    let pair_id = internal.stream(1).unwrap().conncheck_list[0];
    assert!(internal.pairs.get(pair_id).unwrap().nominated);
    Ok(())
}

#[tokio::test]
async fn test_aggressive_check_is_nominated_and_discard_port_suppressed() -> Result<()> {
    let (mut internal, _events, _local) = internal_with_local(localhost_config()).await;
    // Discard port: the check arms but never transmits.
    internal.add_remote_candidate(remote("127.0.0.1:9", "1", 1000), false);

    let pair_id = internal.stream(1).unwrap().conncheck_list[0];
    internal.pairs.get_mut(pair_id).unwrap().state = CandidatePairState::Waiting;
    internal.start_check(pair_id, Instant::now()).await;

    let pair = internal.pairs.get(pair_id).unwrap();
    assert_eq!(pair.state, CandidatePairState::InProgress);
    assert!(pair.nominated, "aggressive mode nominates every check");
    assert!(pair.transaction.is_some());
    assert_eq!(internal.transactions.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_regular_nomination_waits_then_settles() -> Result<()> {
    let mut config = localhost_config();
    config.regular_nomination = true;
    let (mut internal, _events, _local) = internal_with_local(config).await;

    internal.add_remote_candidate(remote("127.0.0.1:6000", "best", 9000), false);
    internal.add_remote_candidate(remote("127.0.0.1:6001", "worse", 1000), false);

    let stream = internal.stream(1).unwrap();
    let best = stream.conncheck_list[0];
    let worse = stream.conncheck_list[1];

    // The lesser pair validated; the best one is still being retried.
    internal.pairs.get_mut(best).unwrap().state = CandidatePairState::InProgress;
    internal.pairs.get_mut(worse).unwrap().state = CandidatePairState::Succeeded;

    let started = Instant::now();
    internal.stream_mut(1).unwrap().conncheck_started = Some(started);

    // Within the patience window nothing is nominated.
    internal.regular_nomination_tick(1, started + Duration::from_millis(1000)).await;
    assert!(!internal.pairs.get(worse).unwrap().use_candidate);

    // Past the timeout the succeeded pair is taken, best or not.
    internal
        .regular_nomination_tick(1, started + Duration::from_millis(3020))
        .await;
    assert!(internal.pairs.get(worse).unwrap().use_candidate);
    assert!(!internal.pairs.get(best).unwrap().use_candidate);
    Ok(())
}

#[tokio::test]
async fn test_regular_nomination_takes_best_when_it_succeeds() -> Result<()> {
    let mut config = localhost_config();
    config.regular_nomination = true;
    let (mut internal, _events, _local) = internal_with_local(config).await;

    internal.add_remote_candidate(remote("127.0.0.1:6000", "best", 9000), false);
    internal.add_remote_candidate(remote("127.0.0.1:6001", "worse", 1000), false);

    let stream = internal.stream(1).unwrap();
    let best = stream.conncheck_list[0];
    internal.pairs.get_mut(best).unwrap().state = CandidatePairState::Succeeded;

    let started = Instant::now();
    internal.stream_mut(1).unwrap().conncheck_started = Some(started);

    // No need to wait for the timeout when the front-runner is done.
    internal
        .regular_nomination_tick(1, started + Duration::from_millis(100))
        .await;
    assert!(internal.pairs.get(best).unwrap().use_candidate);
    Ok(())
}

#[tokio::test]
async fn test_unfreeze_related_same_stream() -> Result<()> {
    let (mut internal, _events) = make_internal(localhost_config());
    internal.streams.push(crate::stream::Stream::new(1, 2));
    internal.gather_candidates(1).await?;

    for component_id in [1u16, 2u16] {
        let candidate = RemoteCandidate {
            kind: CandidateKind::Host,
            transport: TransportType::Udp,
            addr: SocketAddr::from_str(&format!("127.0.0.1:{}", 6100 + component_id)).unwrap(),
            priority: 1000,
            foundation: "7".to_owned(),
            username: None,
            password: None,
        }
        .into_candidate(1, component_id);
        internal.add_remote_candidate(candidate, false);
    }

    let (rtp_pair, rtcp_pair) = {
        let stream = internal.stream(1).unwrap();
        let mut rtp = None;
        let mut rtcp = None;
        for id in &stream.conncheck_list {
            match internal.pairs.get(*id).unwrap().component_id {
                1 => rtp = Some(*id),
                2 => rtcp = Some(*id),
                _ => {}
            }
        }
        (rtp.unwrap(), rtcp.unwrap())
    };

    internal.pairs.get_mut(rtp_pair).unwrap().state = CandidatePairState::Succeeded;
    internal.unfreeze_related(1, rtp_pair);

    // The RTCP pair shares the foundation and thaws.
    assert_eq!(
        internal.pairs.get(rtcp_pair).unwrap().state,
        CandidatePairState::Waiting
    );
    Ok(())
}

#[tokio::test]
async fn test_check_timeout_fails_pair_and_forgets_transaction() -> Result<()> {
    let (mut internal, _events, _local) = internal_with_local(localhost_config()).await;
    internal.add_remote_candidate(remote("127.0.0.1:6000", "1", 1000), false);

    let pair_id = internal.stream(1).unwrap().conncheck_list[0];
    internal.pairs.get_mut(pair_id).unwrap().state = CandidatePairState::Waiting;

    let start = Instant::now();
    internal.start_check(pair_id, start).await;
    assert_eq!(internal.transactions.len(), 1);

    let mut now = start;
    for _ in 0..8 {
        now += Duration::from_secs(3);
        internal.conncheck_tick(now).await;
    }

    assert_eq!(
        internal.pairs.get(pair_id).unwrap().state,
        CandidatePairState::Failed
    );
    assert!(internal.transactions.is_empty());
    Ok(())
}
