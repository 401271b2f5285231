use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use tokio::time::{timeout, Duration};

use super::agent_config::AgentConfig;
use super::*;
use crate::candidate::{CandidateKind, RemoteCandidate, TransportType};
use crate::error::Result;
use crate::state::ComponentState;
use crate::stream::MAX_REMOTE_CANDIDATES;

fn remote_host(addr: &str, foundation: &str, priority: u32) -> RemoteCandidate {
    RemoteCandidate {
        kind: CandidateKind::Host,
        transport: TransportType::Udp,
        addr: SocketAddr::from_str(addr).unwrap(),
        priority,
        foundation: foundation.to_owned(),
        username: None,
        password: None,
    }
}

#[tokio::test]
async fn test_add_stream_returns_monotonic_ids() -> Result<()> {
    let agent = Agent::new(AgentConfig::default())?;

    assert_eq!(agent.add_stream(1).await?, 1);
    assert_eq!(agent.add_stream(2).await?, 2);
    agent.remove_stream(1).await?;
    assert_eq!(agent.add_stream(1).await?, 3);

    agent.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_stream_and_component_validation() -> Result<()> {
    let agent = Agent::new(AgentConfig::default())?;

    assert_eq!(
        agent.get_local_credentials(7).await,
        Err(crate::Error::ErrStreamNotFound)
    );
    let stream = agent.add_stream(1).await?;
    assert_eq!(
        agent.set_stun_info(stream, 9, SocketAddr::from_str("10.0.0.1:3478").unwrap()).await,
        Err(crate::Error::ErrComponentNotFound)
    );

    agent.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_local_credentials_round_trip() -> Result<()> {
    let agent = Agent::new(AgentConfig::default())?;
    let stream = agent.add_stream(1).await?;

    // Generated credentials respect the length limits.
    let (ufrag, pwd) = agent.get_local_credentials(stream).await?;
    assert!(ufrag.len() >= 4 && pwd.len() >= 22);

    agent
        .set_local_credentials(stream, "userfrag", "averylongsecretpassword")
        .await?;
    assert_eq!(
        agent.get_local_credentials(stream).await?,
        ("userfrag".to_owned(), "averylongsecretpassword".to_owned())
    );

    // Too short on either side is rejected without a state change.
    assert_eq!(
        agent.set_local_credentials(stream, "uf", "averylongsecretpassword").await,
        Err(crate::Error::ErrLocalUfragInvalidLength)
    );
    assert_eq!(
        agent.set_local_credentials(stream, "userfrag", "short").await,
        Err(crate::Error::ErrLocalPwdInvalidLength)
    );
    assert_eq!(
        agent.get_local_credentials(stream).await?,
        ("userfrag".to_owned(), "averylongsecretpassword".to_owned())
    );

    agent.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_set_remote_candidates_deduplicates() -> Result<()> {
    let agent = Agent::new(AgentConfig::default())?;
    let stream = agent.add_stream(1).await?;

    let list = vec![
        remote_host("10.0.0.2:6000", "1", 1000),
        remote_host("10.0.0.2:6001", "1", 999),
    ];
    assert_eq!(
        agent.set_remote_candidates(stream, 1, list.clone()).await?,
        2
    );
    // The identical list adds nothing more.
    assert_eq!(agent.set_remote_candidates(stream, 1, list).await?, 0);

    agent.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_remote_candidate_cap() -> Result<()> {
    let agent = Agent::new(AgentConfig::default())?;
    let stream = agent.add_stream(1).await?;

    let list: Vec<RemoteCandidate> = (0..(MAX_REMOTE_CANDIDATES as u32 + 10))
        .map(|n| {
            remote_host(
                &format!("10.0.{}.{}:6000", n / 250, n % 250 + 1),
                &n.to_string(),
                1000 + n,
            )
        })
        .collect();

    let added = agent.set_remote_candidates(stream, 1, list).await?;
    assert_eq!(added, MAX_REMOTE_CANDIDATES as i32);

    agent.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_tcp_active_remotes_are_ignored() -> Result<()> {
    let agent = Agent::new(AgentConfig::default())?;
    let stream = agent.add_stream(1).await?;

    let active = RemoteCandidate {
        kind: CandidateKind::Host,
        transport: TransportType::TcpActive,
        addr: SocketAddr::from_str("10.0.0.2:9").unwrap(),
        priority: 1000,
        foundation: "1".to_owned(),
        username: None,
        password: None,
    };
    assert_eq!(agent.set_remote_candidates(stream, 1, vec![active]).await?, 0);

    agent.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_send_requires_selected_pair() -> Result<()> {
    let agent = Agent::new(AgentConfig::default())?;
    let stream = agent.add_stream(1).await?;

    assert_eq!(
        agent.send(stream, 1, b"data").await,
        Err(crate::Error::ErrNoSelectedPair)
    );

    agent.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_attach_recv_is_exclusive() -> Result<()> {
    let agent = Agent::new(AgentConfig::default())?;
    let stream = agent.add_stream(1).await?;

    let _rx = agent.attach_recv(stream, 1).await?;
    assert!(matches!(
        agent.attach_recv(stream, 1).await,
        Err(crate::Error::ErrRecvAlreadyAttached)
    ));

    agent.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_gather_emits_candidates_then_done() -> Result<()> {
    let agent = Agent::new(AgentConfig {
        local_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        ..Default::default()
    })?;
    let mut events = agent.take_events().await.expect("event stream");
    let stream = agent.add_stream(1).await?;

    assert!(agent.gather_candidates(stream).await?);

    let mut saw_candidate = false;
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("gathering must finish")
            .expect("agent alive");
        match event {
            AgentEvent::NewCandidate { stream_id, .. } => {
                assert_eq!(stream_id, stream);
                saw_candidate = true;
            }
            AgentEvent::CandidateGatheringDone { stream_id } => {
                assert_eq!(stream_id, stream);
                // Ordering guarantee: done only after the candidates.
                assert!(saw_candidate);
                break;
            }
            _ => {}
        }
    }

    let locals = agent.get_local_candidates(stream, 1).await?;
    assert_eq!(locals.len(), 1);
    assert_eq!(locals[0].kind, CandidateKind::Host);
    assert_eq!(locals[0].addr, locals[0].base_addr);
    assert_eq!(locals[0].addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

    agent.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_restart_stream_regenerates_credentials() -> Result<()> {
    let agent = Agent::new(AgentConfig::default())?;
    let stream = agent.add_stream(1).await?;

    let before = agent.get_local_credentials(stream).await?;
    agent
        .set_remote_candidates(stream, 1, vec![remote_host("10.0.0.2:6000", "1", 1000)])
        .await?;

    assert!(agent.restart_stream(stream).await?);

    let after = agent.get_local_credentials(stream).await?;
    assert_ne!(before, after);

    // Candidate state was reset; the same remotes can be added again.
    assert_eq!(
        agent
            .set_remote_candidates(stream, 1, vec![remote_host("10.0.0.2:6000", "1", 1000)])
            .await?,
        1
    );

    agent.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_udp_full_ice_selects_host_pair() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let controlling = Agent::new(AgentConfig {
        is_controlling: true,
        local_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        ..Default::default()
    })?;
    let controlled = Agent::new(AgentConfig {
        is_controlling: false,
        local_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        ..Default::default()
    })?;

    let mut a_events = controlling.take_events().await.expect("events");
    let mut b_events = controlled.take_events().await.expect("events");

    let a_stream = controlling.add_stream(1).await?;
    let b_stream = controlled.add_stream(1).await?;

    controlling.gather_candidates(a_stream).await?;
    controlled.gather_candidates(b_stream).await?;

    // Exchange credentials and candidates out of band.
    let (a_ufrag, a_pwd) = controlling.get_local_credentials(a_stream).await?;
    let (b_ufrag, b_pwd) = controlled.get_local_credentials(b_stream).await?;
    controlling
        .set_remote_credentials(a_stream, &b_ufrag, &b_pwd)
        .await?;
    controlled
        .set_remote_credentials(b_stream, &a_ufrag, &a_pwd)
        .await?;

    // Give gathering a moment; loopback binds complete immediately.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let a_locals = controlling.get_local_candidates(a_stream, 1).await?;
    let b_locals = controlled.get_local_candidates(b_stream, 1).await?;
    assert_eq!(a_locals.len(), 1);
    assert_eq!(b_locals.len(), 1);

    let to_remote = |c: &crate::candidate::Candidate| RemoteCandidate {
        kind: c.kind,
        transport: c.transport,
        addr: c.addr,
        priority: c.priority,
        foundation: c.foundation.clone(),
        username: None,
        password: None,
    };
    controlling
        .set_remote_candidates(a_stream, 1, vec![to_remote(&b_locals[0])])
        .await?;
    controlled
        .set_remote_candidates(b_stream, 1, vec![to_remote(&a_locals[0])])
        .await?;
    controlling.end_of_candidates(a_stream, 1).await?;
    controlled.end_of_candidates(b_stream, 1).await?;

    // Both sides converge on the host pair.
    async fn wait_selected(
        events: &mut tokio::sync::mpsc::UnboundedReceiver<AgentEvent>,
    ) -> (crate::stats::CandidateStats, crate::stats::CandidateStats) {
        loop {
            match timeout(Duration::from_secs(10), events.recv()).await {
                Ok(Some(AgentEvent::NewSelectedPair { local, remote, .. })) => {
                    return (local, remote)
                }
                Ok(Some(_)) => {}
                _ => panic!("selection must happen"),
            }
        }
    }

    let (a_local, a_remote) = wait_selected(&mut a_events).await;
    let (b_local, b_remote) = wait_selected(&mut b_events).await;

    assert_eq!(a_local.addr, b_remote.addr);
    assert_eq!(b_local.addr, a_remote.addr);
    assert_eq!(a_local.kind, CandidateKind::Host);

    let selected = controlling.get_selected_pair(a_stream, 1).expect("snapshot");
    assert_eq!(selected.local.addr, a_local.addr);

    // Data flows over the selected pair.
    let mut b_rx = controlled.attach_recv(b_stream, 1).await?;
    let n = controlling.send(a_stream, 1, b"hello through ice").await?;
    assert_eq!(n, 17);
    let packet = timeout(Duration::from_secs(5), b_rx.recv())
        .await
        .expect("data must arrive")
        .expect("agent alive");
    assert_eq!(packet.data, b"hello through ice");
    assert_eq!(packet.from, a_local.addr);

    // The controlling side walked the full state ladder.
    drop(a_events);
    drop(b_events);

    controlling.close().await?;
    controlled.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_component_state_progression_on_connect() -> Result<()> {
    let a = Agent::new(AgentConfig {
        is_controlling: true,
        local_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        ..Default::default()
    })?;
    let b = Agent::new(AgentConfig {
        is_controlling: false,
        local_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        ..Default::default()
    })?;

    let mut a_events = a.take_events().await.expect("events");

    let sa = a.add_stream(1).await?;
    let sb = b.add_stream(1).await?;
    a.gather_candidates(sa).await?;
    b.gather_candidates(sb).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (a_ufrag, a_pwd) = a.get_local_credentials(sa).await?;
    let (b_ufrag, b_pwd) = b.get_local_credentials(sb).await?;
    a.set_remote_credentials(sa, &b_ufrag, &b_pwd).await?;
    b.set_remote_credentials(sb, &a_ufrag, &a_pwd).await?;

    let a_locals = a.get_local_candidates(sa, 1).await?;
    let b_locals = b.get_local_candidates(sb, 1).await?;
    let to_remote = |c: &crate::candidate::Candidate| RemoteCandidate {
        kind: c.kind,
        transport: c.transport,
        addr: c.addr,
        priority: c.priority,
        foundation: c.foundation.clone(),
        username: None,
        password: None,
    };
    a.set_remote_candidates(sa, 1, vec![to_remote(&b_locals[0])])
        .await?;
    b.set_remote_candidates(sb, 1, vec![to_remote(&a_locals[0])])
        .await?;
    a.end_of_candidates(sa, 1).await?;
    b.end_of_candidates(sb, 1).await?;

    let mut states = vec![];
    loop {
        match timeout(Duration::from_secs(10), a_events.recv()).await {
            Ok(Some(AgentEvent::ComponentStateChanged { state, .. })) => {
                states.push(state);
                if state == ComponentState::Ready {
                    break;
                }
            }
            Ok(Some(_)) => {}
            _ => panic!("component must become ready, got {states:?}"),
        }
    }

    // Monotonic ladder, no regressions.
    let expected_order = [
        ComponentState::Gathering,
        ComponentState::Connecting,
        ComponentState::Connected,
        ComponentState::Ready,
    ];
    let mut last = None;
    for state in &states {
        let idx = expected_order.iter().position(|s| s == state).unwrap();
        if let Some(last) = last {
            assert!(idx > last, "state went backwards: {states:?}");
        }
        last = Some(idx);
    }

    a.close().await?;
    b.close().await?;
    Ok(())
}
