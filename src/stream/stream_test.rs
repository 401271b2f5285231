use super::*;
use crate::arena::Id;
use crate::candidate::Candidate;

fn candidate_id(n: u32) -> CandidateId {
    Id::<Candidate>::new(n, 0)
}

#[test]
fn test_stream_components_are_numbered_from_one() {
    let stream = Stream::new(1, 2);
    assert_eq!(stream.components.len(), 2);
    assert!(stream.component(1).is_some());
    assert!(stream.component(2).is_some());
    assert!(stream.component(0).is_none());
    assert!(stream.component(3).is_none());
}

#[test]
fn test_stream_generates_valid_credentials() {
    let stream = Stream::new(1, 1);
    let creds = &stream.local_credentials;
    assert!(creds.ufrag.len() >= 4 && creds.ufrag.len() <= 256);
    assert!(creds.pwd.len() >= 22 && creds.pwd.len() <= 256);
    assert!(stream.remote_credentials.ufrag.is_empty());
}

#[test]
fn test_validated_remote_fifo_is_bounded() {
    let mut component = Component::new(1);
    for n in 0..(MAX_VALIDATED_REMOTES as u32 + 10) {
        component.remember_validated(candidate_id(n));
    }
    assert_eq!(component.validated_remotes.len(), MAX_VALIDATED_REMOTES);
    // The oldest entries were evicted.
    assert_eq!(component.validated_remotes.front(), Some(&candidate_id(10)));
}

#[test]
fn test_validated_remote_fifo_dedups() {
    let mut component = Component::new(1);
    component.remember_validated(candidate_id(1));
    component.remember_validated(candidate_id(1));
    assert_eq!(component.validated_remotes.len(), 1);
}

#[test]
fn test_stream_restart_regenerates_credentials() {
    let mut stream = Stream::new(1, 1);
    let old = stream.local_credentials.clone();
    stream.remote_credentials = Credentials {
        ufrag: "remoteuf".to_owned(),
        pwd: "remotepassword1234567890".to_owned(),
    };
    stream.initial_binding_request_received = true;
    stream.component_mut(1).unwrap().remote_candidates.push(candidate_id(4));

    stream.restart();

    assert_ne!(stream.local_credentials, old);
    assert!(stream.remote_credentials.ufrag.is_empty());
    assert!(!stream.initial_binding_request_received);
    assert!(stream.conncheck_list.is_empty());
    assert!(stream.component(1).unwrap().remote_candidates.is_empty());
}

#[test]
fn test_port_range_unconstrained() {
    assert!(PortRange::default().is_unconstrained());
    assert!(!PortRange { min: 1, max: 10 }.is_unconstrained());
}
