use super::*;

#[test]
fn test_random_generator_collision() {
    let test_cases = vec![
        ("CandidateID", generate_cand_id as fn() -> String),
        ("PWD", generate_pwd),
        ("Ufrag", generate_ufrag),
    ];

    const N: usize = 10;
    for (name, generator) in test_cases {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..N {
            let v = generator();
            assert!(seen.insert(v), "{name} generated a duplicate value");
        }
    }
}

#[test]
fn test_credential_lengths_within_limits() {
    let ufrag = generate_ufrag();
    let pwd = generate_pwd();

    assert!(ufrag.len() >= 4 && ufrag.len() <= 256);
    assert!(pwd.len() >= 22 && pwd.len() <= 256);
}
