#[cfg(test)]
mod rand_test;

use rand::{thread_rng, Rng};

const RUNES_ALPHA: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const RUNES_CANDIDATE_ID: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789/+";

// Credential lengths chosen inside the [4, 256] / [22, 256] limits the
// agent enforces.
const LEN_UFRAG: usize = 16;
const LEN_PWD: usize = 32;

pub fn generate_random_string(n: usize, runes: &[u8]) -> String {
    let mut rng = thread_rng();

    (0..n)
        .map(|_| {
            let idx = rng.gen_range(0..runes.len());
            runes[idx] as char
        })
        .collect()
}

/// candidate-id = "candidate" ":" 1*32ice-char
pub fn generate_cand_id() -> String {
    format!("candidate:{}", generate_random_string(32, RUNES_CANDIDATE_ID))
}

/// Generates an ICE password.
pub fn generate_pwd() -> String {
    generate_random_string(LEN_PWD, RUNES_ALPHA)
}

/// Generates an ICE user fragment.
pub fn generate_ufrag() -> String {
    generate_random_string(LEN_UFRAG, RUNES_ALPHA)
}

/// Generates the 64-bit role tie-breaker.
pub fn generate_tie_breaker() -> u64 {
    thread_rng().gen::<u64>()
}
