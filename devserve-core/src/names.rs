//! Human-readable server name generation.

use petname::{Generator, Petnames};
use rand::SeedableRng;
use rand::rngs::StdRng;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

/// Generate an adjective-noun name not present in `existing`.
///
/// After `max_attempts` collisions a short time-based suffix guarantees
/// uniqueness rather than failing.
pub fn generate_name(existing: &BTreeSet<String>, max_attempts: u32) -> String {
    let mut rng = rand::thread_rng();
    let petnames = Petnames::default();
    for _ in 0..max_attempts {
        if let Some(name) = petnames.generate(&mut rng, 2, "-") {
            if !existing.contains(&name) {
                return name;
            }
        }
    }
    let base = petnames
        .generate(&mut rng, 2, "-")
        .unwrap_or_else(|| "server".to_string());
    let suffix = chrono::Utc::now().timestamp_millis() % 100_000;
    format!("{}-{}", base, suffix)
}

/// Deterministic variant: identical (command, env) inputs always yield the
/// same name.
///
/// The generator is seeded from a SHA-256 digest and constructed fresh per
/// call; a reused generator carries mutable RNG state and would produce a
/// different name the second time.
pub fn deterministic_name(command: &str, env: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command.trim().as_bytes());
    for (key, value) in env {
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    let seed: [u8; 32] = hasher.finalize().into();
    let mut rng = StdRng::from_seed(seed);
    Petnames::default()
        .generate(&mut rng, 2, "-")
        .unwrap_or_else(|| format!("server-{:x}", u32::from_be_bytes([seed[0], seed[1], seed[2], seed[3]])))
}
