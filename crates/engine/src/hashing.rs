//! Stable string hashing used for bucketing users.

use sha2::{Digest, Sha256};

/// Number of buckets users are spread over for both the percentage gate and
/// variant assignment.
pub const BUCKETS: u64 = 100;

/// A pure, process-independent hash of a string key.
pub trait StableHash: Send + Sync {
    fn hash(&self, key: &str) -> u64;

    fn bucket(&self, key: &str) -> u64 {
        self.hash(key) % BUCKETS
    }
}

/// First 8 bytes of SHA-256 of the key, read big-endian.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hash;

impl StableHash for Sha256Hash {
    fn hash(&self, key: &str) -> u64 {
        let digest = Sha256::digest(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }
}

/// Key for the audience percentage gate.
pub fn gate_key(user_id: &str, experiment_name: &str) -> String {
    format!("{user_id}{experiment_name}")
}

/// Key for variant assignment.
pub fn assignment_key(user_id: &str, experiment_name: &str) -> String {
    format!("{user_id}:{experiment_name}")
}
