//! Hashing, masking and retry helpers shared by the shard, proxy and
//! captcha modules

pub mod retry;

use sha2::{Digest, Sha256};

/// Process-independent 64-bit hash of a key.
///
/// Uses the first 8 bytes of the SHA-256 digest so every shard computes the
/// same value for the same key.
pub fn stable_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Short irreversible fingerprint of a secret (8 hex chars)
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// Truncate text to a maximum length
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
