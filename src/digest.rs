use sha2::{Digest, Sha256};

/// SHA-256 over raw bytes, lowercase hex.
///
/// Used as the primary/dedup key for cases and as the cache key for
/// externally-verified answers (eligibility query digests).
pub fn content_digest(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    let mut hex = String::with_capacity(64);
    for byte in hash {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
