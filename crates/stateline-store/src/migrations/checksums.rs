//! Migration checksums
//!
//! A recorded checksum that no longer matches the embedded SQL means the
//! database was migrated by a different build.

use sha2::{Digest, Sha256};

/// SHA-256 of the migration text, hex encoded
pub fn compute_checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable_hex() {
        let checksum = compute_checksum("CREATE TABLE t (x)");
        assert_eq!(checksum.len(), 64);
        assert_eq!(checksum, compute_checksum("CREATE TABLE t (x)"));
        assert_ne!(checksum, compute_checksum("CREATE TABLE t (y)"));
    }
}
