// ==============================================================================
// hasher.rs - Incremental Content Digest
// ==============================================================================
// Description: Running SHA-256 over the merged byte stream
// Author: Matt Barham
// Created: 2026-10-13
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================
//
// The merger feeds this hasher during its single in-order pass, so the digest
// addresses file content and never depends on chunk arrival order.
//
// ==============================================================================

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Default)]
pub struct IncrementalHasher {
    inner: Sha256,
    bytes: u64,
}

impl IncrementalHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes fed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Consume the hasher and return the lowercase hex digest
    pub fn finalize_hex(self) -> String {
        to_hex(&self.inner.finalize())
    }
}

/// One-shot digest, used for per-chunk conflict detection
pub fn digest_hex(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            digest_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = IncrementalHasher::new();
        hasher.update(b"chunk-zero|");
        hasher.update(b"");
        hasher.update(b"chunk-one");
        assert_eq!(hasher.bytes_hashed(), 20);
        assert_eq!(hasher.finalize_hex(), digest_hex(b"chunk-zero|chunk-one"));
    }
}
