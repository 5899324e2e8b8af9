//! Key hashing.
//!
//! Keys that are not already `R` bits long are hashed down with RIPEMD-160,
//! whose digest is exactly `KEY_LEN` bytes.

use ripemd::{Digest, Ripemd160};

use crate::KEY_LEN;

/// Hashes arbitrary bytes down to a `KEY_LEN`-byte digest.
///
/// # Example
/// ```
/// use kfs_core::key_hash;
///
/// let digest = key_hash(b"A");
/// assert_eq!(hex::encode(digest), "ddadef707ba62c166051b9e3cd0294c27515f2bc");
/// ```
pub fn key_hash(data: &[u8]) -> [u8; KEY_LEN] {
    let mut hasher = KeyHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Incremental key hasher for inputs that arrive in pieces.
#[derive(Clone, Default)]
pub struct KeyHasher {
    inner: Ripemd160,
}

impl KeyHasher {
    /// Creates a new hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds more input.
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    /// Finalizes and returns the `KEY_LEN`-byte digest.
    pub fn finalize(&self) -> [u8; KEY_LEN] {
        let digest = self.inner.clone().finalize();
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(&digest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            hex::encode(key_hash(b"")),
            "9c1185a5c5e9fc54612808977ee8f548b2258d31"
        );
        assert_eq!(
            hex::encode(key_hash(b"A")),
            "ddadef707ba62c166051b9e3cd0294c27515f2bc"
        );
        assert_eq!(
            hex::encode(key_hash(b"abc")),
            "8eb208f7e05d987a9b044a8e98c6b087f15a0bfc"
        );
    }

    #[test]
    fn test_incremental_matches_single_shot() {
        let mut hasher = KeyHasher::new();
        hasher.update(b"Hello, ").update(b"World!");
        assert_eq!(hasher.finalize(), key_hash(b"Hello, World!"));
    }
}
