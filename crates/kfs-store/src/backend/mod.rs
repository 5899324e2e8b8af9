//! Backing key-value store boundary.
//!
//! Every shard owns exactly one [`Backend`], produced by a [`BackendOpener`]
//! for the shard's directory. Closing a shard drops its backend.
//!
//! Two implementations are provided:
//!
//! - [`RocksDbOpener`] - one RocksDB instance per shard directory.
//! - `MemoryOpener` - in-memory ordered maps keyed by path, for tests
//!   (behind the `test-util` feature).

#[cfg(any(test, feature = "test-util"))]
mod memory;
mod rocks;

#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryBackend, MemoryOpener};
pub use rocks::{RocksDbBackend, RocksDbOpener};

use std::path::Path;

use crate::StoreError;

/// A key/value pair yielded by range iteration.
pub type KvPair = (Box<[u8]>, Box<[u8]>);

/// Ordered iterator over a key range.
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<KvPair, StoreError>> + 'a>;

/// Half-open key range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// First key (inclusive)
    pub start: Vec<u8>,
    /// Last key (exclusive)
    pub end: Vec<u8>,
}

impl KeyRange {
    /// Creates a range.
    pub fn new(start: Vec<u8>, end: Vec<u8>) -> Self {
        Self { start, end }
    }

    /// Returns true if `key` falls inside the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && key < self.end.as_slice()
    }
}

/// Ordered key-value store owned by one shard.
///
/// Implementations must be `Send + Sync`; the shard table shares open
/// shards across threads.
pub trait Backend: Send + Sync {
    /// Retrieve a value. Returns `None` if not found.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store a value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Delete a key. Deleting an absent key is not an error.
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Check whether a key exists.
    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Approximate number of bytes used by keys in `range`.
    fn approximate_size(&self, range: &KeyRange) -> Result<u64, StoreError>;

    /// Iterate `(key, value)` pairs in `range` in key order.
    fn iter_range<'a>(&'a self, range: &KeyRange) -> KvIter<'a>;

    /// Persist buffered writes.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Opens backends for shard directories.
pub trait BackendOpener: Send + Sync {
    /// Open (creating if absent) the backend rooted at `path`.
    fn open(&self, path: &Path) -> Result<Box<dyn Backend>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_range_contains() {
        let range = KeyRange::new(b"b".to_vec(), b"d".to_vec());
        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c\xFF"));
        assert!(!range.contains(b"d"));
    }
}
