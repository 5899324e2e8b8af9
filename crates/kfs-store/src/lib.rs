//! KFS Store - sharded local storage engine.
//!
//! Provides:
//! - Shard stores, each owning one ordered key-value backend
//! - A shard table that routes content keys to shards by XOR distance,
//!   opens shards lazily and closes idle ones in the background
//! - Chunk streams that split files into fixed-size indexed chunks

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod backend;
pub mod config;
pub mod shard;
pub mod stream;
pub mod table;

mod evict;

#[cfg(any(test, feature = "test-util"))]
pub use backend::MemoryOpener;
pub use backend::{Backend, BackendOpener, KeyRange, RocksDbOpener};
pub use config::{BackendTuning, KfsConfig, ShardConfig, StreamConfig};
pub use shard::{KeyStat, ShardStats, ShardStore};
pub use stream::{read_all, write_all, ChunkReader};
pub use table::{ShardListing, ShardRef, ShardStat, ShardTable, TableStats};

use std::path::PathBuf;

use kfs_core::KeyError;
use thiserror::Error;

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing store error
    #[error("Database error: {0}")]
    Database(String),

    /// Key derivation error (invalid key, index out of bounds)
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Routed shard index is outside the configured shard count
    #[error("Shard index {index} out of range (shard count {shard_count})")]
    ShardIndexRange {
        /// Requested index
        index: u64,
        /// Configured number of shards
        shard_count: u32,
    },

    /// Backing store could not be opened for a shard
    #[error("Failed to open shard at {path}: {reason}")]
    ShardOpen {
        /// Shard directory
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// Size query on a shard failed
    #[error("Failed to stat shard at {path}: {reason}")]
    ShardStat {
        /// Shard directory
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// Table root is missing its identity marker or is not a directory
    #[error("Invalid table path {path}: {reason}")]
    InvalidTablePath {
        /// Table root
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// Requested content is absent
    #[error("Not found: {0}")]
    NotFound(String),
}

/// `total - used` as a signed byte count, saturating at the `i64` bounds.
pub(crate) fn remaining_space(total: u64, used: u64) -> i64 {
    let diff = i128::from(total) - i128::from(used);
    i64::try_from(diff).unwrap_or(if diff < 0 { i64::MIN } else { i64::MAX })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_space() {
        assert_eq!(remaining_space(100, 30), 70);
        assert_eq!(remaining_space(10, 33), -23);
        assert_eq!(remaining_space(u64::MAX, 0), i64::MAX);
        assert_eq!(remaining_space(u64::MAX, 1), i64::MAX);
        assert_eq!(remaining_space(0, u64::MAX), i64::MIN);
        assert_eq!(remaining_space(1 << 63, 1), i64::MAX);
    }
}
