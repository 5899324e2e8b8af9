//! KFS Core - identifiers and key derivation for the KFS storage engine.
//!
//! This crate provides:
//! - Fixed-length identifiers (`ReferenceId`, `ContentKey`, `ItemKey`)
//! - Key hashing and coercion of arbitrary byte strings
//! - Item key layout for chunked files
//! - XOR-distance shard routing and shard directory naming
//!
//! Everything here is pure: no I/O, no shared state.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod hash;
pub mod identifiers;
pub mod keys;
pub mod routing;

pub use hash::{key_hash, KeyHasher};
pub use identifiers::*;
pub use keys::{coerce_key, hash_key, is_valid_key, ItemKey, ItemKeyLayout, ITEM_KEY_LEN};
pub use routing::{
    coerce_table_path, parse_shard_directory_name, ShardRouter, REFERENCE_ID_FILE,
    SHARD_EXTENSION, TABLE_EXTENSION,
};

use thiserror::Error;

/// Number of bits in a reference id or content key.
pub const R: u64 = 160;

/// Length in bytes of a reference id or content key.
pub const KEY_LEN: usize = (R / 8) as usize;

/// Default number of bytes in a file chunk.
pub const DEFAULT_CHUNK_SIZE: u64 = 131_072;

/// Default number of bytes a single shard may hold (32 GiB).
pub const DEFAULT_MAX_SHARD_SIZE: u64 = 32 * 1024 * 1024 * 1024;

/// Default number of shards in a table.
pub const DEFAULT_SHARD_COUNT: u32 = 256;

/// Default number of bits used for the distance calculation.
pub const DEFAULT_DISTANCE_BITS: u32 = 8;

/// Default byte separating a content key from the chunk index in an item key.
pub const DEFAULT_KEY_SEPARATOR: u8 = b' ';

/// Default idle time in milliseconds before a shard is closed.
pub const DEFAULT_IDLE_TIMEOUT_MS: i64 = 60_000;

/// Errors from key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// A pre-hashed key was required but the input had the wrong length.
    #[error("invalid key: expected {expected} bytes, got {actual}")]
    InvalidKey {
        /// Required length in bytes.
        expected: usize,
        /// Length of the supplied key.
        actual: usize,
    },

    /// The chunk index has more decimal digits than the shard can address.
    #[error("chunk index {index} is out of bounds (max {max_digits} digits)")]
    IndexOutOfBounds {
        /// Requested chunk index.
        index: u64,
        /// Maximum number of decimal digits allowed.
        max_digits: usize,
    },

    /// A reference id could not be parsed.
    #[error("invalid reference id: {0}")]
    InvalidReferenceId(String),

    /// Key layout or routing parameters are unusable.
    #[error("invalid layout: {0}")]
    InvalidLayout(String),
}
