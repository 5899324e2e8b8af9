//! Storage configuration.

use std::path::PathBuf;
use std::time::Duration;

use kfs_core::{
    ItemKeyLayout, KeyError, DEFAULT_CHUNK_SIZE, DEFAULT_DISTANCE_BITS, DEFAULT_IDLE_TIMEOUT_MS,
    DEFAULT_KEY_SEPARATOR, DEFAULT_MAX_SHARD_SIZE, DEFAULT_SHARD_COUNT, ITEM_KEY_LEN,
};
use serde::{Deserialize, Serialize};

use crate::backend::KeyRange;

/// Top-level configuration of a shard table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KfsConfig {
    /// Table root directory (a `.kfs` extension is added if missing)
    pub table_path: PathBuf,
    /// Reference id as hex; generated on first open when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    /// Maximum total size of the table in bytes
    pub max_table_size: u64,
    /// Number of shards the key space is split into
    pub shard_count: u32,
    /// Number of bits used for the XOR distance
    pub distance_bits: u32,
    /// Idle time in milliseconds before a shard is closed; negative disables eviction
    pub idle_timeout_ms: i64,
    /// Per-shard settings
    pub shard: ShardConfig,
    /// Chunk stream settings
    pub stream: StreamConfig,
    /// Backing store tuning
    pub backend: BackendTuning,
}

impl Default for KfsConfig {
    fn default() -> Self {
        Self {
            table_path: PathBuf::from("data.kfs"),
            reference_id: None,
            max_table_size: DEFAULT_MAX_SHARD_SIZE * u64::from(DEFAULT_SHARD_COUNT),
            shard_count: DEFAULT_SHARD_COUNT,
            distance_bits: DEFAULT_DISTANCE_BITS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            shard: ShardConfig::default(),
            stream: StreamConfig::default(),
            backend: BackendTuning::default(),
        }
    }
}

impl KfsConfig {
    /// Creates a configuration with the given table path.
    pub fn new(table_path: impl Into<PathBuf>) -> Self {
        Self {
            table_path: table_path.into(),
            ..Default::default()
        }
    }

    /// Returns the idle timeout, or `None` when eviction is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        u64::try_from(self.idle_timeout_ms)
            .ok()
            .map(Duration::from_millis)
    }

    /// Builds the item key layout for this configuration.
    pub fn item_layout(&self) -> Result<ItemKeyLayout, KeyError> {
        ItemKeyLayout::new(
            self.shard.key_separator,
            self.shard.max_size,
            self.shard.chunk_size,
        )
    }
}

/// Settings shared by every shard store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Maximum size of one shard in bytes
    pub max_size: u64,
    /// Size of one chunk in bytes
    pub chunk_size: u64,
    /// Byte separating the content key from the chunk index
    pub key_separator: u8,
    /// First key (inclusive) of the range used for stat and list
    pub start_key: Vec<u8>,
    /// Last key (exclusive) of the range used for stat and list
    pub end_key: Vec<u8>,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SHARD_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            key_separator: DEFAULT_KEY_SEPARATOR,
            start_key: Vec::new(),
            // sorts after every item key
            end_key: vec![0xFF; ITEM_KEY_LEN + 1],
        }
    }
}

impl ShardConfig {
    /// Returns the configured key range.
    pub fn key_range(&self) -> KeyRange {
        KeyRange::new(self.start_key.clone(), self.end_key.clone())
    }
}

/// Settings for chunk streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Zero-pad the final chunk of a file up to the chunk size
    pub pad_last_chunk: bool,
}

/// Pass-through tuning for the RocksDB backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendTuning {
    /// Maximum number of open files per shard
    pub max_open_files: i32,
    /// Block cache capacity in bytes
    pub block_cache_bytes: usize,
    /// Write buffer size in bytes
    pub write_buffer_bytes: usize,
    /// Block size in bytes
    pub block_size: usize,
    /// Keys between restart points for delta encoding
    pub block_restart_interval: i32,
    /// Compress blocks with LZ4
    pub compression: bool,
}

impl Default for BackendTuning {
    fn default() -> Self {
        Self {
            max_open_files: 1000,
            block_cache_bytes: 8 * 1024 * 1024,
            write_buffer_bytes: 4 * 1024 * 1024,
            block_size: 4096,
            block_restart_interval: 16,
            compression: false,
        }
    }
}
