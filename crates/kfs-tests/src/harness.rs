//! Shard table harness for integration testing.

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;

use kfs_core::{hash_key, ContentKey};
use kfs_store::{
    BackendOpener, KfsConfig, MemoryOpener, RocksDbOpener, ShardConfig, ShardTable, StoreError,
    StreamConfig,
};
use tempfile::TempDir;
use tracing::info;

/// Initializes tracing for tests. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("kfs_tests=debug,kfs_store=debug")
        .with_test_writer()
        .try_init();
}

/// Backend used by a test table.
#[derive(Clone)]
enum TestBackend {
    Memory(MemoryOpener),
    RocksDb,
}

/// A shard table rooted in a temporary directory.
///
/// The directory lives as long as the harness, so the table can be closed
/// and reopened against the same on-disk state.
pub struct TestTable {
    dir: TempDir,
    config: KfsConfig,
    backend: TestBackend,
    table: Arc<ShardTable>,
}

impl TestTable {
    /// Small-shard configuration: 4 shards, 4-byte chunks, padding on,
    /// eviction off.
    pub fn small_config() -> KfsConfig {
        KfsConfig {
            shard_count: 4,
            idle_timeout_ms: -1,
            shard: ShardConfig {
                max_size: 1 << 20,
                chunk_size: 4,
                ..Default::default()
            },
            stream: StreamConfig {
                pad_last_chunk: true,
            },
            ..Default::default()
        }
    }

    /// Opens a table on in-memory backends.
    pub fn memory(config: KfsConfig) -> Result<Self, StoreError> {
        Self::open(config, TestBackend::Memory(MemoryOpener::new()))
    }

    /// Opens a table on RocksDB backends.
    pub fn rocksdb(config: KfsConfig) -> Result<Self, StoreError> {
        Self::open(config, TestBackend::RocksDb)
    }

    fn open(mut config: KfsConfig, backend: TestBackend) -> Result<Self, StoreError> {
        let dir = TempDir::new()?;
        config.table_path = dir.path().join("table");
        let table = Self::open_table(&config, &backend)?;

        info!(root = %table.root().display(), "Opened test table");
        Ok(Self {
            dir,
            config,
            backend,
            table,
        })
    }

    fn open_table(config: &KfsConfig, backend: &TestBackend) -> Result<Arc<ShardTable>, StoreError> {
        let opener: Arc<dyn BackendOpener> = match backend {
            TestBackend::Memory(opener) => Arc::new(opener.clone()),
            TestBackend::RocksDb => Arc::new(RocksDbOpener::new(config.backend.clone())),
        };
        ShardTable::open_with(config.clone(), opener)
    }

    /// Closes the table and opens it again from disk.
    pub fn reopen(&mut self) -> Result<(), StoreError> {
        self.table.close();
        self.table = Self::open_table(&self.config, &self.backend)?;
        Ok(())
    }

    /// Returns the shared table handle.
    pub fn table(&self) -> &Arc<ShardTable> {
        &self.table
    }

    /// Returns the temporary directory holding the table root.
    pub fn dir(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Returns the in-memory opener, if this table uses one.
    pub fn memory_opener(&self) -> Option<&MemoryOpener> {
        match &self.backend {
            TestBackend::Memory(opener) => Some(opener),
            TestBackend::RocksDb => None,
        }
    }

    /// Finds a content key routed to shard `index`.
    ///
    /// Different `salt` values yield different keys.
    pub fn key_for_shard(&self, index: u32, salt: u32) -> ContentKey {
        let mut attempt = 0u32;
        loop {
            let mut raw = salt.to_be_bytes().to_vec();
            raw.extend_from_slice(&attempt.to_be_bytes());
            let key = hash_key(&raw);
            if self.table.shard_index_for_key(key.as_slice()) == index {
                return key;
            }
            attempt += 1;
        }
    }
}

impl Deref for TestTable {
    type Target = ShardTable;

    fn deref(&self) -> &ShardTable {
        &self.table
    }
}
