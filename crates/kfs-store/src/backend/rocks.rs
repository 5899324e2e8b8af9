//! RocksDB backend.

use std::path::Path;

use rocksdb::{
    BlockBasedOptions, Cache, DBCompressionType, Direction, IteratorMode, Options, ReadOptions,
    DB,
};
use tracing::debug;

use super::{Backend, BackendOpener, KeyRange, KvIter};
use crate::config::BackendTuning;
use crate::StoreError;

fn db_error(e: rocksdb::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Opens one RocksDB instance per shard directory.
#[derive(Debug, Clone, Default)]
pub struct RocksDbOpener {
    tuning: BackendTuning,
}

impl RocksDbOpener {
    /// Creates an opener with the given tuning.
    pub fn new(tuning: BackendTuning) -> Self {
        Self { tuning }
    }

    fn options(&self) -> Options {
        let tuning = &self.tuning;

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_size(tuning.block_size);
        block_opts.set_block_restart_interval(tuning.block_restart_interval);
        if tuning.block_cache_bytes > 0 {
            let cache = Cache::new_lru_cache(tuning.block_cache_bytes);
            block_opts.set_block_cache(&cache);
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(tuning.max_open_files);
        opts.set_write_buffer_size(tuning.write_buffer_bytes);
        opts.set_compression_type(if tuning.compression {
            DBCompressionType::Lz4
        } else {
            DBCompressionType::None
        });
        opts.set_block_based_table_factory(&block_opts);
        opts
    }
}

impl BackendOpener for RocksDbOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Backend>, StoreError> {
        let db = DB::open(&self.options(), path).map_err(db_error)?;
        debug!(path = %path.display(), "Opened RocksDB shard");
        Ok(Box::new(RocksDbBackend { db }))
    }
}

/// Shard backend backed by a RocksDB instance.
pub struct RocksDbBackend {
    db: DB,
}

impl Backend for RocksDbBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db.get(key).map_err(db_error)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db.put(key, value).map_err(db_error)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.db.delete(key).map_err(db_error)
    }

    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.db
            .get_pinned(key)
            .map(|v| v.is_some())
            .map_err(db_error)
    }

    fn approximate_size(&self, range: &KeyRange) -> Result<u64, StoreError> {
        // Only flushed data is counted; memtable contents are not.
        let bounds = rocksdb::Range::new(range.start.as_slice(), range.end.as_slice());
        let sizes = self.db.get_approximate_sizes(&[bounds]);
        Ok(sizes.iter().sum())
    }

    fn iter_range<'a>(&'a self, range: &KeyRange) -> KvIter<'a> {
        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_upper_bound(range.end.clone());
        let iter = self.db.iterator_opt(
            IteratorMode::From(range.start.as_slice(), Direction::Forward),
            read_opts,
        );
        Box::new(iter.map(|item| item.map_err(db_error)))
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(db_error)
    }
}
