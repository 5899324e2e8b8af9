//! Shard table.
//!
//! Owns every open [`ShardStore`] of one table root, keyed by shard index.
//! Shards are opened on first use and closed by [`ShardTable::destroy`] or
//! by the idle eviction worker.
//!
//! # On-disk layout
//!
//! ```text
//! data.kfs/
//!   r.id      raw reference id bytes
//!   000.s/    shard 0 backing store
//!   001.s/
//!   ...
//! ```
//!
//! # Locking
//!
//! One reader/writer lock guards the index-to-store map and is held only
//! while the map is touched. Lookups clone a [`ShardRef`] out under the
//! shared lock; opening and closing take it exclusively. Shard I/O runs
//! with no table lock held.
//!
//! A shard with a live [`ShardRef`] is busy: [`ShardTable::destroy`] and
//! the eviction worker leave it open.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kfs_core::{
    coerce_table_path, parse_shard_directory_name, ContentKey, ItemKeyLayout, ReferenceId,
    ShardRouter, KEY_LEN, REFERENCE_ID_FILE,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::{BackendOpener, RocksDbOpener};
use crate::config::KfsConfig;
use crate::evict::Evictor;
use crate::shard::{KeyStat, ShardStats, ShardStore};
use crate::stream::{read_all, write_all, ChunkReader};
use crate::{remaining_space, StoreError};

/// Upper bound on queued eviction requests.
const MAX_EVICTION_QUEUE: u32 = 1024;

/// Shared handle to an open shard. Keeps the shard open while alive.
pub type ShardRef = Arc<ShardStore>;

/// Space usage of one shard in a table-wide stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardStat {
    /// Shard index
    pub index: u32,
    /// Shard usage
    pub stats: ShardStats,
}

/// Aggregated space usage of every shard on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStats {
    /// Per-shard usage in index order
    pub shards: Vec<ShardStat>,
    /// Sum of used space over all shards
    pub used_space: u64,
    /// Maximum table size minus used space; may be negative
    pub free_space: i64,
}

/// Files stored in one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardListing {
    /// Shard index
    pub index: u32,
    /// Files in key order
    pub keys: Vec<KeyStat>,
}

/// Table of lazily opened shards under one root directory.
pub struct ShardTable {
    root: PathBuf,
    config: KfsConfig,
    router: ShardRouter,
    layout: ItemKeyLayout,
    opener: Arc<dyn BackendOpener>,
    shards: RwLock<HashMap<u32, ShardRef>>,
    evictor: Mutex<Option<Evictor>>,
}

impl ShardTable {
    /// Opens the table described by `config` with RocksDB shards.
    pub fn open(config: KfsConfig) -> Result<Arc<Self>, StoreError> {
        let opener = Arc::new(RocksDbOpener::new(config.backend.clone()));
        Self::open_with(config, opener)
    }

    /// Opens the table with a custom backend opener.
    ///
    /// Initializes the root directory and its reference id marker when the
    /// root does not exist yet. Starts the eviction worker unless the idle
    /// timeout is negative.
    pub fn open_with(
        config: KfsConfig,
        opener: Arc<dyn BackendOpener>,
    ) -> Result<Arc<Self>, StoreError> {
        let root = coerce_table_path(&config.table_path);
        let layout = config.item_layout()?;
        let reference_id = init_root(&root, config.reference_id.as_deref())?;
        let router = ShardRouter::new(reference_id, config.shard_count, config.distance_bits)?;
        let idle_timeout = config.idle_timeout();

        info!(
            root = %root.display(),
            reference_id = %reference_id,
            shard_count = config.shard_count,
            "Opened shard table"
        );

        let table = Arc::new(Self {
            root,
            config,
            router,
            layout,
            opener,
            shards: RwLock::new(HashMap::new()),
            evictor: Mutex::new(None),
        });

        if let Some(timeout) = idle_timeout {
            let capacity = table.router.shard_count().min(MAX_EVICTION_QUEUE) as usize;
            let evictor = Evictor::spawn(Arc::downgrade(&table), timeout, capacity)?;
            *table.evictor.lock() = Some(evictor);
        }

        Ok(table)
    }

    /// Returns the table root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the table configuration.
    pub fn config(&self) -> &KfsConfig {
        &self.config
    }

    /// Returns the reference id of this table.
    pub fn reference_id(&self) -> &ReferenceId {
        self.router.reference_id()
    }

    /// Returns the configured number of shards.
    pub fn shard_count(&self) -> u32 {
        self.router.shard_count()
    }

    /// Returns the shard index owning `key`.
    pub fn shard_index_for_key(&self, key: &[u8]) -> u32 {
        self.router.shard_index(key)
    }

    /// Returns the directory of shard `index`.
    pub fn shard_path(&self, index: u32) -> PathBuf {
        self.root.join(self.router.directory_name(index))
    }

    /// Returns true if shard `index` is currently open.
    pub fn is_open(&self, index: u32) -> bool {
        self.shards.read().contains_key(&index)
    }

    /// Number of shards currently open.
    pub fn open_shard_count(&self) -> usize {
        self.shards.read().len()
    }

    /// Returns shard `index`, opening it if needed.
    pub fn resolve_or_open(&self, index: u64) -> Result<ShardRef, StoreError> {
        let shard_count = self.router.shard_count();
        let index = u32::try_from(index)
            .ok()
            .filter(|i| *i < shard_count)
            .ok_or(StoreError::ShardIndexRange { index, shard_count })?;

        let open = self.shards.read().get(&index).cloned();
        let shard = match open {
            Some(shard) => shard,
            None => {
                let mut shards = self.shards.write();
                // Another caller may have opened it while we waited.
                match shards.get(&index) {
                    Some(shard) => Arc::clone(shard),
                    None => {
                        let shard = Arc::new(self.open_store(index)?);
                        shards.insert(index, Arc::clone(&shard));
                        shard
                    }
                }
            }
        };

        shard.touch();
        Ok(shard)
    }

    /// Returns the shard owning `key`, opening it if needed.
    pub fn route_for_key(&self, key: &[u8]) -> Result<ShardRef, StoreError> {
        self.resolve_or_open(u64::from(self.shard_index_for_key(key)))
    }

    /// Closes shard `index`.
    ///
    /// Returns false if it was not open, or if it is busy and stays open.
    pub fn destroy(&self, index: u32) -> bool {
        let shard = take_unused(&mut self.shards.write(), index);
        match shard {
            Some(shard) => {
                shard.close();
                true
            }
            None => false,
        }
    }

    /// Returns true if chunk 0 of `key` is stored.
    pub fn exists_for_key(&self, key: &ContentKey) -> Result<bool, StoreError> {
        self.route_for_key(key.as_slice())?.exists(key)
    }

    /// Deletes the chunks of `key`. Returns the number of chunks removed.
    pub fn unlink_for_key(&self, key: &ContentKey) -> Result<u64, StoreError> {
        self.route_for_key(key.as_slice())?.unlink(key)
    }

    /// Writes `source` as the content of `key`, replacing any previous
    /// content. Returns the chunk count.
    pub fn write_for_key<R: Read>(&self, key: &ContentKey, source: R) -> Result<u64, StoreError> {
        let shard = self.route_for_key(key.as_slice())?;
        let replaced = shard.unlink(key)?;
        if replaced > 0 {
            debug!(key = %key, chunks = replaced, "Replacing stored file");
        }
        write_all(&shard, key, source, &self.config.stream)
    }

    /// Returns a reader over the content of `key`.
    ///
    /// Fails with [`StoreError::NotFound`] when the first chunk is absent.
    pub fn read_for_key(
        &self,
        key: &ContentKey,
    ) -> Result<ChunkReader<ShardRef>, StoreError> {
        let shard = self.route_for_key(key.as_slice())?;
        if !shard.exists(key)? {
            return Err(StoreError::NotFound(key.to_hex()));
        }
        Ok(read_all(shard, *key))
    }

    /// Reports usage of every shard on disk.
    pub fn stat(&self) -> Result<TableStats, StoreError> {
        let shards = self.for_each_disk_shard(|shard| {
            Ok(ShardStat {
                index: shard.index(),
                stats: shard.stat()?,
            })
        })?;

        let used_space = shards.iter().map(|s| s.stats.used_space).sum::<u64>();
        Ok(TableStats {
            free_space: remaining_space(self.config.max_table_size, used_space),
            used_space,
            shards,
        })
    }

    /// Reports usage of the shard owning `key`.
    pub fn stat_with_key(&self, key: &[u8]) -> Result<ShardStat, StoreError> {
        let shard = self.route_for_key(key)?;
        Ok(ShardStat {
            index: shard.index(),
            stats: shard.stat()?,
        })
    }

    /// Reports usage of shard `index`.
    pub fn stat_with_index(&self, index: u64) -> Result<ShardStat, StoreError> {
        let shard = self.resolve_or_open(index)?;
        Ok(ShardStat {
            index: shard.index(),
            stats: shard.stat()?,
        })
    }

    /// Lists the files of every shard on disk.
    pub fn list(&self) -> Result<Vec<ShardListing>, StoreError> {
        self.for_each_disk_shard(|shard| {
            Ok(ShardListing {
                index: shard.index(),
                keys: shard.list()?,
            })
        })
    }

    /// Lists the files of the shard owning `key`.
    pub fn list_with_key(&self, key: &[u8]) -> Result<ShardListing, StoreError> {
        let shard = self.route_for_key(key)?;
        Ok(ShardListing {
            index: shard.index(),
            keys: shard.list()?,
        })
    }

    /// Lists the files of shard `index`.
    pub fn list_with_index(&self, index: u64) -> Result<ShardListing, StoreError> {
        let shard = self.resolve_or_open(index)?;
        Ok(ShardListing {
            index: shard.index(),
            keys: shard.list()?,
        })
    }

    /// Flushes every shard on disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.for_each_disk_shard(|shard| shard.flush())?;
        Ok(())
    }

    /// Stops the eviction worker and closes every open shard.
    pub fn close(&self) {
        // Take the handle out before dropping it; the worker needs the lock.
        let evictor = self.evictor.lock().take();
        drop(evictor);
        self.close_all();
    }

    /// Indexes of shard directories present under the root, ascending.
    ///
    /// Entries that are not shard directories are ignored.
    pub fn disk_shard_indexes(&self) -> Result<Vec<u32>, StoreError> {
        let shard_count = self.router.shard_count();
        let mut indexes = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(index) = entry.file_name().to_str().and_then(parse_shard_directory_name)
            else {
                continue;
            };
            if index >= shard_count {
                warn!(
                    index,
                    shard_count,
                    path = %entry.path().display(),
                    "Skipping shard directory outside shard count"
                );
                continue;
            }
            indexes.push(index);
        }

        indexes.sort_unstable();
        Ok(indexes)
    }

    /// Indexes of open shards idle for at least `timeout`.
    pub(crate) fn idle_shards(&self, timeout: Duration) -> Vec<u32> {
        self.shards
            .read()
            .values()
            .filter(|shard| shard.idle_for() >= timeout)
            .map(|shard| shard.index())
            .collect()
    }

    /// Closes shard `index` if it is still idle for at least `timeout` and
    /// not busy.
    pub(crate) fn evict_if_idle(&self, index: u32, timeout: Duration) -> bool {
        let shard = {
            let mut shards = self.shards.write();
            let idle = shards
                .get(&index)
                .is_some_and(|shard| shard.idle_for() >= timeout);
            if idle {
                take_unused(&mut shards, index)
            } else {
                None
            }
        };
        match shard {
            Some(shard) => {
                shard.close();
                true
            }
            None => false,
        }
    }

    fn open_store(&self, index: u32) -> Result<ShardStore, StoreError> {
        ShardStore::open(
            index,
            &self.shard_path(index),
            &self.config.shard,
            self.layout,
            self.opener.as_ref(),
        )
    }

    /// Runs `f` on every shard present on disk, opening the missing ones.
    ///
    /// Every shard is resolved before the first visit; the first error aborts.
    fn for_each_disk_shard<T, F>(&self, mut f: F) -> Result<Vec<T>, StoreError>
    where
        F: FnMut(&ShardStore) -> Result<T, StoreError>,
    {
        let shards = self
            .disk_shard_indexes()?
            .into_iter()
            .map(|index| self.resolve_or_open(u64::from(index)))
            .collect::<Result<Vec<_>, _>>()?;

        shards.iter().map(|shard| f(shard.as_ref())).collect()
    }

    fn close_all(&self) {
        let drained: Vec<ShardRef> = self.shards.write().drain().map(|(_, s)| s).collect();
        for shard in drained {
            match Arc::try_unwrap(shard) {
                Ok(shard) => shard.close(),
                // Released when the last handle drops.
                Err(shard) => debug!(index = shard.index(), "Shard still in use at close"),
            }
        }
    }
}

impl Drop for ShardTable {
    fn drop(&mut self) {
        drop(self.evictor.get_mut().take());
        self.close_all();
        debug!(root = %self.root.display(), "Closed shard table");
    }
}

impl std::fmt::Debug for ShardTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardTable")
            .field("root", &self.root)
            .field("reference_id", self.router.reference_id())
            .field("shard_count", &self.router.shard_count())
            .field("open_shards", &self.open_shard_count())
            .finish()
    }
}

/// Removes shard `index` from `shards` unless a [`ShardRef`] to it is alive.
fn take_unused(shards: &mut HashMap<u32, ShardRef>, index: u32) -> Option<ShardStore> {
    let shard = shards.remove(&index)?;
    match Arc::try_unwrap(shard) {
        Ok(shard) => Some(shard),
        Err(shard) => {
            debug!(index, "Shard busy; leaving it open");
            shards.insert(index, shard);
            None
        }
    }
}

fn invalid_root(root: &Path, reason: impl Into<String>) -> StoreError {
    StoreError::InvalidTablePath {
        path: root.to_path_buf(),
        reason: reason.into(),
    }
}

/// Validates or initializes the table root, returning its reference id.
fn init_root(root: &Path, configured: Option<&str>) -> Result<ReferenceId, StoreError> {
    let marker = root.join(REFERENCE_ID_FILE);

    if root.exists() {
        if !root.is_dir() {
            return Err(invalid_root(root, "not a directory"));
        }
        if marker.exists() {
            return load_reference_id(root, &marker, configured);
        }
        if fs::read_dir(root)?.next().is_some() {
            return Err(invalid_root(root, "missing reference id marker"));
        }
    } else {
        fs::create_dir_all(root)?;
    }

    let reference_id = ReferenceId::from_hex_or_random(configured)?;
    fs::write(&marker, reference_id.as_bytes())?;
    info!(root = %root.display(), reference_id = %reference_id, "Initialized table root");
    Ok(reference_id)
}

fn load_reference_id(
    root: &Path,
    marker: &Path,
    configured: Option<&str>,
) -> Result<ReferenceId, StoreError> {
    let bytes =
        fs::read(marker).map_err(|e| invalid_root(root, format!("unreadable marker: {e}")))?;
    let reference_id = ReferenceId::from_slice(&bytes).map_err(|_| {
        invalid_root(
            root,
            format!("marker holds {} bytes, expected {KEY_LEN}", bytes.len()),
        )
    })?;

    if let Some(hex) = configured {
        match ReferenceId::from_hex(hex) {
            Ok(id) if id == reference_id => {}
            Ok(id) => warn!(
                configured = %id,
                persisted = %reference_id,
                "Configured reference id differs from table root; using persisted id"
            ),
            Err(e) => warn!(error = %e, "Ignoring invalid configured reference id"),
        }
    }

    Ok(reference_id)
}
