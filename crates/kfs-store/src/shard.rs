//! Shard store.
//!
//! A shard owns one backing key-value store rooted at its directory. All of
//! a file's chunks live in the same shard under item keys built from the
//! file's content key and the chunk index.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use kfs_core::{ContentKey, ItemKey, ItemKeyLayout, KeyError};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::backend::{Backend, BackendOpener};
use crate::config::ShardConfig;
use crate::{remaining_space, StoreError};

/// Space usage of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardStats {
    /// Approximate bytes used by the configured key range
    pub used_space: u64,
    /// `max_size - used_space`; negative when the shard is over-filled
    pub free_space: i64,
}

/// One file observed while listing a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStat {
    /// Grouping key, normally the file's content key
    pub base_key: Vec<u8>,
    /// Chunk count times chunk size
    pub approximate_size: u64,
}

/// One open shard.
pub struct ShardStore {
    index: u32,
    path: PathBuf,
    config: ShardConfig,
    layout: ItemKeyLayout,
    backend: Box<dyn Backend>,
    last_access: Mutex<Instant>,
}

impl ShardStore {
    /// Opens (creating if absent) the shard at `path`.
    pub fn open(
        index: u32,
        path: &Path,
        config: &ShardConfig,
        layout: ItemKeyLayout,
        opener: &dyn BackendOpener,
    ) -> Result<Self, StoreError> {
        let backend = opener.open(path).map_err(|e| StoreError::ShardOpen {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        debug!(index, path = %path.display(), "Opened shard");
        Ok(Self {
            index,
            path: path.to_path_buf(),
            config: config.clone(),
            layout,
            backend,
            last_access: Mutex::new(Instant::now()),
        })
    }

    /// Releases the backing store.
    pub fn close(self) {
        debug!(index = self.index, path = %self.path.display(), "Closed shard");
    }

    /// Returns the shard index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns the shard directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the shard configuration.
    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    /// Returns the item key layout.
    pub fn layout(&self) -> &ItemKeyLayout {
        &self.layout
    }

    /// Marks the shard as used now.
    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    /// Time since the shard was last used.
    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    /// Builds the item key for chunk `index` of `key`.
    pub fn item_key(&self, key: &ContentKey, index: u64) -> Result<ItemKey, KeyError> {
        self.layout.item_key(key.as_slice(), index)
    }

    /// Reads one chunk. Returns `None` if absent.
    pub fn get_chunk(&self, key: &ContentKey, index: u64) -> Result<Option<Bytes>, StoreError> {
        let item = self.item_key(key, index)?;
        Ok(self.backend.get(item.as_ref())?.map(Bytes::from))
    }

    /// Writes one chunk.
    pub fn put_chunk(&self, key: &ContentKey, index: u64, data: &[u8]) -> Result<(), StoreError> {
        let item = self.item_key(key, index)?;
        self.backend.put(item.as_ref(), data)?;
        trace!(shard = self.index, key = %key, index, size = data.len(), "Stored chunk");
        Ok(())
    }

    /// Returns true if chunk 0 of `key` is present.
    pub fn exists(&self, key: &ContentKey) -> Result<bool, StoreError> {
        let item = self.item_key(key, 0)?;
        self.backend.has(item.as_ref())
    }

    /// Deletes the chunks of `key` starting at index 0.
    ///
    /// Stops at the first missing index; chunks beyond a gap are left in
    /// place. Returns the number of chunks deleted.
    pub fn unlink(&self, key: &ContentKey) -> Result<u64, StoreError> {
        let mut index = 0u64;
        loop {
            let item = match self.item_key(key, index) {
                Ok(item) => item,
                Err(KeyError::IndexOutOfBounds { .. }) => break,
                Err(e) => return Err(e.into()),
            };
            if !self.backend.has(item.as_ref())? {
                break;
            }
            self.backend.delete(item.as_ref())?;
            index += 1;
        }

        debug!(shard = self.index, key = %key, chunks = index, "Unlinked file");
        Ok(index)
    }

    /// Reports used and free space.
    pub fn stat(&self) -> Result<ShardStats, StoreError> {
        let used = self
            .backend
            .approximate_size(&self.config.key_range())
            .map_err(|e| StoreError::ShardStat {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        Ok(ShardStats {
            used_space: used,
            free_space: remaining_space(self.config.max_size, used),
        })
    }

    /// Lists the files stored in this shard with their approximate sizes.
    pub fn list(&self) -> Result<Vec<KeyStat>, StoreError> {
        let mut sizes: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
        for item in self.backend.iter_range(&self.config.key_range()) {
            let (key, _) = item?;
            *sizes.entry(self.layout.base_key(&key).to_vec()).or_default() +=
                self.config.chunk_size;
        }

        Ok(sizes
            .into_iter()
            .map(|(base_key, approximate_size)| KeyStat {
                base_key,
                approximate_size,
            })
            .collect())
    }

    /// Flushes buffered writes to the backing store.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush()
    }
}

impl std::fmt::Debug for ShardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardStore")
            .field("index", &self.index)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryOpener;
    use kfs_core::KEY_LEN;
    use tempfile::TempDir;

    fn small_config() -> ShardConfig {
        ShardConfig {
            max_size: 1024,
            chunk_size: 4,
            ..Default::default()
        }
    }

    fn open_shard(dir: &TempDir, opener: &MemoryOpener, config: &ShardConfig) -> ShardStore {
        let layout = ItemKeyLayout::new(config.key_separator, config.max_size, config.chunk_size)
            .unwrap();
        ShardStore::open(0, &dir.path().join("0.s"), config, layout, opener).unwrap()
    }

    #[test]
    fn test_exists_checks_first_chunk() {
        let dir = TempDir::new().unwrap();
        let opener = MemoryOpener::new();
        let shard = open_shard(&dir, &opener, &small_config());
        let key = ContentKey::new([1; KEY_LEN]);

        assert!(!shard.exists(&key).unwrap());
        shard.put_chunk(&key, 1, b"late").unwrap();
        assert!(!shard.exists(&key).unwrap());
        shard.put_chunk(&key, 0, b"head").unwrap();
        assert!(shard.exists(&key).unwrap());
    }

    #[test]
    fn test_unlink_removes_contiguous_chunks() {
        let dir = TempDir::new().unwrap();
        let opener = MemoryOpener::new();
        let shard = open_shard(&dir, &opener, &small_config());
        let key = ContentKey::new([2; KEY_LEN]);

        for i in 0..5 {
            shard.put_chunk(&key, i, b"data").unwrap();
        }
        assert_eq!(shard.unlink(&key).unwrap(), 5);
        assert!(!shard.exists(&key).unwrap());
        for i in 0..5 {
            assert!(shard.get_chunk(&key, i).unwrap().is_none());
        }
    }

    #[test]
    fn test_unlink_stops_at_first_gap() {
        let dir = TempDir::new().unwrap();
        let opener = MemoryOpener::new();
        let shard = open_shard(&dir, &opener, &small_config());
        let key = ContentKey::new([3; KEY_LEN]);

        shard.put_chunk(&key, 0, b"aaaa").unwrap();
        shard.put_chunk(&key, 1, b"bbbb").unwrap();
        shard.put_chunk(&key, 3, b"dddd").unwrap();

        assert_eq!(shard.unlink(&key).unwrap(), 2);
        assert!(shard.get_chunk(&key, 3).unwrap().is_some());
    }

    #[test]
    fn test_unlink_missing_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let opener = MemoryOpener::new();
        let shard = open_shard(&dir, &opener, &small_config());
        assert_eq!(shard.unlink(&ContentKey::new([9; KEY_LEN])).unwrap(), 0);
    }

    #[test]
    fn test_stat_reports_free_space() {
        let dir = TempDir::new().unwrap();
        let opener = MemoryOpener::new();
        let shard = open_shard(&dir, &opener, &small_config());

        let empty = shard.stat().unwrap();
        assert_eq!(empty.used_space, 0);
        assert_eq!(empty.free_space, 1024);

        let key = ContentKey::new([4; KEY_LEN]);
        shard.put_chunk(&key, 0, b"abcd").unwrap();
        let stats = shard.stat().unwrap();
        // item key (29 bytes) + value (4 bytes)
        assert_eq!(stats.used_space, 33);
        assert_eq!(stats.free_space, 1024 - 33);
    }

    #[test]
    fn test_stat_free_space_goes_negative() {
        let dir = TempDir::new().unwrap();
        let opener = MemoryOpener::new();
        let config = ShardConfig {
            max_size: 10,
            chunk_size: 4,
            ..Default::default()
        };
        let shard = open_shard(&dir, &opener, &config);
        shard
            .put_chunk(&ContentKey::new([5; KEY_LEN]), 0, b"abcd")
            .unwrap();
        assert_eq!(shard.stat().unwrap().free_space, 10 - 33);
    }

    #[test]
    fn test_list_groups_chunks_by_content_key() {
        let dir = TempDir::new().unwrap();
        let opener = MemoryOpener::new();
        let shard = open_shard(&dir, &opener, &small_config());

        let a = ContentKey::new([0x0A; KEY_LEN]);
        let mut b_bytes = [0x0B; KEY_LEN];
        b_bytes[5] = b' ';
        let b = ContentKey::new(b_bytes);

        for i in 0..3 {
            shard.put_chunk(&a, i, b"aaaa").unwrap();
        }
        shard.put_chunk(&b, 0, b"bb").unwrap();

        let listing = shard.list().unwrap();
        assert_eq!(
            listing,
            vec![
                KeyStat {
                    base_key: a.as_slice().to_vec(),
                    approximate_size: 12
                },
                KeyStat {
                    base_key: b.as_slice().to_vec(),
                    approximate_size: 4
                },
            ]
        );
    }

    #[test]
    fn test_open_failure_is_wrapped() {
        let dir = TempDir::new().unwrap();
        let opener = MemoryOpener::new();
        opener.set_fail_opens(true);

        let config = small_config();
        let layout = ItemKeyLayout::new(b' ', 1024, 4).unwrap();
        let err = ShardStore::open(1, &dir.path().join("1.s"), &config, layout, &opener)
            .unwrap_err();
        assert!(matches!(err, StoreError::ShardOpen { .. }));
    }

    #[test]
    fn test_chunk_index_bounds() {
        let dir = TempDir::new().unwrap();
        let opener = MemoryOpener::new();
        // 1024 / 4 = 256 chunks -> three digits
        let shard = open_shard(&dir, &opener, &small_config());
        let key = ContentKey::new([6; KEY_LEN]);

        assert!(shard.put_chunk(&key, 999, b"x").is_ok());
        let err = shard.put_chunk(&key, 1000, b"x").unwrap_err();
        assert!(matches!(
            err,
            StoreError::Key(KeyError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_stat_free_space_saturates() {
        let dir = TempDir::new().unwrap();
        let opener = MemoryOpener::new();
        let config = ShardConfig {
            max_size: u64::MAX,
            chunk_size: 4,
            ..Default::default()
        };
        let shard = open_shard(&dir, &opener, &config);
        assert_eq!(shard.stat().unwrap().free_space, i64::MAX);

        shard
            .put_chunk(&ContentKey::new([7; KEY_LEN]), 0, b"abcd")
            .unwrap();
        let stats = shard.stat().unwrap();
        assert_eq!(stats.used_space, 33);
        assert_eq!(stats.free_space, i64::MAX);
    }

    #[test]
    fn test_stat_failure_is_wrapped() {
        let dir = TempDir::new().unwrap();
        let opener = MemoryOpener::new();
        let shard = open_shard(&dir, &opener, &small_config());

        opener.set_fail_sizes(true);
        let err = shard.stat().unwrap_err();
        assert!(matches!(err, StoreError::ShardStat { ref path, .. } if path == shard.path()));
    }

    #[test]
    fn test_list_propagates_scan_failure() {
        let dir = TempDir::new().unwrap();
        let opener = MemoryOpener::new();
        let shard = open_shard(&dir, &opener, &small_config());
        let key = ContentKey::new([8; KEY_LEN]);
        shard.put_chunk(&key, 0, b"aaaa").unwrap();
        shard.put_chunk(&key, 1, b"bbbb").unwrap();

        opener.set_fail_scans(true);
        assert!(matches!(shard.list(), Err(StoreError::Database(_))));
        opener.set_fail_scans(false);
        assert_eq!(shard.list().unwrap().len(), 1);
    }

    #[test]
    fn test_close_releases_backend() {
        let dir = TempDir::new().unwrap();
        let opener = MemoryOpener::new();
        let shard = open_shard(&dir, &opener, &small_config());
        assert_eq!(opener.open_handles(), 1);
        shard.close();
        assert_eq!(opener.open_handles(), 0);
    }
}
