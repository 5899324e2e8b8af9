//! In-memory backend.
//!
//! Each shard path maps to one ordered `BTreeMap` that outlives the backend
//! handle, so closing and reopening a shard sees the same data, just like a
//! directory on disk. Like RocksDB's lock file, only one handle per path may
//! be open at a time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{Backend, BackendOpener, KeyRange, KvIter, KvPair};
use crate::StoreError;

type Volume = Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>;

#[derive(Default)]
struct OpenerState {
    volumes: Mutex<HashMap<PathBuf, Volume>>,
    locked: Mutex<HashSet<PathBuf>>,
    opens: AtomicUsize,
    flushes: AtomicUsize,
    fail_opens: AtomicBool,
    fail_writes: AtomicBool,
    fail_sizes: AtomicBool,
    fail_scans: AtomicBool,
}

/// Opens in-memory backends, counting every open.
///
/// Cloning shares the underlying volumes and counters.
#[derive(Clone, Default)]
pub struct MemoryOpener {
    state: Arc<OpenerState>,
}

impl MemoryOpener {
    /// Creates an opener with no volumes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Number of flushes across all backends.
    pub fn flush_count(&self) -> usize {
        self.state.flushes.load(Ordering::SeqCst)
    }

    /// Number of backends currently open.
    pub fn open_handles(&self) -> usize {
        self.state.locked.lock().len()
    }

    /// Makes subsequent opens fail.
    pub fn set_fail_opens(&self, fail: bool) {
        self.state.fail_opens.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent puts fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent approximate size queries fail.
    pub fn set_fail_sizes(&self, fail: bool) {
        self.state.fail_sizes.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent range scans yield an error after the first pair.
    pub fn set_fail_scans(&self, fail: bool) {
        self.state.fail_scans.store(fail, Ordering::SeqCst);
    }
}

impl BackendOpener for MemoryOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Backend>, StoreError> {
        if self.state.fail_opens.load(Ordering::SeqCst) {
            return Err(StoreError::Database("open refused".to_string()));
        }

        // Keep the on-disk layout self-describing.
        std::fs::create_dir_all(path)?;

        if !self.state.locked.lock().insert(path.to_path_buf()) {
            return Err(StoreError::Database(format!(
                "lock already held for {}",
                path.display()
            )));
        }

        let volume = Arc::clone(
            self.state
                .volumes
                .lock()
                .entry(path.to_path_buf())
                .or_default(),
        );
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        debug!(path = %path.display(), "Opened in-memory shard");

        Ok(Box::new(MemoryBackend {
            path: path.to_path_buf(),
            volume,
            state: Arc::clone(&self.state),
        }))
    }
}

/// In-memory shard backend.
pub struct MemoryBackend {
    path: PathBuf,
    volume: Volume,
    state: Arc<OpenerState>,
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        self.state.locked.lock().remove(&self.path);
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.volume.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("write refused".to_string()));
        }
        self.volume.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.volume.write().remove(key);
        Ok(())
    }

    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.volume.read().contains_key(key))
    }

    fn approximate_size(&self, range: &KeyRange) -> Result<u64, StoreError> {
        if self.state.fail_sizes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("size query refused".to_string()));
        }
        if range.start >= range.end {
            return Ok(0);
        }
        let map = self.volume.read();
        Ok(map
            .range(range.start.clone()..range.end.clone())
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum())
    }

    fn iter_range<'a>(&'a self, range: &KeyRange) -> KvIter<'a> {
        if range.start >= range.end {
            return Box::new(std::iter::empty());
        }
        let mut snapshot: Vec<Result<KvPair, StoreError>> = self
            .volume
            .read()
            .range(range.start.clone()..range.end.clone())
            .map(|(k, v)| Ok((k.clone().into_boxed_slice(), v.clone().into_boxed_slice())))
            .collect();
        if self.state.fail_scans.load(Ordering::SeqCst) {
            snapshot.truncate(1);
            snapshot.push(Err(StoreError::Database("scan interrupted".to_string())));
        }
        Box::new(snapshot.into_iter())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.state.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
