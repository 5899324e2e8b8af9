//! XOR-distance shard routing and on-disk naming.
//!
//! A content key is routed to a shard by XOR-ing its first `D / 8` bytes
//! with the table's reference id and reading the result as a little-endian
//! integer. That raw distance is unbounded with respect to the shard count,
//! so it is always reduced modulo the shard count before use.

use std::path::{Path, PathBuf};

use crate::identifiers::ReferenceId;
use crate::keys::{decimal_digits, hash_key};
use crate::KeyError;

/// Extension of a table root directory.
pub const TABLE_EXTENSION: &str = "kfs";

/// Extension of a shard directory.
pub const SHARD_EXTENSION: &str = "s";

/// Name of the identity marker file inside a table root.
pub const REFERENCE_ID_FILE: &str = "r.id";

/// Maps content keys to shard indexes for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    reference_id: ReferenceId,
    shard_count: u32,
    distance_bytes: usize,
}

impl ShardRouter {
    /// Creates a router.
    ///
    /// `distance_bits` must be a non-zero multiple of 8, at most 64.
    pub fn new(
        reference_id: ReferenceId,
        shard_count: u32,
        distance_bits: u32,
    ) -> Result<Self, KeyError> {
        if shard_count == 0 {
            return Err(KeyError::InvalidLayout("shard count must be non-zero".into()));
        }
        if distance_bits == 0 || distance_bits % 8 != 0 || distance_bits > 64 {
            return Err(KeyError::InvalidLayout(format!(
                "distance width must be a multiple of 8 in 8..=64, got {distance_bits}"
            )));
        }
        Ok(Self {
            reference_id,
            shard_count,
            distance_bytes: (distance_bits / 8) as usize,
        })
    }

    /// Returns the reference id used as routing origin.
    pub fn reference_id(&self) -> &ReferenceId {
        &self.reference_id
    }

    /// Returns the number of shards.
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Computes the raw XOR distance between the reference id and `key`.
    ///
    /// The result is not bounded by the shard count.
    pub fn distance(&self, key: &[u8]) -> u64 {
        let content_key = hash_key(key);
        let xor = self.reference_id.xor_distance(content_key.as_bytes());

        let mut le = [0u8; 8];
        le[..self.distance_bytes].copy_from_slice(&xor[..self.distance_bytes]);
        u64::from_le_bytes(le)
    }

    /// Computes the shard index owning `key`, reduced into `[0, shard_count)`.
    pub fn shard_index(&self, key: &[u8]) -> u32 {
        (self.distance(key) % u64::from(self.shard_count)) as u32
    }

    /// Width of the zero-padded decimal index in shard directory names.
    pub fn name_width(&self) -> usize {
        decimal_digits(u64::from(self.shard_count - 1))
    }

    /// Returns the directory name for shard `index`, e.g. `007.s`.
    pub fn directory_name(&self, index: u32) -> String {
        format!(
            "{:0width$}.{}",
            index,
            SHARD_EXTENSION,
            width = self.name_width()
        )
    }
}

/// Parses a shard directory name back into its index.
///
/// Returns `None` for anything that is not `<digits>.s`.
pub fn parse_shard_directory_name(name: &str) -> Option<u32> {
    let digits = name.strip_suffix(SHARD_EXTENSION)?.strip_suffix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Ensures a table root path carries the `.kfs` extension.
pub fn coerce_table_path(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext == TABLE_EXTENSION => path.to_path_buf(),
        _ => {
            let mut os = path.as_os_str().to_owned();
            os.push(".");
            os.push(TABLE_EXTENSION);
            PathBuf::from(os)
        }
    }
}
