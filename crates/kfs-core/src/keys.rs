//! Content key normalization and chunk item keys.
//!
//! An item key addresses one chunk of one file inside a shard:
//!
//! ```text
//! content_key (KEY_LEN bytes) || separator (1 byte) || le64(chunk_index)
//! ```

use std::fmt;

use crate::hash::key_hash;
use crate::identifiers::ContentKey;
use crate::{KeyError, KEY_LEN, R};

/// Length in bytes of an item key.
pub const ITEM_KEY_LEN: usize = KEY_LEN + 1 + 8;

/// Returns true if `key` is exactly `R` bits long.
pub fn is_valid_key(key: &[u8]) -> bool {
    key.len() as u64 * 8 == R
}

/// Hashes `key` into a content key unless it is already a valid key.
pub fn hash_key(key: &[u8]) -> ContentKey {
    if is_valid_key(key) {
        return ContentKey::coerce(key);
    }
    ContentKey::new(key_hash(key))
}

/// Coerces any identifier into a valid content key.
pub fn coerce_key(key: &[u8]) -> ContentKey {
    if !is_valid_key(key) {
        return hash_key(key);
    }
    ContentKey::coerce(key)
}

/// Number of decimal digits needed to print `n`.
pub(crate) fn decimal_digits(n: u64) -> usize {
    n.checked_ilog10().map_or(1, |d| d as usize + 1)
}

/// Physical key of one chunk inside a shard.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemKey([u8; ITEM_KEY_LEN]);

impl ItemKey {
    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; ITEM_KEY_LEN] {
        &self.0
    }

    /// Returns the content key prefix.
    pub fn content_key(&self) -> ContentKey {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&self.0[..KEY_LEN]);
        ContentKey::new(key)
    }

    /// Returns the separator byte.
    pub fn separator(&self) -> u8 {
        self.0[KEY_LEN]
    }

    /// Returns the chunk index.
    pub fn index(&self) -> u64 {
        let mut le = [0u8; 8];
        le.copy_from_slice(&self.0[KEY_LEN + 1..]);
        u64::from_le_bytes(le)
    }
}

impl AsRef<[u8]> for ItemKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemKey({}#{})", self.content_key(), self.index())
    }
}

/// Parameters that shape item keys for one shard configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemKeyLayout {
    separator: u8,
    max_index_digits: usize,
}

impl ItemKeyLayout {
    /// Builds a layout for shards of `max_shard_size` bytes split into
    /// chunks of `chunk_size` bytes.
    pub fn new(separator: u8, max_shard_size: u64, chunk_size: u64) -> Result<Self, KeyError> {
        if chunk_size == 0 {
            return Err(KeyError::InvalidLayout("chunk size must be non-zero".into()));
        }
        Ok(Self {
            separator,
            max_index_digits: decimal_digits(max_shard_size / chunk_size),
        })
    }

    /// Returns the separator byte.
    pub fn separator(&self) -> u8 {
        self.separator
    }

    /// Maximum number of decimal digits a chunk index may have.
    pub fn max_index_digits(&self) -> usize {
        self.max_index_digits
    }

    /// Builds the item key for chunk `index` of `file_key`.
    pub fn item_key(&self, file_key: &[u8], index: u64) -> Result<ItemKey, KeyError> {
        if !is_valid_key(file_key) {
            return Err(KeyError::InvalidKey {
                expected: KEY_LEN,
                actual: file_key.len(),
            });
        }
        if decimal_digits(index) > self.max_index_digits {
            return Err(KeyError::IndexOutOfBounds {
                index,
                max_digits: self.max_index_digits,
            });
        }

        let mut key = [0u8; ITEM_KEY_LEN];
        key[..KEY_LEN].copy_from_slice(file_key);
        key[KEY_LEN] = self.separator;
        key[KEY_LEN + 1..].copy_from_slice(&index.to_le_bytes());
        Ok(ItemKey(key))
    }

    /// Returns the grouping key of a raw stored key.
    ///
    /// Well-formed item keys yield their content key even if it contains
    /// the separator byte; other keys are split on the first separator.
    pub fn base_key<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        if raw.len() == ITEM_KEY_LEN && raw[KEY_LEN] == self.separator {
            return &raw[..KEY_LEN];
        }
        match raw.iter().position(|b| *b == self.separator) {
            Some(pos) => &raw[..pos],
            None => raw,
        }
    }
}
