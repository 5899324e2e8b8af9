//! Fixed-length identifier types.
//!
//! - `ReferenceId` - identity of a storage root, origin for shard routing
//! - `ContentKey` - normalized identifier of one logical file
//!
//! Both are exactly `KEY_LEN` (`R / 8`) bytes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::key_hash;
use crate::{KeyError, KEY_LEN};

/// Defines a `KEY_LEN`-byte identifier type with common implementations.
macro_rules! define_key_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub [u8; KEY_LEN]);

        impl $name {
            /// Creates a new identifier from a fixed-size array.
            pub const fn new(bytes: [u8; KEY_LEN]) -> Self {
                Self(bytes)
            }

            /// Returns the inner bytes.
            pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
                &self.0
            }

            /// Returns the inner bytes as a slice.
            pub fn as_slice(&self) -> &[u8] {
                &self.0
            }

            /// Creates from a slice that must be exactly `KEY_LEN` bytes.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
                let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| KeyError::InvalidKey {
                    expected: KEY_LEN,
                    actual: bytes.len(),
                })?;
                Ok(Self(arr))
            }

            /// Returns as a hex string.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Computes the byte-wise XOR distance to another identifier.
            pub fn xor_distance(&self, other: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
                let mut result = [0u8; KEY_LEN];
                for (i, out) in result.iter_mut().enumerate() {
                    *out = self.0[i] ^ other[i];
                }
                result
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..16])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl From<[u8; KEY_LEN]> for $name {
            fn from(bytes: [u8; KEY_LEN]) -> Self {
                Self(bytes)
            }
        }

        impl From<$name> for [u8; KEY_LEN] {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

define_key_type!(
    /// Identity of a storage root in the key space.
    ///
    /// Generated once when a table directory is initialized and persisted
    /// as raw bytes in its `r.id` marker file.
    ReferenceId
);

define_key_type!(
    /// Normalized, fixed-length identifier of one logical file.
    ///
    /// Inputs that already have `KEY_LEN` bytes are treated as pre-hashed;
    /// anything else is hashed down with [`key_hash`].
    ContentKey
);

impl ReferenceId {
    /// Generates a random reference id.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parses a reference id from `2 * KEY_LEN` hex characters.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|e| KeyError::InvalidReferenceId(e.to_string()))?;
        if bytes.len() != KEY_LEN {
            return Err(KeyError::InvalidReferenceId(format!(
                "expected {} hex characters, got {}",
                KEY_LEN * 2,
                s.len()
            )));
        }
        Self::from_slice(&bytes)
    }

    /// Returns the configured id, or a fresh random one when none is given.
    pub fn from_hex_or_random(s: Option<&str>) -> Result<Self, KeyError> {
        match s {
            Some(hex) if !hex.is_empty() => Self::from_hex(hex),
            _ => Ok(Self::random()),
        }
    }
}

impl ContentKey {
    /// Coerces arbitrary bytes into a content key.
    ///
    /// A `KEY_LEN`-byte input is used unchanged; anything else is hashed.
    pub fn coerce(input: &[u8]) -> Self {
        match Self::from_slice(input) {
            Ok(key) => key,
            Err(_) => Self(key_hash(input)),
        }
    }
}
