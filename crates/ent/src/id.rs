//! Row identifiers
//!
//! Ids are opaque decimal strings. Ids generated by the store for sharded
//! entities are shard-qualified: `1` + 4-digit island number + sequence,
//! so the island holding a row can be derived from its id alone.
//!
//! ```text
//! 1 0003 00000000000042
//! │ │    └─ per-table sequence (14 digits)
//! │ └─ island number
//! └─ shard marker
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

const SHARD_MARKER: u8 = b'1';
const ISLAND_DIGITS: usize = 4;

/// Largest island number representable in a shard-qualified id
pub const MAX_ISLAND: u32 = 9999;

/// Largest per-table sequence representable in a shard-qualified id
pub const MAX_SEQUENCE: u64 = 99_999_999_999_999;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Build a shard-qualified id for `island`. Stores refuse to generate
    /// sequences above [`MAX_SEQUENCE`].
    pub fn compose(island: u32, sequence: u64) -> Self {
        Self(format!("1{island:04}{sequence:014}"))
    }

    /// Island number encoded in a shard-qualified id, if any
    pub fn island(&self) -> Option<u32> {
        let bytes = self.0.as_bytes();
        if bytes.len() <= 1 + ISLAND_DIGITS
            || bytes[0] != SHARD_MARKER
            || !bytes.iter().all(u8::is_ascii_digit)
        {
            return None;
        }
        self.0[1..=ISLAND_DIGITS].parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Id {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for Id {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
