//! Shard affinity: which columns decide the island a row lives on

use sha2::{Digest, Sha256};

use crate::error::{EntError, Result};
use crate::value::{Row, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardAffinity {
    /// Single global shard, always island 0
    Global,
    /// Ordered columns whose values jointly determine the island
    Columns(Vec<String>),
}

/// Shorthand for [`ShardAffinity::Global`]
pub const GLOBAL_SHARD: ShardAffinity = ShardAffinity::Global;

/// Routing input extracted from a row
#[derive(Debug, Clone, PartialEq)]
pub enum ShardKey {
    Global,
    Values(Vec<Value>),
}

impl ShardAffinity {
    pub fn columns(columns: &[&str]) -> Self {
        Self::Columns(columns.iter().map(|c| c.to_string()).collect())
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Self::Global)
    }

    /// Affinity column names (empty for the global shard)
    pub fn column_names(&self) -> &[String] {
        match self {
            Self::Global => &[],
            Self::Columns(columns) => columns,
        }
    }

    /// Whether `row` holds every affinity column
    pub fn is_covered_by(&self, row: &Row) -> bool {
        self.column_names().iter().all(|c| row.contains(c))
    }

    /// Extract the shard key. Every affinity column must be present and non-null.
    pub fn shard_key(&self, entity: &str, row: &Row) -> Result<ShardKey> {
        match self {
            Self::Global => Ok(ShardKey::Global),
            Self::Columns(columns) => {
                let mut values = Vec::with_capacity(columns.len());
                for column in columns {
                    match row.get(column) {
                        Some(value) if !value.is_null() => values.push(value.clone()),
                        _ => {
                            return Err(EntError::validation(
                                entity,
                                format!("shard affinity column {column} must be present"),
                            ))
                        }
                    }
                }
                Ok(ShardKey::Values(values))
            }
        }
    }
}

/// Stable, order-sensitive hash of shard key values.
///
/// SHA-256 over a tagged, length-prefixed encoding; the first 8 bytes of
/// the digest as a big-endian u64. Independent of process and platform.
pub fn routing_hash(values: &[Value]) -> u64 {
    let mut hasher = Sha256::new();
    for value in values {
        let (tag, bytes): (u8, Vec<u8>) = match value {
            Value::Null => (0, Vec::new()),
            Value::Id(id) => (1, id.as_str().as_bytes().to_vec()),
            Value::String(s) => (2, s.as_bytes().to_vec()),
            Value::Bool(b) => (3, vec![u8::from(*b)]),
            Value::Int(n) => (4, n.to_be_bytes().to_vec()),
            Value::Timestamp(ts) => (5, ts.timestamp_micros().to_be_bytes().to_vec()),
            Value::Json(json) => (6, json.to_string().into_bytes()),
        };
        hasher.update([tag]);
        hasher.update((bytes.len() as u32).to_be_bytes());
        hasher.update(&bytes);
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
