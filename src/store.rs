//! Low-level key-value primitives shared by the Redis-family backends.
//!
//! [`KeyValueCache`](crate::kv::KeyValueCache) speaks to storage only through these traits. Every write command
//! touches exactly one key, so a batch can be split across shards without reinterpreting it.

#[cfg(feature = "redis")]
pub mod redis;
pub mod sharded;

use std::collections::BTreeSet;
use std::fmt::Debug;

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Set { key: String, value: Vec<u8> },
    Del { key: String },
    SAdd { key: String, members: Vec<String> },
    SRem { key: String, members: Vec<String> },
    HSet { key: String, field: String, value: Vec<u8> },
    HDel { key: String, fields: Vec<String> },
    Expire { key: String, seconds: u64 },
}

impl WriteOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. }
            | Self::Del { key }
            | Self::SAdd { key, .. }
            | Self::SRem { key, .. }
            | Self::HSet { key, .. }
            | Self::HDel { key, .. }
            | Self::Expire { key, .. } => key,
        }
    }

    /// Commands with nothing to do, like adding an empty member list.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::SAdd { members, .. } | Self::SRem { members, .. } => members.is_empty(),
            Self::HDel { fields, .. } => fields.is_empty(),
            _ => false,
        }
    }
}

/// Ordered list of write commands applied together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        if !op.is_noop() {
            self.ops.push(op);
        }
        self
    }

    pub fn extend<I: IntoIterator<Item = WriteOp>>(&mut self, ops: I) -> &mut Self {
        for op in ops {
            self.push(op);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

impl FromIterator<WriteOp> for WriteBatch {
    fn from_iter<I: IntoIterator<Item = WriteOp>>(iter: I) -> Self {
        let mut batch = WriteBatch::new();
        batch.extend(iter);
        batch
    }
}

#[async_trait]
pub trait StoreReader: Send + Sync {
    /// Values of string keys, `None` for missing keys. The result is aligned with `keys`.
    async fn get_values(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Values of hash fields, aligned with `fields`.
    async fn hash_values(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Members of each set key, aligned with `keys`. Missing keys read as empty sets.
    async fn set_members(&self, keys: &[String]) -> Result<Vec<BTreeSet<String>>>;

    /// Incrementally scans a set. `pattern` is a server-side hint; callers still filter the result.
    async fn scan_set(&self, key: &str, pattern: Option<&str>, count: usize) -> Result<BTreeSet<String>>;

    /// Membership test for each of `members`, aligned with `members`.
    async fn set_contains(&self, key: &str, members: &[String]) -> Result<Vec<bool>>;
}

#[async_trait]
pub trait BatchWriter: Send + Sync {
    /// Whether [`write`](Self::write) applies the whole batch atomically.
    fn supports_atomic_batches(&self) -> bool;

    async fn write(&self, batch: WriteBatch) -> Result<()>;
}

pub trait StoreClient: StoreReader + BatchWriter + Debug + 'static {
    /// Name used in logs and [`Unavailable`](crate::error::CacheError::Unavailable) errors.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str) -> WriteOp {
        WriteOp::Set {
            key:   key.to_string(),
            value: b"{}".to_vec(),
        }
    }

    #[test]
    fn noop_commands_are_dropped() {
        let mut batch = WriteBatch::new();
        batch
            .push(set("a"))
            .push(WriteOp::SAdd {
                key:     "s".into(),
                members: vec![],
            })
            .push(WriteOp::HDel {
                key:    "h".into(),
                fields: vec![],
            });
        assert_eq!(batch.len(), 1);
    }
}
