//! Coordination store contract
//!
//! Everything the allocator knows about shared state goes through this
//! trait. Implementations must make `compare_and_swap` atomic for one key and
//! `batch_apply` all-or-nothing across keys.

pub mod keys;
pub mod memory;
pub mod sled_store;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::types::Result;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

/// One conditional mutation inside a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Write `value`; with `if_absent` the batch fails if the key exists
    Add {
        key: String,
        value: String,
        if_absent: bool,
    },
    /// Remove the key; with `expected` the batch fails unless it holds that value
    Delete {
        key: String,
        expected: Option<String>,
    },
    /// Replace `old` with `new`; `old == None` requires the key to be absent
    Swap {
        key: String,
        old: Option<String>,
        new: String,
    },
}

impl BatchOp {
    pub fn add_if_absent(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Add {
            key: key.into(),
            value: value.into(),
            if_absent: true,
        }
    }

    pub fn delete_expecting(key: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::Delete {
            key: key.into(),
            expected: Some(expected.into()),
        }
    }

    pub fn swap(key: impl Into<String>, old: Option<String>, new: impl Into<String>) -> Self {
        Self::Swap {
            key: key.into(),
            old,
            new: new.into(),
        }
    }

    /// The key this operation touches
    pub fn key(&self) -> &str {
        match self {
            Self::Add { key, .. } | Self::Delete { key, .. } | Self::Swap { key, .. } => key,
        }
    }
}

/// Shared key-value store with atomic CAS and batch-apply
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a single key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditional write
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, ordered by key
    async fn scan_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>>;

    /// Set `key` to `new` if it currently holds `expected` (`None` = absent).
    /// Returns `false` when the expectation did not hold.
    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: &str)
        -> Result<bool>;

    /// Apply every operation or none. Returns `false` when any condition failed.
    async fn batch_apply(&self, ops: &[BatchOp]) -> Result<bool>;
}
