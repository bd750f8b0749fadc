//! Sled-backed coordination store
//!
//! CAS maps onto `Tree::compare_and_swap`; batches run inside a sled
//! transaction that aborts when any condition fails, so a rejected batch
//! leaves no partial writes behind.

use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, trace};

use super::{BatchOp, CoordinationStore};
use crate::types::{CoordinatorError, Result};

/// Configuration for the sled store
#[derive(Debug, Clone)]
pub struct SledStoreConfig {
    /// Path to sled database
    pub db_path: PathBuf,
    /// Tree holding coordination keys
    pub tree: String,
    /// Cache size in bytes
    pub cache_size: u64,
}

impl Default for SledStoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("pool-coordinator.sled"),
            tree: "coordination".to_string(),
            cache_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

/// Coordination store backed by a sled tree
pub struct SledStore {
    /// Keeps the database open for the lifetime of the tree
    _db: sled::Db,
    tree: sled::Tree,
}

impl SledStore {
    /// Open or create a store
    pub fn open(config: SledStoreConfig) -> Result<Self> {
        let db = sled::Config::new()
            .path(&config.db_path)
            .cache_capacity(config.cache_size)
            .open()?;
        let tree = db.open_tree(config.tree.as_bytes())?;

        info!(path = %config.db_path.display(), tree = %config.tree, "Opened coordination store");
        Ok(Self { _db: db, tree })
    }

    /// Open a store at a specific path with default settings
    pub fn at_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(SledStoreConfig {
            db_path: path.as_ref().to_path_buf(),
            ..Default::default()
        })
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.tree.flush_async().await?;
        Ok(())
    }
}

fn decode(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| CoordinatorError::Inconsistent(format!("non UTF-8 data in store: {e}")))
}

#[async_trait]
impl CoordinationStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.tree.get(key.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.tree.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let mut found = BTreeMap::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            found.insert(decode(&key)?, decode(&value)?);
        }
        Ok(found)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool> {
        let swapped = self.tree.compare_and_swap(
            key.as_bytes(),
            expected.map(str::as_bytes),
            Some(new.as_bytes()),
        )?;
        if swapped.is_err() {
            trace!(key = %key, "CAS expectation failed");
        }
        Ok(swapped.is_ok())
    }

    async fn batch_apply(&self, ops: &[BatchOp]) -> Result<bool> {
        let outcome = self.tree.transaction(|tx| {
            // Check every condition before writing anything
            for op in ops {
                let current = tx.get(op.key().as_bytes())?;
                let holds = match op {
                    BatchOp::Add { if_absent, .. } => !*if_absent || current.is_none(),
                    BatchOp::Delete { expected, .. } => match expected {
                        Some(expected) => current.as_deref() == Some(expected.as_bytes()),
                        None => true,
                    },
                    BatchOp::Swap { old, .. } => {
                        current.as_deref() == old.as_ref().map(|o| o.as_bytes())
                    }
                };
                if !holds {
                    return Err(ConflictableTransactionError::Abort(()));
                }
            }

            for op in ops {
                match op {
                    BatchOp::Add { key, value, .. } => {
                        tx.insert(key.as_bytes(), value.as_bytes())?;
                    }
                    BatchOp::Delete { key, .. } => {
                        tx.remove(key.as_bytes())?;
                    }
                    BatchOp::Swap { key, new, .. } => {
                        tx.insert(key.as_bytes(), new.as_bytes())?;
                    }
                }
            }
            Ok(())
        });

        match outcome {
            Ok(()) => Ok(true),
            Err(TransactionError::Abort(())) => {
                trace!(ops = ops.len(), "Batch condition failed");
                Ok(false)
            }
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, SledStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::at_path(dir.path().join("coord.sled")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_cas_semantics() {
        let (_dir, store) = open_temp();

        assert!(store.compare_and_swap("pool/P/usage", None, "1").await.unwrap());
        assert!(!store.compare_and_swap("pool/P/usage", Some("0"), "1").await.unwrap());
        assert!(store.compare_and_swap("pool/P/usage", Some("1"), "2").await.unwrap());
        assert_eq!(store.get("pool/P/usage").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_rejected_batch_leaves_no_writes() {
        let (_dir, store) = open_temp();
        store.put("pool/P/slot/P_a_0", "a").await.unwrap();

        let applied = store
            .batch_apply(&[
                BatchOp::swap("pool/P/usage", None, "1"),
                BatchOp::add_if_absent("pool/P/slot/P_a_0", "b"),
            ])
            .await
            .unwrap();

        assert!(!applied);
        assert_eq!(store.get("pool/P/usage").await.unwrap(), None);
        assert_eq!(store.get("pool/P/slot/P_a_0").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_batch_release_shape() {
        let (_dir, store) = open_temp();
        store.put("pool/P/usage", "1").await.unwrap();
        store.put("pool/P/slot/P_a_0", "a").await.unwrap();

        let applied = store
            .batch_apply(&[
                BatchOp::delete_expecting("pool/P/slot/P_a_0", "a"),
                BatchOp::swap("pool/P/usage", Some("1".to_string()), "0"),
            ])
            .await
            .unwrap();

        assert!(applied);
        assert_eq!(store.get("pool/P/slot/P_a_0").await.unwrap(), None);
        assert_eq!(store.get("pool/P/usage").await.unwrap(), Some("0".to_string()));
        assert_eq!(store.scan_prefix("pool/P/slot/").await.unwrap().len(), 0);
    }
}
