//! In-process coordination store
//!
//! A single async mutex around an ordered map. Every operation, including a
//! whole batch, runs under the lock, which gives the same atomicity the
//! networked stores promise. Used by tests and single-process deployments.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::trace;

use super::{BatchOp, CoordinationStore};
use crate::types::Result;

/// Coordination store held entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the store holds no keys
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Copy of every entry (diagnostics and tests)
    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.lock().await.clone()
    }
}

/// Check a single batch condition against the current map
fn condition_holds(entries: &BTreeMap<String, String>, op: &BatchOp) -> bool {
    match op {
        BatchOp::Add { key, if_absent, .. } => !*if_absent || !entries.contains_key(key),
        BatchOp::Delete { key, expected } => match expected {
            Some(expected) => entries.get(key) == Some(expected),
            None => true,
        },
        BatchOp::Swap { key, old, .. } => entries.get(key) == old.as_ref(),
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).map(String::as_str) != expected {
            trace!(key = %key, "CAS expectation failed");
            return Ok(false);
        }
        entries.insert(key.to_string(), new.to_string());
        Ok(true)
    }

    async fn batch_apply(&self, ops: &[BatchOp]) -> Result<bool> {
        let mut entries = self.entries.lock().await;

        if let Some(failed) = ops.iter().find(|op| !condition_holds(&entries, op)) {
            trace!(key = %failed.key(), "Batch condition failed");
            return Ok(false);
        }

        for op in ops {
            match op {
                BatchOp::Add { key, value, .. } => {
                    entries.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key, .. } => {
                    entries.remove(key);
                }
                BatchOp::Swap { key, new, .. } => {
                    entries.insert(key.clone(), new.clone());
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cas_from_absent() {
        let store = MemoryStore::new();

        assert!(store.compare_and_swap("k", None, "1").await.unwrap());
        assert!(!store.compare_and_swap("k", None, "2").await.unwrap());
        assert!(store.compare_and_swap("k", Some("1"), "2").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_scan_prefix_is_bounded() {
        let store = MemoryStore::new();
        store.put("pool/a/slot/x", "o1").await.unwrap();
        store.put("pool/a/slot/y", "o2").await.unwrap();
        store.put("pool/ab/slot/z", "o3").await.unwrap();
        store.put("pool/a/usage", "2").await.unwrap();

        let found = store.scan_prefix("pool/a/slot/").await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.contains_key("pool/a/slot/x"));
        assert!(!found.contains_key("pool/ab/slot/z"));
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.put("taken", "someone").await.unwrap();

        let applied = store
            .batch_apply(&[
                BatchOp::swap("counter", None, "1"),
                BatchOp::add_if_absent("taken", "me"),
            ])
            .await
            .unwrap();

        assert!(!applied);
        assert_eq!(store.get("counter").await.unwrap(), None);
        assert_eq!(store.get("taken").await.unwrap(), Some("someone".to_string()));
    }

    #[tokio::test]
    async fn test_batch_delete_expectation() {
        let store = MemoryStore::new();
        store.put("slot", "run1").await.unwrap();

        assert!(!store
            .batch_apply(&[BatchOp::delete_expecting("slot", "run2")])
            .await
            .unwrap());
        assert!(store
            .batch_apply(&[BatchOp::delete_expecting("slot", "run1")])
            .await
            .unwrap());
        assert!(store.is_empty().await);
    }
}
