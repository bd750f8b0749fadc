//! Slot registry: `pool/{pool}/slot/{slot} -> owner`
//!
//! Registry entries are the source of truth for who holds what. Every entry
//! is paired with an `owner/{owner}/{pool}/{slot}` index key, written and
//! deleted in the same batch.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::counter::CounterSnapshot;
use super::{Slot, UsageCounter};
use crate::store::{keys, BatchOp, CoordinationStore};
use crate::types::Result;

/// One registry entry as found by a scan
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotEntry {
    pub pool_id: String,
    pub name: String,
    pub owner: String,
}

impl From<SlotEntry> for Slot {
    fn from(entry: SlotEntry) -> Self {
        Slot {
            pool_id: entry.pool_id,
            name: entry.name,
            owner: entry.owner,
        }
    }
}

impl From<&Slot> for SlotEntry {
    fn from(slot: &Slot) -> Self {
        SlotEntry {
            pool_id: slot.pool_id.clone(),
            name: slot.name.clone(),
            owner: slot.owner.clone(),
        }
    }
}

/// Registry of held slots across all pools
#[derive(Clone)]
pub struct SlotRegistry {
    store: Arc<dyn CoordinationStore>,
}

impl SlotRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Owner currently holding a slot, if the entry exists
    pub async fn owner_of(&self, pool: &str, slot: &str) -> Result<Option<String>> {
        self.store.get(&keys::slot_key(pool, slot)).await
    }

    /// Every entry in one pool
    pub async fn entries(&self, pool: &str) -> Result<Vec<SlotEntry>> {
        let found = self.store.scan_prefix(&keys::slot_prefix(pool)).await?;
        Ok(Self::collect_entries(found))
    }

    /// Every entry in every pool
    pub async fn all_entries(&self) -> Result<Vec<SlotEntry>> {
        let found = self.store.scan_prefix(keys::POOL_ROOT).await?;
        Ok(Self::collect_entries(found))
    }

    fn collect_entries(found: std::collections::BTreeMap<String, String>) -> Vec<SlotEntry> {
        found
            .into_iter()
            .filter_map(|(key, owner)| {
                keys::parse_slot_key(&key).map(|(pool, name)| SlotEntry {
                    pool_id: pool.to_string(),
                    name: name.to_string(),
                    owner,
                })
            })
            .collect()
    }

    /// Names in `pool` that start with `prefix`
    pub async fn names_with_prefix(&self, pool: &str, prefix: &str) -> Result<HashSet<String>> {
        let scan = format!("{}{}", keys::slot_prefix(pool), prefix);
        let found = self.store.scan_prefix(&scan).await?;
        Ok(found
            .keys()
            .filter_map(|key| keys::parse_slot_key(key).map(|(_, name)| name.to_string()))
            .collect())
    }

    /// Slots recorded for an owner, taken from the per-owner index
    pub async fn slots_of_owner(&self, owner: &str) -> Result<Vec<SlotEntry>> {
        let found = self.store.scan_prefix(&keys::owner_prefix(owner)).await?;
        let mut slots = Vec::with_capacity(found.len());
        for key in found.keys() {
            match keys::parse_owner_index_key(owner, key) {
                Some((pool, name)) => slots.push(SlotEntry {
                    pool_id: pool.to_string(),
                    name: name.to_string(),
                    owner: owner.to_string(),
                }),
                None => warn!(key = %key, owner = %owner, "Skipping malformed owner index key"),
            }
        }
        Ok(slots)
    }

    /// Add an entry if no entry with that name exists.
    /// Returns `false` when someone else already holds the name.
    pub async fn register(&self, pool: &str, slot: &str, owner: &str) -> Result<bool> {
        let ops = [
            BatchOp::add_if_absent(keys::slot_key(pool, slot), owner),
            BatchOp::Add {
                key: keys::owner_index_key(owner, pool, slot),
                value: keys::OWNER_INDEX_VALUE.to_string(),
                if_absent: false,
            },
        ];
        let added = self.store.batch_apply(&ops).await?;
        if added {
            debug!(pool = %pool, slot = %slot, owner = %owner, "Registry entry added");
        } else {
            debug!(pool = %pool, slot = %slot, "Registry entry already taken");
        }
        Ok(added)
    }

    /// Batch removing `entry` and decrementing its pool's counter from
    /// `snapshot`. The deletion is conditioned on the entry's owner.
    pub fn release_ops(
        &self,
        entry: &SlotEntry,
        counter: &UsageCounter,
        snapshot: &CounterSnapshot,
    ) -> Result<Vec<BatchOp>> {
        Ok(vec![
            BatchOp::delete_expecting(keys::slot_key(&entry.pool_id, &entry.name), &entry.owner),
            BatchOp::Delete {
                key: keys::owner_index_key(&entry.owner, &entry.pool_id, &entry.name),
                expected: None,
            },
            counter.decrement_op(&entry.pool_id, snapshot)?,
        ])
    }
}
