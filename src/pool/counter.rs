//! Usage counter: one decimal integer per pool, changed only by CAS
//!
//! Each `try_*` call is a single read + CAS. A lost race is reported to the
//! caller, who decides whether and when to retry.

use std::sync::Arc;
use tracing::{debug, error};

use super::Capacity;
use crate::store::{keys, BatchOp, CoordinationStore};
use crate::types::{CoordinatorError, Result};

/// Counter value together with the raw text it was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Stored text, `None` when the key is absent
    pub raw: Option<String>,
    /// Parsed value (absent reads as zero)
    pub value: u64,
}

/// Result of one increment attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// CAS applied; the counter now holds `current`
    Incremented { current: u64 },
    /// Pool already at capacity; nothing was written
    AtCapacity { current: u64 },
    /// Another writer changed the counter between read and CAS
    LostRace,
}

/// Per-pool usage counters in the coordination store
#[derive(Clone)]
pub struct UsageCounter {
    store: Arc<dyn CoordinationStore>,
}

impl UsageCounter {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Read the counter together with its raw stored form
    pub async fn snapshot(&self, pool: &str) -> Result<CounterSnapshot> {
        let raw = self.store.get(&keys::usage_key(pool)).await?;
        let value = match raw.as_deref() {
            None => 0,
            Some(text) => text.trim().parse::<u64>().map_err(|_| {
                error!(pool = %pool, value = %text, "Usage counter is not a number");
                CoordinatorError::Inconsistent(format!(
                    "usage counter for pool {pool} holds '{text}'"
                ))
            })?,
        };
        Ok(CounterSnapshot { raw, value })
    }

    /// Current number of held slots
    pub async fn read(&self, pool: &str) -> Result<u64> {
        Ok(self.snapshot(pool).await?.value)
    }

    /// One attempt to add a slot, refusing when the pool is full
    pub async fn try_increment(&self, pool: &str, capacity: Capacity) -> Result<IncrementOutcome> {
        let snapshot = self.snapshot(pool).await?;
        self.try_increment_from(pool, capacity, &snapshot).await
    }

    /// Increment attempt against a snapshot the caller already holds
    pub async fn try_increment_from(
        &self,
        pool: &str,
        capacity: Capacity,
        snapshot: &CounterSnapshot,
    ) -> Result<IncrementOutcome> {
        if !capacity.admits(snapshot.value) {
            return Ok(IncrementOutcome::AtCapacity {
                current: snapshot.value,
            });
        }

        let next = snapshot.value + 1;
        let swapped = self
            .store
            .compare_and_swap(
                &keys::usage_key(pool),
                snapshot.raw.as_deref(),
                &next.to_string(),
            )
            .await?;

        if swapped {
            debug!(pool = %pool, current = next, "Usage counter incremented");
            Ok(IncrementOutcome::Incremented { current: next })
        } else {
            debug!(pool = %pool, "Usage counter increment lost race");
            Ok(IncrementOutcome::LostRace)
        }
    }

    /// One attempt to give back a slot. `Ok(false)` means the race was lost.
    pub async fn try_decrement(&self, pool: &str) -> Result<bool> {
        let snapshot = self.snapshot(pool).await?;
        let next = decremented(pool, &snapshot)?;

        let swapped = self
            .store
            .compare_and_swap(
                &keys::usage_key(pool),
                snapshot.raw.as_deref(),
                &next.to_string(),
            )
            .await?;
        if swapped {
            debug!(pool = %pool, current = next, "Usage counter decremented");
        }
        Ok(swapped)
    }

    /// Swap operation taking the counter from `snapshot` down by one, for
    /// inclusion in a release batch
    pub fn decrement_op(&self, pool: &str, snapshot: &CounterSnapshot) -> Result<BatchOp> {
        let next = decremented(pool, snapshot)?;
        Ok(BatchOp::swap(
            keys::usage_key(pool),
            snapshot.raw.clone(),
            next.to_string(),
        ))
    }
}

fn decremented(pool: &str, snapshot: &CounterSnapshot) -> Result<u64> {
    snapshot.value.checked_sub(1).ok_or_else(|| {
        error!(pool = %pool, "Usage counter would drop below zero");
        CoordinatorError::Inconsistent(format!("usage counter for pool {pool} is already zero"))
    })
}
