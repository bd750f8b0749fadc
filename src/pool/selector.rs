//! Pool selection across equivalent candidates
//!
//! Candidates are ranked by relative usage (lowest first, ties by pool id)
//! and tried in order. Repeated allocations therefore spread across pools
//! without any shared scheduling state beyond the usage counters.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::{PoolConfig, Slot, SlotAllocator};
use crate::types::{CoordinatorError, Result};

/// A candidate pool with the usage it was ranked by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedPool {
    pub pool: PoolConfig,
    pub current: u64,
}

impl RankedPool {
    fn compare(&self, other: &Self) -> Ordering {
        let (a_num, a_den) = self.pool.capacity.usage_fraction(self.current);
        let (b_num, b_den) = other.pool.capacity.usage_fraction(other.current);
        (a_num * b_den)
            .cmp(&(b_num * a_den))
            .then_with(|| self.pool.id.cmp(&other.pool.id))
    }
}

/// Order candidates by relative usage, dropping unavailable pools
pub fn rank_by_usage(mut candidates: Vec<RankedPool>) -> Vec<RankedPool> {
    candidates.retain(|c| c.pool.capacity.is_available());
    candidates.sort_by(RankedPool::compare);
    candidates
}

/// Picks the least-used pool among candidates and allocates from it
#[derive(Clone)]
pub struct PoolSelector {
    allocator: Arc<SlotAllocator>,
}

impl PoolSelector {
    pub fn new(allocator: Arc<SlotAllocator>) -> Self {
        Self { allocator }
    }

    /// Read usage for each distinct candidate and rank them
    pub async fn rank(&self, candidates: &[PoolConfig]) -> Result<Vec<RankedPool>> {
        let mut seen = HashSet::new();
        let mut ranked = Vec::with_capacity(candidates.len());
        for pool in candidates {
            if !seen.insert(pool.id.as_str()) {
                continue;
            }
            let current = self.allocator.counter().read(&pool.id).await?;
            ranked.push(RankedPool {
                pool: pool.clone(),
                current,
            });
        }
        Ok(rank_by_usage(ranked))
    }

    /// Allocate from the least-used candidate that has room.
    ///
    /// Capacity exhaustion or contention on one candidate moves on to the
    /// next; store failures end the attempt immediately.
    pub async fn select_and_allocate(&self, candidates: &[PoolConfig], owner: &str) -> Result<Slot> {
        let ranked = self.rank(candidates).await?;

        for candidate in &ranked {
            debug!(
                pool = %candidate.pool.id,
                current = candidate.current,
                capacity = %candidate.pool.capacity,
                "Trying candidate pool"
            );

            match self.allocator.allocate(&candidate.pool, owner).await {
                Ok(slot) => return Ok(slot),
                Err(e @ CoordinatorError::CapacityExhausted { .. })
                | Err(e @ CoordinatorError::Busy { .. }) => {
                    debug!(pool = %candidate.pool.id, reason = e.kind(), "Candidate pool declined");
                }
                Err(e) => return Err(e),
            }
        }

        let candidates: Vec<String> = candidates.iter().map(|p| p.id.clone()).collect();
        info!(owner = %owner, candidates = ?candidates, "No candidate pool had capacity");
        Err(CoordinatorError::NoCapacity { candidates })
    }
}
