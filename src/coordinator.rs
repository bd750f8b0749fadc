//! Pool coordinator
//!
//! The one object callers hold. It owns the store handle, the liveness
//! oracle and the resolved pool table, and wires them into the allocator,
//! the selector and the reaper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::CoordinatorConfig;
use crate::liveness::LivenessOracle;
use crate::pool::{PoolConfig, PoolSelector, PoolUsage, Slot, SlotAllocator};
use crate::reaper::{scheduler, ReapReport, ReaperConfig, ReaperHandle, StaleReaper};
use crate::store::CoordinationStore;
use crate::types::{CoordinatorError, Result};

/// Allocates, releases and reclaims slots across a fixed set of pools
pub struct PoolCoordinator {
    pools: Vec<PoolConfig>,
    by_id: HashMap<String, usize>,
    allocator: Arc<SlotAllocator>,
    selector: PoolSelector,
    reaper: Arc<StaleReaper>,
}

impl PoolCoordinator {
    /// Build a coordinator; fails on an invalid pool table
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        oracle: Arc<dyn LivenessOracle>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        config.validate()?;

        let allocator = Arc::new(SlotAllocator::new(
            store,
            config.retry,
            config.allocation_timeout,
        ));
        let selector = PoolSelector::new(Arc::clone(&allocator));
        let pool_ids: Vec<String> = config.pools.iter().map(|p| p.id.clone()).collect();
        let reaper = Arc::new(StaleReaper::new(Arc::clone(&allocator), oracle).with_pools(pool_ids));

        let by_id = config
            .pools
            .iter()
            .enumerate()
            .map(|(index, pool)| (pool.id.clone(), index))
            .collect();

        info!(
            pools = config.pools.len(),
            max_attempts = config.retry.max_attempts,
            "Pool coordinator ready"
        );

        Ok(Self {
            pools: config.pools,
            by_id,
            allocator,
            selector,
            reaper,
        })
    }

    /// Configured pools, in configuration order
    pub fn pools(&self) -> &[PoolConfig] {
        &self.pools
    }

    /// Look up one configured pool
    pub fn pool(&self, pool_id: &str) -> Result<&PoolConfig> {
        self.by_id
            .get(pool_id)
            .map(|&index| &self.pools[index])
            .ok_or_else(|| CoordinatorError::UnknownPool(pool_id.to_string()))
    }

    /// Reserve a slot for `owner`.
    ///
    /// A single candidate fails with `CapacityExhausted` or `Busy`; several
    /// candidates go through the selector and fail with `NoCapacity`.
    pub async fn allocate<S: AsRef<str>>(&self, pool_ids: &[S], owner: &str) -> Result<Slot> {
        let candidates = pool_ids
            .iter()
            .map(|id| self.pool(id.as_ref()).cloned())
            .collect::<Result<Vec<_>>>()?;

        match candidates.as_slice() {
            [] => Err(CoordinatorError::Config(
                "allocate needs at least one candidate pool".to_string(),
            )),
            [pool] => self.allocator.allocate(pool, owner).await,
            _ => self.selector.select_and_allocate(&candidates, owner).await,
        }
    }

    /// Release a slot. `Ok(false)` when it was already gone.
    pub async fn release(&self, slot: &Slot) -> Result<bool> {
        self.allocator.release(slot).await
    }

    /// Current usage of a configured pool
    pub async fn pool_usage(&self, pool_id: &str) -> Result<PoolUsage> {
        let pool = self.pool(pool_id)?;
        let current = self.allocator.counter().read(&pool.id).await?;
        Ok(PoolUsage {
            current,
            capacity: pool.capacity,
        })
    }

    /// One reaper pass over the configured pools
    pub async fn reap_once(&self) -> Result<ReapReport> {
        self.reaper.reap_once().await
    }

    /// Reclaim every slot of an owner that has ended
    pub async fn owner_terminated(&self, owner: &str) -> Result<ReapReport> {
        self.reaper.reclaim_owner(owner).await
    }

    /// Start the periodic reaper with default backoff
    pub fn start_reaper(&self, interval: Duration, jitter: Duration) -> ReaperHandle {
        self.start_reaper_with(ReaperConfig::new(interval, jitter))
    }

    /// Start the periodic reaper with explicit timing
    pub fn start_reaper_with(&self, config: ReaperConfig) -> ReaperHandle {
        scheduler::start(Arc::clone(&self.reaper), config)
    }

    /// Reaper shared with event-driven reclamation
    pub fn reaper(&self) -> Arc<StaleReaper> {
        Arc::clone(&self.reaper)
    }
}
