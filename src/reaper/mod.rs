//! Reclamation of slots held by owners that are no longer live
//!
//! Two triggers share one release path:
//!
//! - a periodic scan ([`StaleReaper::reap_once`], scheduled by
//!   [`scheduler::start`]) compares every registry entry against the
//!   liveness oracle
//! - an owner termination event ([`StaleReaper::reclaim_owner`]) releases the
//!   owner's slots straight from its index
//!
//! Each entry is released on its own. One failure is counted and logged; the
//! rest of the pass carries on.

pub mod events;
pub mod scheduler;

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::liveness::LivenessOracle;
use crate::pool::{SlotAllocator, SlotEntry};
use crate::types::{CoordinatorError, Result};

pub use events::spawn_event_reaper;
pub use scheduler::{ReaperConfig, ReaperHandle};

/// Outcome of one reaper pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Registry entries examined
    pub scanned: usize,
    /// Entries whose owner is live
    pub live: usize,
    /// Entries released by this pass
    pub reclaimed: usize,
    /// Entries released by someone else first
    pub already_gone: usize,
    /// Entries whose release failed
    pub failed: usize,
}

/// Releases registry entries whose owners are not live
pub struct StaleReaper {
    allocator: Arc<SlotAllocator>,
    oracle: Arc<dyn LivenessOracle>,
    /// Pools to scan; `None` scans every pool in the store
    pools: Option<Vec<String>>,
}

impl StaleReaper {
    pub fn new(allocator: Arc<SlotAllocator>, oracle: Arc<dyn LivenessOracle>) -> Self {
        Self {
            allocator,
            oracle,
            pools: None,
        }
    }

    /// Restrict scans to these pools
    pub fn with_pools(mut self, pools: Vec<String>) -> Self {
        self.pools = Some(pools);
        self
    }

    async fn scan(&self) -> Result<Vec<SlotEntry>> {
        let registry = self.allocator.registry();
        match &self.pools {
            Some(pools) => {
                let mut entries = Vec::new();
                for pool in pools {
                    entries.extend(registry.entries(pool).await?);
                }
                Ok(entries)
            }
            None => registry.all_entries().await,
        }
    }

    /// One scan-and-release pass.
    ///
    /// The scan happens before the oracle is read, so an owner that allocates
    /// after the scan cannot be mistaken for a dead one. Scan or oracle
    /// failures fail the pass; per-entry failures only show in the report.
    pub async fn reap_once(&self) -> Result<ReapReport> {
        let entries = self.scan().await?;
        let live = self.oracle.active_owner_tokens().await?;

        let mut report = ReapReport {
            scanned: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            if live.contains(&entry.owner) {
                report.live += 1;
                continue;
            }
            self.release(&entry, &mut report).await;
        }

        if report.reclaimed > 0 || report.failed > 0 {
            info!(
                scanned = report.scanned,
                reclaimed = report.reclaimed,
                already_gone = report.already_gone,
                failed = report.failed,
                "Reaper pass complete"
            );
        } else {
            debug!(scanned = report.scanned, live = report.live, "Reaper pass found nothing stale");
        }
        Ok(report)
    }

    /// Release every slot an owner holds, without consulting the oracle
    pub async fn reclaim_owner(&self, owner: &str) -> Result<ReapReport> {
        let entries = self.allocator.registry().slots_of_owner(owner).await?;
        let mut report = ReapReport {
            scanned: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            self.release(&entry, &mut report).await;
        }

        info!(
            owner = %owner,
            reclaimed = report.reclaimed,
            failed = report.failed,
            "Reclaimed slots of terminated owner"
        );
        Ok(report)
    }

    async fn release(&self, entry: &SlotEntry, report: &mut ReapReport) {
        match self.allocator.release_entry(entry).await {
            Ok(true) => {
                report.reclaimed += 1;
                info!(
                    pool = %entry.pool_id,
                    slot = %entry.name,
                    owner = %entry.owner,
                    "Reclaimed stale slot"
                );
            }
            Ok(false) => report.already_gone += 1,
            Err(e @ CoordinatorError::Inconsistent(_)) => {
                report.failed += 1;
                error!(
                    pool = %entry.pool_id,
                    slot = %entry.name,
                    error = %e,
                    "Cannot reclaim slot, coordination state is inconsistent"
                );
            }
            Err(e) => {
                report.failed += 1;
                warn!(
                    pool = %entry.pool_id,
                    slot = %entry.name,
                    owner = %entry.owner,
                    error = %e,
                    "Failed to reclaim slot"
                );
            }
        }
    }
}
