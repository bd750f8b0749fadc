//! Slot name allocation
//!
//! Probing is racy by nature: two allocators can pick the same free name.
//! The registry write is conditioned on absence, and on conflict the caller
//! comes back here with the taken name excluded.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashSet;
use tracing::debug;

use super::{NamingScheme, PoolConfig, SlotRegistry};
use crate::types::{CoordinatorError, Result};

/// Random draws before giving up on finding an unused random name
const MAX_RANDOM_DRAWS: u32 = 32;

/// Picks slot names that have no registry entry
#[derive(Clone)]
pub struct NameAllocator {
    registry: SlotRegistry,
}

impl NameAllocator {
    pub fn new(registry: SlotRegistry) -> Self {
        Self { registry }
    }

    /// Deterministic prefix for an owner's slots in a pool
    pub fn owner_prefix(pool: &PoolConfig, owner: &str) -> String {
        format!("{}_{}_", pool.name_prefix, owner)
    }

    /// Candidate name with no current registry entry, skipping `excluded`
    pub async fn reserve_name(
        &self,
        pool: &PoolConfig,
        owner: &str,
        excluded: &HashSet<String>,
    ) -> Result<String> {
        match pool.naming {
            NamingScheme::Sequential => self.sequential(pool, owner, excluded).await,
            NamingScheme::Random { length } => self.random(pool, length, excluded).await,
        }
    }

    async fn sequential(
        &self,
        pool: &PoolConfig,
        owner: &str,
        excluded: &HashSet<String>,
    ) -> Result<String> {
        let prefix = Self::owner_prefix(pool, owner);
        let taken = self.registry.names_with_prefix(&pool.id, &prefix).await?;

        // Only names whose remainder is a plain number belong to this owner;
        // "P_run1_x_0" is owner "run1_x", not "run1".
        let used: HashSet<u64> = taken
            .iter()
            .chain(excluded.iter())
            .filter_map(|name| name.strip_prefix(&prefix))
            .filter_map(|suffix| suffix.parse::<u64>().ok())
            .collect();

        let index = (0u64..)
            .find(|n| !used.contains(n))
            .unwrap_or_default();
        let name = format!("{prefix}{index}");
        debug!(pool = %pool.id, owner = %owner, name = %name, "Picked slot name");
        Ok(name)
    }

    async fn random(
        &self,
        pool: &PoolConfig,
        length: usize,
        excluded: &HashSet<String>,
    ) -> Result<String> {
        for _ in 0..MAX_RANDOM_DRAWS {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(length)
                .map(|c| (c as char).to_ascii_uppercase())
                .collect();
            let name = format!("{}{}", pool.name_prefix, suffix);

            if excluded.contains(&name) {
                continue;
            }
            if self.registry.owner_of(&pool.id, &name).await?.is_none() {
                debug!(pool = %pool.id, name = %name, "Drew random slot name");
                return Ok(name);
            }
        }

        Err(CoordinatorError::CapacityExhausted {
            pool: pool.id.clone(),
        })
    }
}
