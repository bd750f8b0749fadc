//! Capacity-bounded pools and the slots reserved in them
//!
//! ## Protocol
//!
//! 1. [`UsageCounter`] holds how many slots a pool has handed out; it only
//!    changes through CAS or inside a batch-apply
//! 2. [`SlotRegistry`] holds one `slot -> owner` entry per reserved slot
//! 3. [`NameAllocator`] picks a slot name that has no registry entry
//! 4. [`SlotAllocator`] ties the three together into allocate/release
//! 5. [`PoolSelector`] spreads requests across equivalent pools
//!
//! A registry deletion and its counter decrement always travel in the same
//! batch, so the counter never drifts from the registry.

pub mod allocator;
pub mod backoff;
pub mod counter;
pub mod names;
pub mod registry;
pub mod selector;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::store::keys;
use crate::types::Result;

pub use allocator::SlotAllocator;
pub use backoff::RetryPolicy;
pub use counter::{IncrementOutcome, UsageCounter};
pub use names::NameAllocator;
pub use registry::{SlotEntry, SlotRegistry};
pub use selector::PoolSelector;

/// How many slots a pool may hand out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capacity {
    /// No upper bound
    Unlimited,
    /// At most this many slots; zero or negative means the pool is unavailable
    Limited(i64),
}

impl Capacity {
    /// Whether the pool can hand out anything at all
    pub fn is_available(&self) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limited(max) => *max > 0,
        }
    }

    /// Whether one more slot fits on top of `current`
    pub fn admits(&self, current: u64) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limited(max) if *max <= 0 => false,
            Self::Limited(max) => current < *max as u64,
        }
    }

    /// Usage as an exact fraction `(numerator, denominator)` for ranking.
    /// Unlimited pools always report zero.
    pub fn usage_fraction(&self, current: u64) -> (u128, u128) {
        match self {
            Self::Limited(max) if *max > 0 => (current as u128, *max as u128),
            _ => (0, 1),
        }
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => write!(f, "unlimited"),
            Self::Limited(max) => write!(f, "{max}"),
        }
    }
}

impl std::str::FromStr for Capacity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "unlimited" | "*" => Ok(Self::Unlimited),
            other => other
                .parse::<i64>()
                .map(Self::Limited)
                .map_err(|e| format!("invalid capacity '{other}': {e}")),
        }
    }
}

/// How slot names are generated inside a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum NamingScheme {
    /// `{prefix}_{owner}_{n}` with the lowest free `n`
    Sequential,
    /// `{prefix}{RANDOM}` with `length` uppercase alphanumerics
    Random { length: usize },
}

impl Default for NamingScheme {
    fn default() -> Self {
        Self::Sequential
    }
}

/// Static description of one pool, resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Pool identifier, unique across the store
    pub id: String,
    /// Maximum number of concurrently held slots
    pub capacity: Capacity,
    /// Human-meaningful prefix for slot names (defaults to the pool id)
    pub name_prefix: String,
    /// Slot naming scheme
    pub naming: NamingScheme,
}

impl PoolConfig {
    /// Create a pool whose slot names start with its id
    pub fn new(id: impl Into<String>, capacity: Capacity) -> Self {
        let id = id.into();
        Self {
            name_prefix: id.clone(),
            id,
            capacity,
            naming: NamingScheme::Sequential,
        }
    }

    /// Set the slot name prefix
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set the naming scheme
    pub fn with_naming(mut self, naming: NamingScheme) -> Self {
        self.naming = naming;
        self
    }

    /// Check that the pool can be laid out in the store
    pub fn validate(&self) -> Result<()> {
        keys::validate_segment("pool id", &self.id)?;
        keys::validate_segment("name prefix", &self.name_prefix)?;
        if let NamingScheme::Random { length } = self.naming {
            if length == 0 {
                return Err(crate::types::CoordinatorError::Config(format!(
                    "pool {} uses random naming with zero length",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// Handle for one reserved slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    /// Pool the slot belongs to
    pub pool_id: String,
    /// Slot name, unique within the pool
    pub name: String,
    /// Owner token the slot is bound to
    pub owner: String,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} (owner {})", self.pool_id, self.name, self.owner)
    }
}

/// Point-in-time usage of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    /// Slots currently held according to the usage counter
    pub current: u64,
    /// Configured capacity
    pub capacity: Capacity,
}
