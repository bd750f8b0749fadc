//! Pool Coordinator - capacity-bounded slot allocation
//!
//! Hands out slots from fixed-size pools (execution slots on a host,
//! browser-driver slots, short ID prefixes) to workers that do not know
//! about each other. All coordination goes through a shared store offering
//! single-key compare-and-swap and atomic multi-key batches; there is no
//! leader.
//!
//! ## Components
//!
//! - **Store**: the [`CoordinationStore`](store::CoordinationStore) contract,
//!   with in-memory and sled backends
//! - **Pool**: usage counters, the slot registry, name allocation, the
//!   allocate/release protocol and usage-based pool selection
//! - **Liveness**: oracles answering which owner tokens are still active
//! - **Reaper**: periodic and event-driven reclamation of slots whose owners
//!   are gone
//! - **NATS**: owner heartbeats and termination events feeding liveness
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pool_coordinator::{
//!     config::CoordinatorConfig,
//!     liveness::StaticOracle,
//!     pool::{Capacity, PoolConfig},
//!     store::MemoryStore,
//!     PoolCoordinator,
//! };
//!
//! # async fn demo() -> pool_coordinator::Result<()> {
//! let config = CoordinatorConfig::new(vec![PoolConfig::new("P", Capacity::Limited(2))]);
//! let coordinator = PoolCoordinator::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(StaticOracle::with_tokens(["run1"])),
//!     config,
//! )?;
//!
//! let slot = coordinator.allocate(&["P"], "run1").await?;
//! assert_eq!(slot.name, "P_run1_0");
//! coordinator.release(&slot).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod liveness;
pub mod nats;
pub mod pool;
pub mod reaper;
pub mod store;
pub mod types;

pub use config::{Args, CoordinatorConfig};
pub use coordinator::PoolCoordinator;
pub use pool::{Capacity, PoolConfig, PoolUsage, Slot};
pub use reaper::{ReapReport, ReaperHandle};
pub use types::{CoordinatorError, Result};
