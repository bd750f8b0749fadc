//! Slot allocation and release
//!
//! ## Allocate
//!
//! 1. Read the usage counter; a full pool fails fast with no writes
//! 2. CAS the counter up by one, re-reading on a lost race (bounded)
//! 3. Pick a free name and add the registry entry, conditioned on absence;
//!    a name conflict keeps the increment and tries again
//! 4. Hand back the [`Slot`]
//!
//! Between steps 2 and 3 the increment is held by a reservation guard.
//! If registration gives up, or the allocate future is dropped before an
//! entry of its own lands, the guard takes the increment back so capacity
//! cannot leak.
//!
//! ## Release
//!
//! One batch deletes the registry entry (conditioned on its owner), its
//! owner index key, and swaps the counter down by one. An entry that is
//! already gone was reclaimed elsewhere; the counter is left alone.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::counter::IncrementOutcome;
use super::{NameAllocator, PoolConfig, RetryPolicy, Slot, SlotEntry, SlotRegistry, UsageCounter};
use crate::store::{keys, CoordinationStore};
use crate::types::{CoordinatorError, Result};

/// Default time allowed between the counter increment and the registry write
pub const DEFAULT_ALLOCATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Why registration of a reserved slot did not produce a slot
enum RegistrationFailure {
    /// Nothing was registered; the increment must be given back
    NotRegistered(CoordinatorError),
    /// The store failed and the entry may or may not exist
    OutcomeUnknown(CoordinatorError),
}

/// Allocates and releases slots within a single pool
pub struct SlotAllocator {
    store: Arc<dyn CoordinationStore>,
    counter: UsageCounter,
    registry: SlotRegistry,
    names: NameAllocator,
    retry: RetryPolicy,
    allocation_timeout: Duration,
}

impl SlotAllocator {
    /// Create an allocator over a store
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        retry: RetryPolicy,
        allocation_timeout: Duration,
    ) -> Self {
        let counter = UsageCounter::new(Arc::clone(&store));
        let registry = SlotRegistry::new(Arc::clone(&store));
        let names = NameAllocator::new(registry.clone());
        Self {
            store,
            counter,
            registry,
            names,
            retry,
            allocation_timeout,
        }
    }

    /// Usage counters this allocator writes
    pub fn counter(&self) -> &UsageCounter {
        &self.counter
    }

    /// Registry this allocator writes
    pub fn registry(&self) -> &SlotRegistry {
        &self.registry
    }

    /// Retry policy for contended operations
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Reserve one slot in `pool` for `owner`
    pub async fn allocate(&self, pool: &PoolConfig, owner: &str) -> Result<Slot> {
        keys::validate_segment("owner token", owner)?;
        if !pool.capacity.is_available() {
            debug!(pool = %pool.id, capacity = %pool.capacity, "Pool unavailable");
            return Err(CoordinatorError::CapacityExhausted {
                pool: pool.id.clone(),
            });
        }

        let current = self.reserve_capacity(pool).await?;
        debug!(pool = %pool.id, owner = %owner, current, "Capacity reserved");

        let mut guard =
            ReservationGuard::new(self.counter.clone(), self.registry.clone(), pool, self.retry);

        match self.register_slot(pool, owner, &mut guard).await {
            Ok(slot) => {
                guard.disarm();
                info!(
                    pool = %slot.pool_id,
                    slot = %slot.name,
                    owner = %slot.owner,
                    "Allocated slot"
                );
                Ok(slot)
            }
            Err(RegistrationFailure::NotRegistered(e)) => {
                guard.compensate().await;
                Err(e)
            }
            Err(RegistrationFailure::OutcomeUnknown(e)) => {
                // Decrementing while an entry might exist would let the pool
                // overcommit; a leaked unit is the lesser failure.
                guard.disarm();
                error!(
                    pool = %pool.id,
                    owner = %owner,
                    error = %e,
                    "Registration outcome unknown, usage counter left incremented"
                );
                Err(e)
            }
        }
    }

    /// Steps 1 and 2: bounded CAS loop on the usage counter
    async fn reserve_capacity(&self, pool: &PoolConfig) -> Result<u64> {
        let max_attempts = self.retry.max_attempts;

        for attempt in 1..=max_attempts {
            let snapshot = self.counter.snapshot(&pool.id).await?;
            if !pool.capacity.admits(snapshot.value) {
                debug!(pool = %pool.id, current = snapshot.value, "Pool full");
                return Err(CoordinatorError::CapacityExhausted {
                    pool: pool.id.clone(),
                });
            }

            match self
                .counter
                .try_increment_from(&pool.id, pool.capacity, &snapshot)
                .await?
            {
                IncrementOutcome::Incremented { current } => return Ok(current),
                IncrementOutcome::AtCapacity { .. } => {
                    return Err(CoordinatorError::CapacityExhausted {
                        pool: pool.id.clone(),
                    })
                }
                IncrementOutcome::LostRace => {
                    if attempt < max_attempts {
                        self.retry.wait(attempt).await;
                    }
                }
            }
        }

        warn!(pool = %pool.id, attempts = max_attempts, "Gave up reserving capacity");
        Err(CoordinatorError::Busy {
            pool: pool.id.clone(),
            attempts: max_attempts,
        })
    }

    /// Step 3: try names until one registers, the retry ceiling is hit, or
    /// the allocation timeout passes
    async fn register_slot(
        &self,
        pool: &PoolConfig,
        owner: &str,
        guard: &mut ReservationGuard,
    ) -> std::result::Result<Slot, RegistrationFailure> {
        let deadline = Instant::now() + self.allocation_timeout;
        let max_attempts = self.retry.max_attempts;
        let mut excluded = HashSet::new();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let name = self
                .names
                .reserve_name(pool, owner, &excluded)
                .await
                .map_err(RegistrationFailure::NotRegistered)?;
            guard.track_candidate(&name, owner);

            match self.registry.register(&pool.id, &name, owner).await {
                Ok(true) => {
                    return Ok(Slot {
                        pool_id: pool.id.clone(),
                        name,
                        owner: owner.to_string(),
                    })
                }
                Ok(false) => {
                    debug!(pool = %pool.id, slot = %name, "Name taken by another allocator");
                    guard.clear_candidate();
                    excluded.insert(name);
                }
                Err(e) => {
                    // The write may have landed before the error surfaced
                    return match self.registry.owner_of(&pool.id, &name).await {
                        Ok(Some(holder)) if holder == owner => Ok(Slot {
                            pool_id: pool.id.clone(),
                            name,
                            owner: owner.to_string(),
                        }),
                        Ok(_) => Err(RegistrationFailure::NotRegistered(e)),
                        Err(_) => Err(RegistrationFailure::OutcomeUnknown(e)),
                    };
                }
            }

            if attempt >= max_attempts || Instant::now() >= deadline {
                warn!(
                    pool = %pool.id,
                    owner = %owner,
                    attempts = attempt,
                    "Gave up registering a slot name"
                );
                return Err(RegistrationFailure::NotRegistered(CoordinatorError::Busy {
                    pool: pool.id.clone(),
                    attempts: attempt,
                }));
            }
            self.retry.wait(attempt).await;
        }
    }

    /// Release a slot. `Ok(false)` when it was already gone.
    pub async fn release(&self, slot: &Slot) -> Result<bool> {
        self.release_entry(&SlotEntry::from(slot)).await
    }

    /// Delete a registry entry and decrement its counter in one batch
    pub async fn release_entry(&self, entry: &SlotEntry) -> Result<bool> {
        let max_attempts = self.retry.max_attempts;

        for attempt in 1..=max_attempts {
            match self.registry.owner_of(&entry.pool_id, &entry.name).await? {
                None => {
                    debug!(
                        pool = %entry.pool_id,
                        slot = %entry.name,
                        "Slot already released"
                    );
                    return Ok(false);
                }
                Some(holder) if holder != entry.owner => {
                    // Reclaimed and handed to someone else since this handle was issued
                    warn!(
                        pool = %entry.pool_id,
                        slot = %entry.name,
                        owner = %entry.owner,
                        holder = %holder,
                        "Slot now held by another owner, nothing to release"
                    );
                    return Ok(false);
                }
                Some(_) => {}
            }

            let snapshot = self.counter.snapshot(&entry.pool_id).await?;
            let ops = self.registry.release_ops(entry, &self.counter, &snapshot)?;

            if self.store.batch_apply(&ops).await? {
                info!(
                    pool = %entry.pool_id,
                    slot = %entry.name,
                    owner = %entry.owner,
                    "Released slot"
                );
                return Ok(true);
            }

            debug!(pool = %entry.pool_id, slot = %entry.name, attempt, "Release lost race");
            if attempt < max_attempts {
                self.retry.wait(attempt).await;
            }
        }

        warn!(pool = %entry.pool_id, slot = %entry.name, "Gave up releasing slot");
        Err(CoordinatorError::Busy {
            pool: entry.pool_id.clone(),
            attempts: max_attempts,
        })
    }
}

/// Holds a counter increment until a registry entry backs it
struct ReservationGuard {
    counter: UsageCounter,
    registry: SlotRegistry,
    pool: String,
    retry: RetryPolicy,
    /// Name and owner of the registration in flight, if any
    candidate: Option<(String, String)>,
    armed: bool,
}

impl ReservationGuard {
    fn new(
        counter: UsageCounter,
        registry: SlotRegistry,
        pool: &PoolConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            counter,
            registry,
            pool: pool.id.clone(),
            retry,
            candidate: None,
            armed: true,
        }
    }

    fn track_candidate(&mut self, name: &str, owner: &str) {
        self.candidate = Some((name.to_string(), owner.to_string()));
    }

    /// The tracked add was rejected; an entry under that name is not ours
    fn clear_candidate(&mut self) {
        self.candidate = None;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Give the increment back now (nothing was registered)
    async fn compensate(&mut self) {
        self.armed = false;
        give_back_increment(&self.counter, &self.pool, self.retry).await;
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        // The allocate future was dropped mid-registration
        let counter = self.counter.clone();
        let registry = self.registry.clone();
        let pool = self.pool.clone();
        let retry = self.retry;
        let candidate = self.candidate.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(pool = %pool, "Allocation abandoned, compensating usage counter");
                handle.spawn(async move {
                    if let Some((name, owner)) = candidate {
                        match registry.owner_of(&pool, &name).await {
                            Ok(Some(holder)) if holder == owner => {
                                // The entry landed; it is reclaimed like any other slot
                                info!(
                                    pool = %pool,
                                    slot = %name,
                                    owner = %owner,
                                    "Abandoned allocation did register, leaving it to the reaper"
                                );
                                return;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(
                                    pool = %pool,
                                    error = %e,
                                    "Cannot verify abandoned registration, usage counter left incremented"
                                );
                                return;
                            }
                        }
                    }
                    give_back_increment(&counter, &pool, retry).await;
                });
            }
            Err(_) => {
                error!(
                    pool = %pool,
                    "No runtime to compensate abandoned allocation, usage counter left incremented"
                );
            }
        }
    }
}

/// Decrement the counter with bounded CAS retries
async fn give_back_increment(counter: &UsageCounter, pool: &str, retry: RetryPolicy) {
    let max_attempts = retry.max_attempts.saturating_mul(2).max(1);

    for attempt in 1..=max_attempts {
        match counter.try_decrement(pool).await {
            Ok(true) => {
                debug!(pool = %pool, "Compensating decrement applied");
                return;
            }
            Ok(false) => retry.wait(attempt).await,
            Err(e) => {
                error!(pool = %pool, error = %e, "Compensating decrement failed");
                return;
            }
        }
    }

    error!(pool = %pool, attempts = max_attempts, "Compensating decrement kept losing races");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Capacity;
    use crate::store::{BatchOp, MemoryStore};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn allocator() -> (Arc<MemoryStore>, SlotAllocator) {
        let store = Arc::new(MemoryStore::new());
        let allocator = SlotAllocator::new(
            store.clone(),
            RetryPolicy::immediate(8),
            DEFAULT_ALLOCATION_TIMEOUT,
        );
        (store, allocator)
    }

    #[tokio::test]
    async fn test_allocate_names_and_counts() {
        let (store, allocator) = allocator();
        let pool = PoolConfig::new("P", Capacity::Limited(2));

        let slot = allocator.allocate(&pool, "run1").await.unwrap();
        assert_eq!(slot.name, "P_run1_0");
        assert_eq!(slot.pool_id, "P");
        assert_eq!(slot.owner, "run1");

        assert_eq!(store.get("pool/P/usage").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.get("pool/P/slot/P_run1_0").await.unwrap(), Some("run1".to_string()));
        assert_eq!(
            store.get("owner/run1/P/P_run1_0").await.unwrap(),
            Some("active".to_string())
        );
    }

    #[tokio::test]
    async fn test_full_pool_is_not_mutated() {
        let (store, allocator) = allocator();
        let pool = PoolConfig::new("P", Capacity::Limited(1));
        allocator.allocate(&pool, "run1").await.unwrap();
        let before = store.snapshot().await;

        let err = allocator.allocate(&pool, "run2").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::CapacityExhausted { .. }));
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_unavailable_pool_fails() {
        let (store, allocator) = allocator();
        let pool = PoolConfig::new("P", Capacity::Limited(0));

        let err = allocator.allocate(&pool, "run1").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::CapacityExhausted { .. }));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_owner_rejected() {
        let (_store, allocator) = allocator();
        let pool = PoolConfig::new("P", Capacity::Limited(1));

        let err = allocator.allocate(&pool, "bad/owner").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (store, allocator) = allocator();
        let pool = PoolConfig::new("P", Capacity::Limited(2));
        allocator.allocate(&pool, "run1").await.unwrap();
        let slot = allocator.allocate(&pool, "run2").await.unwrap();

        assert!(allocator.release(&slot).await.unwrap());
        assert!(!allocator.release(&slot).await.unwrap());

        assert_eq!(store.get("pool/P/usage").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.get("owner/run2/P/P_run2_0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_same_owner_gets_distinct_names() {
        let (_store, allocator) = allocator();
        let pool = PoolConfig::new("P", Capacity::Limited(3));

        let a = allocator.allocate(&pool, "run1").await.unwrap();
        let b = allocator.allocate(&pool, "run1").await.unwrap();
        assert_eq!(a.name, "P_run1_0");
        assert_eq!(b.name, "P_run1_1");
    }

    #[tokio::test]
    async fn test_release_of_reassigned_name_is_noop() {
        let (store, allocator) = allocator();
        let pool = PoolConfig::new("P", Capacity::Limited(2));
        let slot = allocator.allocate(&pool, "run1").await.unwrap();

        // Simulate the name now belonging to someone else
        store.put("pool/P/slot/P_run1_0", "run9").await.unwrap();

        assert!(!allocator.release(&slot).await.unwrap());
        assert_eq!(store.get("pool/P/usage").await.unwrap(), Some("1".to_string()));
    }

    /// Store whose registry adds always conflict, as if another allocator
    /// keeps winning every name
    struct ConflictingStore {
        inner: MemoryStore,
        batches: AtomicU32,
    }

    #[async_trait]
    impl CoordinationStore for ConflictingStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, value: &str) -> Result<()> {
            self.inner.put(key, value).await
        }
        async fn scan_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
            self.inner.scan_prefix(prefix).await
        }
        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&str>,
            new: &str,
        ) -> Result<bool> {
            self.inner.compare_and_swap(key, expected, new).await
        }
        async fn batch_apply(&self, ops: &[BatchOp]) -> Result<bool> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_registration_give_up_compensates_counter() {
        let store = Arc::new(ConflictingStore {
            inner: MemoryStore::new(),
            batches: AtomicU32::new(0),
        });
        let allocator = SlotAllocator::new(
            store.clone(),
            RetryPolicy::immediate(4),
            DEFAULT_ALLOCATION_TIMEOUT,
        );
        let pool = PoolConfig::new("P", Capacity::Limited(2));

        let err = allocator.allocate(&pool, "run1").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Busy { attempts: 4, .. }));
        assert_eq!(store.batches.load(Ordering::SeqCst), 4);
        assert_eq!(store.get("pool/P/usage").await.unwrap(), Some("0".to_string()));
    }

    #[tokio::test]
    async fn test_zero_timeout_gives_up_after_first_conflict() {
        let store = Arc::new(ConflictingStore {
            inner: MemoryStore::new(),
            batches: AtomicU32::new(0),
        });
        let allocator = SlotAllocator::new(store.clone(), RetryPolicy::immediate(8), Duration::ZERO);
        let pool = PoolConfig::new("P", Capacity::Limited(2));

        let err = allocator.allocate(&pool, "run1").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Busy { attempts: 1, .. }));
        assert_eq!(store.get("pool/P/usage").await.unwrap(), Some("0".to_string()));
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Fault {
        /// Registry batches never complete
        Hang,
        /// Every counter CAS loses
        LoseCas,
        /// Batches are rejected with an error and nothing is written
        FailBatch,
        /// Batches apply, then report an error
        ApplyThenFail,
        /// Batches fail, and every read after the first failure fails too
        FailAndGoDark,
        /// Another allocation by the same owner takes P_run1_0 just ahead
        /// of the first batch
        PeerTakesFirstName,
    }

    struct FaultyStore {
        inner: MemoryStore,
        fault: Fault,
        tripped: AtomicBool,
    }

    impl FaultyStore {
        fn new(fault: Fault) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(),
                fault,
                tripped: AtomicBool::new(false),
            })
        }

        fn unavailable() -> CoordinatorError {
            CoordinatorError::StoreUnavailable("connection reset".to_string())
        }

        async fn usage(&self) -> Option<String> {
            self.inner.get("pool/P/usage").await.unwrap()
        }

        /// Poll until the usage counter reads `expected` or a second passes
        async fn wait_for_usage(&self, expected: &str) -> Option<String> {
            for _ in 0..100 {
                if self.usage().await.as_deref() == Some(expected) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.usage().await
        }
    }

    #[async_trait]
    impl CoordinationStore for FaultyStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            if self.fault == Fault::FailAndGoDark && self.tripped.load(Ordering::SeqCst) {
                return Err(Self::unavailable());
            }
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, value: &str) -> Result<()> {
            self.inner.put(key, value).await
        }
        async fn scan_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
            self.inner.scan_prefix(prefix).await
        }
        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&str>,
            new: &str,
        ) -> Result<bool> {
            if self.fault == Fault::LoseCas {
                return Ok(false);
            }
            self.inner.compare_and_swap(key, expected, new).await
        }
        async fn batch_apply(&self, ops: &[BatchOp]) -> Result<bool> {
            match self.fault {
                Fault::Hang => std::future::pending::<Result<bool>>().await,
                Fault::LoseCas => self.inner.batch_apply(ops).await,
                Fault::FailBatch => Err(Self::unavailable()),
                Fault::ApplyThenFail => {
                    self.inner.batch_apply(ops).await?;
                    Err(Self::unavailable())
                }
                Fault::FailAndGoDark => {
                    self.tripped.store(true, Ordering::SeqCst);
                    Err(Self::unavailable())
                }
                Fault::PeerTakesFirstName => {
                    if !self.tripped.swap(true, Ordering::SeqCst) {
                        let usage: u64 = self.usage().await.unwrap().parse().unwrap();
                        self.inner
                            .put("pool/P/usage", &(usage + 1).to_string())
                            .await?;
                        self.inner.put("pool/P/slot/P_run1_0", "run1").await?;
                        self.inner.put("owner/run1/P/P_run1_0", "active").await?;
                    }
                    self.inner.batch_apply(ops).await
                }
            }
        }
    }

    #[tokio::test]
    async fn test_abandoned_allocation_gives_back_increment() {
        let store = FaultyStore::new(Fault::Hang);
        let allocator = SlotAllocator::new(
            store.clone(),
            RetryPolicy::immediate(4),
            DEFAULT_ALLOCATION_TIMEOUT,
        );
        let pool = PoolConfig::new("P", Capacity::Limited(2));

        let outcome =
            tokio::time::timeout(Duration::from_millis(50), allocator.allocate(&pool, "run1"))
                .await;
        assert!(outcome.is_err());

        assert_eq!(store.wait_for_usage("0").await, Some("0".to_string()));
        assert!(allocator.registry().entries("P").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_after_losing_name_to_same_owner() {
        let store = FaultyStore::new(Fault::PeerTakesFirstName);
        // Backoff long enough that the timeout fires while waiting to retry
        let retry = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
        };
        let allocator = SlotAllocator::new(store.clone(), retry, DEFAULT_ALLOCATION_TIMEOUT);
        let pool = PoolConfig::new("P", Capacity::Limited(3));

        let outcome =
            tokio::time::timeout(Duration::from_millis(50), allocator.allocate(&pool, "run1"))
                .await;
        assert!(outcome.is_err());

        // Only the peer's slot remains, and only the peer's unit is counted
        assert_eq!(store.wait_for_usage("1").await, Some("1".to_string()));
        let entries = allocator.registry().entries("P").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "P_run1_0");
    }

    #[tokio::test]
    async fn test_failed_batch_that_landed_returns_slot() {
        let store = FaultyStore::new(Fault::ApplyThenFail);
        let allocator = SlotAllocator::new(
            store.clone(),
            RetryPolicy::immediate(4),
            DEFAULT_ALLOCATION_TIMEOUT,
        );
        let pool = PoolConfig::new("P", Capacity::Limited(2));

        let slot = allocator.allocate(&pool, "run1").await.unwrap();
        assert_eq!(slot.name, "P_run1_0");
        assert_eq!(store.usage().await, Some("1".to_string()));
        assert_eq!(
            store.inner.get("pool/P/slot/P_run1_0").await.unwrap(),
            Some("run1".to_string())
        );
    }

    #[tokio::test]
    async fn test_failed_batch_that_did_not_land_compensates() {
        let store = FaultyStore::new(Fault::FailBatch);
        let allocator = SlotAllocator::new(
            store.clone(),
            RetryPolicy::immediate(4),
            DEFAULT_ALLOCATION_TIMEOUT,
        );
        let pool = PoolConfig::new("P", Capacity::Limited(2));

        let err = allocator.allocate(&pool, "run1").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::StoreUnavailable(_)));
        assert_eq!(store.usage().await, Some("0".to_string()));
    }

    #[tokio::test]
    async fn test_unverifiable_registration_keeps_increment() {
        let store = FaultyStore::new(Fault::FailAndGoDark);
        let allocator = SlotAllocator::new(
            store.clone(),
            RetryPolicy::immediate(4),
            DEFAULT_ALLOCATION_TIMEOUT,
        );
        let pool = PoolConfig::new("P", Capacity::Limited(2));

        let err = allocator.allocate(&pool, "run1").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::StoreUnavailable(_)));
        assert_eq!(store.usage().await, Some("1".to_string()));
        assert!(store
            .inner
            .scan_prefix("pool/P/slot/")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_counter_contention_ends_busy() {
        let store = FaultyStore::new(Fault::LoseCas);
        let allocator = SlotAllocator::new(
            store.clone(),
            RetryPolicy::immediate(5),
            DEFAULT_ALLOCATION_TIMEOUT,
        );
        let pool = PoolConfig::new("P", Capacity::Limited(2));

        let err = allocator.allocate(&pool, "run1").await.unwrap_err();
        match err {
            CoordinatorError::Busy { pool, attempts } => {
                assert_eq!(pool, "P");
                assert_eq!(attempts, 5);
            }
            other => panic!("expected Busy, got {other:?}"),
        }
        assert!(store.inner.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_never_exceed_capacity() {
        let store = Arc::new(MemoryStore::new());
        let allocator = Arc::new(SlotAllocator::new(
            store.clone(),
            RetryPolicy {
                max_attempts: 50,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            DEFAULT_ALLOCATION_TIMEOUT,
        ));
        let pool = PoolConfig::new("P", Capacity::Limited(3));

        let tasks: Vec<_> = (0..12)
            .map(|i| {
                let allocator = Arc::clone(&allocator);
                let pool = pool.clone();
                tokio::spawn(async move { allocator.allocate(&pool, &format!("run{i}")).await })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let granted = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();

        assert!(granted <= 3);
        let entries = allocator.registry().entries("P").await.unwrap();
        assert!(entries.len() <= 3);
        assert_eq!(allocator.counter().read("P").await.unwrap(), entries.len() as u64);
    }
}
