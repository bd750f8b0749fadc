//! Event-driven reclamation of terminated owners

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::StaleReaper;
use crate::nats::OwnerTerminated;

/// Reclaim each terminated owner's slots as events arrive.
/// Runs until every sender is dropped.
pub fn spawn_event_reaper(
    reaper: Arc<StaleReaper>,
    mut events: mpsc::Receiver<OwnerTerminated>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match reaper.reclaim_owner(&event.owner).await {
                Ok(report) => info!(
                    owner = %event.owner,
                    event_id = %event.event_id,
                    reason = event.reason.as_deref().unwrap_or("unspecified"),
                    reclaimed = report.reclaimed,
                    "Processed owner termination"
                ),
                // The periodic reaper picks these up once the owner stops heartbeating
                Err(e) => warn!(
                    owner = %event.owner,
                    error = %e,
                    "Failed to reclaim slots of terminated owner"
                ),
            }
        }
        info!("Event reaper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::StaticOracle;
    use crate::pool::{Capacity, PoolConfig, RetryPolicy, SlotAllocator};
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_termination_event_reclaims_owner() {
        let allocator = Arc::new(SlotAllocator::new(
            Arc::new(MemoryStore::new()),
            RetryPolicy::immediate(4),
            Duration::from_secs(5),
        ));
        let pool = PoolConfig::new("P", Capacity::Limited(3));
        allocator.allocate(&pool, "run1").await.unwrap();
        allocator.allocate(&pool, "run1").await.unwrap();
        allocator.allocate(&pool, "run2").await.unwrap();

        let reaper = Arc::new(StaleReaper::new(
            allocator.clone(),
            Arc::new(StaticOracle::with_tokens(["run1", "run2"])),
        ));
        let (tx, rx) = mpsc::channel(8);
        let task = spawn_event_reaper(reaper, rx);

        tx.send(OwnerTerminated::new("run1".to_string()))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        let entries = allocator.registry().entries("P").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].owner, "run2");
        assert_eq!(allocator.counter().read("P").await.unwrap(), 1);
    }
}
