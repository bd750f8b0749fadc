//! Periodic reaper scheduling
//!
//! Each coordinator process starts at a random offset within the jitter
//! window so that a fleet does not scan in lockstep. A failed pass waits
//! longer before the next one, doubling up to `max_backoff`.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::StaleReaper;

/// Default time between reaper passes
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Default start offset window
pub const DEFAULT_REAP_JITTER: Duration = Duration::from_secs(15);

/// Default ceiling on the delay after repeated failures
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Timing of the periodic reaper
#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub jitter: Duration,
    pub max_backoff: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REAP_INTERVAL,
            jitter: DEFAULT_REAP_JITTER,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl ReaperConfig {
    pub fn new(interval: Duration, jitter: Duration) -> Self {
        Self {
            interval,
            jitter,
            ..Default::default()
        }
    }

    /// Set the failure backoff ceiling
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Random start offset in `[0, jitter]`
    fn start_offset(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Delay before the next pass after `failures` consecutive failures
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.interval;
        }
        let backoff = self.interval.saturating_mul(1u32 << failures.min(16));
        backoff.min(self.max_backoff).max(self.interval)
    }
}

/// Running periodic reaper
pub struct ReaperHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Whether the reaper task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop after the current pass and wait for the task to exit
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!("Reaper task ended abnormally: {}", e);
        }
    }
}

/// Run `reaper` periodically until the handle is stopped
pub fn start(reaper: Arc<StaleReaper>, config: ReaperConfig) -> ReaperHandle {
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

    info!(
        interval = ?config.interval,
        jitter = ?config.jitter,
        "Starting stale reaper"
    );

    let task = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(config.start_offset()) => {}
            _ = shutdown_rx.recv() => return,
        }

        let mut failures = 0u32;
        loop {
            match reaper.reap_once().await {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(
                        error = %e,
                        failures,
                        next_in = ?config.delay_after(failures),
                        "Reaper pass failed"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(config.delay_after(failures)) => {}
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("Stale reaper stopped");
    });

    ReaperHandle { shutdown_tx, task }
}
