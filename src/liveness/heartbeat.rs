//! Heartbeat-based liveness
//!
//! Owners publish [`OwnerHeartbeat`]s while they run. The oracle considers a
//! token live while its last heartbeat is younger than the stale threshold.
//!
//! A freshly started oracle has heard from nobody yet, which would make every
//! owner look dead. Until one full threshold has passed since startup it
//! refuses to answer, so a reaper pass fails instead of reclaiming live slots.
//!
//! Owners must start publishing before they allocate. A slot whose owner has
//! not been heard from yet is stale to the next reaper pass.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::LivenessOracle;
use crate::nats::messages::OwnerHeartbeat;
use crate::nats::NatsClient;
use crate::types::{CoordinatorError, Result};

/// Default time without a heartbeat before an owner counts as gone
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(90);

/// Default interval between heartbeats published by an owner
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Oracle fed by owner heartbeats.
///
/// Only tokens with a recorded heartbeat are live, so an owner that allocates
/// before its first heartbeat arrives can lose the slot to the reaper.
pub struct HeartbeatOracle {
    /// owner token → last heartbeat
    last_seen: DashMap<String, Instant>,
    /// How long a heartbeat keeps an owner live
    stale_threshold: Duration,
    /// When the oracle started listening
    started_at: Instant,
}

impl HeartbeatOracle {
    pub fn new(stale_threshold: Duration) -> Self {
        Self {
            last_seen: DashMap::new(),
            stale_threshold,
            started_at: Instant::now(),
        }
    }

    /// Oracle that answers immediately, for callers that have already
    /// replayed heartbeats into it
    pub fn warmed(stale_threshold: Duration) -> Self {
        let mut oracle = Self::new(stale_threshold);
        oracle.started_at = Instant::now()
            .checked_sub(stale_threshold)
            .unwrap_or_else(Instant::now);
        oracle
    }

    /// Record a heartbeat received now
    pub fn record(&self, owner: &str) {
        self.record_at(owner, Instant::now());
    }

    /// Record a heartbeat received at `at`
    pub fn record_at(&self, owner: &str, at: Instant) {
        self.last_seen.insert(owner.to_string(), at);
        debug!(owner = %owner, "Heartbeat recorded");
    }

    /// Drop an owner immediately (explicit termination)
    pub fn forget(&self, owner: &str) -> bool {
        self.last_seen.remove(owner).is_some()
    }

    /// Whether one owner is currently live
    pub fn is_live(&self, owner: &str) -> bool {
        self.last_seen
            .get(owner)
            .map(|seen| seen.elapsed() <= self.stale_threshold)
            .unwrap_or(false)
    }

    /// Remove owners silent for more than twice the threshold
    pub fn prune(&self) -> usize {
        let before = self.last_seen.len();
        let horizon = self.stale_threshold.saturating_mul(2);
        self.last_seen.retain(|_, seen| seen.elapsed() <= horizon);
        before - self.last_seen.len()
    }

    fn warmed_up(&self) -> bool {
        self.started_at.elapsed() >= self.stale_threshold
    }
}

#[async_trait]
impl LivenessOracle for HeartbeatOracle {
    async fn active_owner_tokens(&self) -> Result<HashSet<String>> {
        if !self.warmed_up() {
            return Err(CoordinatorError::LivenessUnavailable(format!(
                "heartbeat oracle warming up ({:?} of {:?})",
                self.started_at.elapsed(),
                self.stale_threshold
            )));
        }

        Ok(self
            .last_seen
            .iter()
            .filter(|entry| entry.value().elapsed() <= self.stale_threshold)
            .map(|entry| entry.key().clone())
            .collect())
    }
}

/// Publishes heartbeats for one owner token until stopped.
///
/// Start it, and let at least one heartbeat go out, before the owner's first
/// allocation.
pub struct OwnerHeartbeatPublisher {
    template: OwnerHeartbeat,
    nats: NatsClient,
    interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl OwnerHeartbeatPublisher {
    pub fn new(owner: impl Into<String>, nats: NatsClient) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            template: OwnerHeartbeat::new(owner.into()),
            nats,
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            shutdown_tx,
        }
    }

    /// Set the interval between heartbeats
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the host name reported in heartbeats
    pub fn with_host(mut self, host: String) -> Self {
        self.template.host = Some(host);
        self
    }

    pub fn owner(&self) -> &str {
        &self.template.owner
    }

    /// Publish a single heartbeat
    pub async fn publish_once(&self) -> Result<()> {
        let payload = stamped(&self.template).to_bytes()?;
        self.nats.publish(OwnerHeartbeat::subject(), payload).await?;
        debug!(owner = %self.template.owner, "Published heartbeat");
        Ok(())
    }

    /// Start the publishing loop. The first heartbeat goes out immediately.
    pub fn start(&self) -> JoinHandle<()> {
        info!(
            owner = %self.template.owner,
            interval = ?self.interval,
            "Starting owner heartbeat publisher"
        );

        let nats = self.nats.clone();
        let interval = self.interval;
        let template = self.template.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sent = match stamped(&template).to_bytes() {
                            Ok(payload) => nats.publish(OwnerHeartbeat::subject(), payload).await,
                            Err(e) => Err(e.into()),
                        };
                        if let Err(e) = sent {
                            error!(owner = %template.owner, error = %e, "Failed to publish heartbeat");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!(owner = %template.owner, "Heartbeat publisher stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the publishing loop
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Copy of `template` timestamped now
fn stamped(template: &OwnerHeartbeat) -> OwnerHeartbeat {
    let mut heartbeat = template.clone();
    heartbeat.timestamp = chrono::Utc::now();
    heartbeat
}
