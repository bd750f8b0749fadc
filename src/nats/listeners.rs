//! Subscription loops for owner lifecycle messages

use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::messages::{OwnerHeartbeat, OwnerTerminated};
use super::NatsClient;
use crate::liveness::HeartbeatOracle;
use crate::types::Result;

/// Feed one heartbeat payload into the oracle
pub fn handle_heartbeat(oracle: &HeartbeatOracle, payload: &[u8]) -> bool {
    match OwnerHeartbeat::from_bytes(payload) {
        Ok(heartbeat) => {
            oracle.record(&heartbeat.owner);
            true
        }
        Err(e) => {
            error!("Failed to parse owner heartbeat: {}", e);
            false
        }
    }
}

/// Decode one termination payload, dropping the owner from the oracle
pub fn handle_termination(
    oracle: Option<&HeartbeatOracle>,
    payload: &[u8],
) -> Option<OwnerTerminated> {
    match OwnerTerminated::from_bytes(payload) {
        Ok(event) => {
            if let Some(oracle) = oracle {
                oracle.forget(&event.owner);
            }
            Some(event)
        }
        Err(e) => {
            error!("Failed to parse owner termination: {}", e);
            None
        }
    }
}

/// Record every heartbeat seen on NATS into `oracle`
pub async fn spawn_heartbeat_listener(
    nats: &NatsClient,
    oracle: Arc<HeartbeatOracle>,
) -> Result<JoinHandle<()>> {
    let mut subscriber = nats.subscribe(OwnerHeartbeat::subject()).await?;
    info!("Listening for owner heartbeats on {}", OwnerHeartbeat::subject());

    Ok(tokio::spawn(async move {
        while let Some(msg) = subscriber.next().await {
            handle_heartbeat(&oracle, &msg.payload);
        }
        warn!("Heartbeat subscription closed");
    }))
}

/// Forward termination events to `events`
pub async fn spawn_termination_listener(
    nats: &NatsClient,
    oracle: Option<Arc<HeartbeatOracle>>,
    events: mpsc::Sender<OwnerTerminated>,
) -> Result<JoinHandle<()>> {
    let mut subscriber = nats.subscribe(OwnerTerminated::subject()).await?;
    info!("Listening for owner terminations on {}", OwnerTerminated::subject());

    Ok(tokio::spawn(async move {
        while let Some(msg) = subscriber.next().await {
            let Some(event) = handle_termination(oracle.as_deref(), &msg.payload) else {
                continue;
            };
            debug!(owner = %event.owner, event_id = %event.event_id, "Owner terminated");
            if events.send(event).await.is_err() {
                info!("Termination receiver dropped, stopping listener");
                return;
            }
        }
        warn!("Termination subscription closed");
    }))
}
