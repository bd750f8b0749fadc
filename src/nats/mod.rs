//! NATS integration
//!
//! Owners announce themselves with heartbeats and, when they end cleanly, a
//! termination event. Coordinators listen to both: heartbeats feed the
//! [`HeartbeatOracle`](crate::liveness::HeartbeatOracle), terminations drive
//! the event reaper.

pub mod client;
pub mod listeners;
pub mod messages;

pub use client::NatsClient;
pub use listeners::{spawn_heartbeat_listener, spawn_termination_listener};
pub use messages::{OwnerHeartbeat, OwnerTerminated};
