//! NATS message types for owner liveness

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subject prefix for owner lifecycle messages
pub const OWNER_SUBJECT_PREFIX: &str = "POOL.OWNER";

/// Periodic proof that an owner is still running
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerHeartbeat {
    /// Owner token
    pub owner: String,

    /// When the heartbeat was sent
    pub timestamp: DateTime<Utc>,

    /// Host the owner runs on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl OwnerHeartbeat {
    pub fn new(owner: String) -> Self {
        Self {
            owner,
            timestamp: Utc::now(),
            host: None,
        }
    }

    /// Subject for heartbeat messages
    pub fn subject() -> &'static str {
        "POOL.OWNER.HEARTBEAT"
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<bytes::Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Into::into)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// An owner has ended and its slots can be reclaimed now
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerTerminated {
    /// Unique event ID, for correlating logs across coordinators
    pub event_id: String,

    /// Owner token
    pub owner: String,

    /// Why the owner ended (completed, cancelled, failed, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// When the owner ended
    pub timestamp: DateTime<Utc>,
}

impl OwnerTerminated {
    /// Create a termination event with a generated ID
    pub fn new(owner: String) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            owner,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    /// Set the termination reason
    pub fn with_reason(mut self, reason: String) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Subject for termination events
    pub fn subject() -> &'static str {
        "POOL.OWNER.TERMINATED"
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<bytes::Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Into::into)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects_share_prefix() {
        assert!(OwnerHeartbeat::subject().starts_with(OWNER_SUBJECT_PREFIX));
        assert!(OwnerTerminated::subject().starts_with(OWNER_SUBJECT_PREFIX));
    }

    #[test]
    fn test_heartbeat_omits_missing_host() {
        let heartbeat = OwnerHeartbeat::new("run1".to_string());
        let json = String::from_utf8(heartbeat.to_bytes().unwrap().to_vec()).unwrap();
        assert!(json.contains("\"owner\":\"run1\""));
        assert!(!json.contains("host"));
    }

    #[test]
    fn test_termination_decodes_from_producer_json() {
        let json = br#"{
            "event_id": "e-1",
            "owner": "run7",
            "reason": "cancelled",
            "timestamp": "2026-01-02T03:04:05Z"
        }"#;
        let event = OwnerTerminated::from_bytes(json).unwrap();
        assert_eq!(event.owner, "run7");
        assert_eq!(event.reason.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_termination_ids_are_unique() {
        let a = OwnerTerminated::new("run1".to_string());
        let b = OwnerTerminated::new("run1".to_string()).with_reason("failed".to_string());
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(b.reason.as_deref(), Some("failed"));
    }
}
