//! Error types for the pool coordinator
//!
//! Contention and capacity outcomes are ordinary variants so callers can
//! match on them; store and invariant failures carry a message.

/// Main error type for coordinator operations
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Capacity exhausted for pool {pool}")]
    CapacityExhausted { pool: String },

    #[error("Pool {pool} busy after {attempts} attempts")]
    Busy { pool: String, attempts: u32 },

    #[error("No capacity in any candidate pool: {}", candidates.join(", "))]
    NoCapacity { candidates: Vec<String> },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Inconsistent coordination state: {0}")]
    Inconsistent(String),

    #[error("Liveness unavailable: {0}")]
    LivenessUnavailable(String),

    #[error("Unknown pool: {0}")]
    UnknownPool(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("NATS error: {0}")]
    Nats(String),
}

impl CoordinatorError {
    /// Whether the caller can reasonably try again (later, or elsewhere)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExhausted { .. } | Self::Busy { .. } | Self::NoCapacity { .. }
        )
    }

    /// Short machine-readable label, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CapacityExhausted { .. } => "capacity_exhausted",
            Self::Busy { .. } => "busy",
            Self::NoCapacity { .. } => "no_capacity",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Inconsistent(_) => "inconsistent",
            Self::LivenessUnavailable(_) => "liveness_unavailable",
            Self::UnknownPool(_) => "unknown_pool",
            Self::InvalidName(_) => "invalid_name",
            Self::Config(_) => "config",
            Self::Nats(_) => "nats",
        }
    }
}

// Implement From conversions for common error types

impl From<sled::Error> for CoordinatorError {
    fn from(err: sled::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<std::io::Error> for CoordinatorError {
    fn from(err: std::io::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Nats(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for CoordinatorError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("TOML error: {}", err))
    }
}

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoordinatorError::Busy {
            pool: "p".into(),
            attempts: 3
        }
        .is_retryable());
        assert!(CoordinatorError::CapacityExhausted { pool: "p".into() }.is_retryable());
        assert!(!CoordinatorError::StoreUnavailable("down".into()).is_retryable());
        assert!(!CoordinatorError::Inconsistent("bad".into()).is_retryable());
    }

    #[test]
    fn test_no_capacity_message_lists_candidates() {
        let err = CoordinatorError::NoCapacity {
            candidates: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "No capacity in any candidate pool: a, b");
        assert_eq!(err.kind(), "no_capacity");
    }
}
