//! Liveness oracles: which owner tokens are still active
//!
//! The coordinator only ever reads an oracle. Providers decide what "live"
//! means: a run table they maintain ([`StaticOracle`]) or recent heartbeats
//! ([`HeartbeatOracle`]).

pub mod heartbeat;

use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::RwLock;

use crate::types::Result;

pub use heartbeat::{HeartbeatOracle, OwnerHeartbeatPublisher};

/// Source of truth for which owner tokens are active
#[async_trait]
pub trait LivenessOracle: Send + Sync {
    /// Snapshot of every owner token currently considered active
    async fn active_owner_tokens(&self) -> Result<HashSet<String>>;
}

/// Oracle over a set the provider maintains directly
#[derive(Default)]
pub struct StaticOracle {
    tokens: RwLock<HashSet<String>>,
}

impl StaticOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an oracle reporting exactly these tokens
    pub fn with_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: RwLock::new(tokens.into_iter().map(Into::into).collect()),
        }
    }

    /// Mark a token active
    pub async fn insert(&self, token: impl Into<String>) {
        self.tokens.write().await.insert(token.into());
    }

    /// Mark a token inactive
    pub async fn remove(&self, token: &str) -> bool {
        self.tokens.write().await.remove(token)
    }

    /// Replace the whole set
    pub async fn replace(&self, tokens: HashSet<String>) {
        *self.tokens.write().await = tokens;
    }
}

#[async_trait]
impl LivenessOracle for StaticOracle {
    async fn active_owner_tokens(&self) -> Result<HashSet<String>> {
        Ok(self.tokens.read().await.clone())
    }
}
