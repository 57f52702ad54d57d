//! Transaction identity and overall timing

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::TransactionConfig;

/// Unique identifier of a transaction (shared by all of its attempts)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransactionId({})", self.0)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of one attempt
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttemptId(pub Uuid);

impl AttemptId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AttemptId({})", self.0)
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Get current time in milliseconds since UNIX epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// State shared by every attempt of one transaction
#[derive(Clone)]
pub struct TransactionContext {
    /// Transaction identifier
    pub transaction_id: TransactionId,
    /// Effective configuration
    pub config: Arc<TransactionConfig>,
    /// Monotonic start, used for the expiry deadline
    pub started_at: Instant,
    /// Wall-clock start (millis since UNIX epoch)
    pub started_at_millis: u64,
}

impl TransactionContext {
    /// Start the clock on a new transaction
    pub fn new(config: Arc<TransactionConfig>) -> Self {
        Self {
            transaction_id: TransactionId::new(),
            config,
            started_at: Instant::now(),
            started_at_millis: now_millis(),
        }
    }

    /// Time since the transaction started
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Budget left before expiry, zero once expired
    pub fn remaining(&self) -> Duration {
        self.config.expiration.saturating_sub(self.elapsed())
    }

    /// Whether the transaction's expiry has passed
    pub fn has_expired(&self) -> bool {
        self.elapsed() > self.config.expiration
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("transaction_id", &self.transaction_id)
            .field("elapsed", &self.elapsed())
            .field("expiration", &self.config.expiration)
            .finish()
    }
}
