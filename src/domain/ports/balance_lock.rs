//! Balance Lock Port
//!
//! Serializes rebalance passes. A single instance uses a local mutex;
//! replicated deployments can plug in a distributed lock so only one
//! balancer moves metrics at a time.

use async_trait::async_trait;

/// Held for the duration of a rebalance pass, released on drop.
pub type BalanceLockGuard = Box<dyn Send>;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("balance lock unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait BalanceLock: Send + Sync {
    async fn acquire(&self) -> Result<BalanceLockGuard, LockError>;
}
