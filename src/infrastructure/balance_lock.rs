//! Local Balance Lock
//!
//! In-process implementation of the balance lock port.

use crate::domain::ports::{BalanceLock, BalanceLockGuard, LockError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Serializes rebalance passes within one balancer process.
#[derive(Default, Clone)]
pub struct LocalBalanceLock {
    inner: Arc<Mutex<()>>,
}

impl LocalBalanceLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BalanceLock for LocalBalanceLock {
    async fn acquire(&self) -> Result<BalanceLockGuard, LockError> {
        let guard = self.inner.clone().lock_owned().await;
        Ok(Box::new(guard))
    }
}
