//! Health Probe Port
//!
//! Defines the interface for checking whether a backend host is reachable.

use crate::domain::entities::HostRecord;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("probe timed out after {0}ms")]
    Timeout(u64),
    #[error("probe task failed: {0}")]
    Aborted(String),
}

/// Liveness check for one backend host.
///
/// This is an outbound port. The health monitor only cares whether the
/// probe succeeded; the reason is logged.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, host: &Arc<HostRecord>) -> Result<(), ProbeError>;
}
