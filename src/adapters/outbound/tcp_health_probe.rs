//! TCP Health Probe
//!
//! Checks a host by borrowing a client from the TCP ingest pool, which
//! connects to the ingest port on activation.

use crate::adapters::outbound::tcp_client::TcpClientFactory;
use crate::domain::entities::HostRecord;
use crate::domain::ports::{HealthProbe, ProbeError};
use crate::infrastructure::connection_pool::ConnectionPool;
use async_trait::async_trait;
use std::sync::Arc;

pub struct TcpHealthProbe {
    pool: Arc<ConnectionPool<TcpClientFactory>>,
}

impl TcpHealthProbe {
    pub fn new(pool: Arc<ConnectionPool<TcpClientFactory>>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthProbe for TcpHealthProbe {
    async fn probe(&self, host: &Arc<HostRecord>) -> Result<(), ProbeError> {
        match self.pool.borrow(host).await {
            Ok(client) => {
                self.pool.release(client).await;
                Ok(())
            }
            Err(e) => Err(ProbeError::Unreachable(e.to_string())),
        }
    }
}
