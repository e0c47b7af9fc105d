//! Client Factory Port
//!
//! Lifecycle hooks the connection pool uses to create, ready, park and
//! tear down protocol clients for a backend host.

use crate::domain::entities::HostRecord;
use crate::domain::value_objects::Protocol;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("client closed")]
    Closed,
    #[error("{0}")]
    Protocol(String),
}

/// Creates and maintains clients of one protocol.
///
/// `activate` must leave the client connected; a failure there is returned
/// to the borrower and the client is destroyed. `destroy` never fails, it
/// logs instead.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    type Client: Send + 'static;

    fn protocol(&self) -> Protocol;

    async fn make(&self, host: &Arc<HostRecord>) -> Result<Self::Client, ClientError>;

    async fn activate(&self, client: &mut Self::Client, host: &Arc<HostRecord>) -> Result<(), ClientError>;

    /// Flush buffered output before the client goes back to the idle set.
    async fn passivate(&self, client: &mut Self::Client) -> Result<(), ClientError> {
        let _ = client;
        Ok(())
    }

    async fn destroy(&self, client: Self::Client);

    /// Whether an idle or returned client may be handed out again.
    fn validate(&self, client: &Self::Client, host: &HostRecord) -> bool {
        let _ = (client, host);
        true
    }
}
