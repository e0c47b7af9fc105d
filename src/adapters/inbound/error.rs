//! Relay Errors

use crate::application::AssignmentError;
use crate::domain::ports::ClientError;
use crate::infrastructure::PoolError;

/// Failure while relaying one request to its backend.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Assignment(#[from] AssignmentError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("{0}")]
    Backend(String),
    #[error("invalid put line: {0}")]
    InvalidLine(String),
    #[error("{0}")]
    InvalidOperation(String),
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),
    #[error("balancer is shutting down")]
    ShuttingDown,
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        Self::Backend(e.to_string())
    }
}
