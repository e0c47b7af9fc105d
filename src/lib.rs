//! metric-balancer Library
//!
//! Routes metric ingest and query traffic to the backend that owns each
//! metric name, keeping ownership balanced as backends come and go.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{AssignmentTable, HostRegistry};
pub use config::{load_config, Config, ConfigError};
pub use domain::entities::{HostKey, HostRecord, HostSpec};
pub use domain::events::BalancerEvent;
pub use domain::ports::{AssignmentStore, ClientFactory, EventListener, HealthProbe};
pub use domain::value_objects::{AssignReason, HostStatus, Intent, Protocol};
pub use infrastructure::{ConnectionPool, EventBus, HealthMonitor, ShutdownController};
