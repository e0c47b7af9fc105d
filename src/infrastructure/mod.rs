//! Infrastructure Layer
//!
//! Cross-cutting concerns and infrastructure components.

pub mod backoff;
pub mod balance_lock;
pub mod connection_pool;
pub mod event_bus;
pub mod health_monitor;
pub mod shutdown;

pub use backoff::{backoff_delay, RetryPolicy};
pub use balance_lock::LocalBalanceLock;
pub use connection_pool::{ConnectionPool, PoolConfig, PoolError, PoolStats, PooledClient};
pub use event_bus::{EventBus, RecordingListener};
pub use health_monitor::{HealthMonitor, HealthMonitorConfig};
pub use shutdown::{shutdown_signal, RelayGuard, ShutdownController};
