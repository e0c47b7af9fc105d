mod assignment_store;
mod balance_lock;
mod client_factory;
mod event_listener;
mod health_probe;

pub use assignment_store::{AssignmentStore, StoreError};
pub use balance_lock::{BalanceLock, BalanceLockGuard, LockError};
pub use client_factory::{ClientError, ClientFactory};
pub use event_listener::EventListener;
pub use health_probe::{HealthProbe, ProbeError};
