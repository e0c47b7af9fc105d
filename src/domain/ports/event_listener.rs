//! Event Listener Port
//!
//! Receives balancer events. Implementations must not block for long and
//! must not call back into mutating assignment operations.

use crate::domain::events::BalancerEvent;

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &BalancerEvent);
}
