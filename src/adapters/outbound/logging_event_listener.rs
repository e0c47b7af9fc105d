//! Logging Event Listener
//!
//! Writes every balancer event to the tracing log.

use crate::domain::events::BalancerEvent;
use crate::domain::ports::EventListener;

#[derive(Debug, Default)]
pub struct LoggingEventListener;

impl LoggingEventListener {
    pub fn new() -> Self {
        Self
    }
}

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &BalancerEvent) {
        match event {
            BalancerEvent::Assigned(_) => tracing::debug!("{}", event),
            BalancerEvent::Host(_) | BalancerEvent::Balance(_) => tracing::info!("{}", event),
        }
    }
}
