//! Event Bus
//!
//! Synchronous fan-out of balancer events to registered listeners.

use crate::domain::events::BalancerEvent;
use crate::domain::ports::EventListener;
use parking_lot::RwLock;
use std::sync::Arc;

/// Delivers every published event to all listeners, in registration order.
///
/// Publishers must not hold assignment table guards while publishing.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn publish(&self, event: BalancerEvent) {
        // Snapshot so a listener may subscribe another without deadlocking
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            listener.on_event(&event);
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = BalancerEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

/// Listener that keeps every event it sees. Handy for tests and the admin API.
#[derive(Default)]
pub struct RecordingListener {
    events: parking_lot::Mutex<Vec<BalancerEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BalancerEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &BalancerEvent) {
        self.events.lock().push(event.clone());
    }
}
