//! Host Registry
//!
//! Copy-on-write list of known backend hosts, shared by the assignment
//! table, the health monitor and the admin API.

use crate::domain::entities::{HealthThresholds, HostKey, HostRecord, HostSpec};
use parking_lot::RwLock;
use std::sync::Arc;

/// Shared, ordered list of backend hosts.
///
/// Readers take a cheap snapshot (`Arc` clone) and iterate without holding
/// the lock. Writers replace the whole list. Insertion order is preserved
/// so round robin walks hosts in discovery order.
pub struct HostRegistry {
    hosts: RwLock<Arc<Vec<Arc<HostRecord>>>>,
    thresholds: HealthThresholds,
}

impl HostRegistry {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            hosts: RwLock::new(Arc::new(Vec::new())),
            thresholds,
        }
    }

    /// Build a registry seeded with `specs`, duplicates ignored.
    pub fn with_hosts(specs: impl IntoIterator<Item = HostSpec>, thresholds: HealthThresholds) -> Self {
        let registry = Self::new(thresholds);
        for spec in specs {
            registry.add(spec);
        }
        registry
    }

    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds
    }

    /// Snapshot of the current host list.
    pub fn all(&self) -> Arc<Vec<Arc<HostRecord>>> {
        self.hosts.read().clone()
    }

    pub fn up_hosts(&self) -> Vec<Arc<HostRecord>> {
        self.all().iter().filter(|h| h.is_up()).cloned().collect()
    }

    pub fn find(&self, key: &HostKey) -> Option<Arc<HostRecord>> {
        self.hosts.read().iter().find(|h| h.key() == key).cloned()
    }

    pub fn contains(&self, key: &HostKey) -> bool {
        self.find(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a host. Returns `None` when a host with the same key exists.
    pub fn add(&self, spec: HostSpec) -> Option<Arc<HostRecord>> {
        let mut guard = self.hosts.write();
        let key = spec.key();
        if guard.iter().any(|h| h.key() == &key) {
            return None;
        }

        let record = Arc::new(HostRecord::new(spec, self.thresholds));
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(record.clone());
        *guard = Arc::new(next);

        tracing::info!("host registered: {}", key);
        Some(record)
    }

    /// Remove a host. Returns the removed record, if it was known.
    pub fn remove(&self, key: &HostKey) -> Option<Arc<HostRecord>> {
        let mut guard = self.hosts.write();
        let removed = guard.iter().find(|h| h.key() == key).cloned()?;
        let next: Vec<_> = guard.iter().filter(|h| h.key() != key).cloned().collect();
        *guard = Arc::new(next);

        tracing::info!("host deregistered: {}", key);
        Some(removed)
    }
}
