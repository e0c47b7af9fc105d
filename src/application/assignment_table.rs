//! Assignment Table
//!
//! Owns the metric→host mapping. Resolves metrics to hosts, moves metrics
//! off failed or removed hosts, rebalances load across UP hosts, and keeps
//! an on-disk snapshot current.

use crate::application::host_registry::HostRegistry;
use crate::domain::arrival_rate::ArrivalRate;
use crate::domain::entities::{
    AssignmentEntry, HostKey, HostRecord, HostSpec, PersistedAssignment,
};
use crate::domain::events::{BalanceProgress, BalanceType, BalancerEvent, HostAction};
use crate::domain::ports::{AssignmentStore, BalanceLock, LockError, StoreError};
use crate::domain::services::{MetricLoad, RebalancePlanner};
use crate::domain::value_objects::{AssignReason, Intent, RebalanceWeighting};
use crate::infrastructure::balance_lock::LocalBalanceLock;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::shutdown::ShutdownController;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    #[error("no backend hosts configured")]
    NoHostsConfigured,
    #[error("host {0} is not registered")]
    UnknownHost(HostKey),
    #[error("assignment store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Tuning for reassignment and rebalancing.
#[derive(Debug, Clone)]
pub struct AssignmentConfig {
    /// Allowed deviation from the mean load, as a fraction of the mean
    pub control_band: f64,
    /// Quantity evened out by the rebalancer
    pub weighting: RebalanceWeighting,
    /// Quiet period before a dirty table is written out
    pub persist_debounce: Duration,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            control_band: 0.05,
            weighting: RebalanceWeighting::Count,
            persist_debounce: Duration::from_secs(1),
        }
    }
}

/// When the periodic rebalancer runs.
#[derive(Debug, Clone, Copy)]
pub struct RebalanceSchedule {
    /// Wait before the first pass
    pub delay: Duration,
    /// Time between passes
    pub interval: Duration,
    /// Passes stop once this much time has passed since the schedule started
    pub window: Duration,
}

impl Default for RebalanceSchedule {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(600),
            interval: Duration::from_secs(120),
            window: Duration::from_secs(1800),
        }
    }
}

/// Hosts added and removed by one discovery update.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DiscoveryOutcome {
    pub added: usize,
    pub removed: usize,
    pub reassigned: usize,
}

/// Metric→host mapping with sticky assignments.
///
/// Reads go through a `DashMap` and never touch I/O. Every mutation
/// replaces a whole entry, marks the table dirty and wakes the persister.
/// Events are collected while entries are locked and published only after
/// the guards are dropped.
pub struct AssignmentTable {
    registry: Arc<HostRegistry>,
    assignments: DashMap<String, AssignmentEntry>,
    metric_rates: DashMap<String, ArrivalRate>,
    rr_counter: AtomicUsize,
    fallback_counter: AtomicUsize,
    events: Arc<EventBus>,
    store: Option<Arc<dyn AssignmentStore>>,
    balance_lock: Arc<dyn BalanceLock>,
    config: AssignmentConfig,
    dirty: AtomicBool,
    persist_notify: Notify,
}

impl AssignmentTable {
    pub fn new(registry: Arc<HostRegistry>, events: Arc<EventBus>, config: AssignmentConfig) -> Self {
        Self {
            registry,
            assignments: DashMap::new(),
            metric_rates: DashMap::new(),
            rr_counter: AtomicUsize::new(0),
            fallback_counter: AtomicUsize::new(0),
            events,
            store: None,
            balance_lock: Arc::new(LocalBalanceLock::new()),
            config,
            dirty: AtomicBool::new(false),
            persist_notify: Notify::new(),
        }
    }

    /// Persist snapshots through `store`.
    pub fn with_store(mut self, store: Arc<dyn AssignmentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the in-process balance lock.
    pub fn with_balance_lock(mut self, lock: Arc<dyn BalanceLock>) -> Self {
        self.balance_lock = lock;
        self
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &AssignmentConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Current entry for `metric`, if any.
    pub fn get(&self, metric: &str) -> Option<AssignmentEntry> {
        self.assignments.get(metric).map(|e| e.value().clone())
    }

    /// All entries, sorted by metric name.
    pub fn entries(&self) -> Vec<AssignmentEntry> {
        let mut all: Vec<_> = self.assignments.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.metric.cmp(&b.metric));
        all
    }

    /// Number of metrics owned by each known host.
    pub fn counts_by_host(&self) -> Vec<(HostKey, usize)> {
        let hosts = self.registry.all();
        let mut counts: Vec<(HostKey, usize)> = hosts.iter().map(|h| (h.key().clone(), 0)).collect();
        for entry in self.assignments.iter() {
            if let Some(slot) = counts.iter_mut().find(|(k, _)| k == entry.host.key()) {
                slot.1 += 1;
            }
        }
        counts
    }

    /// Last computed ingest rate of `metric` in requests/sec.
    pub fn metric_rate(&self, metric: &str) -> f64 {
        self.metric_rates.get(metric).map(|r| r.rate()).unwrap_or(0.0)
    }

    // ===== Resolve =====

    /// Resolve the host responsible for `metric`.
    ///
    /// First sight assigns round robin over UP hosts, or sequentially over
    /// all hosts when none is UP. An owner that went DOWN is replaced as
    /// soon as another host is UP. A blank metric picks any UP host without
    /// recording an entry.
    pub fn resolve(&self, metric: &str, intent: Intent) -> Result<Arc<HostRecord>, AssignmentError> {
        let hosts = self.registry.all();
        if hosts.is_empty() {
            return Err(AssignmentError::NoHostsConfigured);
        }

        let metric = metric.trim();
        if metric.is_empty() {
            let host = match self.next_up(&hosts) {
                Some(h) => h,
                None => self.next_sequential(&hosts),
            };
            if intent == Intent::Ingest {
                host.arrived();
            }
            return Ok(host);
        }

        let any_up = hosts.iter().any(|h| h.is_up());

        let current = self.assignments.get(metric).map(|e| e.host.clone());
        let host = match current {
            Some(owner)
                if Self::is_available(&hosts, &owner)
                    || (!any_up && hosts.iter().any(|h| Arc::ptr_eq(h, &owner))) =>
            {
                owner
            }
            _ => self.assign_slow(metric, &hosts)?,
        };

        if intent == Intent::Ingest {
            self.metric_rates.entry(metric.to_string()).or_default().arrived();
            host.arrived();
        }

        tracing::debug!("resolved metric={} host={} intent={:?}", metric, host.key(), intent);
        Ok(host)
    }

    fn assign_slow(
        &self,
        metric: &str,
        hosts: &[Arc<HostRecord>],
    ) -> Result<Arc<HostRecord>, AssignmentError> {
        let mut event = None;

        let host = match self.assignments.entry(metric.to_string()) {
            Entry::Occupied(mut occupied) => {
                let owner = occupied.get().host.clone();
                if Self::is_available(hosts, &owner) {
                    owner
                } else {
                    match self.next_up(hosts) {
                        Some(next) => {
                            occupied.insert(AssignmentEntry::new(
                                metric.to_string(),
                                next.clone(),
                                AssignReason::HostDownRoundRobin,
                            ));
                            event = Some(BalancerEvent::assigned(
                                metric,
                                Some(owner.key().clone()),
                                next.key().clone(),
                                AssignReason::HostDownRoundRobin,
                            ));
                            next
                        }
                        None if hosts.iter().any(|h| Arc::ptr_eq(h, &owner)) => owner,
                        None => {
                            let next = self.next_sequential(hosts);
                            occupied.insert(AssignmentEntry::new(
                                metric.to_string(),
                                next.clone(),
                                AssignReason::FallbackSequential,
                            ));
                            event = Some(BalancerEvent::assigned(
                                metric,
                                Some(owner.key().clone()),
                                next.key().clone(),
                                AssignReason::FallbackSequential,
                            ));
                            next
                        }
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let (next, reason) = match self.next_up(hosts) {
                    Some(h) => (h, AssignReason::RoundRobin),
                    None => (self.next_sequential(hosts), AssignReason::FallbackSequential),
                };
                vacant.insert(AssignmentEntry::new(metric.to_string(), next.clone(), reason));
                event = Some(BalancerEvent::assigned(metric, None, next.key().clone(), reason));
                next
            }
        };

        if let Some(event) = event {
            self.mark_dirty();
            self.events.publish(event);
        }
        Ok(host)
    }

    fn is_available(hosts: &[Arc<HostRecord>], host: &Arc<HostRecord>) -> bool {
        host.is_up() && hosts.iter().any(|h| Arc::ptr_eq(h, host))
    }

    /// Next UP host in round-robin order, skipping DOWN hosts.
    fn next_up(&self, hosts: &[Arc<HostRecord>]) -> Option<Arc<HostRecord>> {
        let n = hosts.len();
        if n == 0 {
            return None;
        }
        let start = self.rr_counter.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .map(|i| &hosts[(start + i) % n])
            .find(|h| h.is_up())
            .cloned()
    }

    fn next_sequential(&self, hosts: &[Arc<HostRecord>]) -> Arc<HostRecord> {
        let idx = self.fallback_counter.fetch_add(1, Ordering::Relaxed) % hosts.len();
        hosts[idx].clone()
    }

    // ===== Failover =====

    /// Move every metric owned by `key` to UP hosts.
    ///
    /// Returns the number of metrics moved. When no host is UP the entries
    /// stay where they are.
    pub fn on_host_down(&self, key: &HostKey) -> usize {
        let hosts = self.registry.all();
        if !hosts.iter().any(|h| h.is_up()) {
            tracing::warn!("host {} down but no UP host to take its metrics", key);
            return 0;
        }

        let owned = self.metrics_owned_by(key);
        let mut events = Vec::with_capacity(owned.len());

        for metric in owned {
            let Some(mut entry) = self.assignments.get_mut(&metric) else {
                continue;
            };
            if entry.host.key() != key {
                continue;
            }
            let Some(next) = self.next_up(&hosts) else {
                break;
            };
            *entry = AssignmentEntry::new(metric.clone(), next.clone(), AssignReason::HostDownRoundRobin);
            events.push(BalancerEvent::assigned(
                metric,
                Some(key.clone()),
                next.key().clone(),
                AssignReason::HostDownRoundRobin,
            ));
        }

        let moved = events.len();
        if moved > 0 {
            tracing::info!("reassigned {} metrics away from down host {}", moved, key);
            self.mark_dirty();
        }
        self.events.publish_all(events);
        moved
    }

    /// Drop `key` from the registry and move its metrics elsewhere.
    pub fn on_host_removed(&self, key: &HostKey) -> Result<usize, AssignmentError> {
        if self.registry.remove(key).is_none() {
            return Err(AssignmentError::UnknownHost(key.clone()));
        }

        let hosts = self.registry.all();
        let owned = self.metrics_owned_by(key);
        let mut events = Vec::with_capacity(owned.len() + 1);

        if !hosts.is_empty() {
            for metric in owned {
                let Some(mut entry) = self.assignments.get_mut(&metric) else {
                    continue;
                };
                if entry.host.key() != key {
                    continue;
                }
                let next = match self.next_up(&hosts) {
                    Some(h) => h,
                    None => self.next_sequential(&hosts),
                };
                *entry = AssignmentEntry::new(metric.clone(), next.clone(), AssignReason::HostRemoved);
                events.push(BalancerEvent::assigned(
                    metric,
                    Some(key.clone()),
                    next.key().clone(),
                    AssignReason::HostRemoved,
                ));
            }
        } else if !owned.is_empty() {
            tracing::warn!("last host {} removed, {} metrics left unowned", key, owned.len());
        }

        let moved = events.len();
        tracing::info!("host {} removed, {} metrics reassigned", key, moved);
        events.push(BalancerEvent::host(key.clone(), HostAction::Removed));
        self.mark_dirty();
        self.events.publish_all(events);
        Ok(moved)
    }

    /// Register `spec` as a new host. Returns `false` if it was known.
    pub fn add_host(&self, spec: HostSpec) -> bool {
        match self.registry.add(spec) {
            Some(record) => {
                self.events
                    .publish(BalancerEvent::host(record.key().clone(), HostAction::Added));
                true
            }
            None => false,
        }
    }

    /// Reconcile the registry with a full host list from discovery.
    pub fn apply_discovery(&self, specs: Vec<HostSpec>) -> DiscoveryOutcome {
        let wanted: HashSet<HostKey> = specs.iter().map(|s| s.key()).collect();
        let mut outcome = DiscoveryOutcome::default();

        for spec in specs {
            if self.add_host(spec) {
                outcome.added += 1;
            }
        }

        let stale: Vec<HostKey> = self
            .registry
            .all()
            .iter()
            .map(|h| h.key().clone())
            .filter(|k| !wanted.contains(k))
            .collect();
        for key in stale {
            if let Ok(moved) = self.on_host_removed(&key) {
                outcome.removed += 1;
                outcome.reassigned += moved;
            }
        }

        tracing::info!(
            "discovery applied: added={} removed={} reassigned={}",
            outcome.added,
            outcome.removed,
            outcome.reassigned
        );
        outcome
    }

    fn metrics_owned_by(&self, key: &HostKey) -> Vec<String> {
        self.assignments
            .iter()
            .filter(|e| e.host.key() == key)
            .map(|e| e.key().clone())
            .collect()
    }

    // ===== Rebalance =====

    /// Even out load across UP hosts. Returns the number of metrics moved.
    pub async fn rebalance(&self, balance_type: BalanceType) -> Result<usize, AssignmentError> {
        self.events
            .publish(BalancerEvent::balance(BalanceProgress::Begin, balance_type, 0));

        let guard = self.balance_lock.acquire().await?;
        self.events.publish(BalancerEvent::balance(
            BalanceProgress::BalancerLockAcquired,
            balance_type,
            0,
        ));

        let up = self.registry.up_hosts();
        let up_keys: Vec<HostKey> = up.iter().map(|h| h.key().clone()).collect();

        let loads: Vec<MetricLoad> = self
            .assignments
            .iter()
            .filter(|e| up.iter().any(|h| Arc::ptr_eq(h, &e.host)))
            .map(|e| MetricLoad {
                metric: e.key().clone(),
                owner: e.host.key().clone(),
                weight: self.weight_of(e.key()),
            })
            .collect();

        let plan = RebalancePlanner::plan(&up_keys, &loads, self.config.control_band);

        let mut events = Vec::with_capacity(plan.len());
        for mv in plan {
            let Some(target) = up.iter().find(|h| h.key() == &mv.to) else {
                continue;
            };
            let Some(mut entry) = self.assignments.get_mut(&mv.metric) else {
                continue;
            };
            if entry.host.key() != &mv.from {
                continue;
            }
            *entry = AssignmentEntry::new(mv.metric.clone(), target.clone(), AssignReason::Rebalance);
            drop(entry);
            events.push(BalancerEvent::assigned(
                mv.metric,
                Some(mv.from),
                mv.to,
                AssignReason::Rebalance,
            ));
        }

        let moved = events.len();
        if moved > 0 {
            self.mark_dirty();
        }
        self.events.publish_all(events);
        self.events
            .publish(BalancerEvent::balance(BalanceProgress::End, balance_type, moved));
        drop(guard);

        tracing::info!("rebalance {} finished, {} metrics moved", balance_type.as_str(), moved);
        Ok(moved)
    }

    fn weight_of(&self, metric: &str) -> f64 {
        match self.config.weighting {
            RebalanceWeighting::Count => 1.0,
            RebalanceWeighting::ArrivalRate => self.metric_rate(metric),
        }
    }

    /// Recompute every metric and host arrival rate.
    pub fn recompute_rates(&self) {
        for rate in self.metric_rates.iter() {
            rate.recompute();
        }
        for host in self.registry.all().iter() {
            host.recompute_rate();
        }
    }

    // ===== Persistence =====

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.persist_notify.notify_one();
    }

    /// Current table as persisted rows, sorted by metric.
    pub fn snapshot(&self) -> Vec<PersistedAssignment> {
        self.entries()
            .into_iter()
            .map(|e| PersistedAssignment {
                rate: self.metric_rate(&e.metric),
                host: e.host.host().to_string(),
                tcp_port: e.host.tcp_port(),
                metric: e.metric,
                reason: e.reason,
                assigned_at_ms: e.assigned_at_ms,
            })
            .collect()
    }

    /// Write the snapshot now, if a store is configured.
    pub async fn persist_now(&self) -> Result<(), AssignmentError> {
        let Some(store) = &self.store else {
            self.dirty.store(false, Ordering::SeqCst);
            return Ok(());
        };

        self.dirty.store(false, Ordering::SeqCst);
        let rows = self.snapshot();
        if let Err(e) = store.save(&rows).await {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e.into());
        }
        tracing::debug!("persisted {} assignments", rows.len());
        Ok(())
    }

    /// Restore assignments saved by a previous run.
    ///
    /// Rows naming hosts that are not registered are dropped. Returns the
    /// number of entries restored.
    pub async fn load_persisted(&self) -> Result<usize, AssignmentError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let rows = store.load().await?;
        let total = rows.len();
        let mut restored = 0;

        for row in rows {
            let Some(host) = self.registry.find(&row.host_key()) else {
                tracing::debug!("dropping persisted metric {} for unknown host {}", row.metric, row.host_key());
                continue;
            };
            self.assignments.insert(
                row.metric.clone(),
                AssignmentEntry {
                    metric: row.metric,
                    host,
                    reason: AssignReason::LoadedFromFile,
                    assigned_at_ms: row.assigned_at_ms,
                },
            );
            restored += 1;
        }

        if restored < total {
            self.mark_dirty();
        }
        tracing::info!("loaded {} of {} persisted assignments", restored, total);
        Ok(restored)
    }

    // ===== Background Tasks =====

    /// Start the debounced persistence loop. Writes a final snapshot on
    /// shutdown.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start_persister(self: &Arc<Self>, shutdown: ShutdownController) -> JoinHandle<()> {
        let table = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = table.persist_notify.notified() => {}
                    _ = shutdown.cancelled() => break,
                }

                tokio::select! {
                    _ = tokio::time::sleep(table.config.persist_debounce) => {}
                    _ = shutdown.cancelled() => break,
                }

                if table.is_dirty() {
                    if let Err(e) = table.persist_now().await {
                        tracing::error!("failed to persist assignments: {}", e);
                    }
                }
            }

            if table.is_dirty() {
                if let Err(e) = table.persist_now().await {
                    tracing::error!("failed to persist assignments on shutdown: {}", e);
                }
            }
        })
    }

    /// Start the periodic rebalancer.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start_rebalancer(
        self: &Arc<Self>,
        schedule: RebalanceSchedule,
        shutdown: ShutdownController,
    ) -> JoinHandle<()> {
        let table = self.clone();

        tokio::spawn(async move {
            let until = tokio::time::Instant::now() + schedule.window;

            tokio::select! {
                _ = tokio::time::sleep(schedule.delay) => {}
                _ = shutdown.cancelled() => return,
            }

            let mut interval = tokio::time::interval(schedule.interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.cancelled() => return,
                }

                if tokio::time::Instant::now() >= until {
                    tracing::info!("rebalance window closed");
                    return;
                }

                if let Err(e) = table.rebalance(BalanceType::Periodic).await {
                    tracing::error!("periodic rebalance failed: {}", e);
                }
            }
        })
    }

    /// Start the arrival rate recompute loop.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start_rate_tracker(self: &Arc<Self>, every: Duration, shutdown: ShutdownController) -> JoinHandle<()> {
        let table = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // First tick fires immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => table.recompute_rates(),
                    _ = shutdown.cancelled() => return,
                }
            }
        })
    }
}
