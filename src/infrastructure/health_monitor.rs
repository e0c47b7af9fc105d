//! Active Health Monitor
//!
//! Periodically probes every registered host and drives its UP/DOWN state
//! machine.

use crate::application::host_registry::HostRegistry;
use crate::domain::entities::HostRecord;
use crate::domain::events::{BalancerEvent, HostAction};
use crate::domain::ports::{HealthProbe, ProbeError};
use crate::domain::value_objects::HostStatus;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::shutdown::ShutdownController;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Health monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Interval between probe rounds
    pub interval: Duration,
    /// Timeout for each probe
    pub probe_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

type HealthCallback = Arc<dyn Fn(&Arc<HostRecord>, HostStatus) + Send + Sync>;

/// Active health monitor for backend hosts.
///
/// Probes run one host at a time, each on its own task. A probe error,
/// timeout or panic counts as a failure, and a panicking callback is
/// logged; the loop itself never exits on errors.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    registry: Arc<HostRegistry>,
    probe: Arc<dyn HealthProbe>,
    events: Arc<EventBus>,
    /// Callback when a host changes state
    on_health_change: Option<HealthCallback>,
    stopping: AtomicBool,
    stop_notify: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthMonitorConfig,
        registry: Arc<HostRegistry>,
        probe: Arc<dyn HealthProbe>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            registry,
            probe,
            events,
            on_health_change: None,
            stopping: AtomicBool::new(false),
            stop_notify: Notify::new(),
            task: Mutex::new(None),
        }
    }

    /// Set callback for health status changes.
    pub fn on_health_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<HostRecord>, HostStatus) + Send + Sync + 'static,
    {
        self.on_health_change = Some(Arc::new(callback));
        self
    }

    /// Start the probe loop.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(self: &Arc<Self>, shutdown: ShutdownController) {
        let monitor = self.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = monitor.stop_notify.notified() => break,
                    _ = shutdown.cancelled() => break,
                }

                monitor.check_all().await;

                if monitor.stopping.load(Ordering::SeqCst) {
                    break;
                }
            }
            tracing::info!("health monitor stopped");
        });

        *self.task.lock() = Some(handle);
    }

    /// Stop the loop, waiting up to `grace` for an in-flight round.
    pub async fn stop(&self, grace: Duration) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();

        let handle = self.task.lock().take();
        let Some(mut handle) = handle else {
            return;
        };

        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            tracing::warn!("health monitor did not stop within {:?}, aborting", grace);
            handle.abort();
        }
    }

    /// Probe every registered host once. Returns the number of transitions.
    pub async fn check_all(&self) -> usize {
        let hosts = self.registry.all();
        let mut transitions = 0;

        for host in hosts.iter() {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            if self.check_host(host).await.is_some() {
                transitions += 1;
            }
        }
        transitions
    }

    /// Probe one host and feed the outcome into its state machine.
    pub async fn check_host(&self, host: &Arc<HostRecord>) -> Option<HostStatus> {
        let timeout_ms = self.config.probe_timeout.as_millis() as u64;
        // Own task so a panicking probe only fails this host
        let probe = self.probe.clone();
        let target = host.clone();
        let mut task = tokio::spawn(async move { probe.probe(&target).await });
        let result = match tokio::time::timeout(self.config.probe_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ProbeError::Aborted(e.to_string())),
            Err(_) => {
                task.abort();
                Err(ProbeError::Timeout(timeout_ms))
            }
        };

        let transition = match result {
            Ok(()) => host.report_success(),
            Err(e) => {
                tracing::debug!("health probe failed for {}: {}", host.key(), e);
                host.report_failure()
            }
        };

        if let Some(status) = transition {
            let action = match status {
                HostStatus::Up => HostAction::Success,
                HostStatus::Down => HostAction::Failure,
            };
            tracing::info!("host {} is now {}", host.key(), status);
            if let Some(callback) = &self.on_health_change {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(host, status))).is_err() {
                    tracing::error!("health change callback panicked for {} ({})", host.key(), status);
                }
            }
            self.events.publish(BalancerEvent::host(host.key().clone(), action));
        }
        transition
    }
}
