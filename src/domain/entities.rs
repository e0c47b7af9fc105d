//! Domain Entities - Core business objects
//!
//! These entities represent the core concepts of the balancer domain:
//! backend hosts with their health state machine, and the assignment of
//! metric names to those hosts.

use crate::domain::arrival_rate::ArrivalRate;
use crate::domain::value_objects::{AssignReason, HostStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of a backend host: address plus ingest port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostKey {
    pub host: String,
    pub tcp_port: u16,
}

impl HostKey {
    pub fn new(host: impl Into<String>, tcp_port: u16) -> Self {
        Self {
            host: host.into(),
            tcp_port,
        }
    }
}

impl std::fmt::Display for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.tcp_port)
    }
}

/// Network identity of a backend as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostSpec {
    pub host: String,
    pub tcp_port: u16,
    pub http_port: u16,
    pub ws_port: u16,
    pub udp_port: u16,
}

impl HostSpec {
    pub fn key(&self) -> HostKey {
        HostKey::new(self.host.clone(), self.tcp_port)
    }
}

/// Error parsing a `host:tcp:http:ws:udp` host spec.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid host spec '{0}', expected host:tcpPort:httpPort:wsPort:udpPort")]
pub struct InvalidHostSpec(pub String);

impl FromStr for HostSpec {
    type Err = InvalidHostSpec;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        // Ports are the last four fields, so IPv6 hosts keep their colons
        let mut parts = trimmed.rsplitn(5, ':');
        let udp = parts.next();
        let ws = parts.next();
        let http = parts.next();
        let tcp = parts.next();
        let host = parts.next();

        let port = |p: Option<&str>| -> Result<u16, InvalidHostSpec> {
            p.and_then(|v| v.parse::<u16>().ok())
                .ok_or_else(|| InvalidHostSpec(trimmed.to_string()))
        };

        let host = host
            .filter(|h| !h.is_empty())
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| InvalidHostSpec(trimmed.to_string()))?;

        Ok(Self {
            host,
            tcp_port: port(tcp)?,
            http_port: port(http)?,
            ws_port: port(ws)?,
            udp_port: port(udp)?,
        })
    }
}

/// Consecutive-outcome thresholds for the UP/DOWN state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// Consecutive failures while UP before the host is marked DOWN
    pub failures_before_down: u32,
    /// Consecutive successes while DOWN before the host is marked UP
    pub successes_before_up: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            failures_before_down: 3,
            successes_before_up: 3,
        }
    }
}

#[derive(Debug)]
struct HealthState {
    status: HostStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

/// A backend host: immutable network identity plus mutable health and load.
///
/// Health is a two-state machine with hysteresis. A host flips UP→DOWN
/// only after `failures_before_down` consecutive failures, and DOWN→UP
/// only after `successes_before_up` consecutive successes. Counters and
/// status are guarded by a single mutex so concurrent probes and relays
/// never lose updates.
#[derive(Debug)]
pub struct HostRecord {
    spec: HostSpec,
    key: HostKey,
    thresholds: HealthThresholds,
    health: Mutex<HealthState>,
    arrivals: ArrivalRate,
}

impl HostRecord {
    pub fn new(spec: HostSpec, thresholds: HealthThresholds) -> Self {
        Self::with_status(spec, thresholds, HostStatus::Up)
    }

    pub fn with_status(spec: HostSpec, thresholds: HealthThresholds, status: HostStatus) -> Self {
        let key = spec.key();
        Self {
            spec,
            key,
            thresholds,
            health: Mutex::new(HealthState {
                status,
                consecutive_failures: 0,
                consecutive_successes: 0,
            }),
            arrivals: ArrivalRate::new(),
        }
    }

    pub fn key(&self) -> &HostKey {
        &self.key
    }

    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    pub fn host(&self) -> &str {
        &self.spec.host
    }

    pub fn tcp_port(&self) -> u16 {
        self.spec.tcp_port
    }

    pub fn http_port(&self) -> u16 {
        self.spec.http_port
    }

    pub fn ws_port(&self) -> u16 {
        self.spec.ws_port
    }

    pub fn udp_port(&self) -> u16 {
        self.spec.udp_port
    }

    /// `host:port` for the given port, bracketing IPv6 literals.
    pub fn socket_addr(&self, port: u16) -> String {
        if self.spec.host.contains(':') {
            format!("[{}]:{}", self.spec.host, port)
        } else {
            format!("{}:{}", self.spec.host, port)
        }
    }

    pub fn status(&self) -> HostStatus {
        self.health.lock().status
    }

    pub fn is_up(&self) -> bool {
        self.status() == HostStatus::Up
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.health.lock().consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.health.lock().consecutive_successes
    }

    /// Record a successful interaction.
    ///
    /// Returns `Some(HostStatus::Up)` when this call moved the host from
    /// DOWN to UP.
    pub fn report_success(&self) -> Option<HostStatus> {
        let mut state = self.health.lock();
        state.consecutive_failures = 0;
        if state.status == HostStatus::Up {
            return None;
        }

        state.consecutive_successes += 1;
        tracing::trace!(
            "success reported host={} successes={} threshold={}",
            self.key,
            state.consecutive_successes,
            self.thresholds.successes_before_up
        );
        if state.consecutive_successes >= self.thresholds.successes_before_up {
            state.status = HostStatus::Up;
            state.consecutive_successes = 0;
            tracing::info!("host up: {}", self.key);
            return Some(HostStatus::Up);
        }
        None
    }

    /// Record a failed interaction.
    ///
    /// Returns `Some(HostStatus::Down)` when this call moved the host from
    /// UP to DOWN.
    pub fn report_failure(&self) -> Option<HostStatus> {
        let mut state = self.health.lock();
        state.consecutive_successes = 0;
        if state.status == HostStatus::Down {
            return None;
        }

        state.consecutive_failures += 1;
        tracing::trace!(
            "failure reported host={} failures={} threshold={}",
            self.key,
            state.consecutive_failures,
            self.thresholds.failures_before_down
        );
        if state.consecutive_failures >= self.thresholds.failures_before_down {
            state.status = HostStatus::Down;
            state.consecutive_failures = 0;
            tracing::warn!("host down: {}", self.key);
            return Some(HostStatus::Down);
        }
        None
    }

    /// Count one routed request towards this host's load.
    pub fn arrived(&self) {
        self.arrivals.arrived();
    }

    /// Recompute requests/sec from arrivals since the previous call.
    pub fn recompute_rate(&self) -> f64 {
        self.arrivals.recompute()
    }

    pub fn arrival_rate(&self) -> f64 {
        self.arrivals.rate()
    }
}

impl PartialEq for HostRecord {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for HostRecord {}

/// Current owner of one metric name.
#[derive(Debug, Clone)]
pub struct AssignmentEntry {
    pub metric: String,
    pub host: Arc<HostRecord>,
    pub reason: AssignReason,
    /// Milliseconds since the Unix epoch
    pub assigned_at_ms: u64,
}

impl AssignmentEntry {
    pub fn new(metric: String, host: Arc<HostRecord>, reason: AssignReason) -> Self {
        Self {
            metric,
            host,
            reason,
            assigned_at_ms: epoch_millis(),
        }
    }
}

/// One row of the on-disk assignment snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedAssignment {
    pub metric: String,
    pub host: String,
    pub tcp_port: u16,
    pub reason: AssignReason,
    pub assigned_at_ms: u64,
    /// Ingest rate of the metric when the snapshot was taken
    #[serde(default)]
    pub rate: f64,
}

impl PersistedAssignment {
    pub fn host_key(&self) -> HostKey {
        HostKey::new(self.host.clone(), self.tcp_port)
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
