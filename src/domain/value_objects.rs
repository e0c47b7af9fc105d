//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};

/// Liveness state of a backend host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostStatus {
    /// Host receives new assignments
    Up,
    /// Host is excluded from round robin until it recovers
    Down,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
        }
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a metric ended up on its current host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignReason {
    /// First sight of the metric, round robin over UP hosts
    RoundRobin,
    /// Previous owner went down
    HostDownRoundRobin,
    /// No host was UP, sequential pick over every known host
    FallbackSequential,
    /// Previous owner was removed by discovery or an administrator
    HostRemoved,
    /// Moved by the rebalancer
    Rebalance,
    /// Restored from the assignment file at startup
    LoadedFromFile,
}

impl AssignReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "ROUND_ROBIN",
            Self::HostDownRoundRobin => "HOST_DOWN_ROUND_ROBIN",
            Self::FallbackSequential => "FALLBACK_SEQUENTIAL",
            Self::HostRemoved => "HOST_REMOVED",
            Self::Rebalance => "REBALANCE",
            Self::LoadedFromFile => "LOADED_FROM_FILE",
        }
    }
}

impl std::fmt::Display for AssignReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the caller intends to do with the resolved host.
///
/// Both intents resolve to the same owner; only ingest traffic counts
/// towards the arrival rates used for load-aware rebalancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    Query,
    Ingest,
}

/// Wire protocol of a pooled client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Http,
    WebSocket,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Http => "http",
            Self::WebSocket => "ws",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Quantity the rebalancer evens out across UP hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceWeighting {
    /// Every assigned metric weighs 1
    #[default]
    Count,
    /// Every metric weighs its recent ingest arrival rate
    ArrivalRate,
}

impl RebalanceWeighting {
    /// Parse a weighting name, falling back to `Count` for unknown input.
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "arrival_rate" | "arrival-rate" | "rate" => Self::ArrivalRate,
            _ => Self::Count,
        }
    }
}
