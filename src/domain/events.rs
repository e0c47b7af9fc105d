//! Balancer Events
//!
//! Value types published whenever assignments move, hosts change state, or a
//! rebalance runs. Listeners receive them through the `EventListener` port.

use crate::domain::entities::HostKey;
use crate::domain::value_objects::AssignReason;
use serde::Serialize;

/// A metric was given a new owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricAssignedEvent {
    pub metric: String,
    /// Previous owner, `None` on first assignment
    pub losing_host: Option<HostKey>,
    pub gaining_host: HostKey,
    pub reason: AssignReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostAction {
    Added,
    Removed,
    /// Health transition DOWN→UP
    Success,
    /// Health transition UP→DOWN
    Failure,
}

impl HostAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Removed => "REMOVED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

/// Membership or health change of a backend host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricHostEvent {
    pub host: HostKey,
    pub action: HostAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalanceProgress {
    Begin,
    BalancerLockAcquired,
    End,
}

impl BalanceProgress {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Begin => "BEGIN",
            Self::BalancerLockAcquired => "BALANCER_LOCK_ACQUIRED",
            Self::End => "END",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalanceType {
    /// Triggered by the rebalance schedule
    Periodic,
    /// Triggered through the admin API
    Manual,
}

impl BalanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Periodic => "PERIODIC",
            Self::Manual => "MANUAL",
        }
    }
}

/// Progress marker of one rebalance pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricBalanceEvent {
    pub progress: BalanceProgress,
    pub balance_type: BalanceType,
    /// Number of metrics moved, only meaningful on `End`
    pub num_reassigned: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BalancerEvent {
    Assigned(MetricAssignedEvent),
    Host(MetricHostEvent),
    Balance(MetricBalanceEvent),
}

impl BalancerEvent {
    pub fn assigned(
        metric: impl Into<String>,
        losing_host: Option<HostKey>,
        gaining_host: HostKey,
        reason: AssignReason,
    ) -> Self {
        Self::Assigned(MetricAssignedEvent {
            metric: metric.into(),
            losing_host,
            gaining_host,
            reason,
        })
    }

    pub fn host(host: HostKey, action: HostAction) -> Self {
        Self::Host(MetricHostEvent { host, action })
    }

    pub fn balance(progress: BalanceProgress, balance_type: BalanceType, num_reassigned: usize) -> Self {
        Self::Balance(MetricBalanceEvent {
            progress,
            balance_type,
            num_reassigned,
        })
    }
}

impl std::fmt::Display for BalancerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assigned(e) => match &e.losing_host {
                Some(losing) => write!(
                    f,
                    "metric {} moved {} -> {} ({})",
                    e.metric, losing, e.gaining_host, e.reason
                ),
                None => write!(f, "metric {} assigned to {} ({})", e.metric, e.gaining_host, e.reason),
            },
            Self::Host(e) => write!(f, "host {} {}", e.host, e.action.as_str()),
            Self::Balance(e) => write!(
                f,
                "balance {} {} reassigned={}",
                e.balance_type.as_str(),
                e.progress.as_str(),
                e.num_reassigned
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_assigned() {
        let first = BalancerEvent::assigned("sys.cpu.user", None, HostKey::new("a", 1), AssignReason::RoundRobin);
        assert_eq!(first.to_string(), "metric sys.cpu.user assigned to a:1 (ROUND_ROBIN)");

        let moved = BalancerEvent::assigned(
            "sys.cpu.user",
            Some(HostKey::new("a", 1)),
            HostKey::new("b", 1),
            AssignReason::HostDownRoundRobin,
        );
        assert_eq!(
            moved.to_string(),
            "metric sys.cpu.user moved a:1 -> b:1 (HOST_DOWN_ROUND_ROBIN)"
        );
    }

    #[test]
    fn test_display_balance() {
        let ev = BalancerEvent::balance(BalanceProgress::End, BalanceType::Periodic, 4);
        assert_eq!(ev.to_string(), "balance PERIODIC END reassigned=4");
    }

    #[test]
    fn test_serialize_tagged() {
        let ev = BalancerEvent::host(HostKey::new("a", 1), HostAction::Removed);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "host");
        assert_eq!(json["action"], "REMOVED");
        assert_eq!(json["host"]["tcp_port"], 1);
    }
}
