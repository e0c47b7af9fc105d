//! Application Layer
//!
//! Orchestrates the domain: host membership and the metric assignment table.

pub mod assignment_table;
pub mod host_registry;

pub use assignment_table::{
    AssignmentConfig, AssignmentError, AssignmentTable, DiscoveryOutcome, RebalanceSchedule,
};
pub use host_registry::HostRegistry;
