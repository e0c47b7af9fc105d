mod rebalance_planner;

pub use rebalance_planner::{MetricLoad, PlannedMove, RebalancePlanner};
