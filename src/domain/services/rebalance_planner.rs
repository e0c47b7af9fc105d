//! Rebalance Planner
//!
//! Pure domain logic for deciding which metrics to move so every UP host
//! carries roughly the same load. This service has no I/O and no locks.

use crate::domain::entities::HostKey;
use std::collections::BTreeMap;

/// A metric and the weight it contributes to its owner's load.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricLoad {
    pub metric: String,
    pub owner: HostKey,
    pub weight: f64,
}

/// One reassignment the planner wants applied.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMove {
    pub metric: String,
    pub from: HostKey,
    pub to: HostKey,
    pub weight: f64,
}

/// Greedy planner that moves metrics from the most to the least loaded host.
///
/// Each step picks the heaviest metric on the most loaded host that fits
/// into both that host's excess over the mean and the least loaded host's
/// deficit. When nothing fits, the lightest metric is moved as long as it
/// still narrows the gap between the two. Every move strictly lowers the
/// sum of squared deviations, so the plan always terminates.
pub struct RebalancePlanner;

impl RebalancePlanner {
    /// Plan moves until every host is within `control_band` (a fraction of
    /// the mean load) or no single move improves the spread.
    ///
    /// # Arguments
    /// * `up_hosts` - Hosts eligible to carry load
    /// * `metrics` - Current owners and weights; metrics on hosts outside
    ///   `up_hosts` are ignored
    /// * `control_band` - Allowed deviation from the mean, e.g. `0.05`
    pub fn plan(up_hosts: &[HostKey], metrics: &[MetricLoad], control_band: f64) -> Vec<PlannedMove> {
        if up_hosts.len() < 2 {
            return Vec::new();
        }

        let mut owned: BTreeMap<HostKey, Vec<(String, f64)>> =
            up_hosts.iter().map(|h| (h.clone(), Vec::new())).collect();
        for m in metrics {
            if let Some(list) = owned.get_mut(&m.owner) {
                list.push((m.metric.clone(), m.weight.max(0.0)));
            }
        }

        let mut loads: BTreeMap<HostKey, f64> = owned
            .iter()
            .map(|(h, list)| (h.clone(), list.iter().map(|(_, w)| w).sum()))
            .collect();

        let total: f64 = loads.values().sum();
        if total <= 0.0 {
            return Vec::new();
        }
        let mean = total / loads.len() as f64;
        let band = mean * control_band.max(0.0);

        let mut moves = Vec::new();
        let max_steps = metrics.len() * 2 + up_hosts.len();

        for _ in 0..max_steps {
            let (heavy, heavy_load) = match extreme(&loads, |a, b| a > b) {
                Some(v) => v,
                None => break,
            };
            let (light, light_load) = match extreme(&loads, |a, b| a < b) {
                Some(v) => v,
                None => break,
            };

            if heavy_load <= mean + band && light_load >= mean - band {
                break;
            }

            let limit = (heavy_load - mean).min(mean - light_load);
            let gap = heavy_load - light_load;

            let candidates = match owned.get(&heavy) {
                Some(list) => list,
                None => break,
            };

            let best_fit = candidates
                .iter()
                .enumerate()
                .filter(|(_, (_, w))| *w > 0.0 && *w <= limit)
                .max_by(|a, b| a.1 .1.total_cmp(&b.1 .1).then_with(|| b.1 .0.cmp(&a.1 .0)));

            let chosen = match best_fit {
                Some((idx, _)) => Some(idx),
                None => candidates
                    .iter()
                    .enumerate()
                    .filter(|(_, (_, w))| *w > 0.0 && *w < gap)
                    .min_by(|a, b| a.1 .1.total_cmp(&b.1 .1).then_with(|| a.1 .0.cmp(&b.1 .0)))
                    .map(|(idx, _)| idx),
            };

            let idx = match chosen {
                Some(idx) => idx,
                None => break,
            };

            let (metric, weight) = match owned.get_mut(&heavy) {
                Some(list) => list.swap_remove(idx),
                None => break,
            };
            if let Some(list) = owned.get_mut(&light) {
                list.push((metric.clone(), weight));
            }
            if let Some(l) = loads.get_mut(&heavy) {
                *l -= weight;
            }
            if let Some(l) = loads.get_mut(&light) {
                *l += weight;
            }

            moves.push(PlannedMove {
                metric,
                from: heavy,
                to: light,
                weight,
            });
        }

        moves
    }
}

/// Host with the extreme load per `better`, ties going to the lowest key.
fn extreme(loads: &BTreeMap<HostKey, f64>, better: impl Fn(f64, f64) -> bool) -> Option<(HostKey, f64)> {
    let mut best: Option<(&HostKey, f64)> = None;
    for (host, load) in loads {
        match best {
            Some((_, current)) if !better(*load, current) => {}
            _ => best = Some((host, *load)),
        }
    }
    best.map(|(h, l)| (h.clone(), l))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    // ===== Test Helpers =====

    fn hosts(n: usize) -> Vec<HostKey> {
        (0..n).map(|i| HostKey::new(format!("h{}", i), 4241)).collect()
    }

    fn load(metric: &str, owner: &HostKey, weight: f64) -> MetricLoad {
        MetricLoad {
            metric: metric.to_string(),
            owner: owner.clone(),
            weight,
        }
    }

    fn apply(metrics: &mut [MetricLoad], moves: &[PlannedMove]) {
        for mv in moves {
            let m = metrics.iter_mut().find(|m| m.metric == mv.metric).unwrap();
            assert_eq!(m.owner, mv.from);
            m.owner = mv.to.clone();
        }
    }

    fn host_loads(hosts: &[HostKey], metrics: &[MetricLoad]) -> Vec<f64> {
        hosts
            .iter()
            .map(|h| metrics.iter().filter(|m| &m.owner == h).map(|m| m.weight).sum())
            .collect()
    }

    // ===== Count Weighting Tests =====

    #[test]
    fn test_plan_spreads_single_hot_host() {
        let hs = hosts(3);
        let mut metrics: Vec<_> = (0..9).map(|i| load(&format!("m{}", i), &hs[0], 1.0)).collect();

        let moves = RebalancePlanner::plan(&hs, &metrics, 0.05);
        assert_eq!(moves.len(), 6);
        apply(&mut metrics, &moves);
        assert_eq!(host_loads(&hs, &metrics), vec![3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_plan_stops_at_best_possible_spread() {
        let hs = hosts(3);
        let mut metrics: Vec<_> = (0..10).map(|i| load(&format!("m{}", i), &hs[0], 1.0)).collect();

        let moves = RebalancePlanner::plan(&hs, &metrics, 0.05);
        apply(&mut metrics, &moves);

        let loads = host_loads(&hs, &metrics);
        let max = loads.iter().cloned().fold(f64::MIN, f64::max);
        let min = loads.iter().cloned().fold(f64::MAX, f64::min);
        assert_eq!(max - min, 1.0);
        assert_eq!(moves.len(), 6);
    }

    #[test]
    fn test_plan_balanced_table_moves_nothing() {
        let hs = hosts(2);
        let metrics = vec![
            load("a", &hs[0], 1.0),
            load("b", &hs[0], 1.0),
            load("c", &hs[1], 1.0),
            load("d", &hs[1], 1.0),
        ];
        assert!(RebalancePlanner::plan(&hs, &metrics, 0.05).is_empty());
    }

    #[test]
    fn test_plan_within_band_moves_nothing() {
        let hs = hosts(2);
        let mut metrics: Vec<_> = (0..11).map(|i| load(&format!("a{}", i), &hs[0], 1.0)).collect();
        metrics.extend((0..9).map(|i| load(&format!("b{}", i), &hs[1], 1.0)));
        // mean 10, band 1.0, loads 11 and 9 sit on the edge
        assert!(RebalancePlanner::plan(&hs, &metrics, 0.1).is_empty());
    }

    // ===== Arrival Rate Weighting Tests =====

    #[test]
    fn test_plan_moves_heaviest_fitting_metric() {
        let hs = hosts(2);
        let metrics = vec![
            load("hot", &hs[0], 50.0),
            load("warm", &hs[0], 30.0),
            load("cool", &hs[0], 10.0),
            load("idle", &hs[1], 10.0),
        ];
        // mean 50: h0 has 90, h1 has 10, limit 40 fits "warm"
        let moves = RebalancePlanner::plan(&hs, &metrics, 0.05);
        assert_eq!(moves[0].metric, "warm");
        assert_eq!(moves[0].from, hs[0]);
        assert_eq!(moves[0].to, hs[1]);
    }

    #[test]
    fn test_plan_ignores_zero_weight_metrics() {
        let hs = hosts(2);
        let metrics = vec![
            load("busy", &hs[0], 100.0),
            load("quiet1", &hs[0], 0.0),
            load("quiet2", &hs[0], 0.0),
        ];
        // Single heavy metric cannot improve spread; quiet ones do not help
        assert!(RebalancePlanner::plan(&hs, &metrics, 0.05).is_empty());
    }

    // ===== Edge Cases =====

    #[test]
    fn test_plan_single_host() {
        let hs = hosts(1);
        let metrics = vec![load("a", &hs[0], 1.0)];
        assert!(RebalancePlanner::plan(&hs, &metrics, 0.05).is_empty());
    }

    #[test]
    fn test_plan_ignores_metrics_on_down_hosts() {
        let hs = hosts(2);
        let down = HostKey::new("down", 4241);
        let metrics: Vec<_> = (0..6).map(|i| load(&format!("m{}", i), &down, 1.0)).collect();
        assert!(RebalancePlanner::plan(&hs, &metrics, 0.05).is_empty());
    }

    #[test]
    fn test_plan_empty_host_receives_load() {
        let hs = hosts(4);
        let mut metrics = Vec::new();
        for (i, h) in hs.iter().take(3).enumerate() {
            for j in 0..4 {
                metrics.push(load(&format!("m{}-{}", i, j), h, 1.0));
            }
        }

        let moves = RebalancePlanner::plan(&hs, &metrics, 0.05);
        assert_eq!(moves.len(), 3);
        assert!(moves.iter().all(|m| m.to == hs[3]));
        apply(&mut metrics, &moves);
        assert_eq!(host_loads(&hs, &metrics), vec![3.0, 3.0, 3.0, 3.0]);
    }
}
