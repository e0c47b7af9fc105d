//! Integration tests for the Assignment Table
//!
//! Drives failover, rebalancing, discovery and persistence through the
//! public API with real hosts and a file-backed store.

use metric_balancer::adapters::outbound::FileAssignmentStore;
use metric_balancer::application::{AssignmentConfig, AssignmentTable, HostRegistry};
use metric_balancer::domain::entities::{HealthThresholds, HostKey, HostSpec};
use metric_balancer::domain::events::{BalanceProgress, BalanceType, BalancerEvent};
use metric_balancer::domain::value_objects::{AssignReason, HostStatus, Intent};
use metric_balancer::infrastructure::{EventBus, RecordingListener, ShutdownController};
use std::sync::Arc;
use std::time::Duration;

fn spec(host: &str) -> HostSpec {
    HostSpec {
        host: host.to_string(),
        tcp_port: 4241,
        http_port: 4242,
        ws_port: 4243,
        udp_port: 4245,
    }
}

fn thresholds() -> HealthThresholds {
    HealthThresholds {
        failures_before_down: 1,
        successes_before_up: 1,
    }
}

fn table_with(hosts: &[&str]) -> (Arc<AssignmentTable>, Arc<RecordingListener>) {
    let registry = Arc::new(HostRegistry::with_hosts(hosts.iter().map(|h| spec(h)), thresholds()));
    let events = Arc::new(EventBus::new());
    let recorder = Arc::new(RecordingListener::new());
    events.subscribe(recorder.clone());
    let table = Arc::new(AssignmentTable::new(registry, events, AssignmentConfig::default()));
    (table, recorder)
}

fn stored_table(hosts: &[&str], path: &std::path::Path) -> AssignmentTable {
    let registry = Arc::new(HostRegistry::with_hosts(hosts.iter().map(|h| spec(h)), thresholds()));
    AssignmentTable::new(registry, Arc::new(EventBus::new()), AssignmentConfig::default())
        .with_store(Arc::new(FileAssignmentStore::new(path)))
}

fn mark_down(table: &AssignmentTable, host: &str) {
    let record = table.registry().find(&HostKey::new(host, 4241)).unwrap();
    assert_eq!(record.report_failure(), Some(HostStatus::Down));
}

fn mark_up(table: &AssignmentTable, host: &str) {
    let record = table.registry().find(&HostKey::new(host, 4241)).unwrap();
    assert_eq!(record.report_success(), Some(HostStatus::Up));
}

fn count_on(table: &AssignmentTable, host: &str) -> usize {
    table
        .counts_by_host()
        .into_iter()
        .find(|(k, _)| k == &HostKey::new(host, 4241))
        .map(|(_, n)| n)
        .unwrap_or(0)
}

// ===== Failover Tests =====

/// A metric follows its owner until the owner goes down, then moves once
/// and stays on the new owner after recovery.
#[tokio::test]
async fn test_three_host_failover_scenario() {
    let (table, recorder) = table_with(&["tsd-a", "tsd-b", "tsd-c"]);

    let first = table.resolve("sys.cpu.user", Intent::Ingest).unwrap();
    for _ in 0..10 {
        let again = table.resolve("sys.cpu.user", Intent::Query).unwrap();
        assert_eq!(again.key(), first.key());
    }

    let owner = first.host().to_string();
    mark_down(&table, &owner);
    assert_eq!(table.on_host_down(first.key()), 1);

    let moved = table.get("sys.cpu.user").unwrap();
    assert_ne!(moved.host.key(), first.key());
    assert!(moved.host.is_up());
    assert_eq!(moved.reason, AssignReason::HostDownRoundRobin);

    // Recovery does not pull the metric back
    mark_up(&table, &owner);
    let after = table.resolve("sys.cpu.user", Intent::Ingest).unwrap();
    assert_eq!(after.key(), moved.host.key());

    let assigned: Vec<_> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            BalancerEvent::Assigned(a) => Some(a),
            _ => None,
        })
        .collect();
    assert_eq!(assigned.len(), 2);
    assert_eq!(assigned[0].losing_host, None);
    assert_eq!(assigned[1].losing_host.as_ref(), Some(first.key()));
}

#[tokio::test]
async fn test_all_hosts_down_keeps_owners() {
    let (table, _) = table_with(&["tsd-a", "tsd-b"]);
    let owner = table.resolve("sys.mem.free", Intent::Ingest).unwrap();

    mark_down(&table, "tsd-a");
    mark_down(&table, "tsd-b");

    assert_eq!(table.on_host_down(owner.key()), 0);
    let resolved = table.resolve("sys.mem.free", Intent::Ingest).unwrap();
    assert_eq!(resolved.key(), owner.key());
}

#[tokio::test]
async fn test_new_metrics_skip_down_hosts() {
    let (table, _) = table_with(&["tsd-a", "tsd-b", "tsd-c"]);
    mark_down(&table, "tsd-b");

    for i in 0..12 {
        let host = table.resolve(&format!("metric.{}", i), Intent::Ingest).unwrap();
        assert_ne!(host.host(), "tsd-b");
    }
    assert_eq!(count_on(&table, "tsd-b"), 0);
    assert_eq!(count_on(&table, "tsd-a") + count_on(&table, "tsd-c"), 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_sight_assigns_once() {
    let (table, recorder) = table_with(&["tsd-a", "tsd-b", "tsd-c"]);

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let table = table.clone();
            tokio::spawn(async move { table.resolve("sys.load.avg", Intent::Ingest).unwrap() })
        })
        .collect();
    let owners: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().key().clone())
        .collect();

    assert!(owners.iter().all(|k| k == &owners[0]));
    let first_sight = recorder
        .events()
        .into_iter()
        .filter(|e| matches!(e, BalancerEvent::Assigned(a) if a.losing_host.is_none()))
        .count();
    assert_eq!(first_sight, 1);
}

// ===== Rebalance Tests =====

#[tokio::test]
async fn test_rebalance_converges_after_hosts_join() {
    let (table, recorder) = table_with(&["tsd-a"]);
    for i in 0..30 {
        table.resolve(&format!("metric.{}", i), Intent::Ingest).unwrap();
    }
    assert_eq!(count_on(&table, "tsd-a"), 30);

    assert!(table.add_host(spec("tsd-b")));
    assert!(table.add_host(spec("tsd-c")));
    recorder.clear();

    let moved = table.rebalance(BalanceType::Manual).await.unwrap();
    assert_eq!(moved, 20);
    for host in ["tsd-a", "tsd-b", "tsd-c"] {
        assert_eq!(count_on(&table, host), 10);
    }

    // A second pass has nothing left to do
    assert_eq!(table.rebalance(BalanceType::Manual).await.unwrap(), 0);

    let progress: Vec<_> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            BalancerEvent::Balance(b) => Some(b.progress),
            _ => None,
        })
        .collect();
    assert_eq!(
        &progress[..3],
        &[BalanceProgress::Begin, BalanceProgress::BalancerLockAcquired, BalanceProgress::End]
    );
}

#[tokio::test]
async fn test_rebalance_ignores_down_hosts() {
    let (table, _) = table_with(&["tsd-a"]);
    for i in 0..10 {
        table.resolve(&format!("metric.{}", i), Intent::Ingest).unwrap();
    }
    table.add_host(spec("tsd-b"));
    mark_down(&table, "tsd-b");

    assert_eq!(table.rebalance(BalanceType::Periodic).await.unwrap(), 0);
    assert_eq!(count_on(&table, "tsd-a"), 10);
}

// ===== Discovery Tests =====

#[tokio::test]
async fn test_discovery_replaces_host_set() {
    let (table, _) = table_with(&["tsd-a", "tsd-b"]);
    for i in 0..8 {
        table.resolve(&format!("metric.{}", i), Intent::Ingest).unwrap();
    }
    let on_a = count_on(&table, "tsd-a");

    let outcome = table.apply_discovery(vec![spec("tsd-b"), spec("tsd-c")]);
    assert_eq!(outcome.added, 1);
    assert_eq!(outcome.removed, 1);
    assert_eq!(outcome.reassigned, on_a);

    assert!(!table.registry().contains(&HostKey::new("tsd-a", 4241)));
    assert_eq!(table.len(), 8);
    assert!(table.entries().iter().all(|e| e.host.host() != "tsd-a"));
}

// ===== Persistence Tests =====

#[tokio::test]
async fn test_assignments_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("assignments.json");

    let table = stored_table(&["tsd-a", "tsd-b"], &path);
    for metric in ["sys.cpu.user", "sys.cpu.system", "sys.mem.free"] {
        table.resolve(metric, Intent::Ingest).unwrap();
    }
    table.persist_now().await.unwrap();
    let before = table.entries();

    let restarted = stored_table(&["tsd-a", "tsd-b"], &path);
    assert_eq!(restarted.load_persisted().await.unwrap(), 3);

    for entry in before {
        let loaded = restarted.get(&entry.metric).unwrap();
        assert_eq!(loaded.host.key(), entry.host.key());
        assert_eq!(loaded.reason, AssignReason::LoadedFromFile);
    }
}

#[tokio::test]
async fn test_persisted_rows_for_unknown_hosts_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("assignments.json");

    let table = stored_table(&["tsd-a", "tsd-b"], &path);
    for i in 0..6 {
        table.resolve(&format!("metric.{}", i), Intent::Ingest).unwrap();
    }
    table.persist_now().await.unwrap();
    let on_b = count_on(&table, "tsd-b");

    let restarted = stored_table(&["tsd-a"], &path);
    assert_eq!(restarted.load_persisted().await.unwrap(), 6 - on_b);
}

#[tokio::test]
async fn test_persister_writes_final_snapshot_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("assignments.json");

    let registry = Arc::new(HostRegistry::with_hosts(vec![spec("tsd-a")], thresholds()));
    let table = Arc::new(
        AssignmentTable::new(
            registry,
            Arc::new(EventBus::new()),
            AssignmentConfig {
                persist_debounce: Duration::from_secs(3600),
                ..AssignmentConfig::default()
            },
        )
        .with_store(Arc::new(FileAssignmentStore::new(&path))),
    );

    let shutdown = ShutdownController::new();
    let persister = table.start_persister(shutdown.clone());
    table.resolve("sys.cpu.user", Intent::Ingest).unwrap();

    shutdown.shutdown();
    tokio::time::timeout(Duration::from_secs(5), persister)
        .await
        .unwrap()
        .unwrap();

    let raw = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(raw.contains("sys.cpu.user"));
}
