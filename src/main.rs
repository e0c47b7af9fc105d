//! metric-balancer - Metric-Sharding Balancer
//!
//! This is the composition root that wires together all the components.

use metric_balancer::adapters::inbound::{
    AdminServer, AdminState, HttpRelayHandler, HttpRelayServer, TcpRelay, UdpRelay, UdpRelayConfig,
    WsRelayHandler, WsRelayServer,
};
use metric_balancer::adapters::outbound::{
    FileAssignmentStore, HttpClientFactory, LoggingEventListener, TcpClientFactory, TcpHealthProbe,
    UdpClientFactory, WsClientFactory,
};
use metric_balancer::application::{AssignmentTable, HostRegistry};
use metric_balancer::config::load_config;
use metric_balancer::domain::value_objects::HostStatus;
use metric_balancer::infrastructure::{shutdown_signal, ConnectionPool, EventBus, HealthMonitor, ShutdownController};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

const POOL_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    cfg.validate()?;
    let specs = cfg.host_specs()?;

    tracing::info!(
        "starting metric-balancer hosts={} tcp={} udp={} http={} ws={} admin={}",
        specs.len(),
        cfg.tcp_listen_addr,
        cfg.udp_listen_addr,
        cfg.http_listen_addr,
        cfg.ws_listen_addr,
        cfg.admin_listen_addr
    );

    // ===== COMPOSITION ROOT =====

    let shutdown = ShutdownController::new();

    // 1. Event sink
    let events = Arc::new(EventBus::new());
    events.subscribe(Arc::new(LoggingEventListener::new()));

    // 2. Hosts and assignments
    let registry = Arc::new(HostRegistry::with_hosts(specs, cfg.thresholds()));
    let mut table = AssignmentTable::new(registry.clone(), events.clone(), cfg.assignment_config());
    if let Some(path) = &cfg.assignment_file {
        table = table.with_store(Arc::new(FileAssignmentStore::new(path)));
    }
    let table = Arc::new(table);

    match table.load_persisted().await {
        Ok(restored) if restored > 0 => tracing::info!("restored {} assignments", restored),
        Ok(_) => {}
        Err(e) => tracing::warn!("could not load persisted assignments: {}", e),
    }

    // 3. Connection pools, evicting removed hosts
    let connect_timeout = Duration::from_millis(cfg.connect_timeout_ms);
    let tcp_pool = Arc::new(ConnectionPool::new(
        TcpClientFactory::new(connect_timeout),
        cfg.pool_config(cfg.tcp_pool_max),
    ));
    let udp_pool = Arc::new(ConnectionPool::new(
        UdpClientFactory::new(),
        cfg.pool_config(cfg.udp_pool_max),
    ));
    let http_pool = Arc::new(ConnectionPool::new(
        HttpClientFactory::new(
            cfg.http_scheme.clone(),
            cfg.http_accept_invalid_certs,
            Duration::from_millis(cfg.http_request_timeout_ms),
        ),
        cfg.pool_config(cfg.http_pool_max),
    ));
    let ws_pool = Arc::new(ConnectionPool::new(
        WsClientFactory::new(cfg.ws_scheme.clone(), cfg.ws_path.clone(), connect_timeout),
        cfg.pool_config(cfg.ws_pool_max),
    ));
    events.subscribe(tcp_pool.clone());
    events.subscribe(udp_pool.clone());
    events.subscribe(http_pool.clone());
    events.subscribe(ws_pool.clone());

    // 4. Health monitor, failing over metrics of hosts that go down
    let probe = Arc::new(TcpHealthProbe::new(tcp_pool.clone()));
    let failover_table = table.clone();
    let monitor = Arc::new(
        HealthMonitor::new(cfg.health_monitor_config(), registry.clone(), probe, events.clone()).on_health_change(
            move |host, status| {
                if status == HostStatus::Down {
                    failover_table.on_host_down(host.key());
                }
            },
        ),
    );
    monitor.start(shutdown.clone());

    // 5. Background tasks
    let persister = table.start_persister(shutdown.clone());
    let rebalancer = table.start_rebalancer(cfg.rebalance_schedule(), shutdown.clone());
    let rate_tracker = table.start_rate_tracker(Duration::from_secs(cfg.rate_interval_secs.max(1)), shutdown.clone());
    let cleanups = vec![
        tcp_pool.start_cleanup(POOL_CLEANUP_INTERVAL, shutdown.clone()),
        udp_pool.start_cleanup(POOL_CLEANUP_INTERVAL, shutdown.clone()),
        http_pool.start_cleanup(POOL_CLEANUP_INTERVAL, shutdown.clone()),
        ws_pool.start_cleanup(POOL_CLEANUP_INTERVAL, shutdown.clone()),
    ];

    // 6. Inbound adapters
    let tcp_relay = TcpRelay::new(
        table.clone(),
        tcp_pool.clone(),
        cfg.tcp_listen_addr.clone(),
        shutdown.clone(),
    );
    let udp_relay = UdpRelay::new(
        table.clone(),
        udp_pool.clone(),
        cfg.udp_listen_addr.clone(),
        UdpRelayConfig {
            queue_capacity: cfg.udp_queue_capacity,
            retry: cfg.udp_retry_policy(),
        },
        shutdown.clone(),
    );
    let http_server = HttpRelayServer::new(
        cfg.http_listen_addr.clone(),
        Arc::new(HttpRelayHandler::new(table.clone(), http_pool.clone(), shutdown.clone())),
        shutdown.clone(),
    );
    let ws_server = WsRelayServer::new(
        cfg.ws_listen_addr.clone(),
        cfg.ws_path.clone(),
        Arc::new(WsRelayHandler::new(
            table.clone(),
            ws_pool.clone(),
            shutdown.clone(),
            WS_PING_INTERVAL,
        )),
        shutdown.clone(),
    );
    let admin = AdminServer::new(
        cfg.admin_listen_addr.clone(),
        AdminState::new(table.clone())
            .with_pool(tcp_pool.clone())
            .with_pool(udp_pool.clone())
            .with_pool(http_pool.clone())
            .with_pool(ws_pool.clone()),
        shutdown.clone(),
    );

    tokio::spawn(shutdown_signal(shutdown.clone()));

    let served = tokio::try_join!(
        tcp_relay.run(),
        udp_relay.run(),
        http_server.run(),
        ws_server.run(),
        admin.run()
    );
    if let Err(e) = &served {
        tracing::error!("server failed: {:?}", e);
        shutdown.shutdown();
    }

    // ===== SHUTDOWN =====
    let grace = Duration::from_secs(cfg.shutdown_grace_secs);

    // Schedulers stop first
    monitor.stop(grace).await;
    let _ = rebalancer.await;
    let _ = rate_tracker.await;

    // In-flight relays finish, then the final snapshot is written
    shutdown.wait_for_drain(grace).await;
    let _ = persister.await;

    // Pools drain last
    for cleanup in cleanups {
        let _ = cleanup.await;
    }
    tcp_pool.clear().await;
    udp_pool.clear().await;
    http_pool.clear().await;
    ws_pool.clear().await;

    tracing::info!("metric-balancer stopped");
    served.map(|_| ())
}
