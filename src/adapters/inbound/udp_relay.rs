//! UDP Ingest Relay
//!
//! The socket task only reads datagrams and queues them; a dedicated worker
//! resolves, borrows with backoff and writes. A full queue drops the
//! datagram.

use super::error::RelayError;
use super::tcp_relay::{put_metric, ERR_MSG};
use crate::adapters::outbound::UdpClientFactory;
use crate::application::AssignmentTable;
use crate::domain::value_objects::Intent;
use crate::infrastructure::{ConnectionPool, RetryPolicy, ShutdownController};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};

const MAX_DATAGRAM: usize = 65_536;

#[derive(Debug, Clone)]
pub struct UdpRelayConfig {
    /// Datagrams waiting for the worker before new ones are dropped
    pub queue_capacity: usize,
    /// Backoff between borrow attempts
    pub retry: RetryPolicy,
}

impl Default for UdpRelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

struct Datagram {
    text: String,
    from: SocketAddr,
}

pub struct UdpRelay {
    table: Arc<AssignmentTable>,
    pool: Arc<ConnectionPool<UdpClientFactory>>,
    listen_addr: String,
    config: UdpRelayConfig,
    shutdown: ShutdownController,
    dropped: Arc<AtomicU64>,
}

impl UdpRelay {
    pub fn new(
        table: Arc<AssignmentTable>,
        pool: Arc<ConnectionPool<UdpClientFactory>>,
        listen_addr: String,
        config: UdpRelayConfig,
        shutdown: ShutdownController,
    ) -> Self {
        Self {
            table,
            pool,
            listen_addr,
            config,
            shutdown,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Datagrams dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let socket = UdpSocket::bind(&self.listen_addr).await?;
        tracing::info!("UDP relay listening on {}", self.listen_addr);
        self.serve(socket).await
    }

    /// Read datagrams from `socket` until shutdown, then let the worker
    /// finish the queue.
    pub async fn serve(&self, socket: UdpSocket) -> anyhow::Result<()> {
        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let worker = tokio::spawn(Self::work(
            self.table.clone(),
            self.pool.clone(),
            self.config.retry,
            self.shutdown.clone(),
            socket.clone(),
            rx,
        ));

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };
            let (n, from) = match received {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("udp receive failed: {}", e);
                    continue;
                }
            };

            let datagram = Datagram {
                text: String::from_utf8_lossy(&buf[..n]).into_owned(),
                from,
            };
            match tx.try_send(datagram) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!("udp relay queue full, dropped datagram from {} (total {})", from, dropped);
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }

        drop(tx);
        if let Err(e) = worker.await {
            tracing::error!("udp relay worker failed: {}", e);
        }
        tracing::info!("UDP relay stopped");
        Ok(())
    }

    async fn work(
        table: Arc<AssignmentTable>,
        pool: Arc<ConnectionPool<UdpClientFactory>>,
        retry: RetryPolicy,
        shutdown: ShutdownController,
        socket: Arc<UdpSocket>,
        mut rx: mpsc::Receiver<Datagram>,
    ) {
        while let Some(datagram) = rx.recv().await {
            for line in datagram.text.lines() {
                let line = line.trim_end_matches('\r');
                if line.trim().is_empty() {
                    continue;
                }
                match relay_line(&table, &pool, retry, &shutdown, line).await {
                    Ok(()) => {}
                    Err(e @ RelayError::Client(_)) => {
                        tracing::error!("error storing put metric {} from {}: {}", line, datagram.from, e);
                        let reply = format!("{}{}\n", ERR_MSG, e);
                        if let Err(e) = socket.send_to(reply.as_bytes(), datagram.from).await {
                            tracing::debug!("udp error reply to {} failed: {}", datagram.from, e);
                        }
                    }
                    Err(e) => tracing::error!("error storing put metric {} from {}: {}", line, datagram.from, e),
                }
            }
        }
    }
}

/// Write one `put` line, retrying the borrow with backoff.
///
/// Every attempt resolves the metric again, so a retry follows the metric
/// to its new owner after a failover.
pub async fn relay_line(
    table: &AssignmentTable,
    pool: &ConnectionPool<UdpClientFactory>,
    retry: RetryPolicy,
    shutdown: &ShutdownController,
    line: &str,
) -> Result<(), RelayError> {
    let _guard = shutdown.relay_guard().ok_or(RelayError::ShuttingDown)?;
    let metric = put_metric(line)?;

    let mut attempt = 0;
    let mut client = loop {
        attempt += 1;
        // The owner may have failed over while we were backing off
        let host = table.resolve(metric, Intent::Ingest)?;
        match pool.borrow(&host).await {
            Ok(client) => break client,
            Err(e) if retry.should_retry(attempt) => {
                let delay = retry.delay(attempt);
                tracing::warn!(
                    "udp borrow for {} failed (attempt {}): {}, retrying in {:?}",
                    host.key(),
                    attempt,
                    e,
                    delay
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(RelayError::ShuttingDown),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e.into()),
        }
    };

    client.write_line(line);
    match client.flush().await {
        Ok(()) => {
            pool.release(client).await;
            Ok(())
        }
        Err(e) => {
            pool.invalidate(client).await;
            Err(e.into())
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::application::{AssignmentConfig, HostRegistry};
    use crate::domain::entities::{HealthThresholds, HostSpec};
    use crate::domain::value_objects::HostStatus;
    use crate::infrastructure::{EventBus, PoolConfig};
    use std::time::Duration;

    // ===== Test Helpers =====

    fn udp_spec(tcp_port: u16, udp_port: u16) -> HostSpec {
        HostSpec {
            host: "127.0.0.1".to_string(),
            tcp_port,
            http_port: 0,
            ws_port: 0,
            udp_port,
        }
    }

    fn table_with(specs: Vec<HostSpec>) -> Arc<AssignmentTable> {
        let thresholds = HealthThresholds {
            failures_before_down: 1,
            successes_before_up: 1,
        };
        let registry = Arc::new(HostRegistry::with_hosts(specs, thresholds));
        Arc::new(AssignmentTable::new(
            registry,
            Arc::new(EventBus::new()),
            AssignmentConfig::default(),
        ))
    }

    fn table_with_udp_port(udp_port: u16) -> Arc<AssignmentTable> {
        table_with(vec![udp_spec(4241, udp_port)])
    }

    /// One client per host and a short borrow timeout, so a held lease
    /// exhausts the host.
    fn single_slot_pool() -> Arc<ConnectionPool<UdpClientFactory>> {
        Arc::new(ConnectionPool::new(
            UdpClientFactory::new(),
            PoolConfig {
                max_clients_per_host: 1,
                borrow_timeout: Duration::from_millis(10),
                ..PoolConfig::default()
            },
        ))
    }

    async fn recv_line(backend: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(2), backend.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf[..n].to_vec()
    }

    // ===== Relay Line Tests =====

    #[tokio::test]
    async fn test_relay_line_sends_datagram() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let table = table_with_udp_port(backend.local_addr().unwrap().port());
        let pool = ConnectionPool::new(UdpClientFactory::new(), PoolConfig::default());
        let shutdown = ShutdownController::new();

        relay_line(&table, &pool, RetryPolicy::default(), &shutdown, "put sys.cpu.user 1 1.0")
            .await
            .unwrap();

        assert_eq!(recv_line(&backend).await, b"put sys.cpu.user 1 1.0\n");
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_relay_line_gives_up_after_max_attempts() {
        let table = table_with_udp_port(9);
        let pool = single_slot_pool();
        let owner = table.resolve("m", Intent::Ingest).unwrap();
        let held = pool.borrow(&owner).await.unwrap();

        let retry = RetryPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(10),
            max_attempts: 3,
        };
        let err = relay_line(&table, &pool, retry, &ShutdownController::new(), "put m 1 1")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Pool(_)));

        pool.release(held).await;
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_retry_follows_metric_after_failover() {
        let backend_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let table = table_with(vec![
            udp_spec(4241, backend_a.local_addr().unwrap().port()),
            udp_spec(4251, backend_b.local_addr().unwrap().port()),
        ]);
        let pool = single_slot_pool();

        let owner = table.resolve("sys.cpu.user", Intent::Ingest).unwrap();
        let held = pool.borrow(&owner).await.unwrap();

        let retry = RetryPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
            max_attempts: 0,
        };
        let shutdown = ShutdownController::new();
        let relaying = {
            let (table, pool, shutdown) = (table.clone(), pool.clone(), shutdown.clone());
            tokio::spawn(async move {
                relay_line(&table, &pool, retry, &shutdown, "put sys.cpu.user 1 1.0").await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!relaying.is_finished());

        assert_eq!(owner.report_failure(), Some(HostStatus::Down));
        assert_eq!(table.on_host_down(owner.key()), 1);

        tokio::time::timeout(Duration::from_secs(2), relaying)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let survivor = if owner.tcp_port() == 4241 { &backend_b } else { &backend_a };
        assert_eq!(recv_line(survivor).await, b"put sys.cpu.user 1 1.0\n");

        pool.release(held).await;
    }

    // ===== Queue Tests =====

    #[tokio::test]
    async fn test_full_queue_drops_datagrams() {
        let table = table_with_udp_port(9);
        let pool = single_slot_pool();
        // The worker blocks on the first datagram while this lease is out
        let owner = table.resolve("sys.cpu.user", Intent::Ingest).unwrap();
        let held = pool.borrow(&owner).await.unwrap();

        let shutdown = ShutdownController::new();
        let relay = Arc::new(UdpRelay::new(
            table,
            pool.clone(),
            "127.0.0.1:0".to_string(),
            UdpRelayConfig {
                queue_capacity: 1,
                retry: RetryPolicy::default(),
            },
            shutdown.clone(),
        ));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let serving = relay.clone();
        let server = tokio::spawn(async move { serving.serve(socket).await });

        let producer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for _ in 0..5 {
            producer.send_to(b"put sys.cpu.user 1 1.0", addr).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while relay.dropped() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(relay.dropped() >= 1);

        shutdown.shutdown();
        let stopped = tokio::time::timeout(Duration::from_secs(2), server).await.unwrap();
        assert!(stopped.unwrap().is_ok());

        pool.release(held).await;
    }
}
