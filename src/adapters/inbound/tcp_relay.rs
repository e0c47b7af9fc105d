//! TCP Ingest Relay
//!
//! Accepts `put` lines from metric producers and writes each line to the
//! backend that owns its metric.

use super::error::RelayError;
use crate::adapters::outbound::TcpClientFactory;
use crate::application::AssignmentTable;
use crate::domain::value_objects::Intent;
use crate::infrastructure::{ConnectionPool, ShutdownController};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub const ERR_MSG: &str = "Error storing put metric: ";

/// Metric name of an ingest line `put <metric> <timestamp> <value> <tags>`.
pub fn put_metric(line: &str) -> Result<&str, RelayError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("put"), Some(metric)) => Ok(metric),
        _ => Err(RelayError::InvalidLine(line.to_string())),
    }
}

/// TCP ingest relay - inbound adapter for metric producers.
pub struct TcpRelay {
    table: Arc<AssignmentTable>,
    pool: Arc<ConnectionPool<TcpClientFactory>>,
    listen_addr: String,
    shutdown: ShutdownController,
}

impl TcpRelay {
    pub fn new(
        table: Arc<AssignmentTable>,
        pool: Arc<ConnectionPool<TcpClientFactory>>,
        listen_addr: String,
        shutdown: ShutdownController,
    ) -> Self {
        Self {
            table,
            pool,
            listen_addr,
            shutdown,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("TCP relay listening on {}", self.listen_addr);
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("TCP relay stopped accepting");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            let table = self.table.clone();
            let pool = self.pool.clone();
            let shutdown = self.shutdown.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(table, pool, shutdown, stream, addr).await {
                    tracing::error!("connection error from {}: {:?}", addr, e);
                }
            });
        }
    }

    async fn handle_connection(
        table: Arc<AssignmentTable>,
        pool: Arc<ConnectionPool<TcpClientFactory>>,
        shutdown: ShutdownController,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = lines.next_line() => next?,
            };
            let Some(line) = next else {
                break;
            };
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }

            tracing::trace!("received {} from {}", line, addr);
            if let Err(e) = relay_line(&table, &pool, &shutdown, line).await {
                tracing::error!("error storing put metric {} from {}: {}", line, addr, e);
                writer.write_all(format!("{}{}\n", ERR_MSG, e).as_bytes()).await?;
                writer.flush().await?;
            }
        }
        Ok(())
    }
}

/// Write one `put` line to the backend owning its metric.
pub async fn relay_line(
    table: &AssignmentTable,
    pool: &ConnectionPool<TcpClientFactory>,
    shutdown: &ShutdownController,
    line: &str,
) -> Result<(), RelayError> {
    let _guard = shutdown.relay_guard().ok_or(RelayError::ShuttingDown)?;
    let metric = put_metric(line)?;
    let host = table.resolve(metric, Intent::Ingest)?;

    let mut client = pool.borrow(&host).await?;
    let written = async {
        client.write_line(line).await?;
        client.flush().await
    }
    .await;

    match written {
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
    use crate::infrastructure::{EventBus, PoolConfig};
    use std::time::Duration;

    fn spec(tcp_port: u16) -> HostSpec {
        HostSpec {
            host: "127.0.0.1".to_string(),
            tcp_port,
            http_port: 0,
            ws_port: 0,
            udp_port: 0,
        }
    }

    fn relay_parts(specs: Vec<HostSpec>) -> (Arc<AssignmentTable>, Arc<ConnectionPool<TcpClientFactory>>) {
        let registry = Arc::new(HostRegistry::with_hosts(specs, HealthThresholds::default()));
        let table = Arc::new(AssignmentTable::new(
            registry,
            Arc::new(EventBus::new()),
            AssignmentConfig::default(),
        ));
        let pool = Arc::new(ConnectionPool::new(
            TcpClientFactory::new(Duration::from_millis(500)),
            PoolConfig {
                connect_timeout: Duration::from_millis(500),
                borrow_timeout: Duration::from_millis(500),
                ..PoolConfig::default()
            },
        ));
        (table, pool)
    }

    // ===== Line Parsing Tests =====

    #[test]
    fn test_put_metric() {
        assert_eq!(put_metric("put sys.cpu.user 1 1.0 host=a").unwrap(), "sys.cpu.user");
        assert_eq!(put_metric("  put   sys.mem 1 2").unwrap(), "sys.mem");
        assert!(matches!(put_metric("version"), Err(RelayError::InvalidLine(_))));
        assert!(matches!(put_metric("put"), Err(RelayError::InvalidLine(_))));
    }

    // ===== Relay Tests =====

    #[tokio::test]
    async fn test_relay_line_reaches_owner() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = backend.local_addr().unwrap().port();
        let reader = tokio::spawn(async move {
            let (stream, _) = backend.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            lines.next_line().await.unwrap()
        });

        let (table, pool) = relay_parts(vec![spec(port)]);
        let shutdown = ShutdownController::new();
        relay_line(&table, &pool, &shutdown, "put sys.cpu.user 1 1.0 host=a")
            .await
            .unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), "put sys.cpu.user 1 1.0 host=a");
        assert_eq!(table.get("sys.cpu.user").unwrap().host.tcp_port(), port);
        let stats = pool.stats();
        assert_eq!(stats.borrowed, 1);
        assert_eq!(stats.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_relay_line_backend_down_is_error() {
        let (table, pool) = relay_parts(vec![spec(1)]);
        let shutdown = ShutdownController::new();
        let err = relay_line(&table, &pool, &shutdown, "put sys.cpu.user 1 1.0")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Pool(_)));
    }

    #[tokio::test]
    async fn test_connection_echoes_errors() {
        let (table, pool) = relay_parts(vec![]);
        let shutdown = ShutdownController::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = TcpRelay::new(table, pool, addr.to_string(), shutdown.clone());
        let server = tokio::spawn(async move { relay.serve(listener).await });

        let mut producer = TcpStream::connect(addr).await.unwrap();
        producer.write_all(b"put sys.cpu.user 1 1.0 host=a\n").await.unwrap();
        let mut replies = BufReader::new(producer).lines();
        let reply = tokio::time::timeout(Duration::from_secs(2), replies.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, "Error storing put metric: no backend hosts configured");

        shutdown.shutdown();
        let stopped = tokio::time::timeout(Duration::from_secs(2), server).await.unwrap();
        assert!(stopped.unwrap().is_ok());
    }
}
