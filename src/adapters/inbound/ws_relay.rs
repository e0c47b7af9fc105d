//! WebSocket Subscription Relay
//!
//! Each client session may hold several subscriptions. Every metric added to
//! a subscription gets its own backend client on the metric's owner, and
//! backend frames are streamed back to the session unchanged.

use super::error::RelayError;
use crate::adapters::outbound::{WsClient, WsClientFactory, WsOperation};
use crate::application::AssignmentTable;
use crate::domain::value_objects::Intent;
use crate::infrastructure::{ConnectionPool, PooledClient, ShutdownController};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

/// Backend clients of one session: subscription id -> metric -> client.
#[derive(Default)]
pub struct WsSession {
    subscriptions: HashMap<String, HashMap<String, PooledClient<WsClient>>>,
}

impl WsSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Number of backend clients held for `subscription_id`.
    pub fn client_count(&self, subscription_id: &str) -> usize {
        self.subscriptions.get(subscription_id).map_or(0, |c| c.len())
    }
}

pub struct WsRelayHandler {
    table: Arc<AssignmentTable>,
    pool: Arc<ConnectionPool<WsClientFactory>>,
    shutdown: ShutdownController,
    ping_interval: Duration,
}

impl WsRelayHandler {
    pub fn new(
        table: Arc<AssignmentTable>,
        pool: Arc<ConnectionPool<WsClientFactory>>,
        shutdown: ShutdownController,
        ping_interval: Duration,
    ) -> Self {
        Self {
            table,
            pool,
            shutdown,
            ping_interval,
        }
    }

    /// Apply one client operation. Returns `true` when the session should
    /// be closed.
    pub async fn handle_operation(
        &self,
        session: &mut WsSession,
        operation: WsOperation,
        forward: &mpsc::UnboundedSender<String>,
    ) -> Result<bool, RelayError> {
        let _guard = self.shutdown.relay_guard().ok_or(RelayError::ShuttingDown)?;

        match operation {
            WsOperation::Create { subscription_id } => {
                tracing::debug!("create subscription {}", subscription_id);
                session.subscriptions.entry(subscription_id).or_default();
                Ok(false)
            }
            WsOperation::Add {
                subscription_id,
                metric,
                tags,
                start_time,
                end_time,
                delay_time,
            } => {
                let Some(clients) = session.subscriptions.get_mut(&subscription_id) else {
                    tracing::info!("subscription {} not found, create not called?", subscription_id);
                    return Err(RelayError::InvalidOperation("Must call create first".to_string()));
                };

                if !clients.contains_key(&metric) {
                    let host = self.table.resolve(&metric, Intent::Query)?;
                    let mut client = self.pool.borrow(&host).await?;
                    if let Err(e) = client.subscribe(forward.clone()).await {
                        self.pool.invalidate(client).await;
                        return Err(e.into());
                    }
                    tracing::debug!("subscription {} metric {} relayed to {}", subscription_id, metric, host.key());
                    clients.insert(metric.clone(), client);
                }

                let client = clients
                    .get_mut(&metric)
                    .ok_or_else(|| RelayError::InvalidOperation(format!("no client for {}", metric)))?;
                client.add(&metric, tags, start_time, end_time, delay_time).await?;
                Ok(false)
            }
            WsOperation::Remove {
                subscription_id,
                metric,
            } => {
                match session
                    .subscriptions
                    .get_mut(&subscription_id)
                    .and_then(|clients| clients.get_mut(&metric))
                {
                    Some(client) => client.remove(&metric).await?,
                    None => tracing::info!(
                        "client not found for subscription {} metric {}",
                        subscription_id,
                        metric
                    ),
                }
                Ok(false)
            }
            WsOperation::Close { subscription_id } => {
                if let Some(clients) = session.subscriptions.remove(&subscription_id) {
                    self.release_clients(clients).await;
                }
                Ok(true)
            }
        }
    }

    /// Give every backend client of the session back to the pool.
    pub async fn end_session(&self, session: &mut WsSession) {
        for (subscription_id, clients) in session.subscriptions.drain() {
            tracing::debug!("session closed, closing subscription {}", subscription_id);
            self.release_clients(clients).await;
        }
    }

    async fn release_clients(&self, clients: HashMap<String, PooledClient<WsClient>>) {
        for (_, client) in clients {
            self.pool.release(client).await;
        }
    }

    /// Drive one client WebSocket until either side closes.
    pub async fn run_session(self: Arc<Self>, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();
        let (forward, mut backend_frames) = mpsc::unbounded_channel::<String>();
        let mut session = WsSession::new();
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + self.ping_interval, self.ping_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                Some(text) = backend_frames.recv() => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            tracing::debug!("websocket session read failed: {}", e);
                            break;
                        }
                    };

                    let outcome = match serde_json::from_str::<WsOperation>(&text) {
                        Ok(operation) => self.handle_operation(&mut session, operation, &forward).await,
                        Err(e) => Err(RelayError::InvalidOperation(format!("invalid subscription request: {}", e))),
                    };

                    match outcome {
                        Ok(false) => {}
                        Ok(true) => {
                            let _ = sink
                                .send(Message::Close(Some(CloseFrame {
                                    code: 1000,
                                    reason: "Client requested close.".into(),
                                })))
                                .await;
                            break;
                        }
                        Err(e) => {
                            tracing::error!("websocket operation failed: {}", e);
                            if sink.send(Message::Text(error_frame(&e))).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.end_session(&mut session).await;
    }
}

/// JSON error frame sent to the client.
pub fn error_frame(error: &RelayError) -> String {
    let code = match error {
        RelayError::InvalidOperation(_) => 400,
        RelayError::ShuttingDown => 503,
        _ => 500,
    };
    serde_json::json!({
        "code": code,
        "message": error.to_string(),
    })
    .to_string()
}

pub struct WsRelayServer {
    listen_addr: String,
    path: String,
    handler: Arc<WsRelayHandler>,
    shutdown: ShutdownController,
}

impl WsRelayServer {
    pub fn new(listen_addr: String, path: String, handler: Arc<WsRelayHandler>, shutdown: ShutdownController) -> Self {
        Self {
            listen_addr,
            path,
            handler,
            shutdown,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.path, get(upgrade_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.handler.clone())
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("WebSocket relay listening on {}{}", self.listen_addr, self.path);

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn upgrade_handler(State(handler): State<Arc<WsRelayHandler>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handler.run_session(socket))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::application::{AssignmentConfig, HostRegistry};
    use crate::domain::entities::{HealthThresholds, HostSpec};
    use crate::infrastructure::{EventBus, PoolConfig};
    use tokio_tungstenite::tungstenite::Message as BackendMessage;

    /// Backend that records every operation and answers `add` with a data
    /// frame naming the metric.
    async fn spawn_backend() -> (u16, mpsc::UnboundedReceiver<serde_json::Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen_tx = seen_tx.clone();
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    while let Some(Ok(msg)) = ws.next().await {
                        if let BackendMessage::Text(text) = msg {
                            let op: serde_json::Value = serde_json::from_str(&text).unwrap();
                            if op["operation"] == "add" {
                                let data = serde_json::json!({"metric": op["metric"], "value": 1.0});
                                let _ = ws.send(BackendMessage::Text(data.to_string())).await;
                            }
                            let _ = seen_tx.send(op);
                        }
                    }
                });
            }
        });
        (port, seen_rx)
    }

    fn handler_for(ws_port: u16) -> (WsRelayHandler, Arc<ConnectionPool<WsClientFactory>>) {
        let spec = HostSpec {
            host: "127.0.0.1".to_string(),
            tcp_port: 4241,
            http_port: 0,
            ws_port,
            udp_port: 0,
        };
        let registry = Arc::new(HostRegistry::with_hosts(vec![spec], HealthThresholds::default()));
        let table = Arc::new(AssignmentTable::new(
            registry,
            Arc::new(EventBus::new()),
            AssignmentConfig::default(),
        ));
        let pool = Arc::new(ConnectionPool::new(
            WsClientFactory::new("ws", "/websocket", Duration::from_secs(1)),
            PoolConfig::default(),
        ));
        let handler = WsRelayHandler::new(table, pool.clone(), ShutdownController::new(), Duration::from_secs(30));
        (handler, pool)
    }

    fn add(subscription_id: &str, metric: &str) -> WsOperation {
        WsOperation::Add {
            subscription_id: subscription_id.to_string(),
            metric: metric.to_string(),
            tags: None,
            start_time: None,
            end_time: None,
            delay_time: None,
        }
    }

    #[tokio::test]
    async fn test_add_without_create_is_rejected() {
        let (handler, _) = handler_for(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = WsSession::new();

        let err = handler
            .handle_operation(&mut session, add("s1", "sys.cpu.user"), &tx)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Must call create first");
        assert!(error_frame(&err).contains("\"code\":400"));
    }

    #[tokio::test]
    async fn test_subscription_lifecycle() {
        let (port, mut seen) = spawn_backend().await;
        let (handler, pool) = handler_for(port);
        let (tx, mut frames) = mpsc::unbounded_channel();
        let mut session = WsSession::new();

        let create = WsOperation::Create {
            subscription_id: "s1".to_string(),
        };
        assert!(!handler.handle_operation(&mut session, create, &tx).await.unwrap());
        handler
            .handle_operation(&mut session, add("s1", "sys.cpu.user"), &tx)
            .await
            .unwrap();
        // a second add for the same metric reuses the client
        handler
            .handle_operation(&mut session, add("s1", "sys.cpu.user"), &tx)
            .await
            .unwrap();
        assert_eq!(session.client_count("s1"), 1);

        let created = tokio::time::timeout(Duration::from_secs(2), seen.recv()).await.unwrap().unwrap();
        assert_eq!(created["operation"], "create");
        let added = seen.recv().await.unwrap();
        assert_eq!(added["metric"], "sys.cpu.user");

        let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv()).await.unwrap().unwrap();
        let data: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(data["metric"], "sys.cpu.user");

        let close = WsOperation::Close {
            subscription_id: "s1".to_string(),
        };
        assert!(handler.handle_operation(&mut session, close, &tx).await.unwrap());
        assert_eq!(session.subscription_count(), 0);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_end_session_releases_clients() {
        let (port, _seen) = spawn_backend().await;
        let (handler, pool) = handler_for(port);
        let (tx, _frames) = mpsc::unbounded_channel();
        let mut session = WsSession::new();

        for id in ["a", "b"] {
            let create = WsOperation::Create {
                subscription_id: id.to_string(),
            };
            handler.handle_operation(&mut session, create, &tx).await.unwrap();
            handler.handle_operation(&mut session, add(id, "sys.mem.free"), &tx).await.unwrap();
        }
        assert_eq!(pool.stats().outstanding(), 2);

        handler.end_session(&mut session).await;
        assert_eq!(session.subscription_count(), 0);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_metric_is_ignored() {
        let (handler, _) = handler_for(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = WsSession::new();
        let remove = WsOperation::Remove {
            subscription_id: "s1".to_string(),
            metric: "m".to_string(),
        };
        assert!(!handler.handle_operation(&mut session, remove, &tx).await.unwrap());
    }
}
