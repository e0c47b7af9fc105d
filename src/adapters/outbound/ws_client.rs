//! WebSocket Subscription Client
//!
//! Holds one subscription on a backend's WebSocket endpoint and forwards
//! every text frame the backend sends to the session that owns the lease.

use crate::domain::entities::HostRecord;
use crate::domain::ports::{ClientError, ClientFactory};
use crate::domain::value_objects::Protocol;
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Default delay between subscription pushes, in milliseconds.
pub const DEFAULT_DELAY_TIME_MS: u64 = 5000;

/// Subscription control message, as exchanged with both clients and
/// backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum WsOperation {
    #[serde(rename_all = "camelCase")]
    Create { subscription_id: String },
    #[serde(rename_all = "camelCase")]
    Add {
        subscription_id: String,
        metric: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tags: Option<BTreeMap<String, String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_time: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Remove { subscription_id: String, metric: String },
    #[serde(rename_all = "camelCase")]
    Close { subscription_id: String },
}

impl WsOperation {
    pub fn subscription_id(&self) -> &str {
        match self {
            Self::Create { subscription_id }
            | Self::Add { subscription_id, .. }
            | Self::Remove { subscription_id, .. }
            | Self::Close { subscription_id } => subscription_id,
        }
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type Forward = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

pub struct WsClient {
    url: String,
    subscription_id: Option<String>,
    sink: Option<WsSink>,
    forward: Forward,
    reader: Option<JoinHandle<()>>,
    closed: Arc<AtomicBool>,
}

impl WsClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subscription_id: None,
            sink: None,
            forward: Arc::new(Mutex::new(None)),
            reader: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some() && !self.closed.load(Ordering::SeqCst)
    }

    /// Backend-side id of the current subscription.
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    /// Connect if not already connected.
    pub async fn connect(&mut self, timeout: Duration) -> Result<(), ClientError> {
        if self.is_open() {
            return Ok(());
        }
        self.shutdown_reader();

        let (stream, _) = match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(self.url.as_str())).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(ClientError::Connect {
                    addr: self.url.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ClientError::Connect {
                    addr: self.url.clone(),
                    reason: "connection timeout".to_string(),
                })
            }
        };

        let (sink, mut source) = stream.split();
        let forward = self.forward.clone();
        let closed = Arc::new(AtomicBool::new(false));
        let closed_flag = closed.clone();
        let url = self.url.clone();

        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if let Some(tx) = forward.lock().as_ref() {
                            let _ = tx.send(text);
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("websocket read from {} failed: {}", url, e);
                        break;
                    }
                }
            }
            closed_flag.store(true, Ordering::SeqCst);
        });

        self.sink = Some(sink);
        self.closed = closed;
        self.reader = Some(reader);
        Ok(())
    }

    /// Start a new backend subscription whose frames go to `forward`.
    pub async fn subscribe(&mut self, forward: mpsc::UnboundedSender<String>) -> Result<String, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        *self.forward.lock() = Some(forward);
        self.send(&WsOperation::Create {
            subscription_id: id.clone(),
        })
        .await?;
        self.subscription_id = Some(id.clone());
        Ok(id)
    }

    /// Send an `add` for `metric` on the current subscription.
    pub async fn add(
        &mut self,
        metric: &str,
        tags: Option<BTreeMap<String, String>>,
        start_time: Option<u64>,
        end_time: Option<u64>,
        delay_time: Option<u64>,
    ) -> Result<(), ClientError> {
        let subscription_id = self.subscription_id.clone().ok_or(ClientError::Closed)?;
        self.send(&WsOperation::Add {
            subscription_id,
            metric: metric.to_string(),
            tags,
            start_time,
            end_time,
            delay_time: Some(delay_time.unwrap_or(DEFAULT_DELAY_TIME_MS)),
        })
        .await
    }

    pub async fn remove(&mut self, metric: &str) -> Result<(), ClientError> {
        let subscription_id = self.subscription_id.clone().ok_or(ClientError::Closed)?;
        self.send(&WsOperation::Remove {
            subscription_id,
            metric: metric.to_string(),
        })
        .await
    }

    /// Close the backend subscription and stop forwarding. The socket
    /// stays open for reuse.
    pub async fn unsubscribe(&mut self) -> Result<(), ClientError> {
        *self.forward.lock() = None;
        let Some(subscription_id) = self.subscription_id.take() else {
            return Ok(());
        };
        if !self.is_open() {
            return Ok(());
        }
        self.send(&WsOperation::Close { subscription_id }).await
    }

    async fn send(&mut self, op: &WsOperation) -> Result<(), ClientError> {
        let text = serde_json::to_string(op).map_err(|e| ClientError::Protocol(e.to_string()))?;
        let sink = self.sink.as_mut().ok_or(ClientError::Closed)?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| ClientError::Protocol(format!("websocket send to {}: {}", self.url, e)))
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.unsubscribe().await {
            tracing::debug!("websocket unsubscribe on {} failed: {}", self.url, e);
        }
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.close().await;
        }
        self.shutdown_reader();
    }

    fn shutdown_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.sink = None;
    }
}

/// Pool factory for `WsClient`.
pub struct WsClientFactory {
    scheme: String,
    path: String,
    connect_timeout: Duration,
}

impl WsClientFactory {
    pub fn new(scheme: impl Into<String>, path: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            scheme: scheme.into(),
            path: path.into(),
            connect_timeout,
        }
    }

    pub fn url_for(&self, host: &HostRecord) -> String {
        format!("{}://{}{}", self.scheme, host.socket_addr(host.ws_port()), self.path)
    }
}

#[async_trait]
impl ClientFactory for WsClientFactory {
    type Client = WsClient;

    fn protocol(&self) -> Protocol {
        Protocol::WebSocket
    }

    async fn make(&self, host: &Arc<HostRecord>) -> Result<WsClient, ClientError> {
        Ok(WsClient::new(self.url_for(host)))
    }

    async fn activate(&self, client: &mut WsClient, _host: &Arc<HostRecord>) -> Result<(), ClientError> {
        client.connect(self.connect_timeout).await
    }

    async fn passivate(&self, client: &mut WsClient) -> Result<(), ClientError> {
        client.unsubscribe().await
    }

    async fn destroy(&self, mut client: WsClient) {
        client.close().await;
    }

    fn validate(&self, client: &WsClient, host: &HostRecord) -> bool {
        host.is_up() && client.is_open()
    }
}
