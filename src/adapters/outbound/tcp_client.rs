//! TCP Ingest Client
//!
//! Buffered line writer to a backend's ingest port, plus its pool factory.

use crate::domain::entities::HostRecord;
use crate::domain::ports::{ClientError, ClientFactory};
use crate::domain::value_objects::Protocol;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

/// Buffered TCP connection to one backend.
pub struct TcpClient {
    addr: String,
    writer: Option<BufWriter<TcpStream>>,
}

impl TcpClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            writer: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Connect if not already connected. A connection the peer has closed
    /// is replaced.
    pub async fn open(&mut self, timeout: Duration) -> Result<(), ClientError> {
        if let Some(writer) = &self.writer {
            if !peer_closed(writer.get_ref()) {
                return Ok(());
            }
            tracing::debug!("tcp peer {} closed, reconnecting", self.addr);
            self.writer = None;
        }

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ClientError::Connect {
                    addr: self.addr.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ClientError::Connect {
                    addr: self.addr.clone(),
                    reason: "connection timeout".to_string(),
                })
            }
        };
        let _ = stream.set_nodelay(true);
        self.writer = Some(BufWriter::new(stream));
        Ok(())
    }

    /// Buffer one line, appending the newline if missing.
    pub async fn write_line(&mut self, line: &str) -> Result<(), ClientError> {
        let writer = self.writer.as_mut().ok_or(ClientError::Closed)?;
        writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            writer.write_all(b"\n").await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), ClientError> {
        match self.writer.as_mut() {
            Some(writer) => Ok(writer.flush().await?),
            None => Ok(()),
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush().await {
                tracing::debug!("flush on close to {} failed: {}", self.addr, e);
            }
            let _ = writer.shutdown().await;
        }
    }
}

/// Non-blocking check for EOF on an idle connection.
fn peer_closed(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match stream.try_read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    }
}

/// Pool factory for `TcpClient`.
pub struct TcpClientFactory {
    connect_timeout: Duration,
}

impl TcpClientFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ClientFactory for TcpClientFactory {
    type Client = TcpClient;

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn make(&self, host: &Arc<HostRecord>) -> Result<TcpClient, ClientError> {
        Ok(TcpClient::new(host.socket_addr(host.tcp_port())))
    }

    async fn activate(&self, client: &mut TcpClient, _host: &Arc<HostRecord>) -> Result<(), ClientError> {
        client.open(self.connect_timeout).await
    }

    async fn passivate(&self, client: &mut TcpClient) -> Result<(), ClientError> {
        client.flush().await
    }

    async fn destroy(&self, mut client: TcpClient) {
        client.close().await;
    }

    fn validate(&self, client: &TcpClient, host: &HostRecord) -> bool {
        host.is_up() && client.is_open()
    }
}
