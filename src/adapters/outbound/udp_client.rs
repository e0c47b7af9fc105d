//! UDP Ingest Client
//!
//! Connected UDP socket that buffers one datagram until flushed.

use crate::domain::entities::HostRecord;
use crate::domain::ports::{ClientError, ClientFactory};
use crate::domain::value_objects::Protocol;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::UdpSocket;

pub struct UdpClient {
    addr: String,
    socket: Option<UdpSocket>,
    buffer: Vec<u8>,
}

impl UdpClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            socket: None,
            buffer: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub async fn open(&mut self) -> Result<(), ClientError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let bind = if self.addr.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(&self.addr).await.map_err(|e| ClientError::Connect {
            addr: self.addr.clone(),
            reason: e.to_string(),
        })?;
        self.socket = Some(socket);
        Ok(())
    }

    /// Append a line to the pending datagram.
    pub fn write_line(&mut self, line: &str) {
        self.buffer.extend_from_slice(line.as_bytes());
        if !line.ends_with('\n') {
            self.buffer.push(b'\n');
        }
    }

    /// Send the pending datagram, if any.
    pub async fn flush(&mut self) -> Result<(), ClientError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let socket = self.socket.as_ref().ok_or(ClientError::Closed)?;
        let result = socket.send(&self.buffer).await;
        self.buffer.clear();
        result?;
        Ok(())
    }
}

/// Pool factory for `UdpClient`.
#[derive(Default)]
pub struct UdpClientFactory;

impl UdpClientFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClientFactory for UdpClientFactory {
    type Client = UdpClient;

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    async fn make(&self, host: &Arc<HostRecord>) -> Result<UdpClient, ClientError> {
        Ok(UdpClient::new(host.socket_addr(host.udp_port())))
    }

    async fn activate(&self, client: &mut UdpClient, _host: &Arc<HostRecord>) -> Result<(), ClientError> {
        client.open().await
    }

    async fn passivate(&self, client: &mut UdpClient) -> Result<(), ClientError> {
        client.flush().await
    }

    async fn destroy(&self, mut client: UdpClient) {
        if let Err(e) = client.flush().await {
            tracing::debug!("udp flush on destroy to {} failed: {}", client.addr, e);
        }
    }

    fn validate(&self, client: &UdpClient, host: &HostRecord) -> bool {
        host.is_up() && client.is_open()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_flush_sends_one_datagram() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = backend.local_addr().unwrap();

        let mut client = UdpClient::new(addr.to_string());
        client.open().await.unwrap();
        client.write_line("put sys.cpu.user 1 1.0 host=a");
        client.flush().await.unwrap();

        let mut buf = [0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(1), backend.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"put sys.cpu.user 1 1.0 host=a\n");
    }

    #[tokio::test]
    async fn test_flush_empty_is_noop() {
        let mut client = UdpClient::new("127.0.0.1:9");
        assert!(client.flush().await.is_ok());
    }

    #[tokio::test]
    async fn test_flush_unopened_is_error() {
        let mut client = UdpClient::new("127.0.0.1:9");
        client.write_line("x");
        assert!(matches!(client.flush().await, Err(ClientError::Closed)));
    }
}
