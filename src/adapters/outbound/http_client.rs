//! HTTP Backend Client
//!
//! `reqwest` client bound to one backend's HTTP port.

use crate::domain::entities::HostRecord;
use crate::domain::ports::{ClientError, ClientFactory};
use crate::domain::value_objects::Protocol;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;

pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url_for(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self.base_url, path_and_query)
        } else {
            format!("{}/{}", self.base_url, path_and_query)
        }
    }

    pub async fn execute(
        &self,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let url = self.url_for(path_and_query);
        tracing::debug!("relaying {} {}", method, url);
        self.client.request(method, url).headers(headers).body(body).send().await
    }
}

/// Pool factory for `HttpClient`.
pub struct HttpClientFactory {
    scheme: String,
    accept_invalid_certs: bool,
    request_timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(scheme: impl Into<String>, accept_invalid_certs: bool, request_timeout: Duration) -> Self {
        Self {
            scheme: scheme.into(),
            accept_invalid_certs,
            request_timeout,
        }
    }
}

#[async_trait]
impl ClientFactory for HttpClientFactory {
    type Client = HttpClient;

    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn make(&self, host: &Arc<HostRecord>) -> Result<HttpClient, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ClientError::Protocol(format!("http client: {}", e)))?;

        Ok(HttpClient {
            client,
            base_url: format!("{}://{}", self.scheme, host.socket_addr(host.http_port())),
        })
    }

    /// reqwest connects lazily per request.
    async fn activate(&self, _client: &mut HttpClient, _host: &Arc<HostRecord>) -> Result<(), ClientError> {
        Ok(())
    }

    async fn destroy(&self, _client: HttpClient) {}
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::entities::{HealthThresholds, HostSpec};

    #[tokio::test]
    async fn test_base_url_uses_scheme_and_http_port() {
        let host = Arc::new(HostRecord::new(
            HostSpec {
                host: "timely-1".to_string(),
                tcp_port: 4241,
                http_port: 4243,
                ws_port: 4244,
                udp_port: 4245,
            },
            HealthThresholds::default(),
        ));
        let factory = HttpClientFactory::new("https", false, Duration::from_secs(5));
        let client = factory.make(&host).await.unwrap();

        assert_eq!(client.base_url(), "https://timely-1:4243");
        assert_eq!(client.url_for("/api/query"), "https://timely-1:4243/api/query");
        assert_eq!(client.url_for("version"), "https://timely-1:4243/version");
    }
}
