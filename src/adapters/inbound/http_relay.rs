//! HTTP Relay Handler
//!
//! Finds the backend that owns the metric a query or ingest request names
//! and replays the request against that backend's HTTP port.

use super::error::RelayError;
use crate::adapters::outbound::{HttpClient, HttpClientFactory};
use crate::application::AssignmentTable;
use crate::domain::value_objects::Intent;
use crate::infrastructure::{ConnectionPool, ShutdownController};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::sync::Arc;

pub const PROXIED_ENTITIES_HEADER: &str = "X-ProxiedEntitiesChain";
pub const PROXIED_ISSUERS_HEADER: &str = "X-ProxiedIssuersChain";

const NO_MATCHING_TAGS: &str = "No matching tags";

/// Headers rebuilt for the relayed response.
const RECOMPUTED_RESPONSE_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

/// Certificate identity of the caller, as reported by the TLS terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub subject_dn: String,
    pub issuer_dn: String,
}

/// Protocol-neutral view of an inbound HTTP request.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub method: String,
    pub path_and_query: String,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
    pub client_identity: Option<ClientIdentity>,
}

impl RelayRequest {
    pub fn new(method: impl Into<String>, path_and_query: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path_and_query: path_and_query.into(),
            headers: Vec::new(),
            body: Bytes::new(),
            client_identity: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
        self.client_identity = Some(identity);
        self
    }

    pub fn path(&self) -> &str {
        self.path_and_query.split('?').next().unwrap_or("")
    }

    /// First value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Decoded value of query parameter `name`.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let url = reqwest::Url::parse(&format!("http://relay{}", encode_uri(&self.path_and_query))).ok()?;
        let value = url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned());
        value
    }

    /// Metric this request is about, `None` for host-independent endpoints.
    pub fn metric(&self) -> Option<String> {
        if let Some(m) = self.query_param("m") {
            return metric_from_expression(&m);
        }
        if let Some(metric) = self.query_param("metric") {
            return non_blank(metric);
        }
        if self.body.is_empty() {
            return None;
        }
        let value: serde_json::Value = serde_json::from_slice(&self.body).ok()?;
        metric_from_body(&value)
    }

    pub fn intent(&self) -> Intent {
        if self.path() == "/api/put" {
            Intent::Ingest
        } else {
            Intent::Query
        }
    }
}

/// Relayed backend response.
#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
}

impl RelayResponse {
    /// JSON error response carrying `message`.
    pub fn error(status: u16, message: &str) -> Self {
        let body = Bytes::from(
            serde_json::json!({
                "code": status,
                "message": message,
            })
            .to_string(),
        );
        Self {
            status,
            headers: vec![
                ("content-type".to_string(), b"application/json".to_vec()),
                ("content-length".to_string(), body.len().to_string().into_bytes()),
            ],
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }
}

/// Relays query and ingest HTTP calls to the owning backend.
pub struct HttpRelayHandler {
    table: Arc<AssignmentTable>,
    pool: Arc<ConnectionPool<HttpClientFactory>>,
    shutdown: ShutdownController,
}

impl HttpRelayHandler {
    pub fn new(
        table: Arc<AssignmentTable>,
        pool: Arc<ConnectionPool<HttpClientFactory>>,
        shutdown: ShutdownController,
    ) -> Self {
        Self { table, pool, shutdown }
    }

    /// Relay one request. Never fails: errors become 405, 500 or 503
    /// responses.
    pub async fn relay(&self, request: RelayRequest) -> RelayResponse {
        match self.try_relay(&request).await {
            Ok(response) => response,
            Err(RelayError::MethodNotAllowed(method)) => {
                tracing::debug!("refusing {} {}", method, request.path());
                RelayResponse::error(405, "Method not allowed")
            }
            Err(RelayError::ShuttingDown) => RelayResponse::error(503, "balancer is shutting down"),
            Err(e) => {
                let message = e.to_string();
                if message.contains(NO_MATCHING_TAGS) {
                    tracing::trace!("{} {}: {}", request.method, request.path(), message);
                } else {
                    tracing::error!("relay of {} {} failed: {}", request.method, request.path(), message);
                }
                RelayResponse::error(500, &message)
            }
        }
    }

    async fn try_relay(&self, request: &RelayRequest) -> Result<RelayResponse, RelayError> {
        let _guard = self.shutdown.relay_guard().ok_or(RelayError::ShuttingDown)?;

        let method = match request.method.to_ascii_uppercase().as_str() {
            "GET" => Method::GET,
            "POST" => Method::POST,
            other => return Err(RelayError::MethodNotAllowed(other.to_string())),
        };

        let metric = request.metric();
        let host = self
            .table
            .resolve(metric.as_deref().unwrap_or(""), request.intent())?;

        let client = self.pool.borrow(&host).await?;
        let result = Self::forward(&client, method, request).await;
        self.pool.release(client).await;
        result
    }

    async fn forward(
        client: &HttpClient,
        method: Method,
        request: &RelayRequest,
    ) -> Result<RelayResponse, RelayError> {
        let headers = relayed_headers(request);
        let path = encode_uri(&request.path_and_query);
        let response = client.execute(method, &path, headers, request.body.clone()).await?;

        let status = response.status().as_u16();
        let mut headers: Vec<(String, Vec<u8>)> = response
            .headers()
            .iter()
            .filter(|(name, _)| !RECOMPUTED_RESPONSE_HEADERS.contains(&name.as_str()))
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();
        let body = response.bytes().await?;
        headers.push(("content-length".to_string(), body.len().to_string().into_bytes()));

        if status >= 400 {
            let text = String::from_utf8_lossy(&body);
            if text.contains(NO_MATCHING_TAGS) {
                tracing::trace!("backend {} answered {}: {}", client.base_url(), status, text);
            } else {
                tracing::debug!("backend {} answered {}", client.base_url(), status);
            }
        }

        Ok(RelayResponse { status, headers, body })
    }
}

/// Percent-encode the braces of tag expressions so the path is a valid URI.
pub fn encode_uri(path_and_query: &str) -> String {
    path_and_query.replace('{', "%7B").replace('}', "%7D")
}

/// Metric name of a query expression such as
/// `sum:rate{false,100,0}:sys.cpu.user{host=a}`.
pub fn metric_from_expression(expression: &str) -> Option<String> {
    let mut rest = expression.trim();
    if rest.ends_with('}') {
        if let Some(open) = rest.rfind('{') {
            rest = &rest[..open];
        }
    }
    let metric = rest.rsplit(':').next().unwrap_or("");
    non_blank(metric.to_string())
}

/// Metric named by a JSON query or ingest body.
fn metric_from_body(value: &serde_json::Value) -> Option<String> {
    if let Some(first) = value.as_array().and_then(|a| a.first()) {
        return metric_from_body(first);
    }
    let candidate = value
        .pointer("/queries/0/metric")
        .or_else(|| value.get("metric"))
        .or_else(|| value.get("name"))?
        .as_str()?;
    non_blank(candidate.to_string())
}

fn non_blank(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Headers sent to the backend: inbound headers minus `Content-Length` and
/// `Host`, plus the proxied identity chains when the caller presented a
/// certificate.
pub fn relayed_headers(request: &RelayRequest) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("host") {
            continue;
        }
        if request.client_identity.is_some()
            && (name.eq_ignore_ascii_case(PROXIED_ENTITIES_HEADER) || name.eq_ignore_ascii_case(PROXIED_ISSUERS_HEADER))
        {
            continue;
        }
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_bytes(value)) {
            (Ok(n), Ok(v)) => {
                headers.append(n, v);
            }
            _ => tracing::debug!("dropping invalid header {}", name),
        }
    }

    if let Some(identity) = &request.client_identity {
        let chains = [
            ("x-proxiedentitieschain", PROXIED_ENTITIES_HEADER, &identity.subject_dn),
            ("x-proxiedissuerschain", PROXIED_ISSUERS_HEADER, &identity.issuer_dn),
        ];
        for (key, name, dn) in chains {
            let existing = request.header(name).map(String::from_utf8_lossy).unwrap_or_default();
            match HeaderValue::from_str(&format!("{}<{}>", existing, dn)) {
                Ok(value) => {
                    headers.insert(HeaderName::from_static(key), value);
                }
                Err(e) => tracing::warn!("cannot build {} header: {}", name, e),
            }
        }
    }
    headers
}
