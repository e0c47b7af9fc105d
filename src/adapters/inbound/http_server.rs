//! HTTP Relay Server
//!
//! axum front for `HttpRelayHandler`: every path falls through to the relay.

use super::http_relay::{ClientIdentity, HttpRelayHandler, RelayRequest, RelayResponse};
use crate::infrastructure::ShutdownController;
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Subject DN of the caller's certificate, set by the TLS terminator.
pub const SUBJECT_DN_HEADER: &str = "x-ssl-client-s-dn";
/// Issuer DN of the caller's certificate, set by the TLS terminator.
pub const ISSUER_DN_HEADER: &str = "x-ssl-client-i-dn";

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct HttpRelayServer {
    listen_addr: String,
    handler: Arc<HttpRelayHandler>,
    shutdown: ShutdownController,
}

impl HttpRelayServer {
    pub fn new(listen_addr: String, handler: Arc<HttpRelayHandler>, shutdown: ShutdownController) -> Self {
        Self {
            listen_addr,
            handler,
            shutdown,
        }
    }

    pub fn router(&self) -> Router {
        relay_router(self.handler.clone())
    }

    /// Serve until shutdown is signalled.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("HTTP relay listening on {}", self.listen_addr);

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

pub fn relay_router(handler: Arc<HttpRelayHandler>) -> Router {
    Router::new()
        .fallback(relay_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(handler)
}

async fn relay_handler(State(handler): State<Arc<HttpRelayHandler>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response(),
    };

    let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut relay_request = RelayRequest::new(parts.method.as_str(), path_and_query).with_body(body);
    for (name, value) in parts.headers.iter() {
        if name == SUBJECT_DN_HEADER || name == ISSUER_DN_HEADER {
            continue;
        }
        relay_request
            .headers
            .push((name.as_str().to_string(), value.as_bytes().to_vec()));
    }
    relay_request.client_identity = client_identity(&parts.headers);

    into_response(handler.relay(relay_request).await)
}

fn client_identity(headers: &HeaderMap) -> Option<ClientIdentity> {
    let subject_dn = headers.get(SUBJECT_DN_HEADER)?.to_str().ok()?.trim();
    if subject_dn.is_empty() {
        return None;
    }
    let issuer_dn = headers
        .get(ISSUER_DN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim();
    Some(ClientIdentity {
        subject_dn: subject_dn.to_string(),
        issuer_dn: issuer_dn.to_string(),
    })
}

fn into_response(relayed: RelayResponse) -> Response {
    let mut builder = Response::builder().status(relayed.status);
    for (name, value) in &relayed.headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_bytes(value)) {
            (Ok(n), Ok(v)) => builder = builder.header(n, v),
            _ => tracing::debug!("dropping invalid response header {}", name),
        }
    }
    builder
        .body(Body::from(relayed.body))
        .unwrap_or_else(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response())
}
