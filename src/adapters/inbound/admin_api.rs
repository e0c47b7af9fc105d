//! Admin API Server
//!
//! HTTP API to push discovery updates, remove hosts, inspect assignments and
//! trigger a manual rebalance.

use crate::application::{AssignmentError, AssignmentTable, DiscoveryOutcome};
use crate::domain::entities::{HostKey, HostSpec, PersistedAssignment};
use crate::domain::events::BalanceType;
use crate::domain::ports::ClientFactory;
use crate::infrastructure::{ConnectionPool, PoolStats, ShutdownController};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

type StatsSource = Arc<dyn Fn() -> PoolStats + Send + Sync>;

/// Host entry of a discovery push: either a spec object or the
/// `host:tcp:http:ws:udp` shorthand.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HostEntry {
    Spec(HostSpec),
    Text(String),
}

/// Host status response.
#[derive(Debug, Serialize)]
pub struct HostView {
    pub host: String,
    pub tcp_port: u16,
    pub http_port: u16,
    pub ws_port: u16,
    pub udp_port: u16,
    pub status: String,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub arrival_rate: f64,
    pub metrics: usize,
}

#[derive(Debug, Serialize)]
pub struct HostsListResponse {
    pub hosts: Vec<HostView>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct AssignmentsListResponse {
    pub assignments: Vec<PersistedAssignment>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub hosts: usize,
    pub up_hosts: usize,
    pub assignments: usize,
}

/// Admin API state.
#[derive(Clone)]
pub struct AdminState {
    pub table: Arc<AssignmentTable>,
    pools: Vec<StatsSource>,
}

impl AdminState {
    pub fn new(table: Arc<AssignmentTable>) -> Self {
        Self {
            table,
            pools: Vec::new(),
        }
    }

    /// Expose the statistics of `pool` under `GET /api/v1/pools`.
    pub fn with_pool<F: ClientFactory>(mut self, pool: Arc<ConnectionPool<F>>) -> Self {
        self.pools.push(Arc::new(move || pool.stats()));
        self
    }

    pub fn host_views(&self) -> Vec<HostView> {
        let counts: HashMap<HostKey, usize> = self.table.counts_by_host().into_iter().collect();
        self.table
            .registry()
            .all()
            .iter()
            .map(|h| HostView {
                host: h.host().to_string(),
                tcp_port: h.tcp_port(),
                http_port: h.http_port(),
                ws_port: h.ws_port(),
                udp_port: h.udp_port(),
                status: h.status().as_str().to_string(),
                consecutive_failures: h.consecutive_failures(),
                consecutive_successes: h.consecutive_successes(),
                arrival_rate: h.arrival_rate(),
                metrics: counts.get(h.key()).copied().unwrap_or(0),
            })
            .collect()
    }

    /// Parse a discovery push. Fails on the first malformed shorthand.
    pub fn parse_hosts(entries: Vec<HostEntry>) -> Result<Vec<HostSpec>, String> {
        entries
            .into_iter()
            .map(|entry| match entry {
                HostEntry::Spec(spec) => Ok(spec),
                HostEntry::Text(text) => text.parse::<HostSpec>().map_err(|e| e.to_string()),
            })
            .collect()
    }
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/hosts", get(list_hosts_handler).put(discovery_handler))
        .route("/api/v1/hosts/:host/:tcp_port", delete(remove_host_handler))
        .route("/api/v1/assignments", get(list_assignments_handler))
        .route("/api/v1/assignments/:metric", get(get_assignment_handler))
        .route("/api/v1/rebalance", post(rebalance_handler))
        .route("/api/v1/pools", get(pools_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Admin API server.
pub struct AdminServer {
    listen_addr: String,
    state: AdminState,
    shutdown: ShutdownController,
}

impl AdminServer {
    pub fn new(listen_addr: String, state: AdminState, shutdown: ShutdownController) -> Self {
        Self {
            listen_addr,
            state,
            shutdown,
        }
    }

    pub fn state(&self) -> AdminState {
        self.state.clone()
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self) -> anyhow::Result<()> {
        let app = admin_router(self.state.clone());
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("admin API listening on {}", self.listen_addr);

        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

// Handler functions

async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let registry = state.table.registry();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        hosts: registry.len(),
        up_hosts: registry.up_hosts().len(),
        assignments: state.table.len(),
    })
}

async fn list_hosts_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let hosts = state.host_views();
    let total = hosts.len();
    Json(HostsListResponse { hosts, total })
}

async fn discovery_handler(
    State(state): State<AdminState>,
    Json(entries): Json<Vec<HostEntry>>,
) -> impl IntoResponse {
    let specs = match AdminState::parse_hosts(entries) {
        Ok(specs) => specs,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e })),
            )
        }
    };

    let outcome: DiscoveryOutcome = state.table.apply_discovery(specs);
    tracing::info!(
        "discovery update: added={} removed={} reassigned={}",
        outcome.added,
        outcome.removed,
        outcome.reassigned
    );
    (StatusCode::OK, Json(serde_json::json!(outcome)))
}

async fn remove_host_handler(
    State(state): State<AdminState>,
    Path((host, tcp_port)): Path<(String, u16)>,
) -> impl IntoResponse {
    let key = HostKey::new(host, tcp_port);
    match state.table.on_host_removed(&key) {
        Ok(reassigned) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "host": key.to_string(),
                "removed": true,
                "reassigned": reassigned
            })),
        ),
        Err(AssignmentError::UnknownHost(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "host": key.to_string(),
                "error": "host not registered"
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn list_assignments_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let assignments = state.table.snapshot();
    let total = assignments.len();
    Json(AssignmentsListResponse { assignments, total })
}

async fn get_assignment_handler(
    State(state): State<AdminState>,
    Path(metric): Path<String>,
) -> impl IntoResponse {
    match state.table.get(&metric) {
        Some(entry) => {
            let row = PersistedAssignment {
                rate: state.table.metric_rate(&metric),
                host: entry.host.host().to_string(),
                tcp_port: entry.host.tcp_port(),
                metric: entry.metric,
                reason: entry.reason,
                assigned_at_ms: entry.assigned_at_ms,
            };
            (StatusCode::OK, Json(serde_json::json!(row)))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "metric": metric,
                "error": "metric not assigned"
            })),
        ),
    }
}

async fn rebalance_handler(State(state): State<AdminState>) -> impl IntoResponse {
    match state.table.rebalance(BalanceType::Manual).await {
        Ok(reassigned) => (
            StatusCode::OK,
            Json(serde_json::json!({ "reassigned": reassigned })),
        ),
        Err(e) => {
            tracing::error!("manual rebalance failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn pools_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let pools: Vec<PoolStats> = state.pools.iter().map(|stats| stats()).collect();
    Json(pools)
}
