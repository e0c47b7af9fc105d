use crate::application::{AssignmentConfig, RebalanceSchedule};
use crate::domain::entities::{HealthThresholds, HostSpec};
use crate::domain::value_objects::RebalanceWeighting;
use crate::infrastructure::{HealthMonitorConfig, PoolConfig, RetryPolicy};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("control band percentage must be a non-negative number, got {0}")]
    InvalidControlBand(f64),
    #[error("invalid host spec: {0}")]
    InvalidHost(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Backends, as `host:tcp:http:ws:udp`
    pub hosts: Vec<String>,

    // Listeners
    pub tcp_listen_addr: String,
    pub udp_listen_addr: String,
    pub http_listen_addr: String,
    pub ws_listen_addr: String,
    pub admin_listen_addr: String,

    // Health checking
    pub server_failures_before_down: u32,
    pub server_successes_before_up: u32,
    pub check_server_health_interval_ms: u64,
    pub probe_timeout_ms: u64,

    // Assignment and rebalancing
    pub control_band_percentage: f64,
    pub rebalance_weighting: RebalanceWeighting,
    pub rebalance_interval_secs: u64,
    pub rebalance_delay_secs: u64,
    pub balance_window_secs: u64,
    pub assignment_file: Option<String>,
    pub persist_debounce_ms: u64,
    pub rate_interval_secs: u64,

    // Connection pools
    pub tcp_pool_max: usize,
    pub udp_pool_max: usize,
    pub http_pool_max: usize,
    pub ws_pool_max: usize,
    pub pool_borrow_timeout_ms: u64,
    pub connect_timeout_ms: u64,

    // UDP relay
    pub udp_queue_capacity: usize,
    pub udp_max_borrow_attempts: u32,

    // Backend endpoints
    pub http_scheme: String,
    pub http_accept_invalid_certs: bool,
    pub http_request_timeout_ms: u64,
    pub ws_scheme: String,
    pub ws_path: String,

    pub shutdown_grace_secs: u64,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            tcp_listen_addr: "0.0.0.0:4241".to_string(),
            udp_listen_addr: "0.0.0.0:4245".to_string(),
            http_listen_addr: "0.0.0.0:4242".to_string(),
            ws_listen_addr: "0.0.0.0:4243".to_string(),
            admin_listen_addr: "0.0.0.0:4250".to_string(),
            server_failures_before_down: 3,
            server_successes_before_up: 3,
            check_server_health_interval_ms: 10_000,
            probe_timeout_ms: 5_000,
            control_band_percentage: 0.05,
            rebalance_weighting: RebalanceWeighting::Count,
            rebalance_interval_secs: 120,
            rebalance_delay_secs: 600,
            balance_window_secs: 1800,
            assignment_file: None,
            persist_debounce_ms: 1_000,
            rate_interval_secs: 60,
            tcp_pool_max: 10,
            udp_pool_max: 10,
            http_pool_max: 10,
            ws_pool_max: 10,
            pool_borrow_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            udp_queue_capacity: 10_000,
            udp_max_borrow_attempts: 0,
            http_scheme: "https".to_string(),
            http_accept_invalid_certs: false,
            http_request_timeout_ms: 60_000,
            ws_scheme: "wss".to_string(),
            ws_path: "/websocket".to_string(),
            shutdown_grace_secs: 5,
            debug: false,
        }
    }
}

impl Config {
    /// Check values that would make the balancer misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_failures_before_down == 0 {
            return Err(ConfigError::Zero("server failures before down"));
        }
        if self.server_successes_before_up == 0 {
            return Err(ConfigError::Zero("server successes before up"));
        }
        if self.check_server_health_interval_ms == 0 {
            return Err(ConfigError::Zero("health check interval"));
        }
        if !(self.control_band_percentage >= 0.0) {
            return Err(ConfigError::InvalidControlBand(self.control_band_percentage));
        }
        if self.rebalance_interval_secs == 0 {
            return Err(ConfigError::Zero("rebalance interval"));
        }
        for (name, size) in [
            ("tcp pool size", self.tcp_pool_max),
            ("udp pool size", self.udp_pool_max),
            ("http pool size", self.http_pool_max),
            ("ws pool size", self.ws_pool_max),
        ] {
            if size == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        self.host_specs()?;
        Ok(())
    }

    pub fn host_specs(&self) -> Result<Vec<HostSpec>, ConfigError> {
        self.hosts
            .iter()
            .map(|h| h.parse::<HostSpec>().map_err(|e| ConfigError::InvalidHost(e.to_string())))
            .collect()
    }

    pub fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            failures_before_down: self.server_failures_before_down,
            successes_before_up: self.server_successes_before_up,
        }
    }

    pub fn assignment_config(&self) -> AssignmentConfig {
        AssignmentConfig {
            control_band: self.control_band_percentage,
            weighting: self.rebalance_weighting,
            persist_debounce: Duration::from_millis(self.persist_debounce_ms),
        }
    }

    pub fn rebalance_schedule(&self) -> RebalanceSchedule {
        RebalanceSchedule {
            delay: Duration::from_secs(self.rebalance_delay_secs),
            interval: Duration::from_secs(self.rebalance_interval_secs),
            window: Duration::from_secs(self.balance_window_secs),
        }
    }

    pub fn health_monitor_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            interval: Duration::from_millis(self.check_server_health_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }

    pub fn pool_config(&self, max_clients_per_host: usize) -> PoolConfig {
        PoolConfig {
            max_clients_per_host,
            borrow_timeout: Duration::from_millis(self.pool_borrow_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..PoolConfig::default()
        }
    }

    pub fn udp_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.udp_max_borrow_attempts,
            ..RetryPolicy::default()
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

pub fn load_config() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let hosts = std::env::var("BALANCER_HOSTS")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let rebalance_weighting = std::env::var("BALANCER_REBALANCE_WEIGHTING")
        .map(|v| RebalanceWeighting::from_str(&v))
        .unwrap_or_default();

    Ok(Config {
        hosts,
        tcp_listen_addr: env_string("BALANCER_TCP_LISTEN_ADDR", &defaults.tcp_listen_addr),
        udp_listen_addr: env_string("BALANCER_UDP_LISTEN_ADDR", &defaults.udp_listen_addr),
        http_listen_addr: env_string("BALANCER_HTTP_LISTEN_ADDR", &defaults.http_listen_addr),
        ws_listen_addr: env_string("BALANCER_WS_LISTEN_ADDR", &defaults.ws_listen_addr),
        admin_listen_addr: env_string("BALANCER_ADMIN_LISTEN_ADDR", &defaults.admin_listen_addr),
        server_failures_before_down: env_parse(
            "BALANCER_SERVER_FAILURES_BEFORE_DOWN",
            defaults.server_failures_before_down,
        ),
        server_successes_before_up: env_parse(
            "BALANCER_SERVER_SUCCESSES_BEFORE_UP",
            defaults.server_successes_before_up,
        ),
        check_server_health_interval_ms: env_parse(
            "BALANCER_CHECK_SERVER_HEALTH_INTERVAL_MS",
            defaults.check_server_health_interval_ms,
        ),
        probe_timeout_ms: env_parse("BALANCER_PROBE_TIMEOUT_MS", defaults.probe_timeout_ms),
        control_band_percentage: env_parse(
            "BALANCER_CONTROL_BAND_PERCENTAGE",
            defaults.control_band_percentage,
        ),
        rebalance_weighting,
        rebalance_interval_secs: env_parse("BALANCER_REBALANCE_INTERVAL_SECS", defaults.rebalance_interval_secs),
        rebalance_delay_secs: env_parse("BALANCER_REBALANCE_DELAY_SECS", defaults.rebalance_delay_secs),
        balance_window_secs: env_parse("BALANCER_BALANCE_WINDOW_SECS", defaults.balance_window_secs),
        assignment_file: std::env::var("BALANCER_ASSIGNMENT_FILE").ok(),
        persist_debounce_ms: env_parse("BALANCER_PERSIST_DEBOUNCE_MS", defaults.persist_debounce_ms),
        rate_interval_secs: env_parse("BALANCER_RATE_INTERVAL_SECS", defaults.rate_interval_secs),
        tcp_pool_max: env_parse("BALANCER_TCP_POOL_MAX", defaults.tcp_pool_max),
        udp_pool_max: env_parse("BALANCER_UDP_POOL_MAX", defaults.udp_pool_max),
        http_pool_max: env_parse("BALANCER_HTTP_POOL_MAX", defaults.http_pool_max),
        ws_pool_max: env_parse("BALANCER_WS_POOL_MAX", defaults.ws_pool_max),
        pool_borrow_timeout_ms: env_parse("BALANCER_POOL_BORROW_TIMEOUT_MS", defaults.pool_borrow_timeout_ms),
        connect_timeout_ms: env_parse("BALANCER_CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms),
        udp_queue_capacity: env_parse("BALANCER_UDP_QUEUE_CAPACITY", defaults.udp_queue_capacity),
        udp_max_borrow_attempts: env_parse(
            "BALANCER_UDP_MAX_BORROW_ATTEMPTS",
            defaults.udp_max_borrow_attempts,
        ),
        http_scheme: env_string("BALANCER_HTTP_SCHEME", &defaults.http_scheme),
        http_accept_invalid_certs: env_flag("BALANCER_HTTP_ACCEPT_INVALID_CERTS"),
        http_request_timeout_ms: env_parse("BALANCER_HTTP_REQUEST_TIMEOUT_MS", defaults.http_request_timeout_ms),
        ws_scheme: env_string("BALANCER_WS_SCHEME", &defaults.ws_scheme),
        ws_path: env_string("BALANCER_WS_PATH", &defaults.ws_path),
        shutdown_grace_secs: env_parse("BALANCER_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace_secs),
        debug: std::env::var("DEBUG").is_ok(),
    })
}
