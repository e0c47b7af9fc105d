//! Connection Pool
//!
//! Keeps reusable protocol clients per backend host. One pool exists per
//! protocol; the `ClientFactory` supplies the protocol specifics.

use crate::domain::entities::{HostKey, HostRecord};
use crate::domain::events::{BalancerEvent, HostAction};
use crate::domain::ports::{ClientError, ClientFactory, EventListener};
use crate::infrastructure::shutdown::ShutdownController;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum clients per host, idle plus borrowed
    pub max_clients_per_host: usize,
    /// How long a borrower waits for a free slot
    pub borrow_timeout: Duration,
    /// Maximum time a client can sit idle
    pub idle_timeout: Duration,
    /// Maximum client lifetime
    pub max_lifetime: Duration,
    /// Bound on `make` + `activate`
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_clients_per_host: 10,
            borrow_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool exhausted for {0}")]
    PoolExhausted(HostKey),
    #[error("connect to {0} timed out")]
    ConnectTimeout(HostKey),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("connection pool closed")]
    Closed,
}

struct IdleClient<C> {
    client: C,
    created_at: Instant,
    last_used: Instant,
}

impl<C> IdleClient<C> {
    fn is_expired(&self, config: &PoolConfig) -> bool {
        self.created_at.elapsed() > config.max_lifetime || self.last_used.elapsed() > config.idle_timeout
    }
}

/// Per-host pool.
struct HostPool<C> {
    idle: Mutex<VecDeque<IdleClient<C>>>,
    permits: Arc<Semaphore>,
}

impl<C> HostPool<C> {
    fn new(max: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(max.max(1))),
        }
    }

    fn drain(&self) -> Vec<C> {
        self.idle.lock().drain(..).map(|i| i.client).collect()
    }
}

#[derive(Default)]
struct Counters {
    borrowed: AtomicU64,
    released: AtomicU64,
    invalidated: AtomicU64,
    abandoned: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub protocol: String,
    pub hosts: usize,
    pub idle: usize,
    pub borrowed: u64,
    pub released: u64,
    pub invalidated: u64,
    /// Leases dropped without `release` or `invalidate`
    pub abandoned: u64,
    pub created: u64,
    pub destroyed: u64,
}

impl PoolStats {
    /// Leases not yet returned.
    pub fn outstanding(&self) -> u64 {
        self.borrowed
            .saturating_sub(self.released + self.invalidated + self.abandoned)
    }
}

/// A leased client.
///
/// Owns a slot of its host's pool until it is handed back through
/// `ConnectionPool::release` or `ConnectionPool::invalidate`. Dropping it
/// frees the slot too, but the client is closed without being flushed.
pub struct PooledClient<C> {
    client: Option<C>,
    host: Arc<HostRecord>,
    created_at: Instant,
    counters: Arc<Counters>,
    _permit: OwnedSemaphorePermit,
}

impl<C> PooledClient<C> {
    pub fn host(&self) -> &Arc<HostRecord> {
        &self.host
    }
}

impl<C> fmt::Debug for PooledClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledClient")
            .field("host", self.host.key())
            .field("age", &self.created_at.elapsed())
            .field("returned", &self.client.is_none())
            .finish()
    }
}

impl<C> Deref for PooledClient<C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only None after release/invalidate consumed the lease
        self.client.as_ref().unwrap_or_else(|| unreachable!("pooled client used after return"))
    }
}

impl<C> DerefMut for PooledClient<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.client.as_mut().unwrap_or_else(|| unreachable!("pooled client used after return"))
    }
}

impl<C> Drop for PooledClient<C> {
    fn drop(&mut self) {
        if self.client.is_some() {
            self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("pooled client for {} dropped without being returned", self.host.key());
        }
    }
}

/// Connection pool manager for one protocol.
pub struct ConnectionPool<F: ClientFactory> {
    factory: Arc<F>,
    config: PoolConfig,
    pools: Arc<DashMap<HostKey, Arc<HostPool<F::Client>>>>,
    counters: Arc<Counters>,
}

impl<F: ClientFactory> ConnectionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory: Arc::new(factory),
            config,
            pools: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn pool_for(&self, key: &HostKey) -> Arc<HostPool<F::Client>> {
        self.pools
            .entry(key.clone())
            .or_insert_with(|| Arc::new(HostPool::new(self.config.max_clients_per_host)))
            .clone()
    }

    /// Borrow a ready-to-use client for `host`.
    ///
    /// Reuses a valid idle client when one exists, otherwise makes a new
    /// one. Waits up to `borrow_timeout` for a free slot.
    pub async fn borrow(&self, host: &Arc<HostRecord>) -> Result<PooledClient<F::Client>, PoolError> {
        let key = host.key();
        let pool = self.pool_for(key);

        let permit = match tokio::time::timeout(self.config.borrow_timeout, pool.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                tracing::warn!("{} pool exhausted for {}", self.factory.protocol(), key);
                return Err(PoolError::PoolExhausted(key.clone()));
            }
        };

        loop {
            let next = pool.idle.lock().pop_front();
            let Some(idle) = next else {
                break;
            };

            if idle.is_expired(&self.config) || !self.factory.validate(&idle.client, host) {
                tracing::debug!("discarding stale {} client for {}", self.factory.protocol(), key);
                self.destroy(idle.client).await;
                continue;
            }

            let mut client = idle.client;
            if let Err(e) = self.factory.activate(&mut client, host).await {
                self.destroy(client).await;
                return Err(e.into());
            }
            self.counters.borrowed.fetch_add(1, Ordering::Relaxed);
            return Ok(self.lease(client, host, idle.created_at, permit));
        }

        let made = tokio::time::timeout(self.config.connect_timeout, async {
            let mut client = self.factory.make(host).await?;
            match self.factory.activate(&mut client, host).await {
                Ok(()) => Ok(client),
                Err(e) => {
                    self.factory.destroy(client).await;
                    self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
                    Err(e)
                }
            }
        })
        .await;

        let client = match made {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(PoolError::ConnectTimeout(key.clone())),
        };

        self.counters.created.fetch_add(1, Ordering::Relaxed);
        self.counters.borrowed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("new {} client for {}", self.factory.protocol(), key);
        Ok(self.lease(client, host, Instant::now(), permit))
    }

    fn lease(
        &self,
        client: F::Client,
        host: &Arc<HostRecord>,
        created_at: Instant,
        permit: OwnedSemaphorePermit,
    ) -> PooledClient<F::Client> {
        PooledClient {
            client: Some(client),
            host: host.clone(),
            created_at,
            counters: self.counters.clone(),
            _permit: permit,
        }
    }

    /// Return a client after use. Flushes it, then parks it for reuse or
    /// destroys it if it is no longer valid.
    pub async fn release(&self, mut pooled: PooledClient<F::Client>) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        let Some(mut client) = pooled.client.take() else {
            return;
        };

        if let Err(e) = self.factory.passivate(&mut client).await {
            tracing::debug!("{} client for {} failed to flush: {}", self.factory.protocol(), pooled.host.key(), e);
            self.destroy(client).await;
            return;
        }

        let live = self
            .pools
            .get(pooled.host.key())
            .map(|p| p.value().clone());

        match live {
            Some(pool)
                if self.factory.validate(&client, &pooled.host)
                    && pooled.created_at.elapsed() <= self.config.max_lifetime =>
            {
                pool.idle.lock().push_back(IdleClient {
                    client,
                    created_at: pooled.created_at,
                    last_used: Instant::now(),
                });
            }
            _ => self.destroy(client).await,
        }
    }

    /// Destroy a client that must not be reused.
    pub async fn invalidate(&self, mut pooled: PooledClient<F::Client>) {
        self.counters.invalidated.fetch_add(1, Ordering::Relaxed);
        if let Some(client) = pooled.client.take() {
            self.destroy(client).await;
        }
    }

    async fn destroy(&self, client: F::Client) {
        self.factory.destroy(client).await;
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop the pool of a removed host and destroy its idle clients.
    pub async fn evict_host(&self, key: &HostKey) -> usize {
        let Some((_, pool)) = self.pools.remove(key) else {
            return 0;
        };
        let clients = pool.drain();
        let n = clients.len();
        for client in clients {
            self.destroy(client).await;
        }
        tracing::debug!("evicted {} pool for {} ({} idle clients)", self.factory.protocol(), key, n);
        n
    }

    /// Idle clients currently parked for `key`.
    pub fn idle_count(&self, key: &HostKey) -> usize {
        self.pools.get(key).map(|p| p.idle.lock().len()).unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            protocol: self.factory.protocol().to_string(),
            hosts: self.pools.len(),
            idle: self.pools.iter().map(|p| p.idle.lock().len()).sum(),
            borrowed: self.counters.borrowed.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            invalidated: self.counters.invalidated.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            created: self.counters.created.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
        }
    }

    /// Remove expired idle clients from every host pool.
    pub async fn evict_expired(&self) -> usize {
        let mut expired = Vec::new();
        for entry in self.pools.iter() {
            let mut idle = entry.idle.lock();
            let mut keep = VecDeque::with_capacity(idle.len());
            for client in idle.drain(..) {
                if client.is_expired(&self.config) {
                    expired.push(client.client);
                } else {
                    keep.push_back(client);
                }
            }
            *idle = keep;
        }

        let n = expired.len();
        for client in expired {
            self.destroy(client).await;
        }
        if n > 0 {
            tracing::debug!("{} pool cleanup removed {} idle clients", self.factory.protocol(), n);
        }
        n
    }

    /// Start periodic cleanup of idle clients.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration, shutdown: ShutdownController) -> JoinHandle<()> {
        let pool = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.evict_expired().await;
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        })
    }

    /// Destroy every idle client and refuse further borrows.
    pub async fn clear(&self) {
        let pools: Vec<_> = self.pools.iter().map(|p| p.value().clone()).collect();
        self.pools.clear();

        let mut n = 0;
        for pool in pools {
            pool.permits.close();
            for client in pool.drain() {
                self.destroy(client).await;
                n += 1;
            }
        }
        tracing::info!("{} pool cleared, {} idle clients closed", self.factory.protocol(), n);
    }
}

impl<F: ClientFactory> EventListener for ConnectionPool<F> {
    fn on_event(&self, event: &BalancerEvent) {
        let BalancerEvent::Host(e) = event else {
            return;
        };
        if e.action != HostAction::Removed {
            return;
        }
        let Some((_, pool)) = self.pools.remove(&e.host) else {
            return;
        };

        let clients = pool.drain();
        if clients.is_empty() {
            return;
        }
        let factory = self.factory.clone();
        let counters = self.counters.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for client in clients {
                        factory.destroy(client).await;
                        counters.destroyed.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
            Err(_) => {
                counters.destroyed.fetch_add(clients.len() as u64, Ordering::Relaxed);
            }
        }
    }
}
