//! Pool manager: pools keyed by `(protocol, endpoint)`
//!
//! Creates pools on demand, owns the per-endpoint circuit breakers, and
//! registers the sweeping and scaling jobs with the shared scheduler.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::config::PoolConfig;
use super::connection::ConnectionFactory;
use super::domain_types::{AcquireRequest, Lease, LeaseId, LeaseUsage, PoolMetrics};
use super::pool::ConnectionPool;
use crate::domain_types::{EndpointAddress, ProtocolId};
use crate::error::CommError;
use crate::scheduler::{PeriodicJob, Scheduler};
use crate::time_provider::TimeProvider;

/// Owns every connection pool in the core
pub struct PoolManager {
    pools: DashMap<(ProtocolId, EndpointAddress), Arc<ConnectionPool>>,
    default_config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    time: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

impl PoolManager {
    /// Creates a manager with a default per-pool configuration
    #[must_use]
    pub fn new(
        default_config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        time: Arc<dyn TimeProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pools: DashMap::new(),
            default_config,
            factory,
            time,
        })
    }

    /// Leases a connection, creating the pool on first use
    ///
    /// # Errors
    /// Propagates pool errors; see [`ConnectionPool::acquire`].
    pub async fn acquire(self: &Arc<Self>, request: &AcquireRequest) -> Result<Lease, CommError> {
        let pool = self.pool_for(&request.protocol, &request.endpoint).await?;
        pool.acquire(request).await
    }

    /// Releases a lease back to its pool; idempotent
    pub fn release(&self, lease: &Lease, usage: Option<LeaseUsage>) {
        if let Some(pool) = self.find_pool_by_id(lease) {
            pool.release(lease.lease_id, usage);
        }
    }

    /// Releases by lease id alone, scanning pools; prefer [`release`](Self::release)
    pub fn release_by_id(&self, lease_id: LeaseId) {
        for entry in &self.pools {
            entry.value().release(lease_id, None);
        }
    }

    /// The pool serving a `(protocol, endpoint)` pair, creating it on demand
    ///
    /// # Errors
    /// Propagates initialization failure of a brand-new pool.
    pub async fn pool_for(
        self: &Arc<Self>,
        protocol: &ProtocolId,
        endpoint: &EndpointAddress,
    ) -> Result<Arc<ConnectionPool>, CommError> {
        let key = (protocol.clone(), endpoint.clone());
        if let Some(pool) = self.pools.get(&key) {
            return Ok(Arc::clone(pool.value()));
        }

        let pool = ConnectionPool::new(
            protocol.clone(),
            endpoint.clone(),
            self.default_config.clone(),
            Arc::clone(&self.factory),
            Arc::clone(&self.time),
        );
        // First writer wins; a racing creator's pool is dropped unused.
        let entry = self.pools.entry(key).or_insert_with(|| Arc::clone(&pool));
        let pool = Arc::clone(entry.value());
        drop(entry);

        // Initialization failure leaves the pool degraded but registered, so
        // callers share the same (recovering) pool instead of stampeding.
        if pool.metrics().total_connections == 0 {
            if let Err(err) = pool.initialize().await {
                debug!(endpoint = %endpoint, error = %err, "pool initialized degraded");
            }
        }
        info!(%protocol, %endpoint, "pool ready");
        Ok(pool)
    }

    /// Existing pool for a pair, if any
    #[must_use]
    pub fn existing_pool(
        &self,
        protocol: &ProtocolId,
        endpoint: &EndpointAddress,
    ) -> Option<Arc<ConnectionPool>> {
        self.pools
            .get(&(protocol.clone(), endpoint.clone()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Whether the breaker for an endpoint currently blocks traffic
    #[must_use]
    pub fn endpoint_open(&self, endpoint: &EndpointAddress) -> bool {
        self.pools
            .iter()
            .filter(|entry| entry.key().1 == *endpoint)
            .any(|entry| entry.value().breaker().is_open())
    }

    /// The default configuration applied to new pools
    #[must_use]
    pub fn default_config(&self) -> &PoolConfig {
        &self.default_config
    }

    /// Metrics for every pool
    #[must_use]
    pub fn all_metrics(&self) -> Vec<((ProtocolId, EndpointAddress), PoolMetrics)> {
        self.pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics()))
            .collect()
    }

    /// Registers the lease sweeper and scaling evaluator with the scheduler
    pub async fn register_jobs(self: &Arc<Self>, scheduler: &Arc<Scheduler>) {
        let sweeper = Arc::clone(self);
        scheduler
            .register(PeriodicJob {
                name: "pool-lease-sweeper".to_string(),
                interval: self.default_config.sweep_interval,
                max_jitter: Duration::from_millis(500),
                run: Arc::new(move || {
                    let manager = Arc::clone(&sweeper);
                    Box::pin(async move {
                        for pool in manager.all_pools() {
                            pool.sweep_expired_leases().await;
                        }
                    })
                }),
            })
            .await;

        let scaler = Arc::clone(self);
        scheduler
            .register(PeriodicJob {
                name: "pool-scaling".to_string(),
                interval: self.default_config.scaling.check_interval,
                max_jitter: Duration::from_millis(500),
                run: Arc::new(move || {
                    let manager = Arc::clone(&scaler);
                    Box::pin(async move {
                        for pool in manager.all_pools() {
                            pool.evaluate_scaling().await;
                        }
                    })
                }),
            })
            .await;
    }

    /// Closes every pool
    pub async fn shutdown(&self) {
        for pool in self.all_pools() {
            pool.close().await;
        }
        info!("pool manager shut down");
    }

    fn all_pools(&self) -> Vec<Arc<ConnectionPool>> {
        self.pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn find_pool_by_id(&self, lease: &Lease) -> Option<Arc<ConnectionPool>> {
        self.pools
            .iter()
            .find(|entry| entry.value().id == lease.pool_id)
            .map(|entry| Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::domain_types::MessagePriority;
    use crate::pool::connection::{ConnectionMetadata, LoopbackFactory};
    use crate::pool::domain_types::ConnectionRequirements;
    use crate::time_provider::MockTimeProvider;

    fn manager() -> Arc<PoolManager> {
        PoolManager::new(
            PoolConfig::default(),
            Arc::new(LoopbackFactory::with_metadata(ConnectionMetadata::default())),
            Arc::new(MockTimeProvider::new()),
        )
    }

    fn request(endpoint: &str) -> AcquireRequest {
        AcquireRequest {
            protocol: ProtocolId::try_new("stream".to_string()).unwrap(),
            endpoint: EndpointAddress::try_new(endpoint.to_string()).unwrap(),
            requirements: ConnectionRequirements::default(),
            priority: MessagePriority::Normal,
            timeout: Duration::from_secs(1),
            requester: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn pools_are_created_on_demand_and_shared() {
        let manager = manager();
        let lease_a = manager.acquire(&request("a:1")).await.unwrap();
        let lease_b = manager.acquire(&request("a:1")).await.unwrap();
        assert_eq!(lease_a.pool_id, lease_b.pool_id);

        let lease_c = manager.acquire(&request("b:1")).await.unwrap();
        assert_ne!(lease_a.pool_id, lease_c.pool_id);
        assert_eq!(manager.all_metrics().len(), 2);
    }

    #[tokio::test]
    async fn release_routes_to_the_owning_pool() {
        let manager = manager();
        let lease = manager.acquire(&request("a:1")).await.unwrap();
        manager.release(&lease, None);
        let pool = manager
            .existing_pool(
                &ProtocolId::try_new("stream".to_string()).unwrap(),
                &EndpointAddress::try_new("a:1".to_string()).unwrap(),
            )
            .unwrap();
        assert_eq!(pool.metrics().busy, 0);
    }
}
