//! Store interfaces the core consumes
//!
//! Persistence backends are external collaborators; the core sees a small
//! number of logical tables addressed through these traits. Records are
//! JSON-serializable opaque blobs with indexes on `(agent_id, timestamp)`
//! and `(status, timestamp)`. A daily retention sweeper deletes records
//! older than the configured window and terminal-state recoveries older
//! than retention.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::info;

use crate::domain_types::{AgentId, EndpointAddress};
use crate::error::CommError;
use crate::health::domain_types::{Alert, AlertId, MetricsSnapshot};
use crate::pool::config::PoolConfig;
use crate::recovery::domain_types::{ExecutionId, RecoveryExecution};
use crate::router::domain_types::Route;
use crate::scheduler::{PeriodicJob, Scheduler};
use crate::time_provider::TimeProvider;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One recorded anomaly detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    /// Agent the detection concerns
    pub agent_id: AgentId,
    /// Metric that was scored
    pub metric: String,
    /// Anomaly score
    pub score: f64,
    /// Expected value
    pub expected: f64,
    /// Observed value
    pub actual: f64,
    /// When the detection fired
    pub at: SystemTime,
}

/// Metrics table: `(agent_id, timestamp)` indexed snapshots
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Persists a batch of snapshots
    async fn store_metrics(&self, batch: Vec<MetricsSnapshot>) -> Result<(), CommError>;

    /// Snapshots for one agent since a point in time, oldest first
    async fn metrics_for(
        &self,
        agent_id: &AgentId,
        since: SystemTime,
    ) -> Result<Vec<MetricsSnapshot>, CommError>;

    /// Deletes snapshots older than the cutoff; returns how many
    async fn purge_metrics_before(&self, cutoff: SystemTime) -> Result<u64, CommError>;
}

/// Alerts table, keyed by alert id, indexed by `(status, timestamp)`
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Persists (or replaces) an alert record
    async fn store_alert(&self, alert: Alert) -> Result<(), CommError>;

    /// Loads an alert by id
    async fn load_alert(&self, alert_id: AlertId) -> Result<Option<Alert>, CommError>;

    /// Deletes alerts raised before the cutoff; returns how many
    async fn purge_alerts_before(&self, cutoff: SystemTime) -> Result<u64, CommError>;
}

/// Recovery executions table, keyed by execution id
#[async_trait]
pub trait RecoveryStore: Send + Sync {
    /// Persists (or replaces) an execution record
    async fn store_execution(&self, execution: RecoveryExecution) -> Result<(), CommError>;

    /// Loads an execution by id
    async fn load_execution(
        &self,
        exec_id: ExecutionId,
    ) -> Result<Option<RecoveryExecution>, CommError>;

    /// Deletes terminal-state executions that ended before the cutoff
    async fn purge_terminal_before(&self, cutoff: SystemTime) -> Result<u64, CommError>;
}

/// Anomaly detections table
#[async_trait]
pub trait AnomalyStore: Send + Sync {
    /// Persists one detection
    async fn store_detection(&self, record: AnomalyRecord) -> Result<(), CommError>;

    /// Deletes detections older than the cutoff; returns how many
    async fn purge_detections_before(&self, cutoff: SystemTime) -> Result<u64, CommError>;
}

/// Route cache snapshot table
#[async_trait]
pub trait RouteSnapshotStore: Send + Sync {
    /// Replaces the persisted route snapshot
    async fn save_route_snapshot(&self, routes: Vec<Route>) -> Result<(), CommError>;

    /// Loads the persisted route snapshot
    async fn load_route_snapshot(&self) -> Result<Vec<Route>, CommError>;
}

/// Pool configuration table, keyed by endpoint
#[async_trait]
pub trait PoolConfigStore: Send + Sync {
    /// Persists (or replaces) a pool configuration
    async fn save_pool_config(
        &self,
        endpoint: &EndpointAddress,
        config: &PoolConfig,
    ) -> Result<(), CommError>;

    /// Loads a pool configuration
    async fn load_pool_config(
        &self,
        endpoint: &EndpointAddress,
    ) -> Result<Option<PoolConfig>, CommError>;
}

/// The full store surface the core consumes
pub trait Store:
    MetricsStore + AlertStore + RecoveryStore + AnomalyStore + RouteSnapshotStore + PoolConfigStore
{
}

impl<T> Store for T where
    T: MetricsStore
        + AlertStore
        + RecoveryStore
        + AnomalyStore
        + RouteSnapshotStore
        + PoolConfigStore
{
}

/// Retention windows enforced by the daily sweeper
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// How long metric snapshots are kept
    pub metrics: Duration,
    /// How long alerts are kept
    pub alerts: Duration,
    /// How long terminal recovery executions are kept
    pub recoveries: Duration,
    /// How long anomaly detections are kept
    pub anomalies: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            metrics: Duration::from_secs(7 * 24 * 3600),
            alerts: Duration::from_secs(30 * 24 * 3600),
            recoveries: Duration::from_secs(30 * 24 * 3600),
            anomalies: Duration::from_secs(14 * 24 * 3600),
        }
    }
}

/// Daily sweeper deleting records past their retention window
pub struct RetentionSweeper {
    store: Arc<dyn Store>,
    retention: RetentionConfig,
    time: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for RetentionSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionSweeper")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl RetentionSweeper {
    /// Creates a sweeper
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        retention: RetentionConfig,
        time: Arc<dyn TimeProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            retention,
            time,
        })
    }

    /// One sweep pass; returns total records deleted
    pub async fn sweep(&self) -> u64 {
        let now = self.time.now();
        let mut deleted = 0;
        let cutoffs = [
            (now.checked_sub(self.retention.metrics), 0usize),
            (now.checked_sub(self.retention.alerts), 1),
            (now.checked_sub(self.retention.recoveries), 2),
            (now.checked_sub(self.retention.anomalies), 3),
        ];
        for (cutoff, table) in cutoffs {
            let Some(cutoff) = cutoff else { continue };
            let result = match table {
                0 => self.store.purge_metrics_before(cutoff).await,
                1 => self.store.purge_alerts_before(cutoff).await,
                2 => self.store.purge_terminal_before(cutoff).await,
                _ => self.store.purge_detections_before(cutoff).await,
            };
            match result {
                Ok(count) => deleted += count,
                Err(err) => tracing::warn!(table, error = %err, "retention purge failed"),
            }
        }
        if deleted > 0 {
            info!(deleted, "retention sweep complete");
        }
        deleted
    }

    /// Registers the daily sweep with the scheduler
    pub async fn register_job(self: &Arc<Self>, scheduler: &Arc<Scheduler>) {
        let sweeper = Arc::clone(self);
        scheduler
            .register(PeriodicJob {
                name: "storage-retention".to_string(),
                interval: Duration::from_secs(24 * 3600),
                max_jitter: Duration::from_secs(600),
                run: Arc::new(move || {
                    let sweeper = Arc::clone(&sweeper);
                    Box::pin(async move {
                        sweeper.sweep().await;
                    })
                }),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::domain_types::AlertSeverity;
    use crate::time_provider::MockTimeProvider;

    fn snapshot(agent: &str, at: SystemTime) -> MetricsSnapshot {
        use crate::health::collector::{AgentSample, MetricAggregator};
        let mut aggregator =
            MetricAggregator::new(AgentId::try_new(agent.to_string()).unwrap());
        let mut snapshot = aggregator.ingest(&AgentSample::default(), at);
        snapshot.at = at;
        snapshot
    }

    #[tokio::test]
    async fn sweeper_purges_old_records() {
        let clock = Arc::new(MockTimeProvider::new());
        let store = Arc::new(MemoryStore::new());
        let now = clock.now();
        let old = now - Duration::from_secs(40 * 24 * 3600);

        store
            .store_metrics(vec![snapshot("a", old), snapshot("a", now)])
            .await
            .unwrap();
        let mut alert = Alert {
            alert_id: AlertId::generate(),
            agent_id: AgentId::try_new("a".to_string()).unwrap(),
            alert_type: "threshold".to_string(),
            metric: "cpu".to_string(),
            severity: AlertSeverity::Warning,
            threshold: 1.0,
            actual: 2.0,
            status: crate::health::domain_types::AlertStatus::Resolved,
            acks: vec![],
            escalations: vec![],
            resolution: None,
            tags: vec![],
            raised_at: old,
        };
        store.store_alert(alert.clone()).await.unwrap();
        alert.alert_id = AlertId::generate();
        alert.raised_at = now;
        store.store_alert(alert).await.unwrap();

        let sweeper = RetentionSweeper::new(
            Arc::clone(&store) as Arc<dyn Store>,
            RetentionConfig::default(),
            clock,
        );
        let deleted = sweeper.sweep().await;
        assert_eq!(deleted, 2);
        assert_eq!(store.metrics_count().await, 1);
    }
}
