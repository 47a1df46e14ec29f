//! In-memory store for tests and ephemeral deployments

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;

use super::{
    AnomalyRecord, AnomalyStore, AlertStore, MetricsStore, PoolConfigStore, RecoveryStore,
    RouteSnapshotStore,
};
use crate::domain_types::{AgentId, EndpointAddress};
use crate::error::CommError;
use crate::health::domain_types::{Alert, AlertId, MetricsSnapshot};
use crate::pool::config::PoolConfig;
use crate::recovery::domain_types::{ExecutionId, RecoveryExecution};
use crate::router::domain_types::Route;

#[derive(Default)]
struct Tables {
    metrics: Vec<MetricsSnapshot>,
    alerts: HashMap<AlertId, Alert>,
    recoveries: HashMap<ExecutionId, RecoveryExecution>,
    anomalies: Vec<AnomalyRecord>,
    route_snapshot: Vec<Route>,
    pool_configs: HashMap<EndpointAddress, PoolConfig>,
}

/// Store backed by in-process memory
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle, for wiring into multiple components
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored metric snapshots (test helper)
    pub async fn metrics_count(&self) -> usize {
        self.tables.lock().await.metrics.len()
    }

    /// Number of stored anomaly detections (test helper)
    pub async fn anomaly_count(&self) -> usize {
        self.tables.lock().await.anomalies.len()
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn store_metrics(&self, batch: Vec<MetricsSnapshot>) -> Result<(), CommError> {
        self.tables.lock().await.metrics.extend(batch);
        Ok(())
    }

    async fn metrics_for(
        &self,
        agent_id: &AgentId,
        since: SystemTime,
    ) -> Result<Vec<MetricsSnapshot>, CommError> {
        let tables = self.tables.lock().await;
        let mut matching: Vec<MetricsSnapshot> = tables
            .metrics
            .iter()
            .filter(|snapshot| snapshot.agent_id == *agent_id && snapshot.at >= since)
            .cloned()
            .collect();
        matching.sort_by_key(|snapshot| snapshot.at);
        Ok(matching)
    }

    async fn purge_metrics_before(&self, cutoff: SystemTime) -> Result<u64, CommError> {
        let mut tables = self.tables.lock().await;
        let before = tables.metrics.len();
        tables.metrics.retain(|snapshot| snapshot.at >= cutoff);
        Ok((before - tables.metrics.len()) as u64)
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn store_alert(&self, alert: Alert) -> Result<(), CommError> {
        self.tables.lock().await.alerts.insert(alert.alert_id, alert);
        Ok(())
    }

    async fn load_alert(&self, alert_id: AlertId) -> Result<Option<Alert>, CommError> {
        Ok(self.tables.lock().await.alerts.get(&alert_id).cloned())
    }

    async fn purge_alerts_before(&self, cutoff: SystemTime) -> Result<u64, CommError> {
        let mut tables = self.tables.lock().await;
        let before = tables.alerts.len();
        tables.alerts.retain(|_, alert| alert.raised_at >= cutoff);
        Ok((before - tables.alerts.len()) as u64)
    }
}

#[async_trait]
impl RecoveryStore for MemoryStore {
    async fn store_execution(&self, execution: RecoveryExecution) -> Result<(), CommError> {
        self.tables
            .lock()
            .await
            .recoveries
            .insert(execution.exec_id, execution);
        Ok(())
    }

    async fn load_execution(
        &self,
        exec_id: ExecutionId,
    ) -> Result<Option<RecoveryExecution>, CommError> {
        Ok(self.tables.lock().await.recoveries.get(&exec_id).cloned())
    }

    async fn purge_terminal_before(&self, cutoff: SystemTime) -> Result<u64, CommError> {
        let mut tables = self.tables.lock().await;
        let before = tables.recoveries.len();
        tables.recoveries.retain(|_, execution| {
            !(execution.state.is_terminal()
                && execution.ended_at.is_some_and(|ended| ended < cutoff))
        });
        Ok((before - tables.recoveries.len()) as u64)
    }
}

#[async_trait]
impl AnomalyStore for MemoryStore {
    async fn store_detection(&self, record: AnomalyRecord) -> Result<(), CommError> {
        self.tables.lock().await.anomalies.push(record);
        Ok(())
    }

    async fn purge_detections_before(&self, cutoff: SystemTime) -> Result<u64, CommError> {
        let mut tables = self.tables.lock().await;
        let before = tables.anomalies.len();
        tables.anomalies.retain(|record| record.at >= cutoff);
        Ok((before - tables.anomalies.len()) as u64)
    }
}

#[async_trait]
impl RouteSnapshotStore for MemoryStore {
    async fn save_route_snapshot(&self, routes: Vec<Route>) -> Result<(), CommError> {
        self.tables.lock().await.route_snapshot = routes;
        Ok(())
    }

    async fn load_route_snapshot(&self) -> Result<Vec<Route>, CommError> {
        Ok(self.tables.lock().await.route_snapshot.clone())
    }
}

#[async_trait]
impl PoolConfigStore for MemoryStore {
    async fn save_pool_config(
        &self,
        endpoint: &EndpointAddress,
        config: &PoolConfig,
    ) -> Result<(), CommError> {
        self.tables
            .lock()
            .await
            .pool_configs
            .insert(endpoint.clone(), config.clone());
        Ok(())
    }

    async fn load_pool_config(
        &self,
        endpoint: &EndpointAddress,
    ) -> Result<Option<PoolConfig>, CommError> {
        Ok(self.tables.lock().await.pool_configs.get(endpoint).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_config_round_trips() {
        let store = MemoryStore::new();
        let endpoint = EndpointAddress::try_new("t:9000".to_string()).unwrap();
        let config = PoolConfig::default();
        store.save_pool_config(&endpoint, &config).await.unwrap();
        let loaded = store.load_pool_config(&endpoint).await.unwrap().unwrap();
        assert_eq!(loaded.min_size, config.min_size);
        assert!(store
            .load_pool_config(&EndpointAddress::try_new("other".to_string()).unwrap())
            .await
            .unwrap()
            .is_none());
    }
}
