//! `SQLite` implementation of the store interfaces
//!
//! Records are stored as JSON blobs beside the indexed columns the core
//! queries on: `(agent_id, ts)` for metrics and anomalies, `(status, ts)`
//! for alerts and recoveries. Table creation is bootstrapped at connect
//! time; the schema is append-only.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::time::{SystemTime, UNIX_EPOCH};

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

const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS metrics (
    agent_id TEXT NOT NULL,
    ts INTEGER NOT NULL,
    record TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_agent_ts ON metrics (agent_id, ts);
CREATE INDEX IF NOT EXISTS idx_metrics_ts ON metrics (ts);

CREATE TABLE IF NOT EXISTS alerts (
    alert_id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    status TEXT NOT NULL,
    ts INTEGER NOT NULL,
    record TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alerts_status_ts ON alerts (status, ts);

CREATE TABLE IF NOT EXISTS recovery_executions (
    exec_id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    state TEXT NOT NULL,
    terminal INTEGER NOT NULL,
    ended_ts INTEGER,
    record TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_recovery_state_ts ON recovery_executions (state, ended_ts);

CREATE TABLE IF NOT EXISTS anomaly_detections (
    agent_id TEXT NOT NULL,
    metric TEXT NOT NULL,
    ts INTEGER NOT NULL,
    record TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_anomaly_agent_ts ON anomaly_detections (agent_id, ts);

CREATE TABLE IF NOT EXISTS route_snapshot (
    slot INTEGER PRIMARY KEY CHECK (slot = 0),
    record TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pool_configs (
    endpoint TEXT PRIMARY KEY,
    record TEXT NOT NULL
);
";

fn storage_err(err: impl std::error::Error + Send + Sync + 'static) -> CommError {
    CommError::Storage {
        source: Box::new(err),
    }
}

fn epoch_millis(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Store backed by a local `SQLite` database
pub struct SqliteStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Connects and bootstraps the schema
    ///
    /// `url` is a sqlx connection string, e.g. `sqlite::memory:` or
    /// `sqlite:data/agora.db?mode=rwc`.
    ///
    /// # Errors
    /// `Storage` on connection or bootstrap failure.
    pub async fn connect(url: &str) -> Result<Self, CommError> {
        // One connection: in-memory databases are per-connection, and the
        // write volume here never warrants more.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(storage_err)?;
        sqlx::raw_sql(CREATE_TABLES)
            .execute(&pool)
            .await
            .map_err(storage_err)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl MetricsStore for SqliteStore {
    async fn store_metrics(&self, batch: Vec<MetricsSnapshot>) -> Result<(), CommError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for snapshot in batch {
            let record = serde_json::to_string(&snapshot).map_err(storage_err)?;
            sqlx::query("INSERT INTO metrics (agent_id, ts, record) VALUES (?, ?, ?)")
                .bind(snapshot.agent_id.to_string())
                .bind(epoch_millis(snapshot.at))
                .bind(record)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)
    }

    async fn metrics_for(
        &self,
        agent_id: &AgentId,
        since: SystemTime,
    ) -> Result<Vec<MetricsSnapshot>, CommError> {
        let rows = sqlx::query(
            "SELECT record FROM metrics WHERE agent_id = ? AND ts >= ? ORDER BY ts ASC",
        )
        .bind(agent_id.to_string())
        .bind(epoch_millis(since))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter()
            .map(|row| {
                let record: String = row.get(0);
                serde_json::from_str(&record).map_err(storage_err)
            })
            .collect()
    }

    async fn purge_metrics_before(&self, cutoff: SystemTime) -> Result<u64, CommError> {
        let result = sqlx::query("DELETE FROM metrics WHERE ts < ?")
            .bind(epoch_millis(cutoff))
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AlertStore for SqliteStore {
    async fn store_alert(&self, alert: Alert) -> Result<(), CommError> {
        let record = serde_json::to_string(&alert).map_err(storage_err)?;
        sqlx::query(
            "INSERT OR REPLACE INTO alerts (alert_id, agent_id, status, ts, record) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(alert.alert_id.to_string())
        .bind(alert.agent_id.to_string())
        .bind(format!("{:?}", alert.status))
        .bind(epoch_millis(alert.raised_at))
        .bind(record)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn load_alert(&self, alert_id: AlertId) -> Result<Option<Alert>, CommError> {
        let row = sqlx::query("SELECT record FROM alerts WHERE alert_id = ?")
            .bind(alert_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|row| {
            let record: String = row.get(0);
            serde_json::from_str(&record).map_err(storage_err)
        })
        .transpose()
    }

    async fn purge_alerts_before(&self, cutoff: SystemTime) -> Result<u64, CommError> {
        let result = sqlx::query("DELETE FROM alerts WHERE ts < ?")
            .bind(epoch_millis(cutoff))
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RecoveryStore for SqliteStore {
    async fn store_execution(&self, execution: RecoveryExecution) -> Result<(), CommError> {
        let record = serde_json::to_string(&execution).map_err(storage_err)?;
        sqlx::query(
            "INSERT OR REPLACE INTO recovery_executions (exec_id, agent_id, state, terminal, ended_ts, record) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(execution.exec_id.to_string())
        .bind(execution.agent_id.to_string())
        .bind(format!("{:?}", execution.state))
        .bind(i64::from(execution.state.is_terminal()))
        .bind(execution.ended_at.map(epoch_millis))
        .bind(record)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn load_execution(
        &self,
        exec_id: ExecutionId,
    ) -> Result<Option<RecoveryExecution>, CommError> {
        let row = sqlx::query("SELECT record FROM recovery_executions WHERE exec_id = ?")
            .bind(exec_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|row| {
            let record: String = row.get(0);
            serde_json::from_str(&record).map_err(storage_err)
        })
        .transpose()
    }

    async fn purge_terminal_before(&self, cutoff: SystemTime) -> Result<u64, CommError> {
        let result = sqlx::query(
            "DELETE FROM recovery_executions WHERE terminal = 1 AND ended_ts IS NOT NULL AND ended_ts < ?",
        )
        .bind(epoch_millis(cutoff))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AnomalyStore for SqliteStore {
    async fn store_detection(&self, record: AnomalyRecord) -> Result<(), CommError> {
        let blob = serde_json::to_string(&record).map_err(storage_err)?;
        sqlx::query(
            "INSERT INTO anomaly_detections (agent_id, metric, ts, record) VALUES (?, ?, ?, ?)",
        )
        .bind(record.agent_id.to_string())
        .bind(record.metric.clone())
        .bind(epoch_millis(record.at))
        .bind(blob)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn purge_detections_before(&self, cutoff: SystemTime) -> Result<u64, CommError> {
        let result = sqlx::query("DELETE FROM anomaly_detections WHERE ts < ?")
            .bind(epoch_millis(cutoff))
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RouteSnapshotStore for SqliteStore {
    async fn save_route_snapshot(&self, routes: Vec<Route>) -> Result<(), CommError> {
        let record = serde_json::to_string(&routes).map_err(storage_err)?;
        sqlx::query("INSERT OR REPLACE INTO route_snapshot (slot, record) VALUES (0, ?)")
            .bind(record)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn load_route_snapshot(&self) -> Result<Vec<Route>, CommError> {
        let row = sqlx::query("SELECT record FROM route_snapshot WHERE slot = 0")
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        match row {
            Some(row) => {
                let record: String = row.get(0);
                serde_json::from_str(&record).map_err(storage_err)
            }
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl PoolConfigStore for SqliteStore {
    async fn save_pool_config(
        &self,
        endpoint: &EndpointAddress,
        config: &PoolConfig,
    ) -> Result<(), CommError> {
        let record = serde_json::to_string(config).map_err(storage_err)?;
        sqlx::query("INSERT OR REPLACE INTO pool_configs (endpoint, record) VALUES (?, ?)")
            .bind(endpoint.to_string())
            .bind(record)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn load_pool_config(
        &self,
        endpoint: &EndpointAddress,
    ) -> Result<Option<PoolConfig>, CommError> {
        let row = sqlx::query("SELECT record FROM pool_configs WHERE endpoint = ?")
            .bind(endpoint.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|row| {
            let record: String = row.get(0);
            serde_json::from_str(&record).map_err(storage_err)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::collector::{AgentSample, MetricAggregator};
    use std::time::Duration;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    fn snapshot(agent: &str, at: SystemTime) -> MetricsSnapshot {
        let mut aggregator =
            MetricAggregator::new(AgentId::try_new(agent.to_string()).unwrap());
        let mut snapshot = aggregator.ingest(&AgentSample::default(), at);
        snapshot.at = at;
        snapshot
    }

    #[tokio::test]
    async fn metrics_round_trip_with_time_filter() {
        let store = store().await;
        let agent = AgentId::try_new("a".to_string()).unwrap();
        let now = SystemTime::now();
        let old = now - Duration::from_secs(3600);
        store
            .store_metrics(vec![snapshot("a", old), snapshot("a", now), snapshot("b", now)])
            .await
            .unwrap();

        let recent = store
            .metrics_for(&agent, now - Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);

        let purged = store
            .purge_metrics_before(now - Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn recovery_execution_round_trips() {
        use crate::recovery::domain_types::{ExecutionState, ProcedureId};
        let store = store().await;
        let execution = RecoveryExecution {
            exec_id: ExecutionId::generate(),
            procedure_id: ProcedureId::try_new("restart-agent".to_string()).unwrap(),
            agent_id: AgentId::try_new("a".to_string()).unwrap(),
            triggered_by: "test".to_string(),
            started_at: SystemTime::now(),
            ended_at: Some(SystemTime::now()),
            state: ExecutionState::Succeeded,
            steps: vec![],
            result: Some("ok".to_string()),
        };
        store.store_execution(execution.clone()).await.unwrap();
        let loaded = store
            .load_execution(execution.exec_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.state, ExecutionState::Succeeded);

        // Terminal retention purge removes it once past the cutoff.
        let purged = store
            .purge_terminal_before(SystemTime::now() + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn pool_config_round_trips() {
        let store = store().await;
        let endpoint = EndpointAddress::try_new("t:9000".to_string()).unwrap();
        store
            .save_pool_config(&endpoint, &PoolConfig::default())
            .await
            .unwrap();
        let loaded = store.load_pool_config(&endpoint).await.unwrap().unwrap();
        assert_eq!(loaded.max_size, PoolConfig::default().max_size);
    }
}
