//! Metric collection: probes, aggregation, batching
//!
//! An [`AgentProbe`] produces raw samples; a [`MetricAggregator`] folds
//! successive samples into `{current, average, min, max, trend}` aggregates;
//! a [`MetricsBatcher`] buffers snapshots and flushes to the store on size or
//! timer.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::trace;

use super::domain_types::{
    ConnectionMetrics, DiskMetrics, DiskThresholds, GovernanceMetrics, LatencyPercentiles,
    MetricTrend, MetricValue, MetricsSnapshot, NetworkMetrics, PerformanceMetrics,
    ResourceMetrics, SystemMetrics,
};
use crate::domain_types::AgentId;
use crate::error::CommError;
use crate::storage::MetricsStore;

/// Raw sample produced by one probe pass
#[derive(Debug, Clone, Default)]
pub struct AgentSample {
    /// Response time in milliseconds
    pub response_time_ms: f64,
    /// Requests per second
    pub throughput_rps: f64,
    /// Error fraction
    pub error_rate: f64,
    /// CPU usage percentage
    pub cpu_percent: f64,
    /// Memory usage percentage
    pub memory_percent: f64,
    /// Disk bytes used
    pub disk_used_bytes: u64,
    /// Disk bytes total
    pub disk_total_bytes: u64,
    /// Network counters
    pub network: NetworkMetrics,
    /// Connection gauges
    pub connections: ConnectionMetrics,
    /// Governance scores
    pub governance: GovernanceMetrics,
    /// System gauges
    pub system: SystemMetrics,
    /// Declared custom metrics
    pub custom: HashMap<String, f64>,
    /// The agent responded to the probe at all
    pub heartbeat_ok: bool,
}

/// Agent-specific metric source
#[async_trait]
pub trait AgentProbe: Send + Sync {
    /// Takes one sample; errors count as a missed heartbeat
    async fn sample(&self) -> Result<AgentSample, CommError>;
}

/// Window size for trend and percentile computation
const WINDOW: usize = 64;

/// Running aggregate for one scalar metric
#[derive(Debug, Clone)]
struct Series {
    window: VecDeque<f64>,
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
}

impl Series {
    fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(WINDOW),
            sum: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn push(&mut self, value: f64) {
        if self.window.len() >= WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.sum += value;
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Direction from comparing the halves of the window; volatile when the
    /// coefficient of variation is high
    fn trend(&self) -> MetricTrend {
        if self.window.len() < 4 {
            return MetricTrend::Stable;
        }
        let half = self.window.len() / 2;
        let older: f64 = self.window.iter().take(half).sum::<f64>() / half as f64;
        let newer: f64 =
            self.window.iter().skip(half).sum::<f64>() / (self.window.len() - half) as f64;
        let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
        let variance = self
            .window
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / self.window.len() as f64;
        let std_dev = variance.sqrt();
        if mean.abs() > f64::EPSILON && std_dev / mean.abs() > 0.5 {
            return MetricTrend::Volatile;
        }
        let band = (std_dev * 0.5).max(mean.abs() * 0.05);
        if newer > older + band {
            MetricTrend::Up
        } else if newer < older - band {
            MetricTrend::Down
        } else {
            MetricTrend::Stable
        }
    }

    fn to_value(&self, unit: &str, timestamp: SystemTime) -> MetricValue {
        MetricValue {
            current: self.window.back().copied().unwrap_or(0.0),
            average: self.average(),
            min: if self.min.is_finite() { self.min } else { 0.0 },
            max: if self.max.is_finite() { self.max } else { 0.0 },
            trend: self.trend(),
            unit: unit.to_string(),
            timestamp,
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((sorted.len() as f64) * p).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }
}

/// Folds raw samples into a [`MetricsSnapshot`]
pub struct MetricAggregator {
    agent_id: AgentId,
    response_time: Series,
    throughput: Series,
    error_rate: Series,
    cpu: Series,
    memory: Series,
    disk_trend: Series,
    custom: HashMap<String, Series>,
    heartbeats_ok: u64,
    heartbeats_total: u64,
}

impl std::fmt::Debug for MetricAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricAggregator")
            .field("agent_id", &self.agent_id)
            .field("samples", &self.heartbeats_total)
            .finish_non_exhaustive()
    }
}

impl MetricAggregator {
    /// Creates an aggregator for one agent
    #[must_use]
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            response_time: Series::new(),
            throughput: Series::new(),
            error_rate: Series::new(),
            cpu: Series::new(),
            memory: Series::new(),
            disk_trend: Series::new(),
            custom: HashMap::new(),
            heartbeats_ok: 0,
            heartbeats_total: 0,
        }
    }

    /// Folds a sample and produces the snapshot for this pass
    pub fn ingest(&mut self, sample: &AgentSample, at: SystemTime) -> MetricsSnapshot {
        self.heartbeats_total += 1;
        if sample.heartbeat_ok {
            self.heartbeats_ok += 1;
        }
        self.response_time.push(sample.response_time_ms);
        self.throughput.push(sample.throughput_rps);
        self.error_rate.push(sample.error_rate);
        self.cpu.push(sample.cpu_percent);
        self.memory.push(sample.memory_percent);
        let disk_pct = if sample.disk_total_bytes == 0 {
            0.0
        } else {
            sample.disk_used_bytes as f64 / sample.disk_total_bytes as f64
        };
        self.disk_trend.push(disk_pct);
        for (name, value) in &sample.custom {
            self.custom
                .entry(name.clone())
                .or_insert_with(Series::new)
                .push(*value);
        }

        MetricsSnapshot {
            agent_id: self.agent_id.clone(),
            at,
            performance: PerformanceMetrics {
                response_time: self.response_time.to_value("ms", at),
                throughput: self.throughput.to_value("rps", at),
                error_rate: self.error_rate.to_value("fraction", at),
                success_rate: MetricValue::point(1.0 - sample.error_rate, "fraction", at),
                latency: LatencyPercentiles {
                    p50: self.response_time.percentile(0.50),
                    p90: self.response_time.percentile(0.90),
                    p95: self.response_time.percentile(0.95),
                    p99: self.response_time.percentile(0.99),
                    mean: self.response_time.average(),
                },
                availability: if self.heartbeats_total == 0 {
                    1.0
                } else {
                    self.heartbeats_ok as f64 / self.heartbeats_total as f64
                },
            },
            resource: ResourceMetrics {
                cpu: self.cpu.to_value("percent", at),
                memory: self.memory.to_value("percent", at),
                disk: DiskMetrics {
                    used_bytes: sample.disk_used_bytes,
                    total_bytes: sample.disk_total_bytes,
                    percentage: disk_pct,
                    trend: self.disk_trend.trend(),
                    thresholds: DiskThresholds::default(),
                },
                network: sample.network.clone(),
                connections: sample.connections.clone(),
            },
            governance: sample.governance.clone(),
            system: sample.system.clone(),
            custom: self
                .custom
                .iter()
                .map(|(name, series)| (name.clone(), series.to_value("", at)))
                .collect(),
        }
    }

    /// History of the CPU series, for anomaly detection
    #[must_use]
    pub fn cpu_history(&self) -> Vec<f64> {
        self.cpu.window.iter().copied().collect()
    }

    /// History of the response-time series
    #[must_use]
    pub fn response_time_history(&self) -> Vec<f64> {
        self.response_time.window.iter().copied().collect()
    }

    /// History of the error-rate series
    #[must_use]
    pub fn error_rate_history(&self) -> Vec<f64> {
        self.error_rate.window.iter().copied().collect()
    }
}

/// Buffers snapshots and flushes to the store on size or timer
pub struct MetricsBatcher {
    store: Arc<dyn MetricsStore>,
    batch_size: usize,
    buffer: Mutex<Vec<MetricsSnapshot>>,
}

impl std::fmt::Debug for MetricsBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsBatcher")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl MetricsBatcher {
    /// Creates a batcher over the given store
    #[must_use]
    pub fn new(store: Arc<dyn MetricsStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Buffers a snapshot, flushing when the batch fills
    pub async fn submit(&self, snapshot: MetricsSnapshot) {
        let batch = {
            let mut buffer = self
                .buffer
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            buffer.push(snapshot);
            if buffer.len() >= self.batch_size {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            self.flush_batch(batch).await;
        }
    }

    /// Flushes whatever is buffered (timer-driven)
    pub async fn flush(&self) {
        let batch = {
            let mut buffer = self
                .buffer
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };
        self.flush_batch(batch).await;
    }

    async fn flush_batch(&self, batch: Vec<MetricsSnapshot>) {
        let count = batch.len();
        if let Err(err) = self.store.store_metrics(batch).await {
            tracing::warn!(error = %err, "metrics batch flush failed");
        } else {
            trace!(count, "metrics batch flushed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn sample(cpu: f64) -> AgentSample {
        AgentSample {
            response_time_ms: 10.0,
            cpu_percent: cpu,
            heartbeat_ok: true,
            ..AgentSample::default()
        }
    }

    #[test]
    fn aggregates_track_min_max_avg() {
        let mut aggregator =
            MetricAggregator::new(AgentId::try_new("a".to_string()).unwrap());
        let now = SystemTime::now();
        for cpu in [10.0, 20.0, 30.0] {
            aggregator.ingest(&sample(cpu), now);
        }
        let snapshot = aggregator.ingest(&sample(40.0), now);
        assert!((snapshot.resource.cpu.min - 10.0).abs() < f64::EPSILON);
        assert!((snapshot.resource.cpu.max - 40.0).abs() < f64::EPSILON);
        assert!((snapshot.resource.cpu.average - 25.0).abs() < f64::EPSILON);
        assert!((snapshot.resource.cpu.current - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rising_series_trends_up() {
        let mut aggregator =
            MetricAggregator::new(AgentId::try_new("a".to_string()).unwrap());
        let now = SystemTime::now();
        let mut last = None;
        for cpu in (0..20).map(|n| f64::from(n) * 5.0) {
            last = Some(aggregator.ingest(&sample(cpu), now));
        }
        assert_eq!(last.unwrap().resource.cpu.trend, MetricTrend::Up);
    }

    #[tokio::test]
    async fn batcher_flushes_at_batch_size() {
        let store = Arc::new(MemoryStore::new());
        let batcher = MetricsBatcher::new(Arc::clone(&store) as Arc<dyn MetricsStore>, 3);
        let mut aggregator =
            MetricAggregator::new(AgentId::try_new("a".to_string()).unwrap());
        let now = SystemTime::now();
        for n in 0..2 {
            batcher.submit(aggregator.ingest(&sample(f64::from(n)), now)).await;
        }
        assert_eq!(store.metrics_count().await, 0);
        batcher.submit(aggregator.ingest(&sample(3.0), now)).await;
        assert_eq!(store.metrics_count().await, 3);

        batcher.submit(aggregator.ingest(&sample(4.0), now)).await;
        batcher.flush().await;
        assert_eq!(store.metrics_count().await, 4);
    }
}
