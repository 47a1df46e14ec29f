//! Domain types for agent health monitoring

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::domain_types::AgentId;

/// Derived health levels, ordered by severity
///
/// `Unknown` means "no data" and never wins a severity comparison; it sits
/// outside the lattice.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    /// Operating normally
    #[default]
    Healthy,
    /// Impaired but serving
    Degraded,
    /// Failing user-visible work
    Unhealthy,
    /// Requires immediate intervention
    Critical,
    /// No data
    Unknown,
}

impl HealthLevel {
    /// Whether this level should trigger recovery consideration
    #[must_use]
    pub fn needs_recovery(self) -> bool {
        matches!(self, Self::Unhealthy | Self::Critical)
    }

    /// Severity comparison that treats `Unknown` as no information
    #[must_use]
    pub fn worse_of(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unknown, level) | (level, Self::Unknown) => level,
            (a, b) => a.max(b),
        }
    }
}

/// Direction of a metric over its recent window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetricTrend {
    /// Rising
    Up,
    /// Falling
    Down,
    /// Flat
    #[default]
    Stable,
    /// High variance, no clear direction
    Volatile,
}

/// One aggregated metric value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricValue {
    /// Latest sample
    pub current: f64,
    /// Running average
    pub average: f64,
    /// Minimum seen
    pub min: f64,
    /// Maximum seen
    pub max: f64,
    /// Recent direction
    pub trend: MetricTrend,
    /// Unit label (`"ms"`, `"percent"`, `"rps"`)
    pub unit: String,
    /// When the latest sample was taken
    pub timestamp: SystemTime,
}

impl MetricValue {
    /// A single-sample value
    #[must_use]
    pub fn point(value: f64, unit: &str, timestamp: SystemTime) -> Self {
        Self {
            current: value,
            average: value,
            min: value,
            max: value,
            trend: MetricTrend::Stable,
            unit: unit.to_string(),
            timestamp,
        }
    }
}

/// Latency percentile summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    /// 50th percentile
    pub p50: f64,
    /// 90th percentile
    pub p90: f64,
    /// 95th percentile
    pub p95: f64,
    /// 99th percentile
    pub p99: f64,
    /// Arithmetic mean
    pub mean: f64,
}

/// Performance metric category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Response time aggregate
    pub response_time: MetricValue,
    /// Requests per second
    pub throughput: MetricValue,
    /// Error fraction
    pub error_rate: MetricValue,
    /// Success fraction
    pub success_rate: MetricValue,
    /// Latency percentiles over the window
    pub latency: LatencyPercentiles,
    /// Availability fraction
    pub availability: f64,
}

/// Disk thresholds for alerting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskThresholds {
    /// Warning level (fraction used)
    pub warning: f64,
    /// Critical level
    pub critical: f64,
    /// Emergency level
    pub emergency: f64,
}

impl Default for DiskThresholds {
    fn default() -> Self {
        Self {
            warning: 0.75,
            critical: 0.9,
            emergency: 0.97,
        }
    }
}

/// Disk usage aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskMetrics {
    /// Bytes used
    pub used_bytes: u64,
    /// Total bytes
    pub total_bytes: u64,
    /// used / total
    pub percentage: f64,
    /// Recent direction
    pub trend: MetricTrend,
    /// Alerting thresholds
    pub thresholds: DiskThresholds,
}

/// One direction of network counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkDirection {
    /// Bytes moved
    pub bytes: u64,
    /// Packets moved
    pub packets: u64,
    /// Errors
    pub errors: u64,
    /// Dropped packets
    pub dropped: u64,
}

/// Network counters, both directions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkMetrics {
    /// Inbound counters
    pub inbound: NetworkDirection,
    /// Outbound counters
    pub outbound: NetworkDirection,
}

/// Connection-table gauges
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    /// Active connections
    pub active: u32,
    /// Idle connections
    pub idle: u32,
    /// Waiting acquirers
    pub waiting: u32,
    /// Pool size
    pub pool_size: u32,
    /// Pool ceiling
    pub max: u32,
    /// Connection errors
    pub errors: u32,
}

/// Resource metric category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// CPU usage percentage
    pub cpu: MetricValue,
    /// Memory usage percentage
    pub memory: MetricValue,
    /// Disk usage
    pub disk: DiskMetrics,
    /// Network counters
    pub network: NetworkMetrics,
    /// Connection gauges
    pub connections: ConnectionMetrics,
}

/// Governance metric category
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceMetrics {
    /// Decision quality score in `[0, 1]`
    pub decision_quality: f64,
    /// Compliance score
    pub compliance: f64,
    /// Audit-trail integrity
    pub audit_integrity: f64,
    /// Stakeholder satisfaction
    pub stakeholder_satisfaction: f64,
    /// Ethics score
    pub ethics: f64,
    /// Transparency score
    pub transparency: f64,
}

/// System metric category
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Process count
    pub processes: u32,
    /// Thread count
    pub threads: u32,
    /// Open file descriptors
    pub file_descriptors: u32,
    /// Database connections
    pub db_connections: u32,
    /// Cache hit fraction
    pub cache_hit_rate: f64,
    /// Work queue depth
    pub queue_depth: u32,
}

/// A full metrics snapshot for one agent at one collection pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Agent sampled
    pub agent_id: AgentId,
    /// When the pass completed
    pub at: SystemTime,
    /// Performance category
    pub performance: PerformanceMetrics,
    /// Resource category
    pub resource: ResourceMetrics,
    /// Governance category
    pub governance: GovernanceMetrics,
    /// System category
    pub system: SystemMetrics,
    /// Declared per-agent collectors
    pub custom: HashMap<String, MetricValue>,
}

/// Health of one component of an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Derived level
    pub level: HealthLevel,
    /// Criticality weight used in the overall derivation
    pub weight: f64,
    /// When the component entered this level
    pub since: SystemTime,
}

/// Derived health state for an agent; `overall` is derived, never stored
/// independently of its components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealthState {
    /// Agent
    pub agent_id: AgentId,
    /// Weighted-worst over components, with flap damping applied
    pub overall: HealthLevel,
    /// Per-component levels
    pub components: HashMap<String, ComponentHealth>,
    /// Active alert ids for the agent
    pub alerts: Vec<AlertId>,
    /// Last heartbeat observed
    pub last_heartbeat: SystemTime,
    /// Uptime since registration
    pub uptime: Duration,
}

/// Unique identifier for an alert
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct AlertId(Uuid);

impl AlertId {
    /// Creates a new random alert ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Alert severity levels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Informational
    Info,
    /// Needs attention
    #[default]
    Warning,
    /// Needs prompt attention
    Error,
    /// Needs immediate attention
    Critical,
}

/// Alert lifecycle states; `Resolved` and `Suppressed` are sticky
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Raised and unhandled
    Active,
    /// A human has seen it
    Acknowledged,
    /// Closed with a resolution; terminal
    Resolved,
    /// Muted inside a suppression window; terminal
    Suppressed,
    /// Advanced at least one escalation level
    Escalated,
}

impl AlertStatus {
    /// Whether the state is terminal
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Suppressed)
    }
}

/// One acknowledgment in an alert's audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acknowledgment {
    /// Who acknowledged
    pub by: String,
    /// When
    pub at: SystemTime,
    /// Optional comment
    pub comment: Option<String>,
}

/// One escalation step in an alert's history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    /// Level reached (1-based)
    pub level: u8,
    /// When it was reached
    pub at: SystemTime,
    /// Channels notified at this level (opaque sink names)
    pub channels: Vec<String>,
}

/// An alert raised against an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Identifier
    pub alert_id: AlertId,
    /// Agent the alert concerns
    pub agent_id: AgentId,
    /// Alert type (`"anomaly"`, `"threshold"`, `"heartbeat"`)
    pub alert_type: String,
    /// Metric that fired (`"cpu_usage"`, `"error_rate"`)
    pub metric: String,
    /// Severity
    pub severity: AlertSeverity,
    /// Threshold that was crossed (or expected value for anomalies)
    pub threshold: f64,
    /// Observed value
    pub actual: f64,
    /// Lifecycle state
    pub status: AlertStatus,
    /// Acknowledgment audit trail; entries are never removed
    pub acks: Vec<Acknowledgment>,
    /// Escalation history
    pub escalations: Vec<EscalationRecord>,
    /// Resolution note, set exactly once
    pub resolution: Option<String>,
    /// Free-form tags
    pub tags: Vec<String>,
    /// When the alert was raised
    pub raised_at: SystemTime,
}
