//! Domain types for load balancing

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use uuid::Uuid;

use crate::bus::domain_types::{GovernanceRequirements, MessagePriority};
use crate::domain_types::{AgentId, EndpointAddress, ProtocolId, TrustScore};
use crate::pool::circuit_breaker::CircuitBreaker;

/// Identifier correlating a selection with its completion report
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
pub struct BalanceRequestId(Uuid);

impl BalanceRequestId {
    /// Creates a new random request ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Governance posture a target advertises
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceProfile {
    /// Trust score of the target
    pub trust: TrustScore,
    /// Compliance level in `[0, 1]`
    pub compliance_level: f64,
    /// Target can produce audit trails
    pub audit_capable: bool,
    /// Target supports accountability reporting
    pub accountability: bool,
    /// Target participates in consensus
    pub consensus_capable: bool,
}

impl Default for GovernanceProfile {
    fn default() -> Self {
        Self {
            trust: TrustScore::default(),
            compliance_level: 0.5,
            audit_capable: false,
            accountability: false,
            consensus_capable: false,
        }
    }
}

/// Registration record for a balance target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalanceTarget {
    /// Agent this endpoint belongs to
    pub agent: AgentId,
    /// Endpoint address
    pub endpoint: EndpointAddress,
    /// Transport protocol the endpoint speaks
    pub protocol: ProtocolId,
    /// Concurrent-request capacity
    pub capacity: u32,
    /// Static weight for weighted algorithms
    pub weight: f64,
    /// Governance posture
    pub governance: GovernanceProfile,
}

/// EMA performance record per target
#[derive(Debug, Clone)]
pub struct TargetPerformance {
    /// EMA of recent response times
    pub response_time_ms: f64,
    /// EMA success fraction
    pub success_rate: f64,
    /// EMA error fraction
    pub error_rate: f64,
    /// Requests per second estimate
    pub throughput_rps: f64,
    /// Samples folded in
    pub samples: u64,
}

impl Default for TargetPerformance {
    fn default() -> Self {
        Self {
            response_time_ms: 0.0,
            success_rate: 1.0,
            error_rate: 0.0,
            throughput_rps: 0.0,
            samples: 0,
        }
    }
}

/// Free-fraction resource gauges reported by a target
#[derive(Debug, Clone)]
pub struct ResourceHeadroom {
    /// Free CPU fraction
    pub cpu: f64,
    /// Free memory fraction
    pub memory: f64,
    /// Free network fraction
    pub network: f64,
}

impl Default for ResourceHeadroom {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory: 1.0,
            network: 1.0,
        }
    }
}

/// Live state of a registered target
pub struct TargetState {
    /// Registration record
    pub target: LoadBalanceTarget,
    active: AtomicU32,
    healthy: AtomicBool,
    blacklisted: AtomicBool,
    completed: AtomicU64,
    perf: RwLock<TargetPerformance>,
    resources: RwLock<ResourceHeadroom>,
    breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetState")
            .field("agent", &self.target.agent)
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("healthy", &self.healthy.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TargetState {
    /// Wraps a registration with live counters and a breaker
    #[must_use]
    pub fn new(target: LoadBalanceTarget, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            target,
            active: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
            blacklisted: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            perf: RwLock::new(TargetPerformance::default()),
            resources: RwLock::new(ResourceHeadroom::default()),
            breaker,
        }
    }

    /// The target's circuit breaker
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Active in-flight requests
    #[must_use]
    pub fn active_requests(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }

    /// Requests completed over the target's lifetime
    #[must_use]
    pub fn completed_requests(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// active / capacity, clamped to `[0, 1]`
    #[must_use]
    pub fn load_factor(&self) -> f64 {
        let capacity = self.target.capacity.max(1);
        (f64::from(self.active.load(Ordering::Relaxed)) / f64::from(capacity)).min(1.0)
    }

    /// Marks one request started
    pub fn begin_request(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks one request finished and folds its outcome into the EMAs
    pub fn complete_request(&self, alpha: f64, success: bool, latency_ms: f64) {
        let previous = self.active.load(Ordering::Relaxed);
        if previous > 0 {
            self.active.fetch_sub(1, Ordering::Relaxed);
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
        let mut perf = self
            .perf
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let success_sample = if success { 1.0 } else { 0.0 };
        perf.success_rate = alpha * success_sample + (1.0 - alpha) * perf.success_rate;
        perf.error_rate = alpha * (1.0 - success_sample) + (1.0 - alpha) * perf.error_rate;
        if success {
            perf.response_time_ms = alpha * latency_ms + (1.0 - alpha) * perf.response_time_ms;
            if latency_ms > 0.0 {
                perf.throughput_rps =
                    alpha * (1_000.0 / latency_ms) + (1.0 - alpha) * perf.throughput_rps;
            }
        }
        perf.samples += 1;
    }

    /// Snapshot of the performance record
    #[must_use]
    pub fn performance(&self) -> TargetPerformance {
        self.perf
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the resource gauges
    #[must_use]
    pub fn resources(&self) -> ResourceHeadroom {
        self.resources
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Updates the resource gauges
    pub fn set_resources(&self, headroom: ResourceHeadroom) {
        *self
            .resources
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = headroom;
    }

    /// Current health flag
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Sets the health flag
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Whether the target is blacklisted
    #[must_use]
    pub fn is_blacklisted(&self) -> bool {
        self.blacklisted.load(Ordering::Relaxed)
    }

    /// Sets the blacklist flag
    pub fn set_blacklisted(&self, blacklisted: bool) {
        self.blacklisted.store(blacklisted, Ordering::Relaxed);
    }

    /// Composite quality score used for failover ordering
    #[must_use]
    pub fn quality_score(&self) -> f64 {
        let perf = self.performance();
        let health = if self.is_healthy() { 1.0 } else { 0.0 };
        let latency_term = 1.0 / (1.0 + perf.response_time_ms / 100.0);
        let load_term = 1.0 - self.load_factor();
        0.35 * health
            + 0.25 * perf.success_rate
            + 0.2 * latency_term
            + 0.1 * load_term
            + 0.1 * self.target.governance.trust.as_f64()
    }
}

/// Performance requirements a request may impose on targets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceRequirements {
    /// Maximum acceptable EMA response time
    pub max_response_time_ms: Option<f64>,
    /// Minimum throughput
    pub min_throughput_rps: Option<f64>,
    /// Minimum success rate
    pub min_success_rate: Option<f64>,
    /// Maximum error rate
    pub max_error_rate: Option<f64>,
}

/// A request for target selection
#[derive(Debug, Clone, Default)]
pub struct SelectRequest {
    /// Priority of the underlying message
    pub priority: MessagePriority,
    /// The request is latency-sensitive
    pub latency_sensitive: bool,
    /// Expected duration, used by the predictive algorithm
    pub expected_duration_ms: Option<f64>,
    /// Governance requirements, if any
    pub governance: Option<GovernanceRequirements>,
    /// Performance requirements, if any
    pub performance: Option<PerformanceRequirements>,
    /// Consider unhealthy targets too (operator override)
    pub allow_unhealthy: bool,
}

/// Why traffic failed over from a primary target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    /// Immediate: the target went unhealthy
    HealthFailure,
    /// Gradual: shift traffic weight away
    PerformanceDegradation,
    /// The target hit its capacity ceiling
    CapacityExceeded,
    /// The request timed out
    Timeout,
}

/// The outcome of a selection
#[derive(Debug, Clone)]
pub struct Selection {
    /// Correlates with `report_completion`
    pub request_id: BalanceRequestId,
    /// Selected agent
    pub agent: AgentId,
    /// Selected endpoint
    pub endpoint: EndpointAddress,
    /// Endpoint protocol
    pub protocol: ProtocolId,
    /// Algorithm that made the choice
    pub algorithm: super::algorithms::BalancingAlgorithmId,
    /// Ordered failover alternatives (best first, at most three)
    pub alternatives: Vec<AgentId>,
    /// When the selection was made
    pub selected_at: SystemTime,
}
