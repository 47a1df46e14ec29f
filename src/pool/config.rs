//! Pool configuration, scaling policy, and breaker thresholds

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sizing algorithms; only `Reactive` is implemented, the rest fall back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAlgorithm {
    /// Threshold-driven scaling on observed utilization
    #[default]
    Reactive,
    /// Forecast-driven; accepted, falls back to reactive
    Predictive,
    /// Self-tuning thresholds; accepted, falls back to reactive
    Adaptive,
    /// Model-driven; accepted, falls back to reactive
    Ml,
}

/// Dynamic sizing policy evaluated at `check_interval`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalingPolicy {
    /// Sizing algorithm
    pub algorithm: ScalingAlgorithm,
    /// Utilization above which the pool grows
    pub high_threshold: f64,
    /// Utilization below which the pool shrinks
    pub low_threshold: f64,
    /// How long a threshold must hold before acting
    pub trigger_duration: Duration,
    /// Connections added per scale-up
    pub scale_up_increment: usize,
    /// Idle connections removed per scale-down
    pub scale_down_increment: usize,
    /// Hard cap on connections added in one action
    pub max_scale_up_rate: usize,
    /// Minimum time between consecutive scaling actions
    pub cooldown: Duration,
    /// How often the policy is evaluated
    pub check_interval: Duration,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            algorithm: ScalingAlgorithm::Reactive,
            high_threshold: 0.8,
            low_threshold: 0.3,
            trigger_duration: Duration::from_secs(60),
            scale_up_increment: 2,
            scale_down_increment: 2,
            max_scale_up_rate: 5,
            cooldown: Duration::from_secs(60),
            check_interval: Duration::from_secs(10),
        }
    }
}

/// Circuit breaker thresholds for one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker open
    pub failure_threshold: u32,
    /// Successes in half-open that close it again
    pub success_threshold: u32,
    /// How long the breaker stays open before admitting a probe
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for one pool (and the manager default)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Lower bound on pool size
    pub min_size: usize,
    /// Upper bound on pool size
    pub max_size: usize,
    /// Lease lifetime before the sweeper reclaims it
    pub lease_ttl: Duration,
    /// Run a validation probe before granting an idle connection
    pub validate_on_acquire: bool,
    /// Consecutive probe failures that mark a connection failed
    pub connection_failure_threshold: u32,
    /// Creation retry attempts before the pool degrades
    pub connection_retry_attempts: u32,
    /// Delay between creation retries
    pub connection_retry_delay: Duration,
    /// Failure-rate ceiling for pool health
    pub healthy_failure_rate: f64,
    /// P95 latency ceiling for pool health
    pub healthy_p95_latency_ms: f64,
    /// How often expired leases are swept
    pub sweep_interval: Duration,
    /// Sizing policy
    pub scaling: ScalingPolicy,
    /// Breaker thresholds for the pool's endpoint
    pub breaker: CircuitBreakerConfig,
}

impl PoolConfig {
    /// Validates bounds consistency
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.min_size <= self.max_size
            && self.max_size > 0
            && self.scaling.low_threshold < self.scaling.high_threshold
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            lease_ttl: Duration::from_secs(30),
            validate_on_acquire: false,
            connection_failure_threshold: 3,
            connection_retry_attempts: 3,
            connection_retry_delay: Duration::from_millis(200),
            healthy_failure_rate: 0.1,
            healthy_p95_latency_ms: 500.0,
            sweep_interval: Duration::from_secs(5),
            scaling: ScalingPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PoolConfig::default().is_valid());
    }

    #[test]
    fn inverted_bounds_are_invalid() {
        let config = PoolConfig {
            min_size: 10,
            max_size: 2,
            ..PoolConfig::default()
        };
        assert!(!config.is_valid());
    }
}
