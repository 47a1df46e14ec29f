//! Balancing algorithms
//!
//! Each algorithm is a strategy over the eligible target set; context comes
//! in through the request, never through shared base state. The adaptive
//! algorithm is a deterministic UCB bandit over the concrete strategies.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::domain_types::{SelectRequest, TargetState};

/// Identifiers for the registered balancing algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalancingAlgorithmId {
    /// Rotate through targets
    #[default]
    RoundRobin,
    /// Rotate weighted by performance score
    WeightedRoundRobin,
    /// Fewest active requests
    LeastConnections,
    /// Lowest EMA response time
    LeastResponseTime,
    /// Most composite resource headroom
    ResourceBased,
    /// Highest trust, then lowest response time
    TrustBased,
    /// Trust + compliance + audit capability
    GovernanceOptimized,
    /// Lowest projected load over the request's expected duration
    Predictive,
    /// Bandit over the other algorithms using observed reward
    AdaptiveMl,
}

impl BalancingAlgorithmId {
    /// The concrete (non-meta) algorithms
    pub const CONCRETE: [Self; 8] = [
        Self::RoundRobin,
        Self::WeightedRoundRobin,
        Self::LeastConnections,
        Self::LeastResponseTime,
        Self::ResourceBased,
        Self::TrustBased,
        Self::GovernanceOptimized,
        Self::Predictive,
    ];
}

/// Strategy interface: pick one target among the eligible set
pub trait BalancingAlgorithm: Send + Sync {
    /// Stable identifier
    fn id(&self) -> BalancingAlgorithmId;

    /// Picks a target; `None` only when `eligible` is empty
    fn select(&self, request: &SelectRequest, eligible: &[Arc<TargetState>])
        -> Option<Arc<TargetState>>;
}

fn max_by_score(
    eligible: &[Arc<TargetState>],
    score: impl Fn(&Arc<TargetState>) -> f64,
) -> Option<Arc<TargetState>> {
    eligible
        .iter()
        .max_by(|a, b| {
            score(a)
                .partial_cmp(&score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .cloned()
}

/// Rotates through the eligible set
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl BalancingAlgorithm for RoundRobin {
    fn id(&self) -> BalancingAlgorithmId {
        BalancingAlgorithmId::RoundRobin
    }

    fn select(
        &self,
        _request: &SelectRequest,
        eligible: &[Arc<TargetState>],
    ) -> Option<Arc<TargetState>> {
        if eligible.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Some(Arc::clone(&eligible[index]))
    }
}

/// Weighted rotation; weight is the target's performance score
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    counter: AtomicUsize,
}

impl BalancingAlgorithm for WeightedRoundRobin {
    fn id(&self) -> BalancingAlgorithmId {
        BalancingAlgorithmId::WeightedRoundRobin
    }

    fn select(
        &self,
        _request: &SelectRequest,
        eligible: &[Arc<TargetState>],
    ) -> Option<Arc<TargetState>> {
        if eligible.is_empty() {
            return None;
        }
        // Integer weights from static weight x quality, minimum 1 slot each.
        let weights: Vec<usize> = eligible
            .iter()
            .map(|t| ((t.target.weight * t.quality_score() * 10.0).round() as usize).max(1))
            .collect();
        let total: usize = weights.iter().sum();
        let mut slot = self.counter.fetch_add(1, Ordering::Relaxed) % total;
        for (target, weight) in eligible.iter().zip(weights) {
            if slot < weight {
                return Some(Arc::clone(target));
            }
            slot -= weight;
        }
        eligible.last().cloned()
    }
}

/// Fewest active requests wins
#[derive(Debug, Default)]
pub struct LeastConnections;

impl BalancingAlgorithm for LeastConnections {
    fn id(&self) -> BalancingAlgorithmId {
        BalancingAlgorithmId::LeastConnections
    }

    fn select(
        &self,
        _request: &SelectRequest,
        eligible: &[Arc<TargetState>],
    ) -> Option<Arc<TargetState>> {
        eligible
            .iter()
            .min_by_key(|t| t.active_requests())
            .cloned()
    }
}

/// Lowest EMA response time wins
#[derive(Debug, Default)]
pub struct LeastResponseTime;

impl BalancingAlgorithm for LeastResponseTime {
    fn id(&self) -> BalancingAlgorithmId {
        BalancingAlgorithmId::LeastResponseTime
    }

    fn select(
        &self,
        _request: &SelectRequest,
        eligible: &[Arc<TargetState>],
    ) -> Option<Arc<TargetState>> {
        max_by_score(eligible, |t| -t.performance().response_time_ms)
    }
}

/// Most composite CPU/memory/network headroom wins
#[derive(Debug, Default)]
pub struct ResourceBased;

impl BalancingAlgorithm for ResourceBased {
    fn id(&self) -> BalancingAlgorithmId {
        BalancingAlgorithmId::ResourceBased
    }

    fn select(
        &self,
        _request: &SelectRequest,
        eligible: &[Arc<TargetState>],
    ) -> Option<Arc<TargetState>> {
        max_by_score(eligible, |t| {
            let r = t.resources();
            0.5 * r.cpu + 0.3 * r.memory + 0.2 * r.network
        })
    }
}

/// Highest trust wins; response time breaks ties
#[derive(Debug, Default)]
pub struct TrustBased;

impl BalancingAlgorithm for TrustBased {
    fn id(&self) -> BalancingAlgorithmId {
        BalancingAlgorithmId::TrustBased
    }

    fn select(
        &self,
        _request: &SelectRequest,
        eligible: &[Arc<TargetState>],
    ) -> Option<Arc<TargetState>> {
        max_by_score(eligible, |t| {
            let latency_tiebreak = 1.0 / (1.0 + t.performance().response_time_ms / 1_000.0);
            t.target.governance.trust.as_f64() + latency_tiebreak * 1e-3
        })
    }
}

/// Trust, compliance level, and audit capability combined
#[derive(Debug, Default)]
pub struct GovernanceOptimized;

impl BalancingAlgorithm for GovernanceOptimized {
    fn id(&self) -> BalancingAlgorithmId {
        BalancingAlgorithmId::GovernanceOptimized
    }

    fn select(
        &self,
        _request: &SelectRequest,
        eligible: &[Arc<TargetState>],
    ) -> Option<Arc<TargetState>> {
        max_by_score(eligible, |t| {
            let g = &t.target.governance;
            0.5 * g.trust.as_f64()
                + 0.3 * g.compliance_level
                + 0.2 * f64::from(u8::from(g.audit_capable))
        })
    }
}

/// Lowest projected load over the request's expected duration wins
#[derive(Debug, Default)]
pub struct Predictive;

impl BalancingAlgorithm for Predictive {
    fn id(&self) -> BalancingAlgorithmId {
        BalancingAlgorithmId::Predictive
    }

    fn select(
        &self,
        request: &SelectRequest,
        eligible: &[Arc<TargetState>],
    ) -> Option<Arc<TargetState>> {
        let horizon_ms = request.expected_duration_ms.unwrap_or(100.0).max(1.0);
        max_by_score(eligible, |t| {
            let perf = t.performance();
            // Requests expected to finish within the horizon free capacity.
            let drain = if perf.response_time_ms > 0.0 {
                (horizon_ms / perf.response_time_ms).min(f64::from(t.active_requests()))
            } else {
                f64::from(t.active_requests())
            };
            let projected = f64::from(t.active_requests()) - drain;
            -(projected / f64::from(t.target.capacity.max(1)))
        })
    }
}

/// Deterministic UCB bandit over the concrete algorithms
pub struct AdaptiveMl {
    delegates: Vec<Arc<dyn BalancingAlgorithm>>,
    rewards: dashmap::DashMap<BalancingAlgorithmId, (f64, u64)>,
    alpha: f64,
}

impl std::fmt::Debug for AdaptiveMl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveMl")
            .field("delegates", &self.delegates.len())
            .finish_non_exhaustive()
    }
}

impl AdaptiveMl {
    /// Creates the bandit over the default delegate set
    #[must_use]
    pub fn new(alpha: f64) -> Self {
        Self {
            delegates: vec![
                Arc::new(RoundRobin::default()),
                Arc::new(WeightedRoundRobin::default()),
                Arc::new(LeastConnections),
                Arc::new(LeastResponseTime),
                Arc::new(ResourceBased),
                Arc::new(TrustBased),
                Arc::new(GovernanceOptimized),
                Arc::new(Predictive),
            ],
            rewards: dashmap::DashMap::new(),
            alpha,
        }
    }

    /// Folds an observed reward for the algorithm that made a selection
    pub fn record_reward(&self, id: BalancingAlgorithmId, reward: f64) {
        self.rewards
            .entry(id)
            .and_modify(|(value, samples)| {
                *value = self.alpha * reward + (1.0 - self.alpha) * *value;
                *samples += 1;
            })
            .or_insert((reward, 1));
    }

    fn ucb(&self, id: BalancingAlgorithmId, total: u64) -> f64 {
        match self.rewards.get(&id) {
            Some(entry) => {
                let (value, samples) = *entry;
                let exploration = (2.0 * (total.max(1) as f64).ln() / samples as f64).sqrt();
                value + exploration
            }
            None => f64::MAX, // unexplored arms first
        }
    }
}

impl BalancingAlgorithm for AdaptiveMl {
    fn id(&self) -> BalancingAlgorithmId {
        BalancingAlgorithmId::AdaptiveMl
    }

    fn select(
        &self,
        request: &SelectRequest,
        eligible: &[Arc<TargetState>],
    ) -> Option<Arc<TargetState>> {
        let total: u64 = self.rewards.iter().map(|entry| entry.value().1).sum();
        let delegate = self
            .delegates
            .iter()
            .max_by(|a, b| {
                self.ucb(a.id(), total)
                    .partial_cmp(&self.ucb(b.id(), total))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()?;
        delegate.select(request, eligible)
    }
}
