//! Load balancer core: eligibility, meta-selection, failover plans
//!
//! The eligible set starts from every registered target for the route and is
//! narrowed by health, load, governance, performance, blacklist, and breaker
//! admission. An empty eligible set fails with no partial state change.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::algorithms::{
    AdaptiveMl, BalancingAlgorithm, BalancingAlgorithmId, GovernanceOptimized, LeastConnections,
    LeastResponseTime, Predictive, ResourceBased, RoundRobin, TrustBased, WeightedRoundRobin,
};
use super::domain_types::{
    BalanceRequestId, FailoverReason, LoadBalanceTarget, Selection, SelectRequest, TargetState,
};
use crate::domain_types::AgentId;
use crate::error::CommError;
use crate::pool::circuit_breaker::CircuitBreaker;
use crate::pool::config::CircuitBreakerConfig;
use crate::time_provider::TimeProvider;

/// Balancer configuration
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Per-request algorithm meta-selection
    pub adaptive_algorithms: bool,
    /// Fixed algorithm when meta-selection is off
    pub default_algorithm: BalancingAlgorithmId,
    /// Targets at or above this load factor are filtered out
    pub redistribution_threshold: f64,
    /// EMA smoothing for target performance records
    pub ema_alpha: f64,
    /// Latency over EMA baseline that triggers re-evaluation
    pub latency_degradation_factor: f64,
    /// Breaker thresholds applied to every target
    pub breaker: CircuitBreakerConfig,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            adaptive_algorithms: false,
            default_algorithm: BalancingAlgorithmId::RoundRobin,
            redistribution_threshold: 0.9,
            ema_alpha: 0.2,
            latency_degradation_factor: 3.0,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Per-algorithm performance profile for the meta-selector
#[derive(Debug, Clone)]
struct AlgorithmProfile {
    score: f64,
    usage_count: u64,
}

struct PendingRequest {
    agent: AgentId,
    algorithm: BalancingAlgorithmId,
}

/// Picks among equivalent targets for a route
pub struct LoadBalancer {
    config: BalancerConfig,
    targets: DashMap<AgentId, Arc<TargetState>>,
    algorithms: Vec<Arc<dyn BalancingAlgorithm>>,
    adaptive: Arc<AdaptiveMl>,
    profiles: DashMap<BalancingAlgorithmId, AlgorithmProfile>,
    pending: DashMap<BalanceRequestId, PendingRequest>,
    time: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("targets", &self.targets.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl LoadBalancer {
    /// Creates a balancer with the full algorithm registry
    #[must_use]
    pub fn new(config: BalancerConfig, time: Arc<dyn TimeProvider>) -> Self {
        let adaptive = Arc::new(AdaptiveMl::new(config.ema_alpha));
        let algorithms: Vec<Arc<dyn BalancingAlgorithm>> = vec![
            Arc::new(RoundRobin::default()),
            Arc::new(WeightedRoundRobin::default()),
            Arc::new(LeastConnections),
            Arc::new(LeastResponseTime),
            Arc::new(ResourceBased),
            Arc::new(TrustBased),
            Arc::new(GovernanceOptimized),
            Arc::new(Predictive),
            Arc::clone(&adaptive) as Arc<dyn BalancingAlgorithm>,
        ];
        Self {
            config,
            targets: DashMap::new(),
            algorithms,
            adaptive,
            profiles: DashMap::new(),
            pending: DashMap::new(),
            time,
        }
    }

    /// Registers (or replaces) a target
    pub fn register_target(&self, target: LoadBalanceTarget) {
        let breaker = Arc::new(CircuitBreaker::new(
            self.config.breaker.clone(),
            Arc::clone(&self.time),
        ));
        debug!(agent = %target.agent, endpoint = %target.endpoint, "target registered");
        self.targets
            .insert(target.agent.clone(), Arc::new(TargetState::new(target, breaker)));
    }

    /// Removes a target
    pub fn deregister_target(&self, agent: &AgentId) {
        self.targets.remove(agent);
    }

    /// Live state for a target
    #[must_use]
    pub fn target_state(&self, agent: &AgentId) -> Option<Arc<TargetState>> {
        self.targets.get(agent).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether the agent's breaker currently blocks traffic
    #[must_use]
    pub fn is_agent_admitted(&self, agent: &AgentId) -> bool {
        self.targets
            .get(agent)
            .map_or(true, |entry| !entry.value().breaker().is_open())
    }

    /// Selects one target among the candidates for a route
    ///
    /// `candidates` restricts the search to a route's endpoint set; an empty
    /// slice considers every registered target.
    ///
    /// # Errors
    /// `NoRoute` when the eligible set is empty after filtering (with no
    /// partial state change), `AllRoutesOpen` when only breakers blocked.
    pub fn select(
        &self,
        request: &SelectRequest,
        candidates: &[AgentId],
    ) -> Result<Selection, CommError> {
        let mut eligible: Vec<Arc<TargetState>> = Vec::new();
        let mut breaker_blocked = 0usize;
        let mut admitted_probes: Vec<Arc<TargetState>> = Vec::new();

        let considered: Vec<Arc<TargetState>> = if candidates.is_empty() {
            self.targets
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect()
        } else {
            candidates
                .iter()
                .filter_map(|agent| self.target_state(agent))
                .collect()
        };

        for state in considered {
            if !self.passes_filters(request, &state) {
                continue;
            }
            match state.breaker().state() {
                crate::pool::circuit_breaker::BreakerState::Open => {
                    breaker_blocked += 1;
                }
                crate::pool::circuit_breaker::BreakerState::HalfOpen => {
                    // Half-open admits exactly one probe.
                    if state.breaker().try_admit() {
                        admitted_probes.push(state);
                    } else {
                        breaker_blocked += 1;
                    }
                }
                crate::pool::circuit_breaker::BreakerState::Closed => eligible.push(state),
            }
        }

        // A half-open probe outranks nothing: only used when it is all we have.
        if eligible.is_empty() {
            eligible = admitted_probes;
        }

        if eligible.is_empty() {
            if breaker_blocked > 0 {
                return Err(CommError::AllRoutesOpen {
                    candidates: breaker_blocked,
                });
            }
            return Err(CommError::NoRoute {
                detail: "eligible target set is empty".to_string(),
            });
        }

        let algorithm = self.algorithm_for(request);
        let selected = algorithm
            .select(request, &eligible)
            .ok_or_else(|| CommError::NoRoute {
                detail: "balancing algorithm declined every eligible target".to_string(),
            })?;

        // Failover plan: top three alternatives by quality, excluding primary.
        let mut alternatives: Vec<Arc<TargetState>> = eligible
            .iter()
            .filter(|t| t.target.agent != selected.target.agent)
            .cloned()
            .collect();
        alternatives.sort_by(|a, b| {
            b.quality_score()
                .partial_cmp(&a.quality_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        alternatives.truncate(3);

        selected.begin_request();
        let request_id = BalanceRequestId::generate();
        self.pending.insert(
            request_id,
            PendingRequest {
                agent: selected.target.agent.clone(),
                algorithm: algorithm.id(),
            },
        );
        self.profiles
            .entry(algorithm.id())
            .and_modify(|profile| profile.usage_count += 1)
            .or_insert(AlgorithmProfile {
                score: 0.5,
                usage_count: 1,
            });

        trace!(
            request = %request_id,
            agent = %selected.target.agent,
            algorithm = ?algorithm.id(),
            "target selected"
        );

        Ok(Selection {
            request_id,
            agent: selected.target.agent.clone(),
            endpoint: selected.target.endpoint.clone(),
            protocol: selected.target.protocol.clone(),
            algorithm: algorithm.id(),
            alternatives: alternatives
                .into_iter()
                .map(|t| t.target.agent.clone())
                .collect(),
            selected_at: self.time.now(),
        })
    }

    /// Reports the completion of a selected request
    ///
    /// Feeds the target's EMAs, its breaker, and the algorithm reward table.
    pub fn report_completion(
        &self,
        request_id: BalanceRequestId,
        success: bool,
        latency_ms: f64,
        error: Option<&CommError>,
    ) {
        let Some((_, pending)) = self.pending.remove(&request_id) else {
            return;
        };
        let Some(state) = self.target_state(&pending.agent) else {
            return;
        };

        let baseline = state.performance().response_time_ms;
        state.complete_request(self.config.ema_alpha, success, latency_ms);
        if success {
            state.breaker().record_success();
        } else {
            state.breaker().record_failure();
        }

        let reward = if success {
            1.0 / (1.0 + latency_ms / 100.0)
        } else {
            0.0
        };
        self.adaptive.record_reward(pending.algorithm, reward);
        self.profiles
            .entry(pending.algorithm)
            .and_modify(|profile| {
                profile.score =
                    self.config.ema_alpha * reward + (1.0 - self.config.ema_alpha) * profile.score;
            })
            .or_insert(AlgorithmProfile {
                score: reward,
                usage_count: 1,
            });

        // Adaptation heuristic: a failure or latency far beyond baseline is
        // surfaced for failover consideration. The health flag itself stays
        // owned by the health monitor; the breaker handles hard blocking.
        let degraded = !success
            || (baseline > 0.0 && latency_ms > baseline * self.config.latency_degradation_factor);
        if degraded {
            let reason = if success {
                FailoverReason::PerformanceDegradation
            } else if error.is_some_and(|e| matches!(e, CommError::RemoteTimeout { .. })) {
                FailoverReason::Timeout
            } else {
                FailoverReason::HealthFailure
            };
            warn!(agent = %pending.agent, ?reason, "target flagged for failover consideration");
        }
    }

    /// Marks an agent healthy/unhealthy (driven by the health monitor)
    pub fn set_agent_health(&self, agent: &AgentId, healthy: bool) {
        if let Some(state) = self.target_state(agent) {
            state.set_healthy(healthy);
        }
    }

    fn passes_filters(&self, request: &SelectRequest, state: &Arc<TargetState>) -> bool {
        if state.is_blacklisted() {
            return false;
        }
        if !state.is_healthy() && !request.allow_unhealthy {
            return false;
        }
        if state.load_factor() >= self.config.redistribution_threshold {
            return false;
        }
        if let Some(governance) = &request.governance {
            let profile = &state.target.governance;
            if let Some(min_trust) = governance.trust_score_minimum {
                if profile.trust.as_f64() < min_trust.as_f64() {
                    return false;
                }
            }
            if governance.audit_required && !profile.audit_capable {
                return false;
            }
            if governance.accountability_required && !profile.accountability {
                return false;
            }
            if governance.consensus_required && !profile.consensus_capable {
                return false;
            }
        }
        if let Some(performance) = &request.performance {
            let perf = state.performance();
            if perf.samples > 0 {
                if let Some(max_response) = performance.max_response_time_ms {
                    if perf.response_time_ms > max_response {
                        return false;
                    }
                }
                if let Some(min_throughput) = performance.min_throughput_rps {
                    if perf.throughput_rps < min_throughput {
                        return false;
                    }
                }
                if let Some(min_success) = performance.min_success_rate {
                    if perf.success_rate < min_success {
                        return false;
                    }
                }
                if let Some(max_error) = performance.max_error_rate {
                    if perf.error_rate > max_error {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn algorithm_for(&self, request: &SelectRequest) -> Arc<dyn BalancingAlgorithm> {
        let wanted = if self.config.adaptive_algorithms {
            self.meta_select(request)
        } else {
            self.config.default_algorithm
        };
        self.algorithms
            .iter()
            .find(|algorithm| algorithm.id() == wanted)
            .cloned()
            .unwrap_or_else(|| Arc::new(RoundRobin::default()))
    }

    /// Combines algorithm performance profiles with request properties
    fn meta_select(&self, request: &SelectRequest) -> BalancingAlgorithmId {
        if request
            .governance
            .as_ref()
            .is_some_and(|g| g.audit_required || g.consensus_required)
        {
            return BalancingAlgorithmId::GovernanceOptimized;
        }
        if request
            .governance
            .as_ref()
            .is_some_and(|g| g.trust_score_minimum.is_some())
        {
            return BalancingAlgorithmId::TrustBased;
        }
        if request.latency_sensitive {
            return BalancingAlgorithmId::LeastResponseTime;
        }
        // Otherwise the best-scoring profile so far, falling back to the
        // bandit when nothing is recorded yet.
        self.profiles
            .iter()
            .max_by(|a, b| {
                a.value()
                    .score
                    .partial_cmp(&b.value().score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map_or(BalancingAlgorithmId::AdaptiveMl, |entry| *entry.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::domain_types::GovernanceProfile;
    use crate::bus::domain_types::GovernanceRequirements;
    use crate::domain_types::{EndpointAddress, ProtocolId, TrustScore};
    use crate::time_provider::MockTimeProvider;
    use std::time::Duration;

    fn balancer() -> (LoadBalancer, Arc<MockTimeProvider>) {
        let clock = Arc::new(MockTimeProvider::new());
        (
            LoadBalancer::new(
                BalancerConfig {
                    breaker: CircuitBreakerConfig {
                        failure_threshold: 3,
                        success_threshold: 1,
                        timeout: Duration::from_secs(10),
                    },
                    ..BalancerConfig::default()
                },
                Arc::clone(&clock) as Arc<dyn TimeProvider>,
            ),
            clock,
        )
    }

    fn target(name: &str, trust: f64) -> LoadBalanceTarget {
        LoadBalanceTarget {
            agent: AgentId::try_new(name.to_string()).unwrap(),
            endpoint: EndpointAddress::try_new(format!("{name}:9000")).unwrap(),
            protocol: ProtocolId::try_new("stream".to_string()).unwrap(),
            capacity: 10,
            weight: 1.0,
            governance: GovernanceProfile {
                trust: TrustScore::try_new(trust).unwrap(),
                audit_capable: trust > 0.8,
                ..GovernanceProfile::default()
            },
        }
    }

    #[test]
    fn empty_registry_is_no_route() {
        let (lb, _) = balancer();
        let err = lb.select(&SelectRequest::default(), &[]).unwrap_err();
        assert_eq!(err.kind(), "no_route");
    }

    #[test]
    fn selection_tracks_active_requests() {
        let (lb, _) = balancer();
        lb.register_target(target("a", 0.5));
        let selection = lb.select(&SelectRequest::default(), &[]).unwrap();
        let state = lb.target_state(&selection.agent).unwrap();
        assert_eq!(state.active_requests(), 1);
        lb.report_completion(selection.request_id, true, 10.0, None);
        assert_eq!(state.active_requests(), 0);
        assert_eq!(state.completed_requests(), 1);
    }

    #[test]
    fn governance_requirements_filter_targets() {
        let (lb, _) = balancer();
        lb.register_target(target("plain", 0.4));
        lb.register_target(target("audited", 0.9));
        let request = SelectRequest {
            governance: Some(GovernanceRequirements {
                audit_required: true,
                trust_score_minimum: Some(TrustScore::try_new(0.8).unwrap()),
                ..GovernanceRequirements::default()
            }),
            ..SelectRequest::default()
        };
        let selection = lb.select(&request, &[]).unwrap();
        assert_eq!(selection.agent.as_ref(), "audited");
    }

    #[test]
    fn breaker_cycle_open_probe_close() {
        let (lb, clock) = balancer();
        lb.register_target(target("t", 0.5));
        let agent = AgentId::try_new("t".to_string()).unwrap();

        // Three consecutive failures trip the breaker.
        for _ in 0..3 {
            let selection = lb.select(&SelectRequest::default(), &[]).unwrap();
            lb.report_completion(
                selection.request_id,
                false,
                0.0,
                Some(&CommError::Transport {
                    detail: "injected".to_string(),
                    retryable: true,
                }),
            );
        }
        let err = lb.select(&SelectRequest::default(), &[]).unwrap_err();
        assert_eq!(err.kind(), "all_routes_open");

        // After the timeout exactly one probe is admitted.
        clock.advance(Duration::from_secs(11));
        let probe = lb.select(&SelectRequest::default(), &[]).unwrap();
        let second = lb.select(&SelectRequest::default(), &[]);
        assert!(second.is_err());
        lb.report_completion(probe.request_id, true, 5.0, None);

        // Success threshold 1: breaker closed again.
        assert!(lb.is_agent_admitted(&agent));
        assert!(lb.select(&SelectRequest::default(), &[]).is_ok());
    }

    #[test]
    fn overloaded_targets_are_filtered() {
        let (lb, _) = balancer();
        lb.register_target(target("full", 0.5));
        let state = lb
            .target_state(&AgentId::try_new("full".to_string()).unwrap())
            .unwrap();
        for _ in 0..10 {
            state.begin_request();
        }
        let err = lb.select(&SelectRequest::default(), &[]).unwrap_err();
        assert_eq!(err.kind(), "no_route");
    }

    #[test]
    fn failover_plan_lists_alternatives_by_quality() {
        let (lb, _) = balancer();
        lb.register_target(target("a", 0.9));
        lb.register_target(target("b", 0.7));
        lb.register_target(target("c", 0.5));
        lb.register_target(target("d", 0.3));
        let selection = lb.select(&SelectRequest::default(), &[]).unwrap();
        assert_eq!(selection.alternatives.len(), 3);
        assert!(!selection.alternatives.contains(&selection.agent));
    }

    #[test]
    fn candidate_slice_restricts_the_pool() {
        let (lb, _) = balancer();
        lb.register_target(target("in", 0.5));
        lb.register_target(target("out", 0.5));
        let candidates = vec![AgentId::try_new("in".to_string()).unwrap()];
        for _ in 0..5 {
            let selection = lb.select(&SelectRequest::default(), &candidates).unwrap();
            assert_eq!(selection.agent.as_ref(), "in");
            lb.report_completion(selection.request_id, true, 5.0, None);
        }
    }
}
