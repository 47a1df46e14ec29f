//! Routing algorithms
//!
//! Each algorithm is a small capability interface over a pre-scored candidate
//! list; context (message, config, metrics) is passed explicitly. Candidates
//! arrive sorted by cost score ascending with deterministic tie-breaks, so an
//! algorithm that wants "cheapest" can take the front.

use dashmap::DashMap;
use std::sync::Arc;

use super::domain_types::{Route, RoutingAlgorithmId};
use crate::bus::domain_types::Message;
use crate::domain_types::{EmaAlpha, MessageType};

/// Payloads at or above this size prefer bandwidth over latency
const LARGE_PAYLOAD_BYTES: usize = 256 * 1024;

/// Strategy interface: choose one route among scored candidates
pub trait RoutingAlgorithm: Send + Sync {
    /// Stable identifier for registries and reward tables
    fn id(&self) -> RoutingAlgorithmId;

    /// Picks a route; `None` when no candidate satisfies the algorithm
    ///
    /// `candidates` is non-empty and sorted by cost ascending.
    fn choose(&self, message: &Message, candidates: &[Route]) -> Option<Route>;
}

/// Minimizes graph hop count; ties fall back to cost order
#[derive(Debug, Default)]
pub struct ShortestPath;

impl RoutingAlgorithm for ShortestPath {
    fn id(&self) -> RoutingAlgorithmId {
        RoutingAlgorithmId::ShortestPath
    }

    fn choose(&self, _message: &Message, candidates: &[Route]) -> Option<Route> {
        candidates
            .iter()
            .min_by_key(|route| route.hop_count())
            .cloned()
    }
}

/// Minimizes load factor among routes within the latency bound
#[derive(Debug)]
pub struct LoadAware {
    /// Routes slower than this are considered only when nothing else fits
    pub latency_bound_ms: f64,
}

impl Default for LoadAware {
    fn default() -> Self {
        Self {
            latency_bound_ms: 1_000.0,
        }
    }
}

impl RoutingAlgorithm for LoadAware {
    fn id(&self) -> RoutingAlgorithmId {
        RoutingAlgorithmId::LoadAware
    }

    fn choose(&self, _message: &Message, candidates: &[Route]) -> Option<Route> {
        let within_bound: Vec<&Route> = candidates
            .iter()
            .filter(|route| route.est_latency_ms <= self.latency_bound_ms)
            .collect();
        // Nothing under the bound: fall back to the whole candidate set.
        let pool: Vec<&Route> = if within_bound.is_empty() {
            candidates.iter().collect()
        } else {
            within_bound
        };
        pool.into_iter()
            .min_by(|a, b| {
                a.load_factor
                    .as_f64()
                    .partial_cmp(&b.load_factor.as_f64())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }
}

/// Maximizes trust above the message's threshold, then minimizes cost
#[derive(Debug, Default)]
pub struct TrustBased;

impl RoutingAlgorithm for TrustBased {
    fn id(&self) -> RoutingAlgorithmId {
        RoutingAlgorithmId::TrustBased
    }

    fn choose(&self, message: &Message, candidates: &[Route]) -> Option<Route> {
        let threshold = message
            .governance
            .as_ref()
            .and_then(|g| g.trust_score_minimum)
            .map_or(0.0, |t| t.as_f64());
        let mut trusted: Vec<&Route> = candidates
            .iter()
            .filter(|route| route.trust.map_or(0.5, |t| t.as_f64()) >= threshold)
            .collect();
        if trusted.is_empty() {
            return None;
        }
        // Highest trust wins; candidates arrive cost-sorted, so a stable sort
        // leaves cheapest-first within equal trust.
        trusted.sort_by(|a, b| {
            let ta = a.trust.map_or(0.5, |t| t.as_f64());
            let tb = b.trust.map_or(0.5, |t| t.as_f64());
            tb.partial_cmp(&ta).unwrap_or(std::cmp::Ordering::Equal)
        });
        trusted.first().map(|route| (*route).clone())
    }
}

/// Minimizes estimated latency
#[derive(Debug, Default)]
pub struct LatencyOptimized;

impl RoutingAlgorithm for LatencyOptimized {
    fn id(&self) -> RoutingAlgorithmId {
        RoutingAlgorithmId::LatencyOptimized
    }

    fn choose(&self, _message: &Message, candidates: &[Route]) -> Option<Route> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.est_latency_ms
                    .partial_cmp(&b.est_latency_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }
}

/// Maximizes sustainable throughput, intended for large payloads
#[derive(Debug, Default)]
pub struct BandwidthOptimized;

impl RoutingAlgorithm for BandwidthOptimized {
    fn id(&self) -> RoutingAlgorithmId {
        RoutingAlgorithmId::BandwidthOptimized
    }

    fn choose(&self, _message: &Message, candidates: &[Route]) -> Option<Route> {
        candidates
            .iter()
            .max_by(|a, b| {
                a.est_bandwidth_mbps
                    .partial_cmp(&b.est_bandwidth_mbps)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }
}

/// Exponentially-weighted reward for one algorithm in one bucket
#[derive(Debug, Clone, Copy)]
struct Reward {
    value: f64,
    samples: u64,
}

/// Picks among the concrete algorithms using a per-message-type reward table
///
/// Rewards are updated lock-free (per-bucket entry under the map's shard
/// lock); slight update skew is tolerable.
pub struct AdaptiveRouting {
    delegates: Vec<Arc<dyn RoutingAlgorithm>>,
    rewards: DashMap<(MessageType, RoutingAlgorithmId), Reward>,
    alpha: EmaAlpha,
}

impl std::fmt::Debug for AdaptiveRouting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRouting")
            .field("delegates", &self.delegates.len())
            .field("buckets", &self.rewards.len())
            .finish()
    }
}

impl AdaptiveRouting {
    /// Creates the adaptive selector over the default delegate set
    #[must_use]
    pub fn new(alpha: EmaAlpha) -> Self {
        Self {
            delegates: vec![
                Arc::new(ShortestPath),
                Arc::new(LoadAware::default()),
                Arc::new(TrustBased),
                Arc::new(LatencyOptimized),
                Arc::new(BandwidthOptimized),
            ],
            rewards: DashMap::new(),
            alpha,
        }
    }

    /// Records the outcome of a send routed by `algorithm`
    ///
    /// Reward is 1.0 for success discounted by latency, 0.0 for failure.
    pub fn record_outcome(
        &self,
        message_type: &MessageType,
        algorithm: RoutingAlgorithmId,
        success: bool,
        latency_ms: f64,
    ) {
        let reward = if success {
            1.0 / (1.0 + (latency_ms / 1_000.0))
        } else {
            0.0
        };
        let alpha = self.alpha.as_f64();
        self.rewards
            .entry((message_type.clone(), algorithm))
            .and_modify(|entry| {
                entry.value = alpha * reward + (1.0 - alpha) * entry.value;
                entry.samples += 1;
            })
            .or_insert(Reward {
                value: reward,
                samples: 1,
            });
    }

    fn best_delegate(&self, message_type: &MessageType, message: &Message) -> Arc<dyn RoutingAlgorithm> {
        let mut best: Option<(f64, Arc<dyn RoutingAlgorithm>)> = None;
        for delegate in &self.delegates {
            let reward = self
                .rewards
                .get(&(message_type.clone(), delegate.id()))
                .map(|r| r.value)
                .unwrap_or_else(|| self.prior_for(delegate.id(), message));
            if best.as_ref().map_or(true, |(r, _)| reward > *r) {
                best = Some((reward, Arc::clone(delegate)));
            }
        }
        best.map(|(_, delegate)| delegate)
            .unwrap_or_else(|| Arc::new(LoadAware::default()))
    }

    /// Unscored buckets start from a message-shape prior instead of zero
    fn prior_for(&self, id: RoutingAlgorithmId, message: &Message) -> f64 {
        let hints = message.hints_or_default();
        match id {
            RoutingAlgorithmId::LatencyOptimized if hints.latency_sensitive => 0.6,
            RoutingAlgorithmId::BandwidthOptimized
                if message.payload.len() >= LARGE_PAYLOAD_BYTES =>
            {
                0.6
            }
            RoutingAlgorithmId::TrustBased if message.governance.is_some() => 0.6,
            RoutingAlgorithmId::LoadAware => 0.5,
            _ => 0.4,
        }
    }
}

impl RoutingAlgorithm for AdaptiveRouting {
    fn id(&self) -> RoutingAlgorithmId {
        RoutingAlgorithmId::Adaptive
    }

    fn choose(&self, message: &Message, candidates: &[Route]) -> Option<Route> {
        let delegate = self.best_delegate(&message.message_type, message);
        delegate.choose(message, candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::domain_types::{GovernanceRequirements, MessagePriority, PayloadEnvelope};
    use crate::domain_types::{
        AgentId, LoadFactor, MessageId, ProtocolId, Reliability, RetryPolicy, TrustScore,
    };
    use crate::router::domain_types::RouteId;
    use bytes::Bytes;
    use std::time::{Duration, SystemTime};

    fn message(trust_min: Option<f64>) -> Message {
        Message {
            id: MessageId::try_new("m".to_string()).unwrap(),
            message_type: MessageType::try_new("vote".to_string()).unwrap(),
            priority: MessagePriority::Normal,
            source: AgentId::try_new("s".to_string()).unwrap(),
            destinations: vec![],
            payload: PayloadEnvelope::opaque(Bytes::from_static(b"x")),
            hints: None,
            correlation_id: None,
            deadline: SystemTime::now() + Duration::from_secs(60),
            retry_policy: RetryPolicy::default(),
            governance: trust_min.map(|t| GovernanceRequirements {
                trust_score_minimum: Some(TrustScore::try_new(t).unwrap()),
                ..GovernanceRequirements::default()
            }),
        }
    }

    fn route(id: &str, latency: f64, load: f64, trust: Option<f64>, hops: usize) -> Route {
        Route {
            route_id: RouteId::try_new(id.to_string()).unwrap(),
            destination: AgentId::try_new("d".to_string()).unwrap(),
            protocol: ProtocolId::try_new("stream".to_string()).unwrap(),
            est_latency_ms: latency,
            est_bandwidth_mbps: 100.0,
            reliability: Reliability::default(),
            load_factor: LoadFactor::try_new(load).unwrap(),
            trust: trust.map(|t| TrustScore::try_new(t).unwrap()),
            cost_score: 0.0,
            hops: (0..hops)
                .map(|n| AgentId::try_new(format!("hop{n}")).unwrap())
                .collect(),
        }
    }

    #[test]
    fn shortest_path_prefers_fewest_hops() {
        let candidates = vec![route("a", 10.0, 0.1, None, 2), route("b", 50.0, 0.9, None, 0)];
        let chosen = ShortestPath.choose(&message(None), &candidates).unwrap();
        assert_eq!(chosen.route_id.as_ref(), "b");
    }

    #[test]
    fn load_aware_honors_latency_bound() {
        let algorithm = LoadAware {
            latency_bound_ms: 100.0,
        };
        let candidates = vec![
            route("slow-idle", 500.0, 0.0, None, 0),
            route("fast-busy", 50.0, 0.6, None, 0),
            route("fast-idle", 60.0, 0.2, None, 0),
        ];
        let chosen = algorithm.choose(&message(None), &candidates).unwrap();
        assert_eq!(chosen.route_id.as_ref(), "fast-idle");
    }

    #[test]
    fn trust_based_filters_below_threshold() {
        let candidates = vec![
            route("low", 10.0, 0.1, Some(0.3), 0),
            route("high", 20.0, 0.1, Some(0.9), 0),
        ];
        let chosen = TrustBased.choose(&message(Some(0.8)), &candidates).unwrap();
        assert_eq!(chosen.route_id.as_ref(), "high");

        let none = TrustBased.choose(&message(Some(0.95)), &candidates);
        assert!(none.is_none());
    }

    #[test]
    fn adaptive_learns_from_rewards() {
        let adaptive = AdaptiveRouting::new(EmaAlpha::try_new(0.5).unwrap());
        let msg = message(None);
        // Make latency-optimized the clear winner for this bucket.
        for _ in 0..10 {
            adaptive.record_outcome(
                &msg.message_type,
                RoutingAlgorithmId::LatencyOptimized,
                true,
                10.0,
            );
            adaptive.record_outcome(&msg.message_type, RoutingAlgorithmId::LoadAware, false, 10.0);
        }
        let candidates = vec![
            route("fast", 5.0, 0.9, None, 0),
            route("idle", 500.0, 0.0, None, 0),
        ];
        let chosen = adaptive.choose(&msg, &candidates).unwrap();
        assert_eq!(chosen.route_id.as_ref(), "fast");
    }
}
