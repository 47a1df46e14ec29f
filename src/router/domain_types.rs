//! Domain types for the message router

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::domain_types::{AgentId, LoadFactor, MessageId, ProtocolId, Reliability, TrustScore};

/// Identifier for a route, deterministic for a `(destination, protocol)` pair
#[nutype(
    validate(len_char_min = 1, len_char_max = 512),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct RouteId(String);

/// Identifiers for the registered routing algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingAlgorithmId {
    /// Minimize graph hop count
    ShortestPath,
    /// Minimize load factor subject to a latency bound
    #[default]
    LoadAware,
    /// Maximize trust above a threshold, then minimize cost
    TrustBased,
    /// Minimize estimated latency
    LatencyOptimized,
    /// Maximize sustainable throughput for large payloads
    BandwidthOptimized,
    /// Pick among the others based on recent reward per message-type bucket
    Adaptive,
}

/// A candidate path for a single send
///
/// Derived data, cached per `(source, destination)` with a TTL. Missing
/// optional fields use documented defaults during scoring: `trust` defaults
/// to 0.5, `reliability` to 1.0, `load_factor` to 0.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Deterministic route identifier (lexicographic tie-break key)
    pub route_id: RouteId,
    /// Destination agent
    pub destination: AgentId,
    /// Transport profile this route travels over
    pub protocol: ProtocolId,
    /// Estimated one-way latency in milliseconds
    pub est_latency_ms: f64,
    /// Estimated sustainable bandwidth in Mbps
    pub est_bandwidth_mbps: f64,
    /// Observed success fraction
    pub reliability: Reliability,
    /// Current load of the path
    pub load_factor: LoadFactor,
    /// Trust score, when the destination publishes one
    pub trust: Option<TrustScore>,
    /// Weighted cost, lower is better; recomputed at scoring time
    pub cost_score: f64,
    /// Intermediate hops, empty for a direct path
    pub hops: Vec<AgentId>,
}

impl Route {
    /// Hop count including the destination
    #[must_use]
    pub fn hop_count(&self) -> usize {
        self.hops.len() + 1
    }
}

/// One weighted factor that contributed to a routing decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingFactor {
    /// Factor name (`"latency"`, `"load"`, `"reliability"`, `"trust_gap"`)
    pub name: String,
    /// Weight applied after renormalization
    pub weight: f64,
    /// Raw score of the factor in `[0, 1]` terms
    pub score: f64,
    /// `weight * score`, the factor's share of the cost
    pub contribution: f64,
}

/// The outcome of scoring one send attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Message the decision applies to
    pub message_id: MessageId,
    /// Selected route
    pub selected: Route,
    /// Up to three failover alternatives, best first
    pub alternatives: Vec<Route>,
    /// Cost factors of the selected route
    pub factors: Vec<RoutingFactor>,
    /// Separation-based confidence in `[0, 1]`
    pub confidence: f64,
    /// Algorithm that made the choice
    pub algorithm: RoutingAlgorithmId,
    /// When the decision was made
    pub decided_at: SystemTime,
    /// Estimated delivery time in milliseconds
    pub est_delivery_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_count_includes_destination() {
        let route = Route {
            route_id: RouteId::try_new("t:stream".to_string()).unwrap(),
            destination: AgentId::try_new("t".to_string()).unwrap(),
            protocol: crate::domain_types::ProtocolId::try_new("stream".to_string()).unwrap(),
            est_latency_ms: 10.0,
            est_bandwidth_mbps: 100.0,
            reliability: Reliability::default(),
            load_factor: LoadFactor::default(),
            trust: None,
            cost_score: 0.0,
            hops: vec![AgentId::try_new("relay".to_string()).unwrap()],
        };
        assert_eq!(route.hop_count(), 2);
    }
}
