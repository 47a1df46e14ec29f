//! Router core: discovery, scoring, selection
//!
//! The cost of a route is a weighted sum, lower is better:
//!
//! ```text
//! cost = 0.4*(est_latency_ms/1000) + 0.3*load + 0.2*(1-reliability) + 0.1*trust_gap
//! ```
//!
//! where `trust_gap = max(0, required_trust - trust)`. When the message sets
//! no trust minimum the trust term is omitted and the remaining weights
//! renormalize.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

use super::algorithms::{
    AdaptiveRouting, BandwidthOptimized, LatencyOptimized, LoadAware, RoutingAlgorithm,
    ShortestPath, TrustBased,
};
use super::cache::RouteCache;
use super::domain_types::{Route, RoutingAlgorithmId, RoutingDecision, RoutingFactor};
use crate::bus::domain_types::Message;
use crate::domain_types::{AgentId, EmaAlpha, MessageType};
use crate::error::CommError;
use crate::time_provider::TimeProvider;

const WEIGHT_LATENCY: f64 = 0.4;
const WEIGHT_LOAD: f64 = 0.3;
const WEIGHT_RELIABILITY: f64 = 0.2;
const WEIGHT_TRUST: f64 = 0.1;
const DEFAULT_TRUST: f64 = 0.5;
const MAX_ALTERNATIVES: usize = 3;

/// Router errors
#[derive(Debug, Error)]
pub enum RouterError {
    /// No candidate routes for the destination set
    #[error("no route: {detail}")]
    NoRoute {
        /// What could not be routed
        detail: String,
    },

    /// Every candidate is blocked by an open circuit breaker
    #[error("all {candidates} candidate routes are circuit-broken")]
    AllOpen {
        /// Candidates examined
        candidates: usize,
    },

    /// The selected algorithm rejected every candidate
    #[error("algorithm {algorithm:?} found no acceptable route")]
    NoAcceptableRoute {
        /// Algorithm that declined
        algorithm: RoutingAlgorithmId,
    },
}

impl From<RouterError> for CommError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::NoRoute { detail } => Self::NoRoute { detail },
            RouterError::AllOpen { candidates } => Self::AllRoutesOpen { candidates },
            RouterError::NoAcceptableRoute { algorithm } => Self::NoRoute {
                detail: format!("algorithm {algorithm:?} found no acceptable route"),
            },
        }
    }
}

/// Resolves implicit destinations from a message type
#[async_trait]
pub trait DestinationResolver: Send + Sync {
    /// Agents that should receive messages of this type
    async fn resolve(&self, message_type: &MessageType) -> Vec<AgentId>;
}

/// Discovers candidate routes toward one destination
#[async_trait]
pub trait RouteDiscoverer: Send + Sync {
    /// Candidate routes from `source` to `destination`, possibly empty
    async fn discover(&self, source: &AgentId, destination: &AgentId) -> Vec<Route>;
}

/// Circuit-breaker visibility for candidate admission
///
/// The pool and balancer own breaker state; the router only asks whether a
/// destination is currently admissible.
pub trait RouteAdmission: Send + Sync {
    /// Whether sends toward the destination are currently admitted
    fn is_admitted(&self, destination: &AgentId) -> bool;
}

/// Admission that never blocks; the default when no breaker view is wired
#[derive(Debug, Default)]
pub struct AlwaysAdmitted;

impl RouteAdmission for AlwaysAdmitted {
    fn is_admitted(&self, _destination: &AgentId) -> bool {
        true
    }
}

/// Static topology backing both resolution and discovery
///
/// Production deployments register agents and their route descriptors here;
/// a dynamic discovery service can replace it behind the same traits.
pub struct StaticTopology {
    routes: DashMap<AgentId, Vec<Route>>,
    by_type: DashMap<MessageType, Vec<AgentId>>,
}

impl std::fmt::Debug for StaticTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTopology")
            .field("destinations", &self.routes.len())
            .finish()
    }
}

impl StaticTopology {
    /// Creates an empty topology
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            by_type: DashMap::new(),
        }
    }

    /// Registers (or replaces) the routes toward a destination
    pub fn register_destination(&self, destination: AgentId, routes: Vec<Route>) {
        self.routes.insert(destination, routes);
    }

    /// Maps a message type to the destinations that consume it
    pub fn register_consumer(&self, message_type: MessageType, destination: AgentId) {
        self.by_type
            .entry(message_type)
            .or_default()
            .push(destination);
    }

    /// Removes a destination and its type mappings
    pub fn deregister(&self, destination: &AgentId) {
        self.routes.remove(destination);
        for mut entry in self.by_type.iter_mut() {
            entry.value_mut().retain(|agent| agent != destination);
        }
    }
}

impl Default for StaticTopology {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DestinationResolver for StaticTopology {
    async fn resolve(&self, message_type: &MessageType) -> Vec<AgentId> {
        self.by_type
            .get(message_type)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RouteDiscoverer for StaticTopology {
    async fn discover(&self, _source: &AgentId, destination: &AgentId) -> Vec<Route> {
        self.routes
            .get(destination)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// TTL for cached `(source, destination)` route sets
    pub route_cache_ttl: Duration,
    /// Algorithm used when the message does not demand otherwise
    pub default_algorithm: RoutingAlgorithmId,
    /// Smoothing for the adaptive algorithm's reward table
    pub reward_alpha: EmaAlpha,
    /// Latency bound for the load-aware algorithm
    pub load_aware_latency_bound_ms: f64,
    /// Keep an in-memory audit log of routing decisions
    pub audit_decisions: bool,
    /// Bound on the audit log
    pub audit_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            route_cache_ttl: Duration::from_secs(30),
            default_algorithm: RoutingAlgorithmId::LoadAware,
            reward_alpha: EmaAlpha::default(),
            load_aware_latency_bound_ms: 1_000.0,
            audit_decisions: false,
            audit_capacity: 10_000,
        }
    }
}

/// Scores candidate routes and picks one per message
pub struct MessageRouter {
    config: RouterConfig,
    cache: RouteCache,
    resolver: Arc<dyn DestinationResolver>,
    discoverer: Arc<dyn RouteDiscoverer>,
    admission: Arc<dyn RouteAdmission>,
    adaptive: Arc<AdaptiveRouting>,
    algorithms: Vec<Arc<dyn RoutingAlgorithm>>,
    time: Arc<dyn TimeProvider>,
    audit_log: Mutex<VecDeque<RoutingDecision>>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("default_algorithm", &self.config.default_algorithm)
            .finish_non_exhaustive()
    }
}

impl MessageRouter {
    /// Creates a router over the given topology and admission view
    #[must_use]
    pub fn new(
        config: RouterConfig,
        resolver: Arc<dyn DestinationResolver>,
        discoverer: Arc<dyn RouteDiscoverer>,
        admission: Arc<dyn RouteAdmission>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        let adaptive = Arc::new(AdaptiveRouting::new(config.reward_alpha));
        let algorithms: Vec<Arc<dyn RoutingAlgorithm>> = vec![
            Arc::new(ShortestPath),
            Arc::new(LoadAware {
                latency_bound_ms: config.load_aware_latency_bound_ms,
            }),
            Arc::new(TrustBased),
            Arc::new(LatencyOptimized),
            Arc::new(BandwidthOptimized),
            Arc::clone(&adaptive) as Arc<dyn RoutingAlgorithm>,
        ];
        Self {
            cache: RouteCache::new(config.route_cache_ttl, Arc::clone(&time)),
            config,
            resolver,
            discoverer,
            admission,
            adaptive,
            algorithms,
            time,
            audit_log: Mutex::new(VecDeque::new()),
        }
    }

    /// Scores candidates and picks a route for one send attempt
    ///
    /// `excluded` lists destinations that already failed this delivery and
    /// are skipped during rescoring.
    ///
    /// # Errors
    /// `NoRoute` when no candidates exist, `AllOpen` when every candidate is
    /// circuit-broken.
    pub async fn route(
        &self,
        message: &Message,
        excluded: &[AgentId],
    ) -> Result<RoutingDecision, RouterError> {
        let destinations = self.destinations_for(message, excluded).await;
        if destinations.is_empty() {
            return Err(RouterError::NoRoute {
                detail: format!(
                    "no destinations for message {} of type {}",
                    message.id, message.message_type
                ),
            });
        }

        let mut candidates = Vec::new();
        let mut blocked = 0usize;
        for destination in &destinations {
            let routes = self.candidate_routes(&message.source, destination).await;
            for route in routes {
                if self.admission.is_admitted(&route.destination) {
                    candidates.push(route);
                } else {
                    blocked += 1;
                }
            }
        }

        if candidates.is_empty() {
            if blocked > 0 {
                return Err(RouterError::AllOpen { candidates: blocked });
            }
            return Err(RouterError::NoRoute {
                detail: format!("no routes discovered for message {}", message.id),
            });
        }

        for route in &mut candidates {
            route.cost_score = self.cost(route, message);
        }
        sort_candidates(&mut candidates);

        let algorithm = self.algorithm_for(message);
        let selected = algorithm
            .choose(message, &candidates)
            .ok_or(RouterError::NoAcceptableRoute {
                algorithm: algorithm.id(),
            })?;

        let alternatives: Vec<Route> = candidates
            .iter()
            .filter(|route| route.route_id != selected.route_id)
            .take(MAX_ALTERNATIVES)
            .cloned()
            .collect();

        let decision = RoutingDecision {
            message_id: message.id.clone(),
            factors: self.factors(&selected, message),
            confidence: confidence(&selected, &candidates),
            algorithm: algorithm.id(),
            decided_at: self.time.now(),
            est_delivery_ms: selected.est_latency_ms,
            selected,
            alternatives,
        };

        trace!(
            message = %message.id,
            route = %decision.selected.route_id,
            cost = decision.selected.cost_score,
            confidence = decision.confidence,
            "route selected"
        );

        if self.config.audit_decisions {
            let mut log = self
                .audit_log
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if log.len() >= self.config.audit_capacity {
                log.pop_front();
            }
            log.push_back(decision.clone());
        }

        Ok(decision)
    }

    /// Feeds the adaptive reward table with a delivery outcome
    pub fn record_outcome(
        &self,
        message_type: &MessageType,
        algorithm: RoutingAlgorithmId,
        success: bool,
        latency_ms: f64,
    ) {
        self.adaptive
            .record_outcome(message_type, algorithm, success, latency_ms);
    }

    /// Drops the cached routes toward a destination
    pub fn invalidate_destination(&self, source: &AgentId, destination: &AgentId) {
        self.cache.invalidate(source, destination);
    }

    /// Flattened copy of the route cache, for snapshot persistence
    #[must_use]
    pub fn cache_snapshot(&self) -> Vec<Route> {
        self.cache.snapshot()
    }

    /// Copies the audit log (empty unless auditing is enabled)
    #[must_use]
    pub fn audit_log(&self) -> Vec<RoutingDecision> {
        self.audit_log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    async fn destinations_for(&self, message: &Message, excluded: &[AgentId]) -> Vec<AgentId> {
        let explicit = if message.destinations.is_empty() {
            self.resolver.resolve(&message.message_type).await
        } else {
            message.destinations.clone()
        };
        explicit
            .into_iter()
            .filter(|agent| !excluded.contains(agent))
            .collect()
    }

    async fn candidate_routes(&self, source: &AgentId, destination: &AgentId) -> Vec<Route> {
        if let Some(routes) = self.cache.get(source, destination) {
            return routes;
        }
        let routes = self.discoverer.discover(source, destination).await;
        if !routes.is_empty() {
            debug!(%source, %destination, count = routes.len(), "routes discovered");
            self.cache
                .put(source.clone(), destination.clone(), routes.clone());
        }
        routes
    }

    fn algorithm_for(&self, message: &Message) -> Arc<dyn RoutingAlgorithm> {
        let wanted = if message
            .governance
            .as_ref()
            .is_some_and(|g| g.trust_score_minimum.is_some())
            && self.config.default_algorithm == RoutingAlgorithmId::LoadAware
        {
            // A trust floor with the stock default gets the trust-aware pick.
            RoutingAlgorithmId::TrustBased
        } else {
            self.config.default_algorithm
        };
        self.algorithms
            .iter()
            .find(|algorithm| algorithm.id() == wanted)
            .cloned()
            .unwrap_or_else(|| Arc::new(LoadAware::default()))
    }

    fn cost(&self, route: &Route, message: &Message) -> f64 {
        let (weights, trust_gap) = weights_for(route, message);
        let latency_term = route.est_latency_ms / 1_000.0;
        let load_term = route.load_factor.as_f64();
        let reliability_term = 1.0 - route.reliability.as_f64();
        weights[0] * latency_term
            + weights[1] * load_term
            + weights[2] * reliability_term
            + weights[3] * trust_gap
    }

    fn factors(&self, route: &Route, message: &Message) -> Vec<RoutingFactor> {
        let (weights, trust_gap) = weights_for(route, message);
        let mut factors = vec![
            RoutingFactor {
                name: "latency".to_string(),
                weight: weights[0],
                score: route.est_latency_ms / 1_000.0,
                contribution: weights[0] * route.est_latency_ms / 1_000.0,
            },
            RoutingFactor {
                name: "load".to_string(),
                weight: weights[1],
                score: route.load_factor.as_f64(),
                contribution: weights[1] * route.load_factor.as_f64(),
            },
            RoutingFactor {
                name: "reliability".to_string(),
                weight: weights[2],
                score: 1.0 - route.reliability.as_f64(),
                contribution: weights[2] * (1.0 - route.reliability.as_f64()),
            },
        ];
        if weights[3] > 0.0 {
            factors.push(RoutingFactor {
                name: "trust_gap".to_string(),
                weight: weights[3],
                score: trust_gap,
                contribution: weights[3] * trust_gap,
            });
        }
        factors
    }
}

/// Effective weights and trust gap for a route under a message's requirements
fn weights_for(route: &Route, message: &Message) -> ([f64; 4], f64) {
    let required = message
        .governance
        .as_ref()
        .and_then(|g| g.trust_score_minimum);
    match required {
        Some(min) => {
            let trust = route.trust.map_or(DEFAULT_TRUST, |t| t.as_f64());
            let gap = (min.as_f64() - trust).max(0.0);
            (
                [WEIGHT_LATENCY, WEIGHT_LOAD, WEIGHT_RELIABILITY, WEIGHT_TRUST],
                gap,
            )
        }
        None => {
            // Trust term omitted; remaining weights renormalize to sum 1.
            let total = WEIGHT_LATENCY + WEIGHT_LOAD + WEIGHT_RELIABILITY;
            (
                [
                    WEIGHT_LATENCY / total,
                    WEIGHT_LOAD / total,
                    WEIGHT_RELIABILITY / total,
                    0.0,
                ],
                0.0,
            )
        }
    }
}

/// Sort by cost ascending; ties by reliability descending, load ascending,
/// then lexicographic route id for determinism
fn sort_candidates(candidates: &mut [Route]) {
    candidates.sort_by(|a, b| {
        a.cost_score
            .partial_cmp(&b.cost_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.reliability
                    .as_f64()
                    .partial_cmp(&a.reliability.as_f64())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                a.load_factor
                    .as_f64()
                    .partial_cmp(&b.load_factor.as_f64())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.route_id.cmp(&b.route_id))
    });
}

/// Confidence from the separation between best and runner-up costs
fn confidence(selected: &Route, candidates: &[Route]) -> f64 {
    let runner_up = candidates
        .iter()
        .filter(|route| route.route_id != selected.route_id)
        .map(|route| route.cost_score)
        .fold(f64::INFINITY, f64::min);
    if !runner_up.is_finite() || runner_up <= f64::EPSILON {
        return 1.0;
    }
    ((runner_up - selected.cost_score) / runner_up).clamp(0.05, 1.0)
}
