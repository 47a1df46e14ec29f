//! Message Router
//!
//! Picks one route per message and exposes alternatives for failover. Routes
//! are discovered through a pluggable topology, cached per
//! `(source, destination)` tuple with a TTL, scored by a weighted cost
//! function, and selected by one of six registered routing algorithms.
//!
//! Scoring never panics; missing fields fall back to documented defaults.

pub mod algorithms;
pub mod cache;
pub mod domain_types;
pub mod router;

pub use algorithms::{
    AdaptiveRouting, BandwidthOptimized, LatencyOptimized, LoadAware, RoutingAlgorithm,
    ShortestPath, TrustBased,
};
pub use cache::RouteCache;
pub use domain_types::*;
pub use router::{
    DestinationResolver, MessageRouter, RouteAdmission, RouteDiscoverer, RouterConfig, RouterError,
    StaticTopology,
};
