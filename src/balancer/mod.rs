//! Load Balancer
//!
//! Picks one target among the equivalent endpoints of a route. The eligible
//! set is filtered by health, load, governance fit, performance fit,
//! blacklist, and circuit-breaker state; a pluggable algorithm then selects,
//! and every selection carries an ordered failover plan. Completions feed the
//! per-target and per-algorithm performance records that drive the adaptive
//! meta-selector.

pub mod algorithms;
pub mod balancer;
pub mod domain_types;

pub use algorithms::{BalancingAlgorithm, BalancingAlgorithmId};
pub use balancer::{BalancerConfig, LoadBalancer};
pub use domain_types::*;
