//! Connection Pool Manager
//!
//! Per-endpoint connection lifecycle: leasing with priority-ordered waiters,
//! optional pre-acquire validation, expired-lease reclamation, reactive
//! scaling, and a per-endpoint circuit breaker. Pools are keyed by
//! `(protocol, endpoint)` and created on demand.
//!
//! Locking discipline: one lock per pool protects the connection map and
//! status; connection-internal counters are atomics so the hot path does not
//! take the pool lock per request.

pub mod circuit_breaker;
pub mod config;
pub mod connection;
pub mod domain_types;
pub mod manager;
pub mod pool;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use config::{CircuitBreakerConfig, PoolConfig, ScalingAlgorithm, ScalingPolicy};
pub use connection::{
    ConnectionFactory, ConnectionMetadata, NewConnection, PooledConnection, Transport,
};
pub use domain_types::*;
pub use manager::PoolManager;
pub use pool::ConnectionPool;
