//! # Agora - Communication Core for Multi-Agent Governance Platforms
//!
//! Agora is the protocol-agnostic message bus at the center of a multi-agent
//! governance platform. It routes, prioritizes, transports, load-balances, and
//! recovers agent-to-agent traffic, and runs the per-agent health monitor that
//! feeds it telemetry and drives automated recovery.
//!
//! ## Core Components
//!
//! - [`bus::UnifiedBus`]: single ingress/egress for all cross-component traffic
//! - [`router::MessageRouter`]: scores and picks a destination route per message
//! - [`protocol::ProtocolSelector`]: picks a transport profile per message and
//!   network condition
//! - [`pool::PoolManager`]: per-endpoint connection pools with leasing, health,
//!   and dynamic sizing
//! - [`balancer::LoadBalancer`]: picks among equivalent targets using pluggable
//!   algorithms
//! - [`health::HealthMonitor`] and [`recovery::RecoveryOrchestrator`]: metric
//!   collection, anomaly detection, alerting, and procedure execution
//! - [`efficiency::EfficiencyMonitor`]: cross-cutting aggregates and adaptation
//!   signals
//!
//! ## Architecture
//!
//! Components never hold references to each other; they coordinate through the
//! bus event queue. The store, clock, and logger are injected into every
//! constructor so tests can build isolated cores.
//!
//! ```text
//! caller -> UnifiedBus -> MessageRouter -> ProtocolSelector
//!               |               |                |
//!               v               v                v
//!          Subscriptions   LoadBalancer --> PoolManager --> transport
//!               |                                |
//!               v                                v
//!        EfficiencyMonitor <---- delivery outcomes
//!
//! HealthMonitor --(HealthChanged)--> bus events --> RecoveryOrchestrator
//! ```

pub mod balancer;
pub mod bus;
pub mod cancel;
pub mod domain_types;
pub mod efficiency;
pub mod error;
pub mod export;
pub mod health;
pub mod pool;
pub mod protocol;
pub mod recovery;
pub mod router;
pub mod scheduler;
pub mod storage;
pub mod time_provider;

pub use crate::domain_types::{AgentId, ComponentId, EndpointAddress, MessageId, ProtocolId};
pub use crate::error::CommError;
pub use crate::time_provider::{MockTimeProvider, RealTimeProvider, TimeProvider};
