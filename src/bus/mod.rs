//! Unified Bus for the communication core
//!
//! The bus is the single ingress/egress for all cross-component traffic. It
//! owns the lifecycle of every in-flight message, fans events out to
//! subscribers, and tracks component heartbeats. It provides:
//!
//! - **Priority-aware ingress** through a five-band bounded queue with a
//!   configurable overflow policy
//! - **Delivery tracking** from submission to ack, failure, or timeout
//! - **Event fan-out** with per-subscription ordering and duplicate
//!   suppression windows
//! - **Dead-lettering** for messages that exhaust retries or expire
//!
//! ## Message Flow
//!
//! ```text
//! caller -> Send -> validation -> priority queue -> worker -> dispatcher
//!                                                       |
//!                                      ack | failed | timed_out
//!                                                       |
//!                                   retries -> dead letter queue
//! ```
//!
//! The dispatcher seam ([`MessageDispatcher`]) is where the router, protocol
//! selector, load balancer, and pool manager plug in; tests substitute a mock.

pub mod bus;
pub mod config;
pub mod domain_types;
pub mod pipeline;
pub mod queues;
pub mod subscriptions;

pub use bus::{BusStats, MessageDispatcher, UnifiedBus};
pub use config::{BusConfig, BusConfigBuilder, BusConfigError};
pub use domain_types::*;
pub use pipeline::DeliveryPipeline;
pub use subscriptions::{EventSink, SubscriptionRegistry};
