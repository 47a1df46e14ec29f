//! Health Monitor
//!
//! Collects per-agent metrics on a configured cadence, derives health levels
//! with flap damping, detects anomalies through pluggable detectors, and
//! raises alerts with deduplication, acknowledgment, and escalation. Health
//! changes are published as bus events; the recovery orchestrator subscribes
//! to them rather than holding a reference to the monitor.

pub mod alerts;
pub mod anomaly;
pub mod collector;
pub mod domain_types;
pub mod monitor;

pub use alerts::{AlertManager, AlertManagerConfig};
pub use anomaly::{
    AnomalyDetector, AnomalyVerdict, ChangepointDetector, EnsembleDetector,
    StatisticalOutlierDetector,
};
pub use collector::{AgentProbe, AgentSample, MetricAggregator, MetricsBatcher};
pub use domain_types::*;
pub use monitor::{
    AgentMonitorConfig, EventPublisher, HealthMonitor, HealthThresholds, NullPublisher,
};
