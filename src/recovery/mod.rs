//! Recovery Orchestrator
//!
//! Builds recovery decisions from health degradation, executes procedures as
//! ordered step sequences with per-step timeout, retry, and rollback, and
//! enforces the safety invariants: at most one active execution per agent,
//! dependency-ordered multi-agent recovery (Kahn over an explicit DAG), and
//! rate-limited, audited emergency protocol invocations.

pub mod domain_types;
pub mod graph;
pub mod orchestrator;

pub use domain_types::*;
pub use graph::DependencyGraph;
pub use orchestrator::{
    builtin_procedures, ActionRunner, EmergencyRecord, HealthView, RecoveryConfig,
    RecoveryOrchestrator,
};
