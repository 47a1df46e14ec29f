//! Domain types for recovery orchestration

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::domain_types::{AgentId, RetryPolicy};

/// Unique identifier for a recovery execution
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Creates a new random execution ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier of a registered recovery procedure
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
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
pub struct ProcedureId(String);

/// Risk classification of a procedure
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Safe to auto-approve
    #[default]
    Low,
    /// Auto-approvable by default policy
    Medium,
    /// Needs an approver unless emergency
    High,
    /// Always needs an approver unless emergency
    Critical,
}

/// Abstract recovery actions; an injected runner executes them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "arg")]
pub enum StepAction {
    /// Restart the agent process
    RestartAgent,
    /// Tear down and re-establish the agent's connections
    Reconnect,
    /// Grant the agent more resources
    ScaleResources,
    /// Re-synchronize the agent's state from its peers
    ResyncState,
    /// Send a governance message through the bus
    EmitMessage(String),
    /// Escape hatch for embedder-defined actions
    Custom(String),
}

/// One step of a procedure
///
/// Steps execute in `order`; steps sharing an order form a parallel group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStep {
    /// Execution order; equal orders run concurrently
    pub order: u32,
    /// Step name for records and logs
    pub name: String,
    /// Action to run
    pub action: StepAction,
    /// Per-step timeout
    pub timeout: Duration,
    /// Retry policy for the step
    pub retry: RetryPolicy,
    /// Whether a failure here lets later steps proceed
    pub continue_on_failure: bool,
    /// Compensating action for rollback
    pub rollback: Option<StepAction>,
}

/// A named, ordered sequence of recovery steps with rollback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryProcedure {
    /// Identifier
    pub id: ProcedureId,
    /// Display name
    pub name: String,
    /// What the procedure does
    pub description: String,
    /// Ordered steps
    pub steps: Vec<RecoveryStep>,
    /// Roll back completed steps when a later one fails
    pub rollback_enabled: bool,
    /// Historical base success rate
    pub base_success_rate: f64,
    /// Risk classification
    pub risk: RiskLevel,
    /// Expected wall-clock duration
    pub estimated_duration: Duration,
    /// Prerequisites checked before execution
    pub prerequisites: Vec<String>,
    /// Procedure is part of the emergency protocol
    pub emergency: bool,
}

/// Step lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Not started
    Pending,
    /// In flight
    Running,
    /// Completed successfully
    Succeeded,
    /// Failed after retries
    Failed,
    /// Compensated during rollback
    RolledBack,
    /// Skipped after an earlier terminal failure
    Skipped,
}

/// Execution record for one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step order
    pub order: u32,
    /// Step name
    pub name: String,
    /// Lifecycle state
    pub state: StepState,
    /// When the step started
    pub started_at: Option<SystemTime>,
    /// When the step ended
    pub ended_at: Option<SystemTime>,
    /// Attempts made
    pub attempts: u8,
    /// Output of the final successful attempt
    pub output: Option<String>,
    /// Error of the final failed attempt
    pub error: Option<String>,
}

/// Execution lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Created, not yet evaluated
    Pending,
    /// Prerequisites and approval being evaluated
    Evaluating,
    /// Approved, waiting to execute
    Approved,
    /// Rejected by policy or approver
    Rejected,
    /// Steps running
    Executing,
    /// All steps succeeded
    Succeeded,
    /// Terminally failed
    Failed,
    /// Cancelled before completion
    Cancelled,
    /// Compensating completed steps
    RollingBack,
    /// Compensation finished
    RolledBack,
}

impl ExecutionState {
    /// Whether the execution still counts against the per-agent guard
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Evaluating | Self::Approved | Self::Executing | Self::RollingBack
        )
    }

    /// Whether the state is terminal
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Succeeded | Self::Failed | Self::Cancelled | Self::RolledBack
        )
    }
}

/// A recovery execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryExecution {
    /// Identifier
    pub exec_id: ExecutionId,
    /// Procedure being run
    pub procedure_id: ProcedureId,
    /// Agent being recovered
    pub agent_id: AgentId,
    /// Who triggered it
    pub triggered_by: String,
    /// When it was created
    pub started_at: SystemTime,
    /// When it reached a terminal state
    pub ended_at: Option<SystemTime>,
    /// Lifecycle state
    pub state: ExecutionState,
    /// Per-step records
    pub steps: Vec<StepRecord>,
    /// Final summary
    pub result: Option<String>,
}

/// The orchestrator's reasoning for choosing a procedure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryDecision {
    /// Agent the decision concerns
    pub agent_id: AgentId,
    /// Chosen procedure
    pub procedure_id: ProcedureId,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    /// Risk of the chosen procedure
    pub risk: RiskLevel,
    /// Prerequisites to verify before execution
    pub prerequisites: Vec<String>,
    /// Expected duration
    pub estimated_duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states_guard_the_agent() {
        assert!(ExecutionState::Executing.is_active());
        assert!(ExecutionState::RollingBack.is_active());
        assert!(!ExecutionState::Succeeded.is_active());
        assert!(ExecutionState::Succeeded.is_terminal());
        assert!(!ExecutionState::Evaluating.is_terminal());
    }
}
