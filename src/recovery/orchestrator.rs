//! Recovery orchestrator: decisions, execution, rollback, safety invariants
//!
//! At most one active execution exists per agent. Multi-agent recovery runs
//! in dependency order: each dependency must return to health before its
//! dependents start. Emergency invocations bypass approval but are
//! rate-limited and audited.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::domain_types::{
    ExecutionId, ExecutionState, ProcedureId, RecoveryDecision, RecoveryExecution,
    RecoveryProcedure, RecoveryStep, RiskLevel, StepAction, StepRecord, StepState,
};
use super::graph::DependencyGraph;
use crate::bus::domain_types::{event_types, BusEvent, EventId};
use crate::domain_types::{AgentId, ComponentId, MessageType};
use crate::error::CommError;
use crate::health::domain_types::HealthLevel;
use crate::health::monitor::EventPublisher;
use crate::storage::RecoveryStore;
use crate::time_provider::TimeProvider;

/// Executes abstract recovery actions against the real world
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Runs one action for one agent, returning a short output summary
    async fn run(&self, agent: &AgentId, action: &StepAction) -> Result<String, CommError>;

    /// Checks a declared prerequisite; the default accepts everything
    async fn check_prerequisite(
        &self,
        _agent: &AgentId,
        _prerequisite: &str,
    ) -> Result<bool, CommError> {
        Ok(true)
    }
}

/// Read-only view of agent health for dependency waits
pub trait HealthView: Send + Sync {
    /// Current derived level of an agent
    fn level(&self, agent: &AgentId) -> HealthLevel;
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Highest risk that is auto-approved
    pub auto_approve_max_risk: RiskLevel,
    /// How long an execution waits for an external approver
    pub approval_timeout: Duration,
    /// How long to wait for a dependency's health before dependents run
    pub health_wait_timeout: Duration,
    /// Poll cadence while waiting for health
    pub health_poll_interval: Duration,
    /// Emergency invocations allowed per window
    pub emergency_max_per_window: usize,
    /// Emergency rate-limit window
    pub emergency_window: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            auto_approve_max_risk: RiskLevel::Medium,
            approval_timeout: Duration::from_secs(300),
            health_wait_timeout: Duration::from_secs(120),
            health_poll_interval: Duration::from_millis(500),
            emergency_max_per_window: 3,
            emergency_window: Duration::from_secs(3600),
        }
    }
}

/// One audited emergency invocation
#[derive(Debug, Clone)]
pub struct EmergencyRecord {
    /// When it was invoked
    pub at: SystemTime,
    /// Agent recovered
    pub agent_id: AgentId,
    /// Who invoked it
    pub by: String,
}

/// Drives recovery procedures and owns their executions
pub struct RecoveryOrchestrator {
    config: RecoveryConfig,
    procedures: DashMap<ProcedureId, RecoveryProcedure>,
    executions: DashMap<ExecutionId, RecoveryExecution>,
    active_guard: DashMap<AgentId, ExecutionId>,
    approval_gates: DashMap<ExecutionId, Arc<Notify>>,
    // Approvals that arrived before evaluation started.
    pre_approvals: DashMap<ExecutionId, bool>,
    procedure_failures: DashMap<ProcedureId, u32>,
    emergency_log: Mutex<Vec<EmergencyRecord>>,
    emergency_window: Mutex<VecDeque<SystemTime>>,
    graph: Mutex<DependencyGraph>,
    runner: Arc<dyn ActionRunner>,
    health: Arc<dyn HealthView>,
    store: Arc<dyn RecoveryStore>,
    publisher: Arc<dyn EventPublisher>,
    time: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for RecoveryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryOrchestrator")
            .field("procedures", &self.procedures.len())
            .field("active", &self.active_guard.len())
            .finish_non_exhaustive()
    }
}

impl RecoveryOrchestrator {
    /// Creates an orchestrator pre-loaded with the built-in procedures
    #[must_use]
    pub fn new(
        config: RecoveryConfig,
        runner: Arc<dyn ActionRunner>,
        health: Arc<dyn HealthView>,
        store: Arc<dyn RecoveryStore>,
        publisher: Arc<dyn EventPublisher>,
        time: Arc<dyn TimeProvider>,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            config,
            procedures: DashMap::new(),
            executions: DashMap::new(),
            active_guard: DashMap::new(),
            approval_gates: DashMap::new(),
            pre_approvals: DashMap::new(),
            procedure_failures: DashMap::new(),
            emergency_log: Mutex::new(Vec::new()),
            emergency_window: Mutex::new(VecDeque::new()),
            graph: Mutex::new(DependencyGraph::new()),
            runner,
            health,
            store,
            publisher,
            time,
        });
        for procedure in builtin_procedures() {
            orchestrator.register_procedure(procedure);
        }
        orchestrator
    }

    /// Registers (or replaces) a procedure
    pub fn register_procedure(&self, procedure: RecoveryProcedure) {
        self.procedures.insert(procedure.id.clone(), procedure);
    }

    /// Declares that `dependent` depends on `dependency`
    pub fn add_dependency(&self, dependent: AgentId, dependency: AgentId) {
        self.graph
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .add_dependency(dependent, dependency);
    }

    /// Fetches an execution record
    #[must_use]
    pub fn execution(&self, exec_id: ExecutionId) -> Option<RecoveryExecution> {
        self.executions.get(&exec_id).map(|e| e.value().clone())
    }

    /// The audited emergency invocations
    #[must_use]
    pub fn emergency_audit(&self) -> Vec<EmergencyRecord> {
        self.emergency_log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Builds a recovery decision for a degraded agent
    ///
    /// Scoring factors: base success rate, severity fit, system load (fast
    /// procedures preferred under load), and recent failures of the same
    /// procedure.
    #[must_use]
    pub fn decide(
        &self,
        agent_id: &AgentId,
        level: HealthLevel,
        system_load: f64,
    ) -> Option<RecoveryDecision> {
        if !level.needs_recovery() {
            return None;
        }
        let mut best: Option<(f64, RecoveryProcedure)> = None;
        for entry in &self.procedures {
            let procedure = entry.value();
            if procedure.emergency {
                continue;
            }
            let mut score = procedure.base_success_rate;
            // Critical agents justify riskier, more thorough procedures.
            if level == HealthLevel::Critical && procedure.risk >= RiskLevel::High {
                score += 0.1;
            }
            // Under load prefer fast procedures.
            let duration_minutes = procedure.estimated_duration.as_secs_f64() / 60.0;
            score -= system_load.clamp(0.0, 1.0) * (duration_minutes / 10.0).min(0.3);
            let failures = self
                .procedure_failures
                .get(&procedure.id)
                .map(|f| *f)
                .unwrap_or(0);
            score -= f64::from(failures) * 0.1;
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, procedure.clone()));
            }
        }
        let (score, procedure) = best?;
        Some(RecoveryDecision {
            agent_id: agent_id.clone(),
            procedure_id: procedure.id.clone(),
            confidence: score.clamp(0.0, 1.0),
            risk: procedure.risk,
            prerequisites: procedure.prerequisites.clone(),
            estimated_duration: procedure.estimated_duration,
        })
    }

    /// Triggers a recovery and waits for it to reach a terminal state
    ///
    /// # Errors
    /// `Validation` for unknown procedures, `RecoveryFailed` when another
    /// execution is active for the agent or the execution fails.
    pub async fn execute_recovery(
        self: &Arc<Self>,
        agent_id: AgentId,
        procedure_id: ProcedureId,
        by: &str,
    ) -> Result<ExecutionId, CommError> {
        let exec_id = self.begin_execution(&agent_id, &procedure_id, by, false)?;
        self.run_execution(exec_id).await;
        let state = self
            .execution(exec_id)
            .map(|e| e.state)
            .unwrap_or(ExecutionState::Failed);
        if state == ExecutionState::Succeeded {
            Ok(exec_id)
        } else {
            Err(CommError::RecoveryFailed {
                agent_id,
                reason: format!("execution {exec_id} ended in {state:?}"),
            })
        }
    }

    /// Triggers a recovery and returns immediately with the execution id
    ///
    /// # Errors
    /// Same admission errors as [`execute_recovery`](Self::execute_recovery).
    pub fn trigger_recovery(
        self: &Arc<Self>,
        agent_id: AgentId,
        procedure_id: ProcedureId,
        by: &str,
    ) -> Result<ExecutionId, CommError> {
        let exec_id = self.begin_execution(&agent_id, &procedure_id, by, false)?;
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_execution(exec_id).await;
        });
        Ok(exec_id)
    }

    /// Approves or rejects an execution waiting for an external approver
    ///
    /// An approval arriving before evaluation starts is remembered and
    /// applied once prerequisites pass.
    pub fn approve(&self, exec_id: ExecutionId, approve: bool) {
        let mut applied = false;
        if let Some(mut execution) = self.executions.get_mut(&exec_id) {
            if execution.state == ExecutionState::Evaluating {
                execution.state = if approve {
                    ExecutionState::Approved
                } else {
                    ExecutionState::Rejected
                };
                applied = true;
            }
        }
        if !applied {
            self.pre_approvals.insert(exec_id, approve);
        }
        if let Some(gate) = self.approval_gates.get(&exec_id) {
            gate.notify_waiters();
        }
    }

    /// Emergency protocol: bypasses approval, rate-limited, audited
    ///
    /// # Errors
    /// `Validation` when the rate limit is exhausted or no emergency
    /// procedure is registered; `RecoveryFailed` when the execution fails.
    pub async fn execute_emergency(
        self: &Arc<Self>,
        agent_id: AgentId,
        by: &str,
    ) -> Result<ExecutionId, CommError> {
        let now = self.time.now();
        {
            let mut window = self
                .emergency_window
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            while let Some(front) = window.front() {
                let expired = now
                    .duration_since(*front)
                    .map(|age| age > self.config.emergency_window)
                    .unwrap_or(false);
                if expired {
                    window.pop_front();
                } else {
                    break;
                }
            }
            if window.len() >= self.config.emergency_max_per_window {
                return Err(CommError::Validation {
                    field: "emergency".to_string(),
                    reason: "emergency invocation rate limit exhausted".to_string(),
                });
            }
            window.push_back(now);
        }
        self.emergency_log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(EmergencyRecord {
                at: now,
                agent_id: agent_id.clone(),
                by: by.to_string(),
            });

        let procedure_id = self
            .procedures
            .iter()
            .find(|entry| entry.value().emergency)
            .map(|entry| entry.key().clone())
            .ok_or_else(|| CommError::Validation {
                field: "emergency".to_string(),
                reason: "no emergency procedure registered".to_string(),
            })?;

        warn!(agent = %agent_id, by, "emergency protocol invoked");
        let exec_id = self.begin_execution(&agent_id, &procedure_id, by, true)?;
        self.run_execution(exec_id).await;
        Ok(exec_id)
    }

    /// Recovers a set of agents in dependency order
    ///
    /// Dependencies recover first; each must return to `Healthy` before its
    /// dependents start. Returns executions in start order.
    ///
    /// # Errors
    /// `Validation` on dependency cycles; `PrerequisiteFailed` when a
    /// dependency does not return to health in time.
    pub async fn recover_agents(
        self: &Arc<Self>,
        agents: &[AgentId],
        by: &str,
    ) -> Result<Vec<ExecutionId>, CommError> {
        let order = {
            let graph = self
                .graph
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            graph
                .recovery_order(agents)
                .map_err(|err| CommError::Validation {
                    field: "dependency_graph".to_string(),
                    reason: err.to_string(),
                })?
        };

        let mut executions = Vec::with_capacity(order.len());
        for agent in order {
            // Dependencies must be healthy before this agent recovers.
            for dependency in self.in_set_dependencies(&agent, agents) {
                self.wait_for_health(&dependency).await?;
            }
            let decision = self
                .decide(&agent, self.health.level(&agent), 0.0)
                .or_else(|| self.decide(&agent, HealthLevel::Unhealthy, 0.0))
                .ok_or_else(|| CommError::RecoveryFailed {
                    agent_id: agent.clone(),
                    reason: "no applicable procedure".to_string(),
                })?;
            let exec_id = self
                .execute_recovery(agent.clone(), decision.procedure_id, by)
                .await?;
            executions.push(exec_id);
        }
        Ok(executions)
    }

    // ------------------------------------------------------------------
    // internals

    fn in_set_dependencies(&self, agent: &AgentId, set: &[AgentId]) -> Vec<AgentId> {
        let graph = self
            .graph
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        graph
            .dependencies_of(agent)
            .into_iter()
            .filter(|dep| set.contains(dep))
            .collect()
    }

    async fn wait_for_health(&self, agent: &AgentId) -> Result<(), CommError> {
        let deadline = self.time.now() + self.config.health_wait_timeout;
        loop {
            if self.health.level(agent) == HealthLevel::Healthy {
                return Ok(());
            }
            if self.time.now() >= deadline {
                return Err(CommError::PrerequisiteFailed {
                    agent_id: agent.clone(),
                    prerequisite: "dependency did not return to health".to_string(),
                });
            }
            self.time.sleep(self.config.health_poll_interval).await;
        }
    }

    fn begin_execution(
        &self,
        agent_id: &AgentId,
        procedure_id: &ProcedureId,
        by: &str,
        emergency: bool,
    ) -> Result<ExecutionId, CommError> {
        let procedure = self
            .procedures
            .get(procedure_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| CommError::Validation {
                field: "procedure_id".to_string(),
                reason: format!("unknown procedure {procedure_id}"),
            })?;

        let exec_id = ExecutionId::generate();
        // At most one active execution per agent: entry-or-fail.
        match self.active_guard.entry(agent_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let existing_id = *existing.get();
                let still_active = self
                    .executions
                    .get(&existing_id)
                    .is_some_and(|e| e.state.is_active());
                if still_active {
                    return Err(CommError::RecoveryFailed {
                        agent_id: agent_id.clone(),
                        reason: format!("execution {existing_id} already active"),
                    });
                }
                let mut existing = existing;
                existing.insert(exec_id);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(exec_id);
            }
        }

        let steps = procedure
            .steps
            .iter()
            .map(|step| StepRecord {
                order: step.order,
                name: step.name.clone(),
                state: StepState::Pending,
                started_at: None,
                ended_at: None,
                attempts: 0,
                output: None,
                error: None,
            })
            .collect();

        let execution = RecoveryExecution {
            exec_id,
            procedure_id: procedure_id.clone(),
            agent_id: agent_id.clone(),
            triggered_by: by.to_string(),
            started_at: self.time.now(),
            ended_at: None,
            state: if emergency {
                ExecutionState::Approved
            } else {
                ExecutionState::Pending
            },
            steps,
            result: None,
        };
        info!(execution = %exec_id, agent = %agent_id, procedure = %procedure_id, by, "recovery execution created");
        self.executions.insert(exec_id, execution);
        self.publish_state(exec_id);
        Ok(exec_id)
    }

    async fn run_execution(self: &Arc<Self>, exec_id: ExecutionId) {
        let Some((agent_id, procedure)) = self.executions.get(&exec_id).and_then(|execution| {
            self.procedures
                .get(&execution.procedure_id)
                .map(|p| (execution.agent_id.clone(), p.value().clone()))
        }) else {
            return;
        };

        // Evaluation: prerequisites, then approval. An external approval may
        // land at any point; it is never overwritten.
        if self.transition_if(exec_id, ExecutionState::Pending, ExecutionState::Evaluating) {
            for prerequisite in &procedure.prerequisites {
                let ok = self
                    .runner
                    .check_prerequisite(&agent_id, prerequisite)
                    .await
                    .unwrap_or(false);
                if !ok {
                    self.finish(exec_id, ExecutionState::Rejected, Some(format!(
                        "prerequisite failed: {prerequisite}"
                    )));
                    return;
                }
            }
            let pre_approval = self.pre_approvals.remove(&exec_id).map(|(_, approve)| approve);
            match self.state_of(exec_id) {
                Some(ExecutionState::Approved) => {}
                Some(ExecutionState::Rejected) => {
                    self.finish(exec_id, ExecutionState::Rejected, Some(
                        "rejected by approver".to_string(),
                    ));
                    return;
                }
                _ if pre_approval == Some(false) => {
                    self.finish(exec_id, ExecutionState::Rejected, Some(
                        "rejected by approver".to_string(),
                    ));
                    return;
                }
                _ if pre_approval == Some(true)
                    || procedure.risk <= self.config.auto_approve_max_risk =>
                {
                    self.transition_if(
                        exec_id,
                        ExecutionState::Evaluating,
                        ExecutionState::Approved,
                    );
                }
                _ => {
                    let gate = Arc::new(Notify::new());
                    self.approval_gates.insert(exec_id, Arc::clone(&gate));
                    tokio::select! {
                        () = gate.notified() => {}
                        () = self.time.sleep(self.config.approval_timeout) => {}
                    }
                    self.approval_gates.remove(&exec_id);
                    if self.state_of(exec_id) != Some(ExecutionState::Approved) {
                        self.finish(exec_id, ExecutionState::Rejected, Some(
                            "approval timed out or was rejected".to_string(),
                        ));
                        return;
                    }
                }
            }
        }

        if self.state_of(exec_id) != Some(ExecutionState::Approved) {
            return;
        }
        self.set_state(exec_id, ExecutionState::Executing);

        // Parallel groups share an order.
        let mut groups: BTreeMap<u32, Vec<RecoveryStep>> = BTreeMap::new();
        for step in &procedure.steps {
            groups.entry(step.order).or_default().push(step.clone());
        }

        let mut completed: Vec<RecoveryStep> = Vec::new();
        let mut failed = false;
        for (order, group) in groups {
            if failed {
                self.mark_group(exec_id, order, StepState::Skipped);
                continue;
            }
            debug!(execution = %exec_id, order, steps = group.len(), "running step group");
            let results = join_all(
                group
                    .iter()
                    .map(|step| self.run_step(exec_id, &agent_id, step)),
            )
            .await;
            for (step, result) in group.iter().zip(results) {
                match result {
                    Ok(()) => completed.push(step.clone()),
                    Err(_) if step.continue_on_failure => {}
                    Err(_) => failed = true,
                }
            }
        }

        if !failed {
            self.finish(exec_id, ExecutionState::Succeeded, Some("all steps succeeded".to_string()));
            return;
        }

        self.procedure_failures
            .entry(procedure.id.clone())
            .and_modify(|count| *count += 1)
            .or_insert(1);

        if procedure.rollback_enabled {
            self.set_state(exec_id, ExecutionState::RollingBack);
            for step in completed.iter().rev() {
                if let Some(rollback) = &step.rollback {
                    if let Err(err) = self.runner.run(&agent_id, rollback).await {
                        warn!(execution = %exec_id, step = %step.name, error = %err, "rollback action failed");
                    }
                    self.mark_step(exec_id, step.order, &step.name, StepState::RolledBack);
                }
            }
            self.finish(exec_id, ExecutionState::RolledBack, Some("rolled back after step failure".to_string()));
        } else {
            self.finish(exec_id, ExecutionState::Failed, Some("step failure without rollback".to_string()));
        }
    }

    async fn run_step(
        &self,
        exec_id: ExecutionId,
        agent_id: &AgentId,
        step: &RecoveryStep,
    ) -> Result<(), CommError> {
        self.mark_step(exec_id, step.order, &step.name, StepState::Running);
        if let Some(mut execution) = self.executions.get_mut(&exec_id) {
            if let Some(record) = execution
                .steps
                .iter_mut()
                .find(|r| r.order == step.order && r.name == step.name)
            {
                record.started_at = Some(self.time.now());
            }
        }

        let max_attempts = step.retry.max_attempts.as_u8();
        let mut last_error: Option<CommError> = None;
        for attempt in 1..=max_attempts {
            if let Some(mut execution) = self.executions.get_mut(&exec_id) {
                if let Some(record) = execution
                    .steps
                    .iter_mut()
                    .find(|r| r.order == step.order && r.name == step.name)
                {
                    record.attempts = attempt;
                }
            }
            let outcome = tokio::time::timeout(step.timeout, self.runner.run(agent_id, &step.action)).await;
            match outcome {
                Ok(Ok(output)) => {
                    if let Some(mut execution) = self.executions.get_mut(&exec_id) {
                        if let Some(record) = execution
                            .steps
                            .iter_mut()
                            .find(|r| r.order == step.order && r.name == step.name)
                        {
                            record.state = StepState::Succeeded;
                            record.ended_at = Some(self.time.now());
                            record.output = Some(output);
                        }
                    }
                    return Ok(());
                }
                Ok(Err(err)) => last_error = Some(err),
                Err(_) => {
                    last_error = Some(CommError::RemoteTimeout {
                        timeout_ms: u64::try_from(step.timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }
            if attempt < max_attempts {
                self.time.sleep(step.retry.delay_for_attempt(attempt)).await;
            }
        }

        let error = last_error.unwrap_or(CommError::RecoveryFailed {
            agent_id: agent_id.clone(),
            reason: "step failed".to_string(),
        });
        if let Some(mut execution) = self.executions.get_mut(&exec_id) {
            if let Some(record) = execution
                .steps
                .iter_mut()
                .find(|r| r.order == step.order && r.name == step.name)
            {
                record.state = StepState::Failed;
                record.ended_at = Some(self.time.now());
                record.error = Some(error.to_string());
            }
        }
        Err(error)
    }

    fn mark_group(&self, exec_id: ExecutionId, order: u32, state: StepState) {
        if let Some(mut execution) = self.executions.get_mut(&exec_id) {
            for record in execution.steps.iter_mut().filter(|r| r.order == order) {
                record.state = state;
            }
        }
    }

    fn mark_step(&self, exec_id: ExecutionId, order: u32, name: &str, state: StepState) {
        if let Some(mut execution) = self.executions.get_mut(&exec_id) {
            if let Some(record) = execution
                .steps
                .iter_mut()
                .find(|r| r.order == order && r.name == name)
            {
                record.state = state;
            }
        }
    }

    fn state_of(&self, exec_id: ExecutionId) -> Option<ExecutionState> {
        self.executions.get(&exec_id).map(|e| e.state)
    }

    /// Transitions only when the current state matches; returns whether it did
    fn transition_if(
        &self,
        exec_id: ExecutionId,
        from: ExecutionState,
        to: ExecutionState,
    ) -> bool {
        let transitioned = {
            if let Some(mut execution) = self.executions.get_mut(&exec_id) {
                if execution.state == from {
                    execution.state = to;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if transitioned {
            self.publish_state(exec_id);
        }
        transitioned
    }

    fn set_state(&self, exec_id: ExecutionId, state: ExecutionState) {
        if let Some(mut execution) = self.executions.get_mut(&exec_id) {
            execution.state = state;
        }
        self.publish_state(exec_id);
    }

    fn finish(&self, exec_id: ExecutionId, state: ExecutionState, result: Option<String>) {
        self.pre_approvals.remove(&exec_id);
        let record = {
            if let Some(mut execution) = self.executions.get_mut(&exec_id) {
                execution.state = state;
                execution.ended_at = Some(self.time.now());
                execution.result = result;
                Some(execution.clone())
            } else {
                None
            }
        };
        self.publish_state(exec_id);
        if let Some(record) = record {
            info!(execution = %exec_id, agent = %record.agent_id, state = ?record.state, "recovery execution finished");
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                if let Err(err) = store.store_execution(record).await {
                    warn!(error = %err, "failed to persist recovery execution");
                }
            });
        }
    }

    fn publish_state(&self, exec_id: ExecutionId) {
        let Some(execution) = self.execution(exec_id) else {
            return;
        };
        let Ok(event_type) = MessageType::try_new(event_types::RECOVERY_STATE_CHANGED.to_string())
        else {
            return;
        };
        let Ok(source) = ComponentId::try_new("recovery-orchestrator".to_string()) else {
            return;
        };
        self.publisher.publish(BusEvent {
            id: EventId::generate(),
            event_type,
            source,
            correlation_id: None,
            payload: json!({
                "exec_id": execution.exec_id.to_string(),
                "agent_id": execution.agent_id.to_string(),
                "state": execution.state,
            }),
            at: self.time.now(),
        });
    }
}

/// The built-in procedure library
#[must_use]
pub fn builtin_procedures() -> Vec<RecoveryProcedure> {
    use crate::domain_types::{MaxRetries, RetryDelayMs, RetryPolicy};

    let quick_retry = RetryPolicy {
        max_attempts: MaxRetries::try_new(2).unwrap_or_default(),
        initial_delay: RetryDelayMs::try_new(100).unwrap_or_default(),
        ..RetryPolicy::default()
    };
    let step = |order: u32, name: &str, action: StepAction, rollback: Option<StepAction>| {
        RecoveryStep {
            order,
            name: name.to_string(),
            action,
            timeout: Duration::from_secs(30),
            retry: quick_retry.clone(),
            continue_on_failure: false,
            rollback,
        }
    };
    let id = |name: &str| ProcedureId::try_new(name.to_string()).unwrap();

    vec![
        RecoveryProcedure {
            id: id("restart-agent"),
            name: "Restart agent".to_string(),
            description: "Restart the agent process and wait for it to rejoin".to_string(),
            steps: vec![step(1, "restart", StepAction::RestartAgent, None)],
            rollback_enabled: false,
            base_success_rate: 0.85,
            risk: RiskLevel::Medium,
            estimated_duration: Duration::from_secs(60),
            prerequisites: vec![],
            emergency: false,
        },
        RecoveryProcedure {
            id: id("reconnect"),
            name: "Reconnect".to_string(),
            description: "Re-establish the agent's transport connections".to_string(),
            steps: vec![step(1, "reconnect", StepAction::Reconnect, None)],
            rollback_enabled: false,
            base_success_rate: 0.9,
            risk: RiskLevel::Low,
            estimated_duration: Duration::from_secs(10),
            prerequisites: vec![],
            emergency: false,
        },
        RecoveryProcedure {
            id: id("scale-and-resync"),
            name: "Scale resources and resync".to_string(),
            description: "Grant resources, then resync state from peers".to_string(),
            steps: vec![
                step(
                    1,
                    "scale",
                    StepAction::ScaleResources,
                    Some(StepAction::Custom("release-resources".to_string())),
                ),
                step(2, "resync", StepAction::ResyncState, None),
            ],
            rollback_enabled: true,
            base_success_rate: 0.7,
            risk: RiskLevel::High,
            estimated_duration: Duration::from_secs(300),
            prerequisites: vec!["agent_reachable".to_string()],
            emergency: false,
        },
        RecoveryProcedure {
            id: id("emergency-restart"),
            name: "Emergency restart".to_string(),
            description: "Immediate restart bypassing approval".to_string(),
            steps: vec![step(1, "restart", StepAction::RestartAgent, None)],
            rollback_enabled: false,
            base_success_rate: 0.8,
            risk: RiskLevel::Critical,
            estimated_duration: Duration::from_secs(60),
            prerequisites: vec![],
            emergency: true,
        },
    ]
}
