//! Agent dependency graph for multi-agent recovery
//!
//! Nodes are agent ids, edges are "depends on" relationships. Recovery order
//! comes from Kahn's algorithm: dependencies first, dependents after. Cycles
//! surface an explicit error rather than recursing.

use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

use crate::domain_types::AgentId;

/// Cycle detected during topological ordering
#[derive(Debug, Error)]
#[error("dependency cycle involving agents: {agents:?}")]
pub struct DependencyCycle {
    /// Agents participating in the unresolvable remainder
    pub agents: Vec<AgentId>,
}

/// Index-free adjacency DAG over agent ids
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    // dependent -> set of agents it depends on
    dependencies: HashMap<AgentId, HashSet<AgentId>>,
}

impl DependencyGraph {
    /// Creates an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that `dependent` depends on `dependency`
    pub fn add_dependency(&mut self, dependent: AgentId, dependency: AgentId) {
        self.dependencies
            .entry(dependent)
            .or_default()
            .insert(dependency);
    }

    /// Removes an agent and every edge touching it
    pub fn remove_agent(&mut self, agent: &AgentId) {
        self.dependencies.remove(agent);
        for deps in self.dependencies.values_mut() {
            deps.remove(agent);
        }
    }

    /// Direct dependencies of an agent
    #[must_use]
    pub fn dependencies_of(&self, agent: &AgentId) -> Vec<AgentId> {
        self.dependencies
            .get(agent)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Recovery order for a set of agents: dependencies before dependents
    ///
    /// Only edges between members of `agents` constrain the order; external
    /// dependencies are assumed healthy.
    ///
    /// # Errors
    /// [`DependencyCycle`] when the subgraph contains a cycle.
    pub fn recovery_order(&self, agents: &[AgentId]) -> Result<Vec<AgentId>, DependencyCycle> {
        let members: HashSet<&AgentId> = agents.iter().collect();
        // In-degree = number of in-set dependencies.
        let mut in_degree: HashMap<&AgentId, usize> = HashMap::new();
        let mut dependents: HashMap<&AgentId, Vec<&AgentId>> = HashMap::new();
        for agent in agents {
            let degree = self
                .dependencies
                .get(agent)
                .map(|deps| deps.iter().filter(|d| members.contains(d)).count())
                .unwrap_or(0);
            in_degree.insert(agent, degree);
            if let Some(deps) = self.dependencies.get(agent) {
                for dep in deps {
                    if members.contains(dep) {
                        dependents.entry(dep).or_default().push(agent);
                    }
                }
            }
        }

        let mut ready: VecDeque<&AgentId> = {
            // Deterministic order for equal ranks.
            let mut zero: Vec<&AgentId> = in_degree
                .iter()
                .filter(|(_, degree)| **degree == 0)
                .map(|(agent, _)| *agent)
                .collect();
            zero.sort();
            zero.into_iter().collect()
        };

        let mut order = Vec::with_capacity(agents.len());
        while let Some(agent) = ready.pop_front() {
            order.push(agent.clone());
            let mut newly_ready = Vec::new();
            if let Some(deps) = dependents.get(agent) {
                for dependent in deps {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            newly_ready.push(*dependent);
                        }
                    }
                }
            }
            newly_ready.sort();
            ready.extend(newly_ready);
        }

        if order.len() != agents.len() {
            let stuck: Vec<AgentId> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(agent, _)| (*agent).clone())
                .collect();
            return Err(DependencyCycle { agents: stuck });
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str) -> AgentId {
        AgentId::try_new(name.to_string()).unwrap()
    }

    #[test]
    fn dependencies_come_first() {
        let mut graph = DependencyGraph::new();
        // B depends on A; C depends on B.
        graph.add_dependency(agent("b"), agent("a"));
        graph.add_dependency(agent("c"), agent("b"));
        let order = graph
            .recovery_order(&[agent("c"), agent("a"), agent("b")])
            .unwrap();
        assert_eq!(order, vec![agent("a"), agent("b"), agent("c")]);
    }

    #[test]
    fn external_dependencies_do_not_constrain() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(agent("b"), agent("external"));
        let order = graph.recovery_order(&[agent("b")]).unwrap();
        assert_eq!(order, vec![agent("b")]);
    }

    #[test]
    fn cycles_are_an_explicit_error() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(agent("a"), agent("b"));
        graph.add_dependency(agent("b"), agent("a"));
        let err = graph.recovery_order(&[agent("a"), agent("b")]).unwrap_err();
        assert_eq!(err.agents.len(), 2);
    }

    #[test]
    fn independent_agents_order_deterministically() {
        let graph = DependencyGraph::new();
        let order = graph
            .recovery_order(&[agent("z"), agent("m"), agent("a")])
            .unwrap();
        assert_eq!(order, vec![agent("a"), agent("m"), agent("z")]);
    }
}
