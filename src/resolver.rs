//! Dependency resolution: compiling steps into ordered execution phases
//!
//! The resolver turns a validated step list into a sequence of phases. Every
//! step in a phase has all of its dependencies satisfied by earlier phases,
//! so phases execute strictly in order while the steps inside a phase are
//! independent and may run concurrently.

use crate::error::{FlowError, Result};
use crate::models::StepConfig;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// One phase of execution: steps whose dependencies are already satisfied.
#[derive(Debug, Clone)]
pub struct ExecutionPhase {
    pub steps: Vec<StepConfig>,
}

impl ExecutionPhase {
    /// Step names in this phase.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Dependency resolver for workflow steps.
///
/// Builds a dependency graph (a `depends_on` entry may name another step or
/// a `parallel_group` label, which stands for all of the group's members),
/// rejects missing references and cycles, and emits execution phases.
///
/// A parallel group always lands in a single phase: if only some members of
/// a group are ready, those members wait until the rest become ready, so a
/// step declaring `depends_on: [group]` always renders against the complete
/// set of sibling outputs.
#[derive(Debug)]
pub struct DependencyResolver {
    graph: DiGraph<String, ()>,
    step_indices: HashMap<String, NodeIndex>,
}

impl DependencyResolver {
    /// Build and validate the dependency graph for a step list.
    ///
    /// # Errors
    ///
    /// * [`FlowError::MissingDependency`] - a `depends_on` entry names
    ///   neither a step nor a declared parallel group
    /// * [`FlowError::CircularDependency`] - the graph has a cycle; the
    ///   error message includes the cycle path
    pub fn build(steps: &[StepConfig]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();
        let group_members = group_members(steps);

        for step in steps {
            let index = graph.add_node(step.name.clone());
            step_indices.insert(step.name.clone(), index);
        }

        for step in steps {
            let step_index = step_indices[&step.name];
            for dep in &step.depends_on {
                if let Some(&dep_index) = step_indices.get(dep) {
                    // Edge from dependency to step (dep completes first)
                    graph.add_edge(dep_index, step_index, ());
                } else if let Some(members) = group_members.get(dep.as_str()) {
                    // Depending on a group means depending on every member
                    for member in members {
                        graph.add_edge(step_indices[*member], step_index, ());
                    }
                } else {
                    return Err(FlowError::MissingDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let resolver = Self {
            graph,
            step_indices,
        };
        resolver.validate_acyclic()?;
        Ok(resolver)
    }

    /// Validate that the graph contains no cycles.
    pub fn validate_acyclic(&self) -> Result<()> {
        if is_cyclic_directed(&self.graph) {
            return Err(FlowError::CircularDependency(self.find_cycle()));
        }
        Ok(())
    }

    /// Find a cycle for error reporting via DFS with a recursion stack.
    fn find_cycle(&self) -> String {
        let mut visited = HashMap::new();
        let mut path = Vec::new();

        for node in self.graph.node_indices() {
            if !visited.contains_key(&node) {
                if let Some(cycle) = self.dfs_find_cycle(node, &mut visited, &mut path) {
                    return cycle;
                }
            }
        }

        "unknown cycle".to_string()
    }

    fn dfs_find_cycle(
        &self,
        node: NodeIndex,
        visited: &mut HashMap<NodeIndex, bool>,
        path: &mut Vec<String>,
    ) -> Option<String> {
        if let Some(&in_path) = visited.get(&node) {
            if in_path {
                path.push(self.graph[node].clone());
                return Some(path.join(" -> "));
            }
            return None;
        }

        visited.insert(node, true);
        path.push(self.graph[node].clone());

        for neighbor in self.graph.neighbors(node) {
            if let Some(cycle) = self.dfs_find_cycle(neighbor, visited, path) {
                return Some(cycle);
            }
        }

        path.pop();
        visited.insert(node, false);
        None
    }

    /// Names of steps that directly depend on `step_name`.
    pub fn dependents(&self, step_name: &str) -> Vec<String> {
        match self.step_indices.get(step_name) {
            Some(&index) => self
                .graph
                .neighbors(index)
                .map(|idx| self.graph[idx].clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

fn group_members(steps: &[StepConfig]) -> HashMap<&str, Vec<&str>> {
    let mut groups: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        if let Some(group) = &step.parallel_group {
            groups.entry(group.as_str()).or_default().push(&step.name);
        }
    }
    groups
}

/// Compile steps into ordered execution phases.
///
/// Iterative and deterministic: each round collects every remaining step
/// whose dependencies are satisfied, holds back parallel-group members until
/// the whole group is ready, and emits the result as the next phase.
///
/// # Errors
///
/// * [`FlowError::MissingDependency`] / [`FlowError::CircularDependency`] -
///   propagated from graph construction
/// * [`FlowError::UnresolvableDependencies`] - no step became ready while
///   steps remain (mutually-blocked parallel groups)
///
/// # Example
///
/// ```
/// use apiflow::parser::parse_workflow_yaml;
/// use apiflow::resolver::resolve_phases;
///
/// let config = parse_workflow_yaml(r#"
/// name: pipeline
/// api_base: https://api.example.com
/// steps:
///   - name: fetch
///     endpoint: /fetch
///   - name: publish
///     endpoint: /publish
///     depends_on: [fetch]
/// "#)?;
/// let phases = resolve_phases(&config.steps)?;
/// assert_eq!(phases.len(), 2);
/// # Ok::<(), apiflow::error::FlowError>(())
/// ```
pub fn resolve_phases(steps: &[StepConfig]) -> Result<Vec<ExecutionPhase>> {
    // Validates references and rejects cycles before phase construction.
    DependencyResolver::build(steps)?;

    let groups = group_members(steps);

    let mut remaining: HashSet<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    let mut completed: HashSet<&str> = HashSet::new();
    let mut phases = Vec::new();

    while !remaining.is_empty() {
        // Iterate in declaration order so phase construction is deterministic.
        let mut ready: Vec<&StepConfig> = steps
            .iter()
            .filter(|step| remaining.contains(step.name.as_str()))
            .filter(|step| deps_satisfied(step, &completed, &groups))
            .collect();

        // A parallel group lands in one phase or not at all: drop members
        // whose siblings are not yet ready.
        let ready_names: HashSet<&str> = ready.iter().map(|s| s.name.as_str()).collect();
        ready.retain(|step| match &step.parallel_group {
            Some(group) => groups[group.as_str()]
                .iter()
                .all(|member| ready_names.contains(member)),
            None => true,
        });

        if ready.is_empty() {
            let mut unresolved: Vec<String> = remaining.iter().map(|s| s.to_string()).collect();
            unresolved.sort();
            return Err(FlowError::UnresolvableDependencies(unresolved));
        }

        for step in &ready {
            remaining.remove(step.name.as_str());
            completed.insert(step.name.as_str());
        }
        phases.push(ExecutionPhase {
            steps: ready.into_iter().cloned().collect(),
        });
    }

    debug_assert_eq!(
        phases.iter().map(|p| p.steps.len()).sum::<usize>(),
        steps.len()
    );
    Ok(phases)
}

fn deps_satisfied(
    step: &StepConfig,
    completed: &HashSet<&str>,
    groups: &HashMap<&str, Vec<&str>>,
) -> bool {
    step.depends_on.iter().all(|dep| {
        if completed.contains(dep.as_str()) {
            return true;
        }
        match groups.get(dep.as_str()) {
            Some(members) => members.iter().all(|member| completed.contains(member)),
            None => false,
        }
    })
}
