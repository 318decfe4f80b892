//! Dependency resolution for sub-team scheduling.
//!
//! A hierarchical team declares its inter-team ordering as a map
//! `sub-team id -> prerequisite sub-team ids`. The [`DependencyResolver`]
//! validates that map, detects cycles with a depth-first search, and produces
//! a deterministic topological execution order via Kahn's algorithm. All
//! operations work on defensive copies; the caller's map is never mutated.
//!
//! Complexity is O(V + E) for every operation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::error::Error;
use std::fmt;

/// Errors raised while resolving the dependency graph.
#[derive(Debug, Clone)]
pub enum DependencyError {
    /// The map referenced unknown ids or contained self-dependencies. Carries
    /// one message per problem found.
    InvalidDependencies(Vec<String>),
    /// The graph contains at least one cycle. Each inner vector is one cycle
    /// as an ordered list of node ids, closing back on the first entry.
    CircularDependencies(Vec<Vec<String>>),
}

impl fmt::Display for DependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyError::InvalidDependencies(problems) => {
                write!(f, "Invalid dependencies: {}", problems.join("; "))
            }
            DependencyError::CircularDependencies(cycles) => {
                let rendered: Vec<String> = cycles
                    .iter()
                    .map(|cycle| cycle.join(" -> "))
                    .collect();
                write!(f, "Circular dependencies detected: {}", rendered.join(", "))
            }
        }
    }
}

impl Error for DependencyError {}

/// Validates dependency maps and computes topological sub-team order.
///
/// Stateless; construct one wherever an order is needed.
#[derive(Debug, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    /// Create a resolver.
    pub fn new() -> Self {
        DependencyResolver
    }

    /// Defensive copy of the dependency map. Later mutation of the caller's
    /// map does not affect the returned graph.
    pub fn build_dependency_graph(
        &self,
        dependencies: &HashMap<String, Vec<String>>,
    ) -> HashMap<String, Vec<String>> {
        dependencies.clone()
    }

    /// Check every key and value against the known sub-team ids and reject
    /// self-dependencies. Returns one message per problem; an empty vector
    /// means the map is valid.
    pub fn validate_dependencies(
        &self,
        dependencies: &HashMap<String, Vec<String>>,
        team_ids: &HashSet<String>,
    ) -> Vec<String> {
        let mut problems = Vec::new();
        // BTreeMap iteration keeps the problem list deterministic.
        let ordered: BTreeMap<&String, &Vec<String>> = dependencies.iter().collect();
        for (team_id, deps) in ordered {
            if !team_ids.contains(team_id) {
                problems.push(format!(
                    "Dependency key '{}' not found in team IDs",
                    team_id
                ));
            }
            for dep in deps.iter() {
                if !team_ids.contains(dep) {
                    problems.push(format!(
                        "Dependency '{}' for team '{}' not found in team IDs",
                        dep, team_id
                    ));
                }
                if dep == team_id {
                    problems.push(format!("Team '{}' cannot depend on itself", team_id));
                }
            }
        }
        problems
    }

    /// Find every cycle in the graph with a depth-first search over a
    /// recursion stack. Handles disconnected components: every node present
    /// as a key or a prerequisite is used as a search root.
    ///
    /// Each returned cycle is the ordered node list from the first repeated
    /// node back to itself (e.g. `["a", "b", "a"]`).
    pub fn detect_circular_dependencies(
        &self,
        dependencies: &HashMap<String, Vec<String>>,
    ) -> Vec<Vec<String>> {
        let mut nodes: Vec<&String> = dependencies
            .iter()
            .flat_map(|(k, deps)| std::iter::once(k).chain(deps.iter()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        nodes.sort();

        let mut cycles = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();

        for node in nodes {
            if visited.contains(node.as_str()) {
                continue;
            }
            let mut stack: Vec<&str> = Vec::new();
            let mut on_stack: HashSet<&str> = HashSet::new();
            self.dfs_cycles(
                node,
                dependencies,
                &mut visited,
                &mut stack,
                &mut on_stack,
                &mut cycles,
            );
        }
        cycles
    }

    fn dfs_cycles<'a>(
        &self,
        node: &'a str,
        graph: &'a HashMap<String, Vec<String>>,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        on_stack: &mut HashSet<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(node);
        stack.push(node);
        on_stack.insert(node);

        if let Some(deps) = graph.get(node) {
            for dep in deps {
                if on_stack.contains(dep.as_str()) {
                    // Cycle: slice the stack from the first occurrence of dep.
                    if let Some(start) = stack.iter().position(|n| *n == dep.as_str()) {
                        let mut cycle: Vec<String> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(dep.clone());
                        cycles.push(cycle);
                    }
                } else if !visited.contains(dep.as_str()) {
                    self.dfs_cycles(dep, graph, visited, stack, on_stack, cycles);
                }
            }
        }

        stack.pop();
        on_stack.remove(node);
    }

    /// Topological execution order over `team_ids` consistent with the
    /// dependency map: every prerequisite of a team precedes it. Ready nodes
    /// are drained in lexicographic id order, so two equivalent schedules
    /// never diverge across runs.
    ///
    /// Fails with [`DependencyError::InvalidDependencies`] when the map
    /// references ids outside `team_ids` (or self-loops), and with
    /// [`DependencyError::CircularDependencies`] when the graph is cyclic.
    pub fn calculate_execution_order(
        &self,
        dependencies: &HashMap<String, Vec<String>>,
        team_ids: &HashSet<String>,
    ) -> Result<Vec<String>, DependencyError> {
        let problems = self.validate_dependencies(dependencies, team_ids);
        if !problems.is_empty() {
            return Err(DependencyError::InvalidDependencies(problems));
        }

        let cycles = self.detect_circular_dependencies(dependencies);
        if !cycles.is_empty() {
            return Err(DependencyError::CircularDependencies(cycles));
        }

        // Kahn's algorithm over a copy of the graph. in_degree counts how
        // many prerequisites a team still waits for; dependents is the
        // reverse adjacency used to release them.
        let mut in_degree: HashMap<&str, usize> =
            team_ids.iter().map(|id| (id.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (team_id, deps) in dependencies {
            if let Some(degree) = in_degree.get_mut(team_id.as_str()) {
                *degree = deps.len();
            }
            for dep in deps {
                dependents
                    .entry(dep.as_str())
                    .or_insert_with(Vec::new)
                    .push(team_id.as_str());
            }
        }

        // BTreeSet keeps the ready pool lexicographically ordered, so the
        // schedule is deterministic across runs.
        let mut ready: std::collections::BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(team_ids.len());
        loop {
            let node = match ready.iter().next().copied() {
                Some(node) => node,
                None => break,
            };
            ready.remove(node);
            order.push(node.to_string());
            if let Some(children) = dependents.get(node) {
                for child in children {
                    let degree = in_degree.get_mut(child).expect("child is a known team id");
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }

        if order.len() != team_ids.len() {
            // Unreachable after the explicit cycle check, kept as a guard.
            return Err(DependencyError::CircularDependencies(vec![]));
        }
        Ok(order)
    }
}
