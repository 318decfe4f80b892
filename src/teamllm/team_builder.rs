//! Construction of runtime teams from validated configuration.
//!
//! The [`TeamBuilder`] turns a [`HierarchicalTeam`] definition into a
//! [`BuiltTeam`]: one top-supervisor runtime, one [`TeamRuntime`] per
//! sub-team (supervisor + workers indexed by id), the dependency graph, and
//! the pre-computed topological execution order. Construction is atomic: any
//! validation or dependency failure rejects the whole build and no partial
//! runtime objects escape.
//!
//! Runtime objects carry handles to the shared [`EnvKeyProvider`] and
//! [`ToolRegistry`]; the builder resolves each worker's declared tool names
//! against the registry up front so the engine can record tool availability
//! without re-checking.

use crate::teamllm::config::{HierarchicalTeam, SubTeam, SupervisorConfig, WorkerConfig};
use crate::teamllm::dependency::{DependencyError, DependencyResolver};
use crate::teamllm::keys::EnvKeyProvider;
use crate::teamllm::tool_protocol::ToolRegistry;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Errors raised while building a team. The whole build is rejected
/// atomically; partial runtime objects are never exposed.
#[derive(Debug)]
pub enum TeamBuildError {
    /// The configuration failed structural validation.
    Config(crate::teamllm::config::ConfigError),
    /// The dependency graph was invalid or cyclic.
    Dependency(DependencyError),
}

impl fmt::Display for TeamBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeamBuildError::Config(err) => write!(f, "Team build failed: {}", err),
            TeamBuildError::Dependency(err) => write!(f, "Team build failed: {}", err),
        }
    }
}

impl Error for TeamBuildError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TeamBuildError::Config(err) => Some(err),
            TeamBuildError::Dependency(err) => Some(err),
        }
    }
}

impl From<crate::teamllm::config::ConfigError> for TeamBuildError {
    fn from(err: crate::teamllm::config::ConfigError) -> Self {
        TeamBuildError::Config(err)
    }
}

impl From<DependencyError> for TeamBuildError {
    fn from(err: DependencyError) -> Self {
        TeamBuildError::Dependency(err)
    }
}

/// Runtime handle for one supervisor.
#[derive(Clone)]
pub struct SupervisorRuntime {
    /// Stable id (`"supervisor_<team id>"`, or `"supervisor_top"`).
    pub id: String,
    /// Display name.
    pub name: String,
    /// The static configuration the router is invoked with.
    pub config: SupervisorConfig,
    key_provider: Arc<EnvKeyProvider>,
}

impl SupervisorRuntime {
    /// The shared key provider this supervisor resolves credentials through.
    pub fn key_provider(&self) -> &EnvKeyProvider {
        &self.key_provider
    }
}

impl fmt::Debug for SupervisorRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorRuntime")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Runtime handle for one worker.
#[derive(Clone)]
pub struct WorkerRuntime {
    /// The static configuration the runner is invoked with.
    pub config: WorkerConfig,
    /// Subset of the declared tools that exist in the shared registry, in
    /// declaration order.
    pub resolved_tools: Vec<String>,
    key_provider: Arc<EnvKeyProvider>,
    tool_registry: Arc<ToolRegistry>,
}

impl WorkerRuntime {
    /// The shared key provider this worker resolves credentials through.
    pub fn key_provider(&self) -> &EnvKeyProvider {
        &self.key_provider
    }

    /// The shared tool registry.
    pub fn tool_registry(&self) -> &Arc<ToolRegistry> {
        &self.tool_registry
    }
}

impl fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("worker_id", &self.config.worker_id)
            .field("worker_name", &self.config.worker_name)
            .field("resolved_tools", &self.resolved_tools)
            .finish()
    }
}

/// Runtime objects for one sub-team.
#[derive(Debug, Clone)]
pub struct TeamRuntime {
    /// The sub-team definition.
    pub sub_team: SubTeam,
    /// The sub-team's supervisor.
    pub supervisor: SupervisorRuntime,
    /// Workers indexed by worker id.
    pub workers: HashMap<String, WorkerRuntime>,
    /// Worker ids in declaration order (the routing roster order).
    pub worker_order: Vec<String>,
}

impl TeamRuntime {
    /// Workers in declaration order.
    pub fn workers_in_order(&self) -> Vec<&WorkerRuntime> {
        self.worker_order
            .iter()
            .filter_map(|id| self.workers.get(id))
            .collect()
    }

    /// Find a worker by its display name.
    pub fn worker_by_name(&self, name: &str) -> Option<&WorkerRuntime> {
        self.worker_order
            .iter()
            .filter_map(|id| self.workers.get(id))
            .find(|worker| worker.config.worker_name == name)
    }
}

/// A fully constructed, validated team, ready for the engine.
#[derive(Debug, Clone)]
pub struct BuiltTeam {
    /// The original definition.
    pub team: HierarchicalTeam,
    /// Top-level supervisor runtime.
    pub top_supervisor: SupervisorRuntime,
    /// Per-sub-team runtimes keyed by sub-team id.
    pub teams: HashMap<String, TeamRuntime>,
    /// Sub-team ids in topological execution order.
    pub execution_order: Vec<String>,
    /// Defensive copy of the dependency graph.
    pub dependency_graph: HashMap<String, Vec<String>>,
}

impl BuiltTeam {
    /// Total number of workers across all sub-teams.
    pub fn worker_count(&self) -> usize {
        self.teams.values().map(|team| team.workers.len()).sum()
    }

    /// Prerequisite ids of `team_id` (empty when it has none).
    pub fn prerequisites(&self, team_id: &str) -> &[String] {
        self.dependency_graph
            .get(team_id)
            .map(|deps| deps.as_slice())
            .unwrap_or(&[])
    }
}

/// Builds [`BuiltTeam`]s from validated configuration.
pub struct TeamBuilder {
    key_provider: Arc<EnvKeyProvider>,
    tool_registry: Arc<ToolRegistry>,
    resolver: DependencyResolver,
}

impl TeamBuilder {
    /// Create a builder over the shared key provider and tool registry.
    pub fn new(key_provider: Arc<EnvKeyProvider>, tool_registry: Arc<ToolRegistry>) -> Self {
        Self {
            key_provider,
            tool_registry,
            resolver: DependencyResolver::new(),
        }
    }

    /// A builder with a fresh key provider and an empty tool registry;
    /// convenient for tests and tool-less teams.
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(EnvKeyProvider::new()), Arc::new(ToolRegistry::new()))
    }

    /// Validate a definition without constructing runtimes: structural config
    /// checks plus dependency validation and cycle detection.
    pub fn validate(&self, team: &HierarchicalTeam) -> Result<(), TeamBuildError> {
        team.validate()?;
        let ids: HashSet<String> = team.sub_team_ids().into_iter().collect();
        let problems = self.resolver.validate_dependencies(&team.dependencies, &ids);
        if !problems.is_empty() {
            return Err(DependencyError::InvalidDependencies(problems).into());
        }
        let cycles = self.resolver.detect_circular_dependencies(&team.dependencies);
        if !cycles.is_empty() {
            return Err(DependencyError::CircularDependencies(cycles).into());
        }
        Ok(())
    }

    /// Validate and construct the full runtime team.
    pub fn build(&self, team: HierarchicalTeam) -> Result<BuiltTeam, TeamBuildError> {
        self.validate(&team)?;

        let ids: HashSet<String> = team.sub_team_ids().into_iter().collect();
        let execution_order = self
            .resolver
            .calculate_execution_order(&team.dependencies, &ids)?;
        let dependency_graph = self.resolver.build_dependency_graph(&team.dependencies);

        let top_config = team
            .top_supervisor_config
            .clone()
            .expect("validate() guarantees a top supervisor");
        let top_supervisor = SupervisorRuntime {
            id: "supervisor_top".to_string(),
            name: format!("{} supervisor", team.team_name),
            config: top_config,
            key_provider: Arc::clone(&self.key_provider),
        };

        let mut teams = HashMap::new();
        for sub_team in &team.sub_teams {
            teams.insert(sub_team.id.clone(), self.build_team_runtime(sub_team));
        }

        log::info!(
            "Built team '{}': {} sub-teams, {} workers, order {:?}",
            team.team_name,
            teams.len(),
            teams.values().map(|t| t.workers.len()).sum::<usize>(),
            execution_order
        );

        Ok(BuiltTeam {
            team,
            top_supervisor,
            teams,
            execution_order,
            dependency_graph,
        })
    }

    fn build_team_runtime(&self, sub_team: &SubTeam) -> TeamRuntime {
        let supervisor = SupervisorRuntime {
            id: format!("supervisor_{}", sub_team.id),
            name: format!("{} supervisor", sub_team.name),
            config: sub_team.supervisor_config.clone(),
            key_provider: Arc::clone(&self.key_provider),
        };

        let mut workers = HashMap::new();
        let mut worker_order = Vec::new();
        for config in &sub_team.worker_configs {
            let resolved_tools = self.tool_registry.resolve(&config.tools);
            if resolved_tools.len() < config.tools.len() {
                log::warn!(
                    "Worker '{}' declares tools not present in the registry: {:?}",
                    config.worker_id,
                    config
                        .tools
                        .iter()
                        .filter(|t| !resolved_tools.contains(t))
                        .collect::<Vec<_>>()
                );
            }
            worker_order.push(config.worker_id.clone());
            workers.insert(
                config.worker_id.clone(),
                WorkerRuntime {
                    config: config.clone(),
                    resolved_tools,
                    key_provider: Arc::clone(&self.key_provider),
                    tool_registry: Arc::clone(&self.tool_registry),
                },
            );
        }

        TeamRuntime {
            sub_team: sub_team.clone(),
            supervisor,
            workers,
            worker_order,
        }
    }
}
