//! Team configuration model.
//!
//! This module defines the declarative description of a hierarchical team: the
//! LLM settings each agent runs with, the supervisor and worker prompts, the
//! sub-team roster, and the dependency map that orders sub-team execution.
//!
//! Configurations are plain serde types so they can arrive as JSON over the
//! HTTP surface or be built programmatically. [`HierarchicalTeam::validate`]
//! performs the structural checks (non-empty names, unique ids, dependency
//! references) that must pass before the team builder will touch the config.
//!
//! # Example
//!
//! ```rust
//! use teamllm::config::{HierarchicalTeam, SubTeam, SupervisorConfig, WorkerConfig, LLMConfig, Provider};
//!
//! let llm = LLMConfig::new(Provider::OpenAI, "gpt-4o");
//!
//! let supervisor = SupervisorConfig::new(
//!     llm.clone(),
//!     "You are a team supervisor coordinating research work.",
//!     "Coordinate the team to execute research tasks.",
//! );
//!
//! let worker = WorkerConfig::new(
//!     "researcher_001",
//!     "Research Specialist",
//!     llm.clone(),
//!     "You are a research specialist.",
//!     "Research the latest developments in AI technology.",
//! );
//!
//! let team = HierarchicalTeam::new("ai_research_team", "AI research and analysis")
//!     .with_top_supervisor(supervisor.clone())
//!     .with_sub_team(SubTeam::new("research", "Research Team", "Gathers material", supervisor, vec![worker]));
//!
//! assert!(team.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;

/// The closed set of LLM providers a worker or supervisor can target.
///
/// The core never talks to a provider directly; the variant is forwarded to
/// the [`AgentRunner`](crate::runner::AgentRunner) collaborator and to the
/// [`EnvKeyProvider`](crate::keys::EnvKeyProvider), which knows which
/// environment variable holds each provider's credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    /// OpenAI-hosted models (`OPENAI_API_KEY`).
    #[serde(rename = "openai")]
    OpenAI,
    /// OpenRouter-proxied models (`OPENROUTER_API_KEY`).
    #[serde(rename = "openrouter")]
    OpenRouter,
    /// AWS Bedrock-hosted models; requires a `region` in [`LLMConfig`].
    #[serde(rename = "aws_bedrock")]
    AwsBedrock,
}

impl Provider {
    /// Stable wire name of the provider (`"openai"`, `"openrouter"`, `"aws_bedrock"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::OpenRouter => "openrouter",
            Provider::AwsBedrock => "aws_bedrock",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while validating team configuration.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// A required field was empty or malformed. Carries a human-readable
    /// description naming the offending field.
    InvalidField(String),
    /// An id (sub-team or worker) appeared more than once where uniqueness is
    /// required.
    DuplicateId(String),
    /// The dependency map referenced an unknown sub-team id or contained a
    /// self-dependency.
    InvalidDependency(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidField(msg) => write!(f, "Invalid field: {}", msg),
            ConfigError::DuplicateId(msg) => write!(f, "Duplicate id: {}", msg),
            ConfigError::InvalidDependency(msg) => write!(f, "Invalid dependency: {}", msg),
        }
    }
}

impl Error for ConfigError {}

/// LLM settings shared by supervisors and workers.
///
/// Invariant: [`Provider::AwsBedrock`] requires `region`; other providers
/// ignore it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Which provider serves this agent's requests.
    pub provider: Provider,
    /// Model name understood by the provider (e.g. `"gpt-4o"`).
    pub model: String,
    /// Custom API endpoint, when the provider supports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// AWS region; only meaningful (and mandatory) for Bedrock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Sampling temperature in `[0.0, 2.0]`.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Generation cap, when set must be > 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Per-request timeout in seconds, must be > 0.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_timeout() -> u64 {
    30
}

impl LLMConfig {
    /// Create a config with the default temperature (0.7) and timeout (30 s).
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            base_url: None,
            region: None,
            temperature: default_temperature(),
            max_tokens: None,
            timeout: default_timeout(),
        }
    }

    /// Set the AWS region (builder pattern). Required for Bedrock.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Override the sampling temperature (builder pattern).
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Override the generation token cap (builder pattern).
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Check field-level invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidField("model must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::InvalidField(format!(
                "temperature {} outside [0.0, 2.0]",
                self.temperature
            )));
        }
        if let Some(max_tokens) = self.max_tokens {
            if max_tokens == 0 {
                return Err(ConfigError::InvalidField("max_tokens must be > 0".into()));
            }
        }
        if self.timeout == 0 {
            return Err(ConfigError::InvalidField("timeout must be > 0".into()));
        }
        if self.provider == Provider::AwsBedrock && self.region.is_none() {
            return Err(ConfigError::InvalidField(
                "region is required for the aws_bedrock provider".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration of a supervisor: the router that picks which worker handles
/// each task within a sub-team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// LLM settings for the routing calls.
    pub llm_config: LLMConfig,
    /// System prompt defining the supervisor's role. Must be non-empty.
    pub system_prompt: String,
    /// User prompt with the routing instructions. Must be non-empty.
    pub user_prompt: String,
    /// Upper bound on routing/worker cycles, must be > 0.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    10
}

impl SupervisorConfig {
    /// Create a supervisor config with the default iteration budget (10).
    pub fn new(
        llm_config: LLMConfig,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            llm_config,
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            max_iterations: default_max_iterations(),
        }
    }

    /// Override the iteration budget (builder pattern).
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Check field-level invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.llm_config.validate()?;
        if self.system_prompt.trim().is_empty() {
            return Err(ConfigError::InvalidField(
                "supervisor system_prompt must not be empty".into(),
            ));
        }
        if self.user_prompt.trim().is_empty() {
            return Err(ConfigError::InvalidField(
                "supervisor user_prompt must not be empty".into(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::InvalidField(
                "supervisor max_iterations must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration of a worker: the unit that performs a task, optionally
/// through tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identifier, unique within its sub-team.
    pub worker_id: String,
    /// Display name used for routing and event attribution. Must be non-empty.
    pub worker_name: String,
    /// LLM settings for this worker's calls.
    pub llm_config: LLMConfig,
    /// System prompt defining the worker's role. Must be non-empty.
    pub system_prompt: String,
    /// User prompt with the task instructions. Must be non-empty.
    pub user_prompt: String,
    /// Names of tools this worker may use, resolved against the shared
    /// [`ToolRegistry`](crate::tool_protocol::ToolRegistry).
    #[serde(default)]
    pub tools: Vec<String>,
    /// Upper bound on tool/LLM cycles inside a single worker run, must be > 0.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl WorkerConfig {
    /// Create a worker config with no tools and the default iteration budget.
    pub fn new(
        worker_id: impl Into<String>,
        worker_name: impl Into<String>,
        llm_config: LLMConfig,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            worker_name: worker_name.into(),
            llm_config,
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            tools: Vec::new(),
            max_iterations: default_max_iterations(),
        }
    }

    /// Grant the worker access to the named tools (builder pattern).
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    /// Check field-level invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_id.trim().is_empty() {
            return Err(ConfigError::InvalidField("worker_id must not be empty".into()));
        }
        if self.worker_name.trim().is_empty() {
            return Err(ConfigError::InvalidField(
                "worker_name must not be empty".into(),
            ));
        }
        self.llm_config.validate()?;
        if self.system_prompt.trim().is_empty() {
            return Err(ConfigError::InvalidField(
                "worker system_prompt must not be empty".into(),
            ));
        }
        if self.user_prompt.trim().is_empty() {
            return Err(ConfigError::InvalidField(
                "worker user_prompt must not be empty".into(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::InvalidField(
                "worker max_iterations must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// One node in the team DAG: a supervisor plus at least one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTeam {
    /// Identifier, unique within the hierarchical team.
    pub id: String,
    /// Display name.
    pub name: String,
    /// What this sub-team is responsible for; fed to the supervisor as the
    /// routing directive.
    pub description: String,
    /// The sub-team's supervisor.
    pub supervisor_config: SupervisorConfig,
    /// The worker roster; at least one, ids unique within the sub-team.
    pub worker_configs: Vec<WorkerConfig>,
}

impl SubTeam {
    /// Assemble a sub-team from its parts.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        supervisor_config: SupervisorConfig,
        worker_configs: Vec<WorkerConfig>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            supervisor_config,
            worker_configs,
        }
    }

    /// Check field-level invariants, including worker id uniqueness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::InvalidField("sub-team id must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidField(
                "sub-team name must not be empty".into(),
            ));
        }
        self.supervisor_config.validate()?;
        if self.worker_configs.is_empty() {
            return Err(ConfigError::InvalidField(format!(
                "sub-team '{}' must have at least one worker",
                self.id
            )));
        }
        let mut seen = HashSet::new();
        for worker in &self.worker_configs {
            worker.validate()?;
            if !seen.insert(worker.worker_id.as_str()) {
                return Err(ConfigError::DuplicateId(format!(
                    "worker id '{}' duplicated in sub-team '{}'",
                    worker.worker_id, self.id
                )));
            }
        }
        Ok(())
    }
}

/// Output verbosity for the final standardized result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Full per-worker detail.
    Detailed,
    /// Team-level outputs only.
    Summary,
    /// Status and metrics only.
    Minimal,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Detailed
    }
}

/// Global knobs applying to a whole hierarchical team run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Wall-clock budget for the whole execution in seconds, must be > 0.
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time: u64,
    /// Whether lifecycle events are published to the event bus.
    #[serde(default = "default_true")]
    pub enable_streaming: bool,
    /// Verbosity of the standardized output.
    #[serde(default)]
    pub output_format: OutputFormat,
}

fn default_max_execution_time() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            max_execution_time: default_max_execution_time(),
            enable_streaming: true,
            output_format: OutputFormat::default(),
        }
    }
}

impl GlobalConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_execution_time == 0 {
            return Err(ConfigError::InvalidField(
                "max_execution_time must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// The complete declarative description of a hierarchical team.
///
/// A team is a top-level supervisor, a set of [`SubTeam`]s, and a dependency
/// map `sub-team id -> prerequisite sub-team ids`. Dependency references are
/// validated here; cycle detection happens in the
/// [`team builder`](crate::team_builder::TeamBuilder), which consults the
/// [`DependencyResolver`](crate::dependency::DependencyResolver) before any
/// runtime object is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchicalTeam {
    /// Display name. Must be non-empty.
    pub team_name: String,
    /// What the team as a whole is for.
    pub description: String,
    /// Top-level supervisor configuration.
    pub top_supervisor_config: Option<SupervisorConfig>,
    /// The sub-teams; ids must be unique.
    #[serde(default)]
    pub sub_teams: Vec<SubTeam>,
    /// `sub-team id -> prerequisite sub-team ids`. Every key and value must
    /// name an existing sub-team; no self-loops.
    #[serde(default)]
    pub dependencies: HashMap<String, Vec<String>>,
    /// Execution-wide settings.
    #[serde(default)]
    pub global_config: GlobalConfig,
}

impl HierarchicalTeam {
    /// Start a team definition; attach the supervisor and sub-teams with the
    /// `with_*` builders.
    pub fn new(team_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            team_name: team_name.into(),
            description: description.into(),
            top_supervisor_config: None,
            sub_teams: Vec::new(),
            dependencies: HashMap::new(),
            global_config: GlobalConfig::default(),
        }
    }

    /// Set the top-level supervisor (builder pattern).
    pub fn with_top_supervisor(mut self, config: SupervisorConfig) -> Self {
        self.top_supervisor_config = Some(config);
        self
    }

    /// Append a sub-team (builder pattern).
    pub fn with_sub_team(mut self, sub_team: SubTeam) -> Self {
        self.sub_teams.push(sub_team);
        self
    }

    /// Declare that `team_id` depends on `prerequisites` (builder pattern).
    pub fn with_dependency(
        mut self,
        team_id: impl Into<String>,
        prerequisites: Vec<String>,
    ) -> Self {
        self.dependencies.insert(team_id.into(), prerequisites);
        self
    }

    /// Replace the global config (builder pattern).
    pub fn with_global_config(mut self, config: GlobalConfig) -> Self {
        self.global_config = config;
        self
    }

    /// Ids of all sub-teams, in declaration order.
    pub fn sub_team_ids(&self) -> Vec<String> {
        self.sub_teams.iter().map(|t| t.id.clone()).collect()
    }

    /// Look up a sub-team by id.
    pub fn sub_team(&self, id: &str) -> Option<&SubTeam> {
        self.sub_teams.iter().find(|t| t.id == id)
    }

    /// Validate the whole definition: non-empty team name, at least one
    /// sub-team, valid supervisor, unique sub-team ids, per-team invariants,
    /// and dependency references that resolve without self-loops.
    ///
    /// Cycle detection is intentionally not done here; it belongs to the
    /// dependency resolver so the builder can report the offending cycle.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.team_name.trim().is_empty() {
            return Err(ConfigError::InvalidField("team_name must not be empty".into()));
        }
        if self.sub_teams.is_empty() {
            return Err(ConfigError::InvalidField(
                "team must have at least one sub-team".into(),
            ));
        }
        if let Some(supervisor) = &self.top_supervisor_config {
            supervisor.validate()?;
        } else {
            return Err(ConfigError::InvalidField(
                "top_supervisor_config is required".into(),
            ));
        }
        self.global_config.validate()?;

        let mut ids = HashSet::new();
        for sub_team in &self.sub_teams {
            sub_team.validate()?;
            if !ids.insert(sub_team.id.as_str()) {
                return Err(ConfigError::DuplicateId(format!(
                    "sub-team id '{}' duplicated",
                    sub_team.id
                )));
            }
        }

        for (team_id, deps) in &self.dependencies {
            if !ids.contains(team_id.as_str()) {
                return Err(ConfigError::InvalidDependency(format!(
                    "dependency key '{}' not found among sub-teams",
                    team_id
                )));
            }
            for dep in deps {
                if !ids.contains(dep.as_str()) {
                    return Err(ConfigError::InvalidDependency(format!(
                        "dependency '{}' for team '{}' not found among sub-teams",
                        dep, team_id
                    )));
                }
                if dep == team_id {
                    return Err(ConfigError::InvalidDependency(format!(
                        "team '{}' cannot depend on itself",
                        team_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Per-run options supplied when an execution is started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Whether lifecycle events are streamed to subscribers.
    #[serde(default = "default_true")]
    pub stream_events: bool,
    /// Whether per-team results are persisted as they complete (rather than
    /// only at the end).
    #[serde(default = "default_true")]
    pub save_intermediate_results: bool,
    /// Reserved concurrency knob; the scheduler runs sub-teams sequentially
    /// along the topological order, so values above 1 are accepted but not yet
    /// exploited. Must be > 0.
    #[serde(default = "default_max_parallel_teams")]
    pub max_parallel_teams: u32,
}

fn default_max_parallel_teams() -> u32 {
    1
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            stream_events: true,
            save_intermediate_results: true,
            max_parallel_teams: default_max_parallel_teams(),
        }
    }
}

impl ExecutionConfig {
    /// Check field-level invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_teams == 0 {
            return Err(ConfigError::InvalidField(
                "max_parallel_teams must be > 0".into(),
            ));
        }
        Ok(())
    }
}
