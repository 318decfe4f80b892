//! LLM collaborator seam.
//!
//! The core never performs inference. Two object-safe traits are the entire
//! boundary: [`AgentRunner`] runs one worker against its configured model and
//! returns a [`WorkerOutcome`], and [`SupervisorRouter`] asks a supervisor
//! model to pick the next worker and returns a [`RoutingDecision`]. Provider
//! crates (or test mocks) implement both; the engine only consumes them.
//!
//! Implementations must be cancellation-friendly: the engine drops the future
//! when an execution is stopped, so avoid detached side effects after await
//! points.

use crate::teamllm::config::{SupervisorConfig, WorkerConfig};
use async_trait::async_trait;
use std::error::Error;
use std::fmt;

/// Errors surfaced by runner and router implementations.
#[derive(Debug, Clone)]
pub enum RunnerError {
    /// The provider rejected the request or the transport failed.
    Provider(String),
    /// The request exceeded the configured timeout.
    Timeout(String),
    /// The response could not be interpreted.
    Unparseable(String),
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerError::Provider(msg) => write!(f, "Provider error: {}", msg),
            RunnerError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            RunnerError::Unparseable(msg) => write!(f, "Unparseable response: {}", msg),
        }
    }
}

impl Error for RunnerError {}

/// What one worker run produced.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    /// The worker's output text.
    pub output: String,
    /// Exact token usage when the provider reports it; the formatter falls
    /// back to estimation when absent.
    pub tokens_used: Option<u64>,
    /// Exact API round-trip count when the provider reports it.
    pub api_calls: Option<u64>,
    /// Names of tools the worker invoked.
    pub tools_used: Vec<String>,
}

impl WorkerOutcome {
    /// An outcome carrying only output text.
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            tokens_used: None,
            api_calls: None,
            tools_used: Vec::new(),
        }
    }

    /// Attach exact token usage (builder pattern).
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }

    /// Attach an exact API call count (builder pattern).
    pub fn with_api_calls(mut self, calls: u64) -> Self {
        self.api_calls = Some(calls);
        self
    }

    /// Record the tools the worker used (builder pattern).
    pub fn with_tools_used(mut self, tools: Vec<String>) -> Self {
        self.tools_used = tools;
        self
    }
}

/// One candidate a supervisor can route to.
#[derive(Debug, Clone)]
pub struct RoutingCandidate {
    /// Worker display name (the name the router is expected to return).
    pub name: String,
    /// What the worker is for, taken from its prompts.
    pub description: String,
    /// Tools the worker can use.
    pub tools: Vec<String>,
}

/// A supervisor's routing decision.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Name of the selected candidate. The engine tolerates inexact names and
    /// falls back to the closest lexical match.
    pub selected: String,
    /// The supervisor's reasoning, when it supplied any.
    pub reasoning: Option<String>,
    /// Set when the supervisor judges the sub-team's directive fulfilled; the
    /// engine stops iterating for that team.
    pub team_complete: bool,
}

impl RoutingDecision {
    /// Select `name` with no reasoning, work not yet complete.
    pub fn select(name: impl Into<String>) -> Self {
        Self {
            selected: name.into(),
            reasoning: None,
            team_complete: false,
        }
    }

    /// Attach reasoning (builder pattern).
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// Mark the team's directive as fulfilled after this worker runs.
    pub fn complete(mut self) -> Self {
        self.team_complete = true;
        self
    }
}

/// Runs one worker against its configured model.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Execute `worker` on `directive`. `prior_context`, when present, carries
    /// the accumulated outputs of teams that ran earlier in the schedule.
    async fn run_worker(
        &self,
        worker: &WorkerConfig,
        directive: &str,
        prior_context: Option<&str>,
    ) -> Result<WorkerOutcome, RunnerError>;
}

/// Asks a supervisor model to pick the next worker.
#[async_trait]
pub trait SupervisorRouter: Send + Sync {
    /// Select one of `candidates` for `task`. `iteration` is the 1-based
    /// routing cycle within the sub-team, letting implementations vary the
    /// prompt between the first pick and follow-ups.
    async fn route(
        &self,
        supervisor: &SupervisorConfig,
        task: &str,
        candidates: &[RoutingCandidate],
        iteration: u32,
    ) -> Result<RoutingDecision, RunnerError>;
}
