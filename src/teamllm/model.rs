//! Shared execution and result types.
//!
//! Everything that flows between the engine, the state store, the formatter,
//! and the HTTP surface lives here: execution status, per-team runtime state,
//! per-team results, errors, metrics, and the standardized output shape served
//! to clients. All types are serde round-trippable; optional fields are
//! omitted from JSON when absent.

use crate::teamllm::config::ExecutionConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle status of an execution (or of one sub-team within it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Created but not yet scheduled.
    Pending,
    /// The orchestration task is active.
    Running,
    /// Held at a checkpoint by a pause request.
    Paused,
    /// Terminal: every sub-team finished successfully.
    Completed,
    /// Terminal: aborted, cancelled, or at least one unrecoverable failure.
    Failed,
}

impl ExecutionStatus {
    /// Stable wire name (`"pending"`, `"running"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    /// Whether this status is terminal (completed or failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    /// Parse a wire name back into a status.
    pub fn parse(s: &str) -> Option<ExecutionStatus> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "paused" => Some(ExecutionStatus::Paused),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and settings of one execution, fixed at start time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Unique execution id (`exec_` + 12 hex).
    pub execution_id: String,
    /// Id of the team definition being run.
    pub team_id: String,
    /// Per-run options.
    pub config: ExecutionConfig,
    /// When the execution was started.
    pub started_at: DateTime<Utc>,
    /// Sub-team currently executing, when one is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_team: Option<String>,
}

impl ExecutionContext {
    /// Create a context stamped with the current time.
    pub fn new(
        execution_id: impl Into<String>,
        team_id: impl Into<String>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            team_id: team_id.into(),
            config,
            started_at: Utc::now(),
            current_team: None,
        }
    }
}

/// Runtime slot the engine keeps per sub-team while an execution is live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamState {
    /// Label of the next routing target ("supervisor" between workers, a
    /// worker name while one runs, "__end__" when done).
    pub next: String,
    /// Sub-team id this slot belongs to.
    pub team_id: String,
    /// Whether every prerequisite sub-team reached `completed`.
    pub dependencies_met: bool,
    /// Current status of the sub-team.
    pub execution_status: ExecutionStatus,
    /// Worker currently executing, when one is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_worker: Option<String>,
}

impl TeamState {
    /// Fresh pending slot for `team_id`.
    pub fn pending(team_id: impl Into<String>) -> Self {
        Self {
            next: "supervisor".to_string(),
            team_id: team_id.into(),
            dependencies_met: false,
            execution_status: ExecutionStatus::Pending,
            current_worker: None,
        }
    }
}

/// Result of one worker's run inside a team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    /// Display name of the worker.
    pub worker_name: String,
    /// Terminal status string (`"completed"` or `"failed"`).
    pub status: String,
    /// What the worker produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Names of tools the worker invoked.
    #[serde(default)]
    pub tools_used: Vec<String>,
    /// Free-form metadata (model, provider, timing) recorded by the runner.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Result of one sub-team's run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamResult {
    /// Terminal status string: `"completed"`, `"failed"`, or `"skipped"` when
    /// a prerequisite team failed and this one was never started.
    pub status: String,
    /// Wall-clock seconds the team ran for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Per-worker results keyed by worker id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<HashMap<String, WorkerResult>>,
    /// The team's overall output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl TeamResult {
    /// A `"skipped"` result for a team whose prerequisite chain broke.
    pub fn skipped() -> Self {
        Self {
            status: "skipped".to_string(),
            duration: None,
            workers: None,
            output: None,
        }
    }
}

/// One recorded error, recoverable or terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine-readable code (e.g. `"cancelled"`, `"timeout"`,
    /// `"budget_exhausted"`, `"worker_error"`, `"state_unavailable"`).
    pub error_code: String,
    /// Human-readable message.
    pub message: String,
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
    /// Optional context (team id, worker id, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<HashMap<String, String>>,
}

impl ErrorInfo {
    /// Create an error stamped with the current time and no context.
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
            timestamp: Utc::now(),
            context: None,
        }
    }

    /// Attach a context entry (builder pattern).
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Aggregate usage and performance counters for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Tokens consumed, exact when the runner reports usage, estimated
    /// otherwise.
    pub total_tokens_used: u64,
    /// LLM API round-trips, exact or estimated likewise.
    pub api_calls_made: u64,
    /// Completed sub-teams over total sub-teams, in `[0.0, 1.0]`.
    pub success_rate: f64,
    /// Mean seconds between matched `agent_started`/`agent_completed` pairs.
    pub average_response_time: f64,
}

impl Default for ExecutionMetrics {
    fn default() -> Self {
        Self {
            total_tokens_used: 0,
            api_calls_made: 0,
            success_rate: 0.0,
            average_response_time: 0.0,
        }
    }
}

/// High-level summary of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Overall status string derived from team results.
    pub status: String,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
    /// When it reached a terminal state, if it has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Total wall-clock seconds, when completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    /// Number of sub-teams that were executed (or skipped).
    pub teams_executed: u32,
    /// Number of distinct workers that produced a result.
    pub agents_involved: u32,
}

/// The standardized result shape served for a finished execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardizedOutput {
    /// Which execution this is.
    pub execution_id: String,
    /// Summary block.
    pub execution_summary: ExecutionSummary,
    /// Per-sub-team results keyed by sub-team id.
    pub team_results: HashMap<String, TeamResult>,
    /// Errors accumulated during the run, recoverable ones included.
    #[serde(default)]
    pub errors: Vec<ErrorInfo>,
    /// Usage and performance counters.
    #[serde(default)]
    pub metrics: ExecutionMetrics,
}
