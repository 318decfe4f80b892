//! Execution event model.
//!
//! Every lifecycle transition inside an execution is captured as an
//! [`ExecutionEvent`]: a timestamped record with a free-form `event_type`, a
//! closed [`SourceType`], and optional attribution/payload fields that are set
//! only when meaningful for the event type. Events are immutable once
//! published; they flow through the [`EventBus`](crate::event_bus::EventBus)
//! to subscribers and are appended to the persisted
//! [`ExecutionState`](crate::state_store::ExecutionState).
//!
//! # Event flow of a typical execution
//!
//! ```text
//! execution_started                       (system)
//!   └─ team_started                       (system, team A)
//!       ├─ supervisor_routing             (supervisor, selected worker)
//!       ├─ agent_started                  (agent)
//!       ├─ agent_progress                 (agent, progress: 50)
//!       └─ agent_completed                (agent, result)
//!   └─ team_completed                     (system, team A)
//!   └─ ... remaining teams in topological order ...
//! execution_completed                     (system, final status)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// The engine itself (execution/team lifecycle).
    System,
    /// A sub-team supervisor (routing decisions).
    Supervisor,
    /// A worker (task progress and results).
    Agent,
}

impl SourceType {
    /// Stable wire name (`"system"`, `"supervisor"`, `"agent"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::System => "system",
            SourceType::Supervisor => "supervisor",
            SourceType::Agent => "agent",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable lifecycle event.
///
/// Only the fields relevant to an `event_type` are populated; everything else
/// stays `None` and is excluded from serialized output, so SSE frames carry no
/// nulls. Use the [`system`](ExecutionEvent::system),
/// [`supervisor`](ExecutionEvent::supervisor), and
/// [`agent`](ExecutionEvent::agent) constructors plus the `with_*` builders
/// rather than filling the struct by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Event type, e.g. `"execution_started"`, `"supervisor_routing"`,
    /// `"agent_progress"`.
    pub event_type: String,
    /// Which kind of actor emitted the event.
    pub source_type: SourceType,
    /// Execution the event belongs to.
    pub execution_id: String,
    /// Sub-team the event belongs to, when team-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    /// Supervisor id, for supervisor-sourced events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_id: Option<String>,
    /// Supervisor display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_name: Option<String>,
    /// Worker id, for agent-sourced events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Worker display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Human-readable description of what happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Short action label (`"started"`, `"routing"`, `"progress"`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Status string at the time of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Progress percentage in `[0, 100]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Result payload (output text, results URL, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Sub-team picked by a routing decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_team: Option<String>,
    /// Worker picked by a routing decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_agent: Option<String>,
}

impl ExecutionEvent {
    fn base(
        event_type: impl Into<String>,
        source_type: SourceType,
        execution_id: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            source_type,
            execution_id: execution_id.into(),
            team_id: None,
            supervisor_id: None,
            supervisor_name: None,
            agent_id: None,
            agent_name: None,
            content: None,
            action: None,
            status: None,
            progress: None,
            result: None,
            selected_team: None,
            selected_agent: None,
        }
    }

    /// A system-sourced event (execution/team lifecycle).
    pub fn system(event_type: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self::base(event_type, SourceType::System, execution_id)
    }

    /// A supervisor-sourced event, attributed to `supervisor_id`/`supervisor_name`.
    pub fn supervisor(
        event_type: impl Into<String>,
        execution_id: impl Into<String>,
        supervisor_id: impl Into<String>,
        supervisor_name: impl Into<String>,
    ) -> Self {
        let mut event = Self::base(event_type, SourceType::Supervisor, execution_id);
        event.supervisor_id = Some(supervisor_id.into());
        event.supervisor_name = Some(supervisor_name.into());
        event
    }

    /// An agent-sourced event, attributed to `agent_id`/`agent_name`.
    pub fn agent(
        event_type: impl Into<String>,
        execution_id: impl Into<String>,
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        let mut event = Self::base(event_type, SourceType::Agent, execution_id);
        event.agent_id = Some(agent_id.into());
        event.agent_name = Some(agent_name.into());
        event
    }

    /// Scope the event to a sub-team (builder pattern).
    pub fn with_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// Attach a description (builder pattern).
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Attach an action label (builder pattern).
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Attach a status string (builder pattern).
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Attach a progress percentage; values above 100 are clamped.
    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    /// Attach a result payload (builder pattern).
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    /// Record the sub-team a routing decision selected (builder pattern).
    pub fn with_selected_team(mut self, selected_team: impl Into<String>) -> Self {
        self.selected_team = Some(selected_team.into());
        self
    }

    /// Record the worker a routing decision selected (builder pattern).
    pub fn with_selected_agent(mut self, selected_agent: impl Into<String>) -> Self {
        self.selected_agent = Some(selected_agent.into());
        self
    }

    // ── Typed constructors for the well-known event types ────────────────
    // Shared by the engine and the event bus convenience emitters so the two
    // never drift apart in which fields they populate.

    /// `execution_started` (system).
    pub fn execution_started(execution_id: &str, team_id: &str) -> Self {
        Self::system("execution_started", execution_id)
            .with_team(team_id)
            .with_action("started")
            .with_status("started")
            .with_content(format!("Execution started for team {}", team_id))
    }

    /// `team_started` (system).
    pub fn team_started(execution_id: &str, team_id: &str, team_name: &str) -> Self {
        Self::system("team_started", execution_id)
            .with_team(team_id)
            .with_action("started")
            .with_status("running")
            .with_content(format!("Team {} started", team_name))
    }

    /// `team_completed` (system); `status` is the team's terminal status.
    pub fn team_completed(
        execution_id: &str,
        team_id: &str,
        team_name: &str,
        status: &str,
    ) -> Self {
        Self::system("team_completed", execution_id)
            .with_team(team_id)
            .with_action("completed")
            .with_status(status)
            .with_content(format!("Team {} finished with status {}", team_name, status))
    }

    /// `supervisor_routing` (supervisor) with the selected worker.
    pub fn supervisor_routing(
        execution_id: &str,
        supervisor_id: &str,
        supervisor_name: &str,
        team_id: &str,
        content: &str,
        selected_agent: Option<&str>,
    ) -> Self {
        let mut event =
            Self::supervisor("supervisor_routing", execution_id, supervisor_id, supervisor_name)
                .with_team(team_id)
                .with_action("routing")
                .with_content(content);
        if let Some(selected) = selected_agent {
            event = event.with_selected_agent(selected);
        }
        event
    }

    /// `agent_started` (agent).
    pub fn agent_started(
        execution_id: &str,
        team_id: &str,
        agent_id: &str,
        agent_name: &str,
        content: &str,
    ) -> Self {
        Self::agent("agent_started", execution_id, agent_id, agent_name)
            .with_team(team_id)
            .with_action("started")
            .with_status("running")
            .with_content(content)
    }

    /// `agent_progress` (agent) with a percentage.
    pub fn agent_progress(
        execution_id: &str,
        team_id: &str,
        agent_id: &str,
        agent_name: &str,
        content: &str,
        progress: u8,
    ) -> Self {
        Self::agent("agent_progress", execution_id, agent_id, agent_name)
            .with_team(team_id)
            .with_action("progress")
            .with_status("running")
            .with_progress(progress)
            .with_content(content)
    }

    /// `agent_completed` (agent) carrying the result text.
    pub fn agent_completed(
        execution_id: &str,
        team_id: &str,
        agent_id: &str,
        agent_name: &str,
        result: &str,
    ) -> Self {
        Self::agent("agent_completed", execution_id, agent_id, agent_name)
            .with_team(team_id)
            .with_action("completed")
            .with_status("completed")
            .with_result(result)
            .with_content(format!("{} completed its task", agent_name))
    }

    /// `agent_error` (agent) carrying the failure description.
    pub fn agent_error(
        execution_id: &str,
        team_id: &str,
        agent_id: &str,
        agent_name: &str,
        error: &str,
    ) -> Self {
        Self::agent("agent_error", execution_id, agent_id, agent_name)
            .with_team(team_id)
            .with_action("error")
            .with_status("failed")
            .with_content(format!("Error in {}: {}", agent_name, error))
    }

    /// `execution_completed` (system) with the final status string and a
    /// pointer to the results resource.
    pub fn execution_completed(execution_id: &str, status: &str, results_ref: &str) -> Self {
        Self::system("execution_completed", execution_id)
            .with_action("completed")
            .with_status(status)
            .with_result(results_ref)
            .with_content(format!("Execution finished with status {}", status))
    }

    /// A free-form `warning` (system); used for routing fallbacks and other
    /// recoverable anomalies.
    pub fn warning(execution_id: &str, team_id: Option<&str>, content: &str) -> Self {
        let mut event = Self::system("warning", execution_id)
            .with_action("warning")
            .with_content(content);
        if let Some(team_id) = team_id {
            event = event.with_team(team_id);
        }
        event
    }

    /// Serialize for an SSE `data:` line: JSON object with null fields
    /// excluded and the timestamp rendered ISO-8601 with a trailing `Z`.
    pub fn to_sse_json(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                serde_json::Value::String(self.timestamp.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()),
            );
        }
        value.to_string()
    }
}
