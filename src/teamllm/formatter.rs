//! Result formatting: aggregation, metrics, and summaries.
//!
//! The [`OutputFormatter`] turns persisted execution state into the
//! [`StandardizedOutput`] served to clients. It is pure over its inputs (it
//! never mutates the store) and works from whatever the state contains:
//! partial results and accumulated errors from a failed run still produce a
//! readable output.
//!
//! Token and API-call counters are exact when the engine recorded usage from
//! the [`AgentRunner`](crate::runner::AgentRunner); otherwise they are
//! estimated with fixed heuristics (100 tokens per worker execution, 50 per
//! routing decision, one token per four output characters).

use crate::teamllm::event::ExecutionEvent;
use crate::teamllm::model::{
    ErrorInfo, ExecutionMetrics, ExecutionSummary, StandardizedOutput, TeamResult,
};
use crate::teamllm::state_store::{ExecutionState, StateStore, StateStoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// Errors raised while formatting results.
#[derive(Debug)]
pub enum FormatterError {
    /// No persisted state exists for the execution id.
    ExecutionNotFound(String),
    /// The state store failed the read.
    StateStore(StateStoreError),
}

impl fmt::Display for FormatterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatterError::ExecutionNotFound(id) => write!(f, "Execution {} not found", id),
            FormatterError::StateStore(err) => write!(f, "State store error: {}", err),
        }
    }
}

impl Error for FormatterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FormatterError::StateStore(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StateStoreError> for FormatterError {
    fn from(err: StateStoreError) -> Self {
        FormatterError::StateStore(err)
    }
}

/// Computes standardized outputs from execution state.
#[derive(Debug, Default)]
pub struct OutputFormatter;

impl OutputFormatter {
    /// Create a formatter.
    pub fn new() -> Self {
        OutputFormatter
    }

    /// Overall execution status derived from team results: `failed` when any
    /// team failed (or when there are errors but no results), `completed`
    /// when every team completed, `pending` for an empty result map, else
    /// `running`.
    pub fn determine_overall_status(
        &self,
        results: &HashMap<String, TeamResult>,
        errors: &[ErrorInfo],
    ) -> String {
        if results.is_empty() {
            return if errors.is_empty() { "pending" } else { "failed" }.to_string();
        }
        if results.values().any(|result| result.status == "failed") {
            return "failed".to_string();
        }
        let completed = results
            .values()
            .filter(|result| result.status == "completed")
            .count();
        if completed == results.len() {
            return "completed".to_string();
        }
        "running".to_string()
    }

    /// Compute usage and performance counters.
    ///
    /// `exact_tokens` / `exact_api_calls` are preferred when the engine
    /// collected them from the runner; either falls back to the heuristic
    /// estimate independently.
    pub fn calculate_metrics(
        &self,
        results: &HashMap<String, TeamResult>,
        events: &[ExecutionEvent],
        exact: Option<(u64, u64)>,
    ) -> ExecutionMetrics {
        let total_teams = results.len();
        let successful_teams = results
            .values()
            .filter(|result| result.status == "completed")
            .count();
        let success_rate = if total_teams > 0 {
            successful_teams as f64 / total_teams as f64
        } else {
            0.0
        };

        // Response times from matched agent_started/agent_completed pairs,
        // keyed by worker id.
        let mut start_times: HashMap<&str, DateTime<Utc>> = HashMap::new();
        let mut response_times: Vec<f64> = Vec::new();
        for event in events {
            let agent_id = match &event.agent_id {
                Some(id) => id.as_str(),
                None => continue,
            };
            match event.event_type.as_str() {
                "agent_started" => {
                    start_times.insert(agent_id, event.timestamp);
                }
                "agent_completed" => {
                    if let Some(started) = start_times.get(agent_id) {
                        let millis = (event.timestamp - *started).num_milliseconds();
                        response_times.push(millis.max(0) as f64 / 1000.0);
                    }
                }
                _ => {}
            }
        }
        let average_response_time = if response_times.is_empty() {
            0.0
        } else {
            response_times.iter().sum::<f64>() / response_times.len() as f64
        };

        let (total_tokens_used, api_calls_made) = match exact {
            Some((tokens, calls)) if calls > 0 => (tokens, calls),
            Some((tokens, _)) => (tokens, self.estimate_api_calls(events)),
            None => (
                self.estimate_token_usage(results, events),
                self.estimate_api_calls(events),
            ),
        };

        ExecutionMetrics {
            total_tokens_used,
            api_calls_made,
            success_rate,
            average_response_time,
        }
    }

    /// Heuristic token estimate: 100 per worker execution, 50 per
    /// supervisor routing event, plus output length divided by four.
    fn estimate_token_usage(
        &self,
        results: &HashMap<String, TeamResult>,
        events: &[ExecutionEvent],
    ) -> u64 {
        let total_workers: u64 = results
            .values()
            .map(|result| result.workers.as_ref().map(|w| w.len() as u64).unwrap_or(0))
            .sum();
        let base_tokens = total_workers * 100;

        let routing_tokens = events
            .iter()
            .filter(|event| event.event_type == "supervisor_routing")
            .count() as u64
            * 50;

        let output_tokens: u64 = results
            .values()
            .filter_map(|result| result.output.as_ref())
            .map(|output| output.len() as u64 / 4)
            .sum();

        base_tokens + routing_tokens + output_tokens
    }

    /// Heuristic API-call estimate: one per `agent_completed` plus one per
    /// `supervisor_routing` event.
    fn estimate_api_calls(&self, events: &[ExecutionEvent]) -> u64 {
        events
            .iter()
            .filter(|event| {
                matches!(
                    event.event_type.as_str(),
                    "agent_completed" | "supervisor_routing"
                )
            })
            .count() as u64
    }

    /// Derive the execution summary from results and the event timeline.
    ///
    /// `context_started_at` (from the execution context) wins over event
    /// timestamps for the start time; completion is the last
    /// `execution_completed` event, falling back to the latest terminal
    /// team/agent event.
    pub fn generate_summary(
        &self,
        results: &HashMap<String, TeamResult>,
        events: &[ExecutionEvent],
        context_started_at: Option<DateTime<Utc>>,
    ) -> ExecutionSummary {
        let status = self.determine_overall_status(results, &[]);

        let started_at = context_started_at
            .or_else(|| {
                events
                    .iter()
                    .find(|event| event.event_type == "execution_started")
                    .map(|event| event.timestamp)
            })
            .or_else(|| events.iter().map(|event| event.timestamp).min())
            .unwrap_or_else(Utc::now);

        let completed_at = events
            .iter()
            .rev()
            .find(|event| event.event_type == "execution_completed")
            .map(|event| event.timestamp)
            .or_else(|| {
                events
                    .iter()
                    .max_by_key(|event| event.timestamp)
                    .filter(|event| {
                        matches!(
                            event.event_type.as_str(),
                            "agent_completed" | "team_completed"
                        )
                    })
                    .map(|event| event.timestamp)
            });

        let total_duration = completed_at
            .map(|completed| (completed - started_at).num_seconds().max(0) as u64);

        let agents_involved: u32 = results
            .values()
            .map(|result| result.workers.as_ref().map(|w| w.len() as u32).unwrap_or(0))
            .sum();

        ExecutionSummary {
            status,
            started_at,
            completed_at,
            total_duration,
            teams_executed: results.len() as u32,
            agents_involved,
        }
    }

    /// Assemble a [`StandardizedOutput`] from an already-loaded state.
    ///
    /// The summary and metrics persisted by the engine win when present
    /// (they may carry exact usage counters); missing blocks are derived
    /// from the state's results and events.
    pub fn format_state(&self, state: &ExecutionState) -> StandardizedOutput {
        let summary = match &state.summary {
            Some(summary) => summary.clone(),
            None => self.generate_summary(
                &state.results,
                &state.events,
                Some(state.context.started_at),
            ),
        };
        let metrics = if state.metrics != ExecutionMetrics::default() {
            state.metrics.clone()
        } else {
            self.calculate_metrics(&state.results, &state.events, None)
        };
        StandardizedOutput {
            execution_id: state.execution_id.clone(),
            execution_summary: summary,
            team_results: state.results.clone(),
            errors: state.errors.clone(),
            metrics,
        }
    }

    /// Read an execution's state from the store and format it.
    pub async fn format_execution_results(
        &self,
        store: &StateStore,
        execution_id: &str,
    ) -> Result<StandardizedOutput, FormatterError> {
        let state = store
            .get_execution_state(execution_id)
            .await?
            .ok_or_else(|| FormatterError::ExecutionNotFound(execution_id.to_string()))?;
        Ok(self.format_state(&state))
    }
}

/// Convenience shorthand for [`OutputFormatter::format_execution_results`].
pub async fn format_execution_results(
    store: &StateStore,
    execution_id: &str,
) -> Result<StandardizedOutput, FormatterError> {
    OutputFormatter::new()
        .format_execution_results(store, execution_id)
        .await
}

