//! Execution engine: session lifecycle and the orchestration loop.
//!
//! The engine owns a registry of live [`ExecutionSession`]s keyed by
//! execution id. [`ExecutionEngine::start_execution`] allocates a fresh id,
//! persists the initial state, spawns the orchestration task, and returns the
//! session handle immediately; the task then walks the built team's
//! topological order, asking each sub-team's supervisor (via the
//! [`SupervisorRouter`] collaborator) to pick workers and running them through
//! the [`AgentRunner`] collaborator, publishing lifecycle events and
//! persisting every transition along the way.
//!
//! # Orchestration loop, per session
//!
//! ```text
//! pending ─▶ running
//!   for each sub-team in execution order:
//!     prerequisites broken? ──▶ record "skipped" result, move on
//!     team_started
//!     loop (≤ supervisor max_iterations, bounded by the time budget):
//!       supervisor_routing  (router picks a worker; lexical fallback on miss)
//!       agent_started ─ agent_progress ─ agent_completed | agent_error
//!     until the supervisor signals completion
//!     team_completed (completed | failed)
//!   compute summary + metrics, persist, execution_completed
//! ```
//!
//! Cancellation is cooperative: [`ExecutionEngine::stop_execution`] sets the
//! session's cancel signal, and every suspension point in the loop checks it.
//! A graceful stop lets the in-flight worker finish its current call; a
//! forced stop aborts the task and records the failure immediately. Worker
//! errors are recoverable (recorded, loop continues); budget exhaustion and
//! persistent state-store failures abort the session as `failed`.

use crate::teamllm::config::ExecutionConfig;
use crate::teamllm::event::ExecutionEvent;
use crate::teamllm::event_bus::EventBus;
use crate::teamllm::formatter::OutputFormatter;
use crate::teamllm::model::{
    ErrorInfo, ExecutionContext, ExecutionStatus, TeamResult, TeamState, WorkerResult,
};
use crate::teamllm::runner::{
    AgentRunner, RoutingCandidate, RoutingDecision, SupervisorRouter,
};
use crate::teamllm::state_store::{StateStore, StateStoreError};
use crate::teamllm::team_builder::{BuiltTeam, TeamRuntime, WorkerRuntime};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Errors raised by engine-level operations.
#[derive(Debug)]
pub enum EngineError {
    /// The state store refused the initial create (or another setup write).
    StateStore(StateStoreError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::StateStore(err) => write!(f, "Engine state error: {}", err),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EngineError::StateStore(err) => Some(err),
        }
    }
}

impl From<StateStoreError> for EngineError {
    fn from(err: StateStoreError) -> Self {
        EngineError::StateStore(err)
    }
}

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long completed/failed sessions stay in the in-memory registry
    /// before [`cleanup_completed_sessions`](ExecutionEngine::cleanup_completed_sessions)
    /// purges them.
    pub session_retention: Duration,
    /// Bounded wait per session during [`shutdown`](ExecutionEngine::shutdown).
    pub shutdown_timeout: Duration,
    /// Duration estimate surfaced at start time (the HTTP layer reports it).
    pub estimated_duration_secs: u64,
    /// Consecutive state-store failures tolerated before the session aborts
    /// as `failed` with a `state_unavailable` error.
    pub state_failure_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_retention: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(10),
            estimated_duration_secs: 1800,
            state_failure_limit: 3,
        }
    }
}

/// In-process handle for one live execution.
///
/// Shared between the engine registry, the orchestration task, and API
/// callers; all mutation goes through interior locks.
pub struct ExecutionSession {
    /// Unique execution id (`exec_` + 12 hex).
    pub execution_id: String,
    /// Team definition id this execution runs.
    pub team_id: String,
    team: Arc<BuiltTeam>,
    context: ExecutionContext,
    config: ExecutionConfig,
    status: RwLock<ExecutionStatus>,
    cancel: watch::Sender<bool>,
    paused: watch::Sender<bool>,
    started_at: DateTime<Utc>,
    completed_at: RwLock<Option<DateTime<Utc>>>,
}

impl ExecutionSession {
    fn new(
        execution_id: String,
        team_id: String,
        team: Arc<BuiltTeam>,
        context: ExecutionContext,
        config: ExecutionConfig,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        let (paused, _) = watch::channel(false);
        Self {
            execution_id,
            team_id,
            team,
            context,
            config,
            status: RwLock::new(ExecutionStatus::Pending),
            cancel,
            paused,
            started_at: Utc::now(),
            completed_at: RwLock::new(None),
        }
    }

    /// The built team this session runs.
    pub fn team(&self) -> &Arc<BuiltTeam> {
        &self.team
    }

    /// The execution context fixed at start.
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// The per-run options.
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Current lifecycle status.
    pub async fn status(&self) -> ExecutionStatus {
        *self.status.read().await
    }

    async fn set_status(&self, status: ExecutionStatus) {
        *self.status.write().await = status;
    }

    /// When the session was started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When the session reached a terminal state, if it has.
    pub async fn completed_at(&self) -> Option<DateTime<Utc>> {
        *self.completed_at.read().await
    }

    async fn set_completed_now(&self) {
        *self.completed_at.write().await = Some(Utc::now());
    }

    /// Wall-clock seconds from start to completion, once terminal.
    pub async fn duration(&self) -> Option<u64> {
        self.completed_at()
            .await
            .map(|done| (done - self.started_at).num_seconds().max(0) as u64)
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        // send_replace updates the value even when no receiver is alive.
        self.cancel.send_replace(true);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// Hold the session at its next checkpoint. In-memory only; the
    /// orchestration loop parks between teams and between worker cycles.
    pub async fn pause(&self) {
        if self.status().await == ExecutionStatus::Running {
            self.set_status(ExecutionStatus::Paused).await;
        }
        self.paused.send_replace(true);
    }

    /// Release a paused session.
    pub async fn resume(&self) {
        if self.status().await == ExecutionStatus::Paused {
            self.set_status(ExecutionStatus::Running).await;
        }
        self.paused.send_replace(false);
    }

    /// Whether the session is currently paused.
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    async fn wait_if_paused(&self) {
        let mut rx = self.paused.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl fmt::Debug for ExecutionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // try_read: Debug cannot await; a contended lock prints as None.
        let status = self.status.try_read().map(|status| *status).ok();
        f.debug_struct("ExecutionSession")
            .field("execution_id", &self.execution_id)
            .field("team_id", &self.team_id)
            .field("status", &status)
            .finish()
    }
}

/// Aggregate engine statistics (see [`ExecutionEngine::get_stats`]).
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Sessions currently held in the registry, terminal ones included.
    pub total_sessions: usize,
    /// Session counts keyed by status wire name.
    pub execution_counts: HashMap<String, usize>,
}

/// The scheduler of sessions.
///
/// Cheap to clone; clones share the registry and all components.
#[derive(Clone)]
pub struct ExecutionEngine {
    store: StateStore,
    bus: EventBus,
    runner: Arc<dyn AgentRunner>,
    router: Arc<dyn SupervisorRouter>,
    config: EngineConfig,
    sessions: Arc<Mutex<HashMap<String, Arc<ExecutionSession>>>>,
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl ExecutionEngine {
    /// Create an engine over the shared store, bus, and LLM collaborators.
    pub fn new(
        store: StateStore,
        bus: EventBus,
        runner: Arc<dyn AgentRunner>,
        router: Arc<dyn SupervisorRouter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            bus,
            runner,
            router,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The state store the engine persists into.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The event bus the engine publishes to.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Generate a fresh execution id: `exec_` + the first 12 hex of a v4
    /// uuid. Always alphanumeric and 17 characters total, matching the
    /// HTTP-surface validator.
    pub fn generate_execution_id() -> String {
        let hex = Uuid::new_v4().simple().to_string();
        format!("exec_{}", &hex[..12])
    }

    /// Start a new execution of `team`.
    ///
    /// Allocates a fresh execution id, creates the persisted state, spawns
    /// the orchestration task, and returns the session handle immediately.
    /// `team_id` is the identifier the execution is recorded under (the
    /// HTTP layer passes its `ht_` team id; embedders may pass the team
    /// name).
    pub async fn start_execution(
        &self,
        team: Arc<BuiltTeam>,
        team_id: &str,
        config: ExecutionConfig,
    ) -> Result<Arc<ExecutionSession>, EngineError> {
        let execution_id = Self::generate_execution_id();
        let context = ExecutionContext::new(&execution_id, team_id, config.clone());

        self.store
            .create_execution(&execution_id, team_id, context.clone())
            .await?;

        let session = Arc::new(ExecutionSession::new(
            execution_id.clone(),
            team_id.to_string(),
            Arc::clone(&team),
            context,
            config,
        ));

        self.sessions
            .lock()
            .await
            .insert(execution_id.clone(), Arc::clone(&session));

        let runner = SessionRunner {
            store: self.store.clone(),
            bus: self.bus.clone(),
            agent_runner: Arc::clone(&self.runner),
            router: Arc::clone(&self.router),
            session: Arc::clone(&session),
            streaming: session.config().stream_events
                && team.team.global_config.enable_streaming,
            state_failures: 0,
            state_failure_limit: self.config.state_failure_limit,
            exact_tokens: 0,
            exact_api_calls: 0,
            saw_exact_counters: false,
        };
        let handle = tokio::spawn(runner.run());
        self.tasks.lock().await.insert(execution_id.clone(), handle);

        log::info!("Started execution {} for team {}", execution_id, team_id);
        Ok(session)
    }

    /// Look up a session known to this process.
    pub async fn get_execution_session(
        &self,
        execution_id: &str,
    ) -> Option<Arc<ExecutionSession>> {
        self.sessions.lock().await.get(execution_id).cloned()
    }

    /// Ids of sessions that have not reached a terminal state.
    pub async fn list_active_executions(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        let mut ids = Vec::new();
        for (id, session) in sessions.iter() {
            if !session.status().await.is_terminal() {
                ids.push(id.clone());
            }
        }
        ids.sort();
        ids
    }

    /// Request that an execution stop.
    ///
    /// Graceful: sets the cancel signal; the in-flight worker call may finish
    /// and the loop then short-circuits to the failed terminal path. Forced:
    /// additionally aborts the orchestration task and records the failure
    /// right away. Returns `false` when the id is unknown to this process or
    /// the session is already terminal.
    pub async fn stop_execution(&self, execution_id: &str, graceful: bool) -> bool {
        let session = match self.get_execution_session(execution_id).await {
            Some(session) => session,
            None => return false,
        };
        if session.status().await.is_terminal() {
            return false;
        }

        log::info!(
            "Stopping execution {} ({})",
            execution_id,
            if graceful { "graceful" } else { "forced" }
        );

        if !graceful {
            // Abort while the task is still parked at a suspension point,
            // before the cancel signal can wake it into a store mutation.
            let handle = self.tasks.lock().await.remove(execution_id);
            if let Some(handle) = handle {
                handle.abort();
            }
        }
        session.cancel();
        session.resume().await; // a paused session must wake up to observe the cancel

        if !graceful {
            session.set_status(ExecutionStatus::Failed).await;
            session.set_completed_now().await;

            let error = ErrorInfo::new("cancelled", "Execution stopped (forced)");
            if let Err(err) = self.store.add_error(execution_id, error).await {
                log::warn!("Failed to record forced-stop error: {}", err);
            }
            if let Err(err) = self
                .store
                .update_execution_status(execution_id, ExecutionStatus::Failed)
                .await
            {
                log::warn!("Failed to persist forced-stop status: {}", err);
            }
            let event = self
                .bus
                .emit_execution_completed(
                    execution_id,
                    ExecutionStatus::Failed,
                    &format!("/api/v1/executions/{}/results", execution_id),
                )
                .await;
            if let Err(err) = self.store.add_event(execution_id, event).await {
                log::warn!("Failed to persist forced-stop event: {}", err);
            }
        }
        true
    }

    /// Purge terminal sessions older than the retention window from the
    /// in-memory registry. State-store cleanup is independent (TTL). Returns
    /// how many sessions were purged.
    pub async fn cleanup_completed_sessions(&self) -> usize {
        let retention =
            chrono::Duration::from_std(self.config.session_retention).unwrap_or_else(|_| {
                chrono::Duration::seconds(300)
            });
        let cutoff = Utc::now() - retention;

        let purged: Vec<String> = {
            let mut sessions = self.sessions.lock().await;
            let mut stale = Vec::new();
            for (id, session) in sessions.iter() {
                let terminal = session.status().await.is_terminal();
                let expired = session
                    .completed_at()
                    .await
                    .map(|done| done < cutoff)
                    .unwrap_or(true);
                if terminal && expired {
                    stale.push(id.clone());
                }
            }
            for id in &stale {
                sessions.remove(id);
            }
            stale
        };
        let mut tasks = self.tasks.lock().await;
        for id in &purged {
            tasks.remove(id);
        }
        purged.len()
    }

    /// Cancel every active session and wait (bounded per session) for its
    /// task to finish; tasks that overrun the bound are aborted.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<ExecutionSession>> =
            self.sessions.lock().await.values().cloned().collect();
        for session in &sessions {
            session.cancel();
            session.resume().await;
        }

        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().collect()
        };
        for (execution_id, mut handle) in handles {
            if tokio::time::timeout(self.config.shutdown_timeout, &mut handle)
                .await
                .is_err()
            {
                log::warn!(
                    "Session {} did not stop within the shutdown bound; aborting",
                    execution_id
                );
                handle.abort();
            }
        }
        log::info!("Engine shutdown complete ({} sessions)", sessions.len());
    }

    /// Session counts for monitoring.
    pub async fn get_stats(&self) -> EngineStats {
        let sessions = self.sessions.lock().await;
        let mut execution_counts: HashMap<String, usize> = HashMap::new();
        for status in &[
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Paused,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
        ] {
            execution_counts.insert(status.as_str().to_string(), 0);
        }
        for session in sessions.values() {
            let status = session.status().await;
            *execution_counts
                .entry(status.as_str().to_string())
                .or_insert(0) += 1;
        }
        EngineStats {
            total_sessions: sessions.len(),
            execution_counts,
        }
    }
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // try_lock: Debug cannot await; a contended registry prints as 0.
        let sessions = self.sessions.try_lock().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("ExecutionEngine")
            .field("sessions", &sessions)
            .finish()
    }
}

/// Raised inside the orchestration task when the state store has failed
/// persistently; the session aborts as failed.
struct StateAbort;

/// What one worker invocation produced, after timeout/cancel arbitration.
enum WorkerCallOutcome {
    Done(crate::teamllm::runner::WorkerOutcome),
    Failed(String),
    TimedOut(u64),
    Cancelled,
}

/// The per-session orchestration task. Owns clones of the shared components
/// plus per-run accumulation (exact usage counters, state-failure streak).
struct SessionRunner {
    store: StateStore,
    bus: EventBus,
    agent_runner: Arc<dyn AgentRunner>,
    router: Arc<dyn SupervisorRouter>,
    session: Arc<ExecutionSession>,
    streaming: bool,
    state_failures: u32,
    state_failure_limit: u32,
    exact_tokens: u64,
    exact_api_calls: u64,
    saw_exact_counters: bool,
}

impl SessionRunner {
    async fn run(mut self) {
        let execution_id = self.session.execution_id.clone();
        match self.run_inner().await {
            Ok(()) => {}
            Err(StateAbort) => {
                log::error!(
                    "Execution {} aborted: state store unavailable",
                    execution_id
                );
                self.session.set_status(ExecutionStatus::Failed).await;
                self.session.set_completed_now().await;
                // Best-effort: the store may have recovered since the abort.
                let _ = self
                    .store
                    .add_error(
                        &execution_id,
                        ErrorInfo::new("state_unavailable", "State store unavailable; execution aborted"),
                    )
                    .await;
                let _ = self
                    .store
                    .update_execution_status(&execution_id, ExecutionStatus::Failed)
                    .await;
                if self.streaming {
                    self.bus
                        .emit_execution_completed(
                            &execution_id,
                            ExecutionStatus::Failed,
                            &format!("/api/v1/executions/{}/results", execution_id),
                        )
                        .await;
                }
            }
        }
    }

    /// Track a state-store write result against the consecutive-failure
    /// budget. Transient failures are retried implicitly at the next
    /// checkpoint; a streak past the limit aborts the session.
    fn note_state(&mut self, result: Result<(), StateStoreError>) -> Result<(), StateAbort> {
        match result {
            Ok(()) => {
                self.state_failures = 0;
                Ok(())
            }
            Err(err) => {
                self.state_failures += 1;
                log::warn!(
                    "State store write failed ({}/{}): {}",
                    self.state_failures,
                    self.state_failure_limit,
                    err
                );
                if self.state_failures > self.state_failure_limit {
                    Err(StateAbort)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Publish (when streaming) and persist one event.
    async fn emit(&mut self, event: ExecutionEvent) -> Result<(), StateAbort> {
        if self.streaming {
            self.bus.publish(event.clone()).await;
        }
        let result = self
            .store
            .add_event(&self.session.execution_id, event)
            .await;
        self.note_state(result)
    }

    async fn run_inner(&mut self) -> Result<(), StateAbort> {
        let execution_id = self.session.execution_id.clone();
        let team = Arc::clone(self.session.team());

        self.session.set_status(ExecutionStatus::Running).await;
        let status_write = self
            .store
            .update_execution_status(&execution_id, ExecutionStatus::Running)
            .await;
        self.note_state(status_write)?;
        self.emit(ExecutionEvent::execution_started(
            &execution_id,
            &self.session.team_id,
        ))
        .await?;

        let deadline = Instant::now()
            + Duration::from_secs(team.team.global_config.max_execution_time);

        let mut broken: HashSet<String> = HashSet::new();
        let mut pending_results: Vec<(String, TeamResult)> = Vec::new();
        let mut prior_outputs: Vec<String> = Vec::new();
        let mut cancelled = false;

        for team_id in team.execution_order.clone() {
            if self.session.is_cancelled() {
                cancelled = true;
                break;
            }
            self.session.wait_if_paused().await;
            if self.session.is_cancelled() {
                cancelled = true;
                break;
            }

            let runtime = match team.teams.get(&team_id) {
                Some(runtime) => runtime.clone(),
                None => continue,
            };

            // A failed (or skipped) prerequisite breaks the chain: this team
            // is never started and is recorded as skipped.
            if let Some(prereq) = team
                .prerequisites(&team_id)
                .iter()
                .find(|p| broken.contains(p.as_str()))
            {
                log::warn!(
                    "Skipping team {}: prerequisite {} did not complete",
                    team_id,
                    prereq
                );
                let state_write = self
                    .store
                    .update_team_state(
                        &execution_id,
                        &team_id,
                        TeamState {
                            next: "__end__".to_string(),
                            team_id: team_id.clone(),
                            dependencies_met: false,
                            execution_status: ExecutionStatus::Pending,
                            current_worker: None,
                        },
                    )
                    .await;
                self.note_state(state_write)?;
                self.record_team_result(
                    &team_id,
                    TeamResult::skipped(),
                    &mut pending_results,
                )
                .await?;
                broken.insert(team_id);
                continue;
            }

            let result = self.run_team(&runtime, deadline, &prior_outputs).await?;
            if result.status != "completed" {
                broken.insert(team_id.clone());
            }
            if let Some(output) = &result.output {
                prior_outputs.push(format!("[{}] {}", runtime.sub_team.name, output));
            }
            self.record_team_result(&team_id, result, &mut pending_results)
                .await?;

            if self.session.is_cancelled() {
                cancelled = true;
                break;
            }
        }

        // Results held back by save_intermediate_results=false land now.
        for (team_id, result) in pending_results.drain(..) {
            let write = self
                .store
                .update_team_result(&execution_id, &team_id, result)
                .await;
            self.note_state(write)?;
        }

        if cancelled {
            let error = ErrorInfo::new("cancelled", "Execution cancelled by stop request");
            let write = self.store.add_error(&execution_id, error).await;
            self.note_state(write)?;
        }

        self.finalize(cancelled).await
    }

    /// Persist a team result now, or hold it until the end of the run when
    /// intermediate saves are disabled.
    async fn record_team_result(
        &mut self,
        team_id: &str,
        result: TeamResult,
        pending: &mut Vec<(String, TeamResult)>,
    ) -> Result<(), StateAbort> {
        if self.session.config().save_intermediate_results {
            let write = self
                .store
                .update_team_result(&self.session.execution_id, team_id, result)
                .await;
            self.note_state(write)
        } else {
            pending.push((team_id.to_string(), result));
            Ok(())
        }
    }

    /// Execute one sub-team: supervisor routing cycles and worker runs until
    /// the supervisor signals completion or a budget runs out.
    async fn run_team(
        &mut self,
        runtime: &TeamRuntime,
        deadline: Instant,
        prior_outputs: &[String],
    ) -> Result<TeamResult, StateAbort> {
        let execution_id = self.session.execution_id.clone();
        let team_id = runtime.sub_team.id.clone();
        let team_start = Instant::now();

        let state_write = self
            .store
            .update_team_state(
                &execution_id,
                &team_id,
                TeamState {
                    next: "supervisor".to_string(),
                    team_id: team_id.clone(),
                    dependencies_met: true,
                    execution_status: ExecutionStatus::Running,
                    current_worker: None,
                },
            )
            .await;
        self.note_state(state_write)?;
        self.emit(ExecutionEvent::team_started(
            &execution_id,
            &team_id,
            &runtime.sub_team.name,
        ))
        .await?;

        let directive = runtime.sub_team.description.clone();
        let prior_context = if prior_outputs.is_empty() {
            None
        } else {
            Some(prior_outputs.join("\n\n"))
        };
        let candidates: Vec<RoutingCandidate> = runtime
            .workers_in_order()
            .iter()
            .map(|worker| RoutingCandidate {
                name: worker.config.worker_name.clone(),
                description: worker.config.system_prompt.clone(),
                tools: worker.resolved_tools.clone(),
            })
            .collect();

        let mut worker_results: HashMap<String, WorkerResult> = HashMap::new();
        let mut outputs: Vec<String> = Vec::new();
        let mut failure: Option<ErrorInfo> = None;
        let mut completed = false;

        for iteration in 1..=runtime.supervisor.config.max_iterations {
            if self.session.is_cancelled() {
                failure = Some(ErrorInfo::new("cancelled", "Team cancelled mid-run"));
                break;
            }
            self.session.wait_if_paused().await;
            if Instant::now() >= deadline {
                failure = Some(
                    ErrorInfo::new("budget_exhausted", "Execution time budget exceeded")
                        .with_context("team_id", &team_id),
                );
                break;
            }

            // Supervisor routing phase.
            let decision = match self
                .router
                .route(&runtime.supervisor.config, &directive, &candidates, iteration)
                .await
            {
                Ok(decision) => decision,
                Err(err) => {
                    let fallback = candidates
                        .first()
                        .map(|c| c.name.clone())
                        .unwrap_or_default();
                    log::warn!(
                        "Supervisor routing failed for team {} (iteration {}): {}; defaulting to '{}'",
                        team_id,
                        iteration,
                        err,
                        fallback
                    );
                    self.emit(ExecutionEvent::warning(
                        &execution_id,
                        Some(&team_id),
                        &format!("Supervisor routing failed: {}; defaulting to '{}'", err, fallback),
                    ))
                    .await?;
                    let error = ErrorInfo::new("routing_error", err.to_string())
                        .with_context("team_id", &team_id);
                    let write = self.store.add_error(&execution_id, error).await;
                    self.note_state(write)?;
                    RoutingDecision::select(fallback)
                }
            };

            let (worker, fallback_note) = resolve_worker(runtime, &decision.selected);
            let worker = match worker {
                Some(worker) => worker.clone(),
                None => {
                    // Roster is never empty after validation; defensive exit.
                    failure = Some(ErrorInfo::new("internal", "Empty worker roster"));
                    break;
                }
            };
            if let Some(note) = fallback_note {
                self.emit(ExecutionEvent::warning(&execution_id, Some(&team_id), &note))
                    .await?;
            }

            let routing_content = decision
                .reasoning
                .clone()
                .unwrap_or_else(|| format!("Selected {}", worker.config.worker_name));
            self.emit(ExecutionEvent::supervisor_routing(
                &execution_id,
                &runtime.supervisor.id,
                &runtime.supervisor.name,
                &team_id,
                &routing_content,
                Some(&worker.config.worker_name),
            ))
            .await?;

            // Worker execution phase.
            let outcome = self
                .run_worker(&worker, runtime, &directive, prior_context.as_deref(), deadline)
                .await?;

            match outcome {
                WorkerCallOutcome::Done(outcome) => {
                    self.emit(ExecutionEvent::agent_completed(
                        &execution_id,
                        &team_id,
                        &worker.config.worker_id,
                        &worker.config.worker_name,
                        &outcome.output,
                    ))
                    .await?;
                    if let Some(tokens) = outcome.tokens_used {
                        self.exact_tokens += tokens;
                        self.saw_exact_counters = true;
                    }
                    if let Some(calls) = outcome.api_calls {
                        self.exact_api_calls += calls;
                    }
                    let mut metadata = HashMap::new();
                    metadata.insert("model".to_string(), worker.config.llm_config.model.clone());
                    metadata.insert(
                        "provider".to_string(),
                        worker.config.llm_config.provider.as_str().to_string(),
                    );
                    worker_results.insert(
                        worker.config.worker_id.clone(),
                        WorkerResult {
                            worker_name: worker.config.worker_name.clone(),
                            status: "completed".to_string(),
                            output: Some(outcome.output.clone()),
                            tools_used: outcome.tools_used,
                            metadata,
                        },
                    );
                    outputs.push(outcome.output);
                }
                WorkerCallOutcome::Failed(message) => {
                    self.emit(ExecutionEvent::agent_error(
                        &execution_id,
                        &team_id,
                        &worker.config.worker_id,
                        &worker.config.worker_name,
                        &message,
                    ))
                    .await?;
                    let error = ErrorInfo::new("worker_error", &message)
                        .with_context("team_id", &team_id)
                        .with_context("worker_id", &worker.config.worker_id);
                    let write = self.store.add_error(&execution_id, error).await;
                    self.note_state(write)?;
                    worker_results
                        .entry(worker.config.worker_id.clone())
                        .or_insert_with(|| WorkerResult {
                            worker_name: worker.config.worker_name.clone(),
                            status: "failed".to_string(),
                            output: None,
                            tools_used: Vec::new(),
                            metadata: HashMap::new(),
                        });
                }
                WorkerCallOutcome::TimedOut(secs) => {
                    let message = format!(
                        "Worker {} timed out after {}s",
                        worker.config.worker_name, secs
                    );
                    self.emit(ExecutionEvent::agent_error(
                        &execution_id,
                        &team_id,
                        &worker.config.worker_id,
                        &worker.config.worker_name,
                        &message,
                    ))
                    .await?;
                    let error = ErrorInfo::new("timeout", &message)
                        .with_context("team_id", &team_id)
                        .with_context("worker_id", &worker.config.worker_id);
                    let write = self.store.add_error(&execution_id, error).await;
                    self.note_state(write)?;
                }
                WorkerCallOutcome::Cancelled => {
                    failure = Some(ErrorInfo::new("cancelled", "Team cancelled mid-run"));
                    break;
                }
            }

            if decision.team_complete {
                completed = true;
                break;
            }
        }

        if !completed && failure.is_none() {
            failure = Some(
                ErrorInfo::new(
                    "budget_exhausted",
                    format!(
                        "Supervisor iteration budget ({}) exhausted without completion",
                        runtime.supervisor.config.max_iterations
                    ),
                )
                .with_context("team_id", &team_id),
            );
        }

        let status = if failure.is_none() { "completed" } else { "failed" };
        if let Some(error) = failure {
            let write = self.store.add_error(&execution_id, error).await;
            self.note_state(write)?;
        }

        let final_status = if status == "completed" {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        let state_write = self
            .store
            .update_team_state(
                &execution_id,
                &team_id,
                TeamState {
                    next: "__end__".to_string(),
                    team_id: team_id.clone(),
                    dependencies_met: true,
                    execution_status: final_status,
                    current_worker: None,
                },
            )
            .await;
        self.note_state(state_write)?;
        self.emit(ExecutionEvent::team_completed(
            &execution_id,
            &team_id,
            &runtime.sub_team.name,
            status,
        ))
        .await?;

        Ok(TeamResult {
            status: status.to_string(),
            duration: Some(team_start.elapsed().as_secs()),
            workers: if worker_results.is_empty() {
                None
            } else {
                Some(worker_results)
            },
            output: if outputs.is_empty() {
                None
            } else {
                Some(outputs.join("\n\n"))
            },
        })
    }

    /// One worker invocation: cancellation-aware, bounded by the smaller of
    /// the per-request LLM timeout and the remaining session budget.
    async fn run_worker(
        &mut self,
        worker: &WorkerRuntime,
        runtime: &TeamRuntime,
        directive: &str,
        prior_context: Option<&str>,
        deadline: Instant,
    ) -> Result<WorkerCallOutcome, StateAbort> {
        let execution_id = self.session.execution_id.clone();
        let team_id = runtime.sub_team.id.clone();

        let state_write = self
            .store
            .update_team_state(
                &execution_id,
                &team_id,
                TeamState {
                    next: worker.config.worker_name.clone(),
                    team_id: team_id.clone(),
                    dependencies_met: true,
                    execution_status: ExecutionStatus::Running,
                    current_worker: Some(worker.config.worker_id.clone()),
                },
            )
            .await;
        self.note_state(state_write)?;

        self.emit(ExecutionEvent::agent_started(
            &execution_id,
            &team_id,
            &worker.config.worker_id,
            &worker.config.worker_name,
            &format!("Starting execution of {}", worker.config.worker_name),
        ))
        .await?;
        self.emit(ExecutionEvent::agent_progress(
            &execution_id,
            &team_id,
            &worker.config.worker_id,
            &worker.config.worker_name,
            "Executing LLM call",
            50,
        ))
        .await?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(WorkerCallOutcome::TimedOut(0));
        }
        let per_request = Duration::from_secs(worker.config.llm_config.timeout).min(remaining);

        let mut cancel_rx = self.session.cancel_receiver();
        if *cancel_rx.borrow() {
            return Ok(WorkerCallOutcome::Cancelled);
        }

        let call = self
            .agent_runner
            .run_worker(&worker.config, directive, prior_context);
        let outcome = tokio::select! {
            _ = cancel_rx.changed() => WorkerCallOutcome::Cancelled,
            result = tokio::time::timeout(per_request, call) => match result {
                Ok(Ok(outcome)) => WorkerCallOutcome::Done(outcome),
                Ok(Err(err)) => WorkerCallOutcome::Failed(err.to_string()),
                Err(_) => WorkerCallOutcome::TimedOut(per_request.as_secs()),
            },
        };
        Ok(outcome)
    }

    /// Compute and persist the summary and metrics, set the terminal status,
    /// and publish `execution_completed`.
    async fn finalize(&mut self, cancelled: bool) -> Result<(), StateAbort> {
        let execution_id = self.session.execution_id.clone();

        let state = match self.store.get_execution_state(&execution_id).await {
            Ok(Some(state)) => Some(state),
            Ok(None) => None,
            Err(err) => {
                log::warn!("Could not read back state for finalize: {}", err);
                None
            }
        };

        let formatter = OutputFormatter::new();
        let (summary, metrics, final_status) = match &state {
            Some(state) => {
                let exact = if self.saw_exact_counters {
                    Some((self.exact_tokens, self.exact_api_calls))
                } else {
                    None
                };
                let metrics = formatter.calculate_metrics(&state.results, &state.events, exact);
                let mut summary = formatter.generate_summary(
                    &state.results,
                    &state.events,
                    Some(state.context.started_at),
                );
                let final_status = if cancelled {
                    ExecutionStatus::Failed
                } else if state.results.values().any(|r| r.status == "failed") {
                    ExecutionStatus::Failed
                } else if !state.results.is_empty()
                    && state
                        .results
                        .values()
                        .all(|r| r.status == "completed" || r.status == "skipped")
                    && state.results.values().any(|r| r.status == "completed")
                {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                };
                summary.status = final_status.as_str().to_string();
                if summary.completed_at.is_none() {
                    summary.completed_at = Some(Utc::now());
                    summary.total_duration = Some(
                        (Utc::now() - summary.started_at).num_seconds().max(0) as u64,
                    );
                }
                (summary, metrics, final_status)
            }
            None => {
                let summary = crate::teamllm::model::ExecutionSummary {
                    status: ExecutionStatus::Failed.as_str().to_string(),
                    started_at: self.session.started_at(),
                    completed_at: Some(Utc::now()),
                    total_duration: Some(0),
                    teams_executed: 0,
                    agents_involved: 0,
                };
                (summary, Default::default(), ExecutionStatus::Failed)
            }
        };

        let write = self
            .store
            .update_execution_summary(&execution_id, summary)
            .await;
        self.note_state(write)?;
        let write = self.store.update_metrics(&execution_id, metrics).await;
        self.note_state(write)?;
        let write = self
            .store
            .update_execution_status(&execution_id, final_status)
            .await;
        self.note_state(write)?;

        self.session.set_status(final_status).await;
        self.session.set_completed_now().await;

        let completed_event = ExecutionEvent::execution_completed(
            &execution_id,
            final_status.as_str(),
            &format!("/api/v1/executions/{}/results", execution_id),
        );
        self.emit(completed_event).await?;

        log::info!("Execution {} finished: {}", execution_id, final_status);
        Ok(())
    }
}

/// Match a router's selection against the roster: exact name, then
/// case-insensitive, then substring in either direction, then the first
/// worker. Returns the worker plus a warning note when a fallback was used.
fn resolve_worker<'a>(
    runtime: &'a TeamRuntime,
    selected: &str,
) -> (Option<&'a WorkerRuntime>, Option<String>) {
    if let Some(worker) = runtime.worker_by_name(selected) {
        return (Some(worker), None);
    }

    let workers = runtime.workers_in_order();
    let selected_lower = selected.to_lowercase();

    if let Some(worker) = workers
        .iter()
        .copied()
        .find(|w| w.config.worker_name.to_lowercase() == selected_lower)
    {
        return (Some(worker), None);
    }

    if let Some(worker) = workers.iter().copied().find(|w| {
        let name_lower = w.config.worker_name.to_lowercase();
        name_lower.contains(&selected_lower) || selected_lower.contains(&name_lower)
    }) {
        return (
            Some(worker),
            Some(format!(
                "Router selected '{}'; matched to '{}'",
                selected, worker.config.worker_name
            )),
        );
    }

    match workers.first().copied() {
        Some(worker) => (
            Some(worker),
            Some(format!(
                "Router selected unknown worker '{}'; defaulting to '{}'",
                selected, worker.config.worker_name
            )),
        ),
        None => (None, None),
    }
}
