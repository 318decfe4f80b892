//! Durable execution state with distributed locking.
//!
//! Every execution persists one [`ExecutionState`] document, serialized as
//! JSON and stored under `<prefix>:execution:<execution id>` in a pluggable
//! [`StateBackend`]. Each mutation happens read-modify-write under a
//! per-execution lock key `<prefix>:lock:<execution id>` held with a unique
//! owner token and a bounded TTL, released by compare-and-delete so a lock
//! stolen after TTL expiry is never clobbered. Reads take no lock and may
//! observe the previous consistent snapshot.
//!
//! Every write refreshes the document's TTL (default one hour); an execution
//! that stops being touched ages out of the store on its own.
//!
//! Two backends ship with the crate: [`MemoryBackend`] for tests and
//! single-process embedding, and [`FileBackend`] which keeps one JSON file per
//! key under a directory and survives restarts. Anything with atomic
//! put-if-absent semantics (Redis et al.) can be slotted in by implementing
//! [`StateBackend`].

use crate::teamllm::event::ExecutionEvent;
use crate::teamllm::model::{
    ErrorInfo, ExecutionContext, ExecutionMetrics, ExecutionStatus, ExecutionSummary,
    StandardizedOutput, TeamResult, TeamState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Errors raised by state store operations.
#[derive(Debug, Clone)]
pub enum StateStoreError {
    /// `create` was called for an execution id that already has state.
    AlreadyExists(String),
    /// The execution id has no persisted state.
    NotFound(String),
    /// The per-execution lock could not be acquired within the retry budget.
    LockFailed(String),
    /// State could not be encoded or decoded.
    Serialization(String),
    /// The backend refused or failed the operation.
    Backend(String),
}

impl fmt::Display for StateStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateStoreError::AlreadyExists(id) => write!(f, "Execution {} already exists", id),
            StateStoreError::NotFound(id) => write!(f, "Execution {} not found", id),
            StateStoreError::LockFailed(id) => {
                write!(f, "Failed to acquire lock for execution {}", id)
            }
            StateStoreError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            StateStoreError::Backend(msg) => write!(f, "State backend error: {}", msg),
        }
    }
}

impl Error for StateStoreError {}

/// Complete persisted state of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Execution id this document belongs to.
    pub execution_id: String,
    /// Team definition id the execution runs.
    pub team_id: String,
    /// Current lifecycle status.
    pub status: ExecutionStatus,
    /// Identity and per-run options fixed at start.
    pub context: ExecutionContext,
    /// Every event published so far, in publish order.
    pub events: Vec<ExecutionEvent>,
    /// Per-sub-team runtime slots keyed by sub-team id.
    pub team_states: HashMap<String, TeamState>,
    /// Per-sub-team results keyed by sub-team id.
    pub results: HashMap<String, TeamResult>,
    /// Final summary once computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ExecutionSummary>,
    /// Errors accumulated during the run.
    #[serde(default)]
    pub errors: Vec<ErrorInfo>,
    /// Usage counters.
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    /// When the document was created.
    pub created_at: DateTime<Utc>,
    /// Bumped on every mutation. Always `>= created_at`.
    pub updated_at: DateTime<Utc>,
}

/// Tuning knobs for the store.
#[derive(Debug, Clone)]
pub struct StateStoreConfig {
    /// Namespace prefix for every key.
    pub key_prefix: String,
    /// Time-to-live applied on every write.
    pub default_ttl: Duration,
    /// How long an acquired lock survives if its holder dies.
    pub lock_ttl: Duration,
    /// Lock acquisition attempts before giving up.
    pub max_retries: u32,
    /// Pause between lock attempts.
    pub retry_delay: Duration,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "teamllm".to_string(),
            default_ttl: Duration::from_secs(3600),
            lock_ttl: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Key-value substrate the store persists into.
///
/// Implementations must provide atomic `put_if_absent` (the lock primitive)
/// and `remove_if_equals` (the token-checked release). Expired entries must
/// behave as absent.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Read a live value.
    async fn get(&self, key: &str) -> Result<Option<String>, StateStoreError>;

    /// Write a value with a TTL, replacing any existing entry.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StateStoreError>;

    /// Write only when the key is absent (or expired). Returns whether the
    /// write happened.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StateStoreError>;

    /// Delete a key. Returns whether a live entry was removed.
    async fn remove(&self, key: &str) -> Result<bool, StateStoreError>;

    /// Delete a key only when its current value equals `expected`. Returns
    /// whether the delete happened.
    async fn remove_if_equals(&self, key: &str, expected: &str)
        -> Result<bool, StateStoreError>;

    /// Keys starting with `prefix`, unordered. Bounded best-effort scan; not
    /// required to be consistent across concurrent inserts.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StateStoreError>;

    /// Drop expired entries eagerly. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, StateStoreError>;
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// In-process backend; entries expire lazily against a monotonic clock.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StateStoreError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StateStoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StateStoreError> {
        let mut entries = self.entries.lock().await;
        let live = entries
            .get(key)
            .map(|entry| entry.expires_at > Instant::now())
            .unwrap_or(false);
        if live {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool, StateStoreError> {
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some(entry) => Ok(entry.expires_at > Instant::now()),
            None => Ok(false),
        }
    }

    async fn remove_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, StateStoreError> {
        let mut entries = self.entries.lock().await;
        let matches = entries
            .get(key)
            .map(|entry| entry.expires_at > Instant::now() && entry.value == expected)
            .unwrap_or(false);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StateStoreError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.expires_at > now)
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn purge_expired(&self) -> Result<usize, StateStoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }
}

#[derive(Serialize, Deserialize)]
struct FileEntry {
    expires_at_unix_ms: u64,
    value: String,
}

/// File-backed backend: one JSON document per key under `dir`, with the
/// expiry stamped inside the document. Survives process restarts.
///
/// All operations serialize on an internal mutex; the expected workload is a
/// handful of writes per orchestration checkpoint, not a hot path.
pub struct FileBackend {
    dir: PathBuf,
    guard: Mutex<()>,
}

impl FileBackend {
    /// Open (and create if needed) a backend rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            guard: Mutex::new(()),
        })
    }

    // Keys contain ':' which is unfriendly to some filesystems.
    fn file_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key.replace(':', "__")))
    }

    fn key_for(file_stem: &str) -> String {
        file_stem.replace("__", ":")
    }

    fn now_unix_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn read_entry(&self, key: &str) -> Result<Option<FileEntry>, StateStoreError> {
        let path = self.file_for(key);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StateStoreError::Backend(err.to_string())),
        };
        let entry: FileEntry = serde_json::from_str(&raw)
            .map_err(|err| StateStoreError::Serialization(err.to_string()))?;
        if entry.expires_at_unix_ms <= Self::now_unix_ms() {
            let _ = std::fs::remove_file(&path);
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn write_entry(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StateStoreError> {
        let entry = FileEntry {
            expires_at_unix_ms: Self::now_unix_ms() + ttl.as_millis() as u64,
            value: value.to_string(),
        };
        let raw = serde_json::to_string(&entry)
            .map_err(|err| StateStoreError::Serialization(err.to_string()))?;
        std::fs::write(self.file_for(key), raw)
            .map_err(|err| StateStoreError::Backend(err.to_string()))
    }
}

#[async_trait]
impl StateBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StateStoreError> {
        let _guard = self.guard.lock().await;
        Ok(self.read_entry(key)?.map(|entry| entry.value))
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StateStoreError> {
        let _guard = self.guard.lock().await;
        self.write_entry(key, value, ttl)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StateStoreError> {
        let _guard = self.guard.lock().await;
        if self.read_entry(key)?.is_some() {
            return Ok(false);
        }
        self.write_entry(key, value, ttl)?;
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool, StateStoreError> {
        let _guard = self.guard.lock().await;
        let existed = self.read_entry(key)?.is_some();
        match std::fs::remove_file(self.file_for(key)) {
            Ok(()) => Ok(existed),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StateStoreError::Backend(err.to_string())),
        }
    }

    async fn remove_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, StateStoreError> {
        let _guard = self.guard.lock().await;
        let matches = self
            .read_entry(key)?
            .map(|entry| entry.value == expected)
            .unwrap_or(false);
        if matches {
            std::fs::remove_file(self.file_for(key))
                .map_err(|err| StateStoreError::Backend(err.to_string()))?;
        }
        Ok(matches)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StateStoreError> {
        let _guard = self.guard.lock().await;
        let mut keys = Vec::new();
        let read_dir =
            std::fs::read_dir(&self.dir).map_err(|err| StateStoreError::Backend(err.to_string()))?;
        let now = Self::now_unix_ms();
        for entry in read_dir.flatten() {
            let file_name = entry.file_name();
            let name = match file_name.to_str() {
                Some(name) => name,
                None => continue,
            };
            let stem = match name.strip_suffix(".json") {
                Some(stem) => stem,
                None => continue,
            };
            let key = Self::key_for(stem);
            if !key.starts_with(prefix) {
                continue;
            }
            // Skip entries that have already expired on disk.
            if let Ok(raw) = std::fs::read_to_string(entry.path()) {
                if let Ok(parsed) = serde_json::from_str::<FileEntry>(&raw) {
                    if parsed.expires_at_unix_ms > now {
                        keys.push(key);
                    }
                }
            }
        }
        Ok(keys)
    }

    async fn purge_expired(&self) -> Result<usize, StateStoreError> {
        let _guard = self.guard.lock().await;
        let mut purged = 0;
        let read_dir =
            std::fs::read_dir(&self.dir).map_err(|err| StateStoreError::Backend(err.to_string()))?;
        let now = Self::now_unix_ms();
        for entry in read_dir.flatten() {
            if let Ok(raw) = std::fs::read_to_string(entry.path()) {
                if let Ok(parsed) = serde_json::from_str::<FileEntry>(&raw) {
                    if parsed.expires_at_unix_ms <= now {
                        if std::fs::remove_file(entry.path()).is_ok() {
                            purged += 1;
                        }
                    }
                }
            }
        }
        Ok(purged)
    }
}

/// Aggregate statistics over the store (see [`StateStore::get_stats`]).
#[derive(Debug, Clone, Serialize)]
pub struct StateStoreStats {
    /// Number of live execution documents.
    pub total_executions: usize,
    /// Live executions per status (sampled, bounded scan).
    pub status_distribution: HashMap<String, usize>,
}

/// The durable, concurrency-safe store of [`ExecutionState`] documents.
///
/// Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    config: StateStoreConfig,
}

impl StateStore {
    /// Create a store over `backend` with `config`.
    pub fn new(backend: Arc<dyn StateBackend>, config: StateStoreConfig) -> Self {
        Self { backend, config }
    }

    /// Create an in-memory store with default configuration. The usual
    /// choice for tests and single-process embedding.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), StateStoreConfig::default())
    }

    fn execution_key(&self, execution_id: &str) -> String {
        format!("{}:execution:{}", self.config.key_prefix, execution_id)
    }

    fn lock_key(&self, execution_id: &str) -> String {
        format!("{}:lock:{}", self.config.key_prefix, execution_id)
    }

    /// Acquire the per-execution lock, returning the owner token.
    async fn acquire_lock(&self, execution_id: &str) -> Result<String, StateStoreError> {
        let lock_key = self.lock_key(execution_id);
        let token = Uuid::new_v4().to_string();
        for attempt in 0..self.config.max_retries {
            if self
                .backend
                .put_if_absent(&lock_key, &token, self.config.lock_ttl)
                .await?
            {
                return Ok(token);
            }
            log::debug!(
                "Lock contention on {} (attempt {}/{})",
                lock_key,
                attempt + 1,
                self.config.max_retries
            );
            tokio::time::sleep(self.config.retry_delay).await;
        }
        Err(StateStoreError::LockFailed(execution_id.to_string()))
    }

    /// Release the lock only if we still own it. A lock that expired and was
    /// re-acquired by someone else is left alone.
    async fn release_lock(&self, execution_id: &str, token: &str) {
        let lock_key = self.lock_key(execution_id);
        match self.backend.remove_if_equals(&lock_key, token).await {
            Ok(true) => {}
            Ok(false) => log::warn!(
                "Lock for {} was not owned at release time (expired and stolen?)",
                execution_id
            ),
            Err(err) => log::warn!("Failed to release lock for {}: {}", execution_id, err),
        }
    }

    async fn load(&self, execution_id: &str) -> Result<Option<ExecutionState>, StateStoreError> {
        let raw = self.backend.get(&self.execution_key(execution_id)).await?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|err| StateStoreError::Serialization(err.to_string())),
            None => Ok(None),
        }
    }

    async fn save(&self, state: &ExecutionState) -> Result<(), StateStoreError> {
        let raw = serde_json::to_string(state)
            .map_err(|err| StateStoreError::Serialization(err.to_string()))?;
        self.backend
            .put(
                &self.execution_key(&state.execution_id),
                &raw,
                self.config.default_ttl,
            )
            .await
    }

    /// Lock, load, apply `mutate`, bump `updated_at`, save, unlock.
    async fn mutate<F>(&self, execution_id: &str, mutate: F) -> Result<(), StateStoreError>
    where
        F: FnOnce(&mut ExecutionState),
    {
        let token = self.acquire_lock(execution_id).await?;
        let result = async {
            let mut state = self
                .load(execution_id)
                .await?
                .ok_or_else(|| StateStoreError::NotFound(execution_id.to_string()))?;
            mutate(&mut state);
            state.updated_at = Utc::now();
            self.save(&state).await
        }
        .await;
        self.release_lock(execution_id, &token).await;
        result
    }

    /// Establish the initial state for a new execution: status `pending`,
    /// empty events/team states/results/errors, default metrics. Fails with
    /// [`StateStoreError::AlreadyExists`] when state for the id exists.
    pub async fn create_execution(
        &self,
        execution_id: &str,
        team_id: &str,
        context: ExecutionContext,
    ) -> Result<(), StateStoreError> {
        let token = self.acquire_lock(execution_id).await?;
        let result = async {
            if self.load(execution_id).await?.is_some() {
                return Err(StateStoreError::AlreadyExists(execution_id.to_string()));
            }
            let now = Utc::now();
            let state = ExecutionState {
                execution_id: execution_id.to_string(),
                team_id: team_id.to_string(),
                status: ExecutionStatus::Pending,
                context,
                events: Vec::new(),
                team_states: HashMap::new(),
                results: HashMap::new(),
                summary: None,
                errors: Vec::new(),
                metrics: ExecutionMetrics::default(),
                created_at: now,
                updated_at: now,
            };
            self.save(&state).await
        }
        .await;
        self.release_lock(execution_id, &token).await;
        result
    }

    /// Set the execution's lifecycle status.
    pub async fn update_execution_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> Result<(), StateStoreError> {
        self.mutate(execution_id, |state| state.status = status).await
    }

    /// Append one event to the execution's event log.
    pub async fn add_event(
        &self,
        execution_id: &str,
        event: ExecutionEvent,
    ) -> Result<(), StateStoreError> {
        self.mutate(execution_id, |state| state.events.push(event)).await
    }

    /// Upsert the runtime slot for one sub-team.
    pub async fn update_team_state(
        &self,
        execution_id: &str,
        team_id: &str,
        team_state: TeamState,
    ) -> Result<(), StateStoreError> {
        let team_id = team_id.to_string();
        self.mutate(execution_id, move |state| {
            state.team_states.insert(team_id, team_state);
        })
        .await
    }

    /// Upsert the result for one sub-team.
    pub async fn update_team_result(
        &self,
        execution_id: &str,
        team_id: &str,
        result: TeamResult,
    ) -> Result<(), StateStoreError> {
        let team_id = team_id.to_string();
        self.mutate(execution_id, move |state| {
            state.results.insert(team_id, result);
        })
        .await
    }

    /// Set the final summary.
    pub async fn update_execution_summary(
        &self,
        execution_id: &str,
        summary: ExecutionSummary,
    ) -> Result<(), StateStoreError> {
        self.mutate(execution_id, move |state| state.summary = Some(summary))
            .await
    }

    /// Append one error record.
    pub async fn add_error(
        &self,
        execution_id: &str,
        error: ErrorInfo,
    ) -> Result<(), StateStoreError> {
        self.mutate(execution_id, move |state| state.errors.push(error))
            .await
    }

    /// Replace the metrics block.
    pub async fn update_metrics(
        &self,
        execution_id: &str,
        metrics: ExecutionMetrics,
    ) -> Result<(), StateStoreError> {
        self.mutate(execution_id, move |state| state.metrics = metrics)
            .await
    }

    /// Read the full state; `None` when absent or expired.
    pub async fn get_execution_state(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionState>, StateStoreError> {
        self.load(execution_id).await
    }

    /// Read just the status.
    pub async fn get_execution_status(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionStatus>, StateStoreError> {
        Ok(self.load(execution_id).await?.map(|state| state.status))
    }

    /// Read the event log; with `limit`, the most recent `limit` events.
    pub async fn get_execution_events(
        &self,
        execution_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionEvent>, StateStoreError> {
        let events = self
            .load(execution_id)
            .await?
            .map(|state| state.events)
            .unwrap_or_default();
        match limit {
            Some(limit) if events.len() > limit => {
                Ok(events[events.len() - limit..].to_vec())
            }
            _ => Ok(events),
        }
    }

    /// Read one sub-team's runtime slot.
    pub async fn get_team_state(
        &self,
        execution_id: &str,
        team_id: &str,
    ) -> Result<Option<TeamState>, StateStoreError> {
        Ok(self
            .load(execution_id)
            .await?
            .and_then(|state| state.team_states.get(team_id).cloned()))
    }

    /// Read one sub-team's result.
    pub async fn get_team_result(
        &self,
        execution_id: &str,
        team_id: &str,
    ) -> Result<Option<TeamResult>, StateStoreError> {
        Ok(self
            .load(execution_id)
            .await?
            .and_then(|state| state.results.get(team_id).cloned()))
    }

    /// Assemble a [`StandardizedOutput`] directly from persisted state.
    /// `None` until a summary has been written.
    pub async fn get_standardized_output(
        &self,
        execution_id: &str,
    ) -> Result<Option<StandardizedOutput>, StateStoreError> {
        let state = match self.load(execution_id).await? {
            Some(state) => state,
            None => return Ok(None),
        };
        let summary = match state.summary {
            Some(summary) => summary,
            None => return Ok(None),
        };
        Ok(Some(StandardizedOutput {
            execution_id: execution_id.to_string(),
            execution_summary: summary,
            team_results: state.results,
            errors: state.errors,
            metrics: state.metrics,
        }))
    }

    /// Enumerate execution ids, optionally filtered by team id and status.
    /// A bounded scan: at most `limit` ids are returned and the listing is
    /// not required to be consistent across concurrent inserts.
    pub async fn list_executions(
        &self,
        team_id: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: usize,
    ) -> Result<Vec<String>, StateStoreError> {
        let prefix = format!("{}:execution:", self.config.key_prefix);
        let mut keys = self.backend.scan(&prefix).await?;
        keys.sort();

        let mut ids = Vec::new();
        for key in keys {
            if ids.len() >= limit {
                break;
            }
            let execution_id = match key.rsplit(':').next() {
                Some(id) => id.to_string(),
                None => continue,
            };
            if team_id.is_some() || status.is_some() {
                let state = match self.load(&execution_id).await? {
                    Some(state) => state,
                    None => continue,
                };
                if let Some(team_id) = team_id {
                    if state.team_id != team_id {
                        continue;
                    }
                }
                if let Some(status) = status {
                    if state.status != status {
                        continue;
                    }
                }
            }
            ids.push(execution_id);
        }
        Ok(ids)
    }

    /// Remove an execution's state. Returns whether anything was removed.
    pub async fn delete_execution(&self, execution_id: &str) -> Result<bool, StateStoreError> {
        let token = self.acquire_lock(execution_id).await?;
        let result = self.backend.remove(&self.execution_key(execution_id)).await;
        self.release_lock(execution_id, &token).await;
        result
    }

    /// Eagerly drop expired entries from the backend. The TTL makes this
    /// optional housekeeping.
    pub async fn cleanup_expired(&self) -> Result<usize, StateStoreError> {
        self.backend.purge_expired().await
    }

    /// Count live executions and sample their status distribution. The sample
    /// is capped at 50 documents to bound the scan.
    pub async fn get_stats(&self) -> Result<StateStoreStats, StateStoreError> {
        let prefix = format!("{}:execution:", self.config.key_prefix);
        let keys = self.backend.scan(&prefix).await?;
        let mut status_distribution: HashMap<String, usize> = HashMap::new();
        for key in keys.iter().take(50) {
            if let Some(id) = key.rsplit(':').next() {
                if let Some(state) = self.load(id).await? {
                    *status_distribution
                        .entry(state.status.as_str().to_string())
                        .or_insert(0) += 1;
                }
            }
        }
        Ok(StateStoreStats {
            total_executions: keys.len(),
            status_distribution,
        })
    }
}
