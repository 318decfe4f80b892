use std::sync::Arc;
use std::time::Duration;
use teamllm::config::ExecutionConfig;
use teamllm::event::ExecutionEvent;
use teamllm::model::{
    ErrorInfo, ExecutionContext, ExecutionMetrics, ExecutionStatus, ExecutionSummary, TeamResult,
    TeamState,
};
use teamllm::state_store::{
    FileBackend, MemoryBackend, StateBackend, StateStore, StateStoreConfig, StateStoreError,
};

fn context(execution_id: &str, team_id: &str) -> ExecutionContext {
    ExecutionContext::new(execution_id, team_id, ExecutionConfig::default())
}

fn fast_store() -> StateStore {
    StateStore::new(
        Arc::new(MemoryBackend::new()),
        StateStoreConfig {
            retry_delay: Duration::from_millis(10),
            ..StateStoreConfig::default()
        },
    )
}

#[tokio::test]
async fn test_create_then_get_round_trip() {
    let store = fast_store();
    store
        .create_execution("exec_001", "ht_test12345", context("exec_001", "ht_test12345"))
        .await
        .unwrap();

    let state = store.get_execution_state("exec_001").await.unwrap().unwrap();
    assert_eq!(state.execution_id, "exec_001");
    assert_eq!(state.team_id, "ht_test12345");
    assert_eq!(state.status, ExecutionStatus::Pending);
    assert!(state.events.is_empty());
    assert!(state.team_states.is_empty());
    assert!(state.results.is_empty());
    assert!(state.errors.is_empty());
    assert_eq!(state.metrics, ExecutionMetrics::default());
    assert!(state.updated_at >= state.created_at);
    assert_eq!(state.context.execution_id, "exec_001");
}

#[tokio::test]
async fn test_create_duplicate_fails() {
    let store = fast_store();
    store
        .create_execution("exec_dup", "team", context("exec_dup", "team"))
        .await
        .unwrap();

    let err = store
        .create_execution("exec_dup", "team", context("exec_dup", "team"))
        .await
        .unwrap_err();
    assert!(matches!(err, StateStoreError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_mutations_bump_updated_at() {
    let store = fast_store();
    store
        .create_execution("exec_ts", "team", context("exec_ts", "team"))
        .await
        .unwrap();
    let before = store.get_execution_state("exec_ts").await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    store
        .update_execution_status("exec_ts", ExecutionStatus::Running)
        .await
        .unwrap();

    let after = store.get_execution_state("exec_ts").await.unwrap().unwrap();
    assert_eq!(after.status, ExecutionStatus::Running);
    assert!(after.updated_at > before.updated_at);
    assert!(after.updated_at >= after.created_at);
}

#[tokio::test]
async fn test_mutating_missing_execution_is_not_found() {
    let store = fast_store();
    let err = store
        .update_execution_status("exec_missing", ExecutionStatus::Running)
        .await
        .unwrap_err();
    assert!(matches!(err, StateStoreError::NotFound(_)));
}

#[tokio::test]
async fn test_events_team_states_results_errors_accumulate() {
    let store = fast_store();
    store
        .create_execution("exec_acc", "team", context("exec_acc", "team"))
        .await
        .unwrap();

    store
        .add_event("exec_acc", ExecutionEvent::execution_started("exec_acc", "team"))
        .await
        .unwrap();
    store
        .add_event(
            "exec_acc",
            ExecutionEvent::agent_started("exec_acc", "team_a", "w1", "Worker", "go"),
        )
        .await
        .unwrap();
    store
        .update_team_state("exec_acc", "team_a", TeamState::pending("team_a"))
        .await
        .unwrap();
    store
        .update_team_result(
            "exec_acc",
            "team_a",
            TeamResult {
                status: "completed".to_string(),
                duration: Some(3),
                workers: None,
                output: Some("done".to_string()),
            },
        )
        .await
        .unwrap();
    store
        .add_error("exec_acc", ErrorInfo::new("worker_error", "transient"))
        .await
        .unwrap();

    let state = store.get_execution_state("exec_acc").await.unwrap().unwrap();
    assert_eq!(state.events.len(), 2);
    assert_eq!(state.events[0].event_type, "execution_started");
    assert!(state.team_states.contains_key("team_a"));
    assert_eq!(state.results["team_a"].status, "completed");
    assert_eq!(state.errors.len(), 1);

    // Read helpers see the same data.
    assert_eq!(
        store.get_execution_status("exec_acc").await.unwrap(),
        Some(ExecutionStatus::Pending)
    );
    let recent = store
        .get_execution_events("exec_acc", Some(1))
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].event_type, "agent_started");
    assert!(store
        .get_team_state("exec_acc", "team_a")
        .await
        .unwrap()
        .is_some());
    assert_eq!(
        store
            .get_team_result("exec_acc", "team_a")
            .await
            .unwrap()
            .unwrap()
            .output
            .as_deref(),
        Some("done")
    );
}

#[tokio::test]
async fn test_standardized_output_requires_summary() {
    let store = fast_store();
    store
        .create_execution("exec_std", "team", context("exec_std", "team"))
        .await
        .unwrap();

    assert!(store
        .get_standardized_output("exec_std")
        .await
        .unwrap()
        .is_none());

    store
        .update_execution_summary(
            "exec_std",
            ExecutionSummary {
                status: "completed".to_string(),
                started_at: chrono::Utc::now(),
                completed_at: Some(chrono::Utc::now()),
                total_duration: Some(1),
                teams_executed: 1,
                agents_involved: 1,
            },
        )
        .await
        .unwrap();

    let output = store
        .get_standardized_output("exec_std")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output.execution_id, "exec_std");
    assert_eq!(output.execution_summary.status, "completed");
}

#[tokio::test]
async fn test_list_executions_with_filters() {
    let store = fast_store();
    store
        .create_execution("exec_a", "team_one", context("exec_a", "team_one"))
        .await
        .unwrap();
    store
        .create_execution("exec_b", "team_two", context("exec_b", "team_two"))
        .await
        .unwrap();
    store
        .update_execution_status("exec_b", ExecutionStatus::Running)
        .await
        .unwrap();

    let all = store.list_executions(None, None, 100).await.unwrap();
    assert_eq!(all.len(), 2);

    let by_team = store
        .list_executions(Some("team_one"), None, 100)
        .await
        .unwrap();
    assert_eq!(by_team, vec!["exec_a"]);

    let by_status = store
        .list_executions(None, Some(ExecutionStatus::Running), 100)
        .await
        .unwrap();
    assert_eq!(by_status, vec!["exec_b"]);

    let limited = store.list_executions(None, None, 1).await.unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn test_delete_execution() {
    let store = fast_store();
    store
        .create_execution("exec_del", "team", context("exec_del", "team"))
        .await
        .unwrap();

    assert!(store.delete_execution("exec_del").await.unwrap());
    assert!(store.get_execution_state("exec_del").await.unwrap().is_none());
    assert!(!store.delete_execution("exec_del").await.unwrap());
}

#[tokio::test]
async fn test_ttl_expiry_makes_state_invisible() {
    let store = StateStore::new(
        Arc::new(MemoryBackend::new()),
        StateStoreConfig {
            default_ttl: Duration::from_millis(50),
            retry_delay: Duration::from_millis(10),
            ..StateStoreConfig::default()
        },
    );
    store
        .create_execution("exec_ttl", "team", context("exec_ttl", "team"))
        .await
        .unwrap();
    assert!(store.get_execution_state("exec_ttl").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(store.get_execution_state("exec_ttl").await.unwrap().is_none());
    assert!(store.list_executions(None, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lock_contention_fails_within_retry_budget() {
    let backend = Arc::new(MemoryBackend::new());
    let store = StateStore::new(
        Arc::clone(&backend) as Arc<dyn StateBackend>,
        StateStoreConfig {
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
            ..StateStoreConfig::default()
        },
    );
    store
        .create_execution("exec_lock", "team", context("exec_lock", "team"))
        .await
        .unwrap();

    // Steal the lock key directly so every acquisition attempt loses.
    backend
        .put_if_absent("teamllm:lock:exec_lock", "intruder", Duration::from_secs(30))
        .await
        .unwrap();

    let err = store
        .update_execution_status("exec_lock", ExecutionStatus::Running)
        .await
        .unwrap_err();
    assert!(matches!(err, StateStoreError::LockFailed(_)));

    // Releasing the foreign lock restores writes.
    backend
        .remove_if_equals("teamllm:lock:exec_lock", "intruder")
        .await
        .unwrap();
    store
        .update_execution_status("exec_lock", ExecutionStatus::Running)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_mutations_serialize_under_the_lock() {
    let store = fast_store();
    store
        .create_execution("exec_conc", "team", context("exec_conc", "team"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .add_event(
                    "exec_conc",
                    ExecutionEvent::system(format!("event_{}", i), "exec_conc"),
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let state = store.get_execution_state("exec_conc").await.unwrap().unwrap();
    assert_eq!(state.events.len(), 10);
}

#[tokio::test]
async fn test_stats_report_status_distribution() {
    let store = fast_store();
    store
        .create_execution("exec_s1", "team", context("exec_s1", "team"))
        .await
        .unwrap();
    store
        .create_execution("exec_s2", "team", context("exec_s2", "team"))
        .await
        .unwrap();
    store
        .update_execution_status("exec_s2", ExecutionStatus::Completed)
        .await
        .unwrap();

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.total_executions, 2);
    assert_eq!(stats.status_distribution.get("pending"), Some(&1));
    assert_eq!(stats.status_distribution.get("completed"), Some(&1));
}

#[tokio::test]
async fn test_file_backend_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = StateStore::new(
            Arc::new(FileBackend::open(dir.path()).unwrap()),
            StateStoreConfig::default(),
        );
        store
            .create_execution("exec_file", "team", context("exec_file", "team"))
            .await
            .unwrap();
        store
            .update_execution_status("exec_file", ExecutionStatus::Completed)
            .await
            .unwrap();
    }

    // A fresh backend over the same directory sees the persisted state.
    let store = StateStore::new(
        Arc::new(FileBackend::open(dir.path()).unwrap()),
        StateStoreConfig::default(),
    );
    let state = store.get_execution_state("exec_file").await.unwrap().unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_cleanup_expired_purges_dead_entries() {
    let store = StateStore::new(
        Arc::new(MemoryBackend::new()),
        StateStoreConfig {
            default_ttl: Duration::from_millis(30),
            retry_delay: Duration::from_millis(10),
            ..StateStoreConfig::default()
        },
    );
    store
        .create_execution("exec_gone", "team", context("exec_gone", "team"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    let purged = store.cleanup_expired().await.unwrap();
    assert!(purged >= 1);
}
