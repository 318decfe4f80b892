#![cfg(feature = "server")]

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use teamllm::config::{SupervisorConfig, WorkerConfig};
use teamllm::engine::{EngineConfig, ExecutionEngine};
use teamllm::event_bus::EventBus;
use teamllm::runner::{
    AgentRunner, RoutingCandidate, RoutingDecision, RunnerError, SupervisorRouter, WorkerOutcome,
};
use teamllm::server::{start_server, ServerState, SharedState};
use teamllm::state_store::StateStore;
use teamllm::team_builder::TeamBuilder;

struct MockRunner {
    delay: Duration,
    response: String,
}

#[async_trait]
impl AgentRunner for MockRunner {
    async fn run_worker(
        &self,
        _worker: &WorkerConfig,
        _directive: &str,
        _prior_context: Option<&str>,
    ) -> Result<WorkerOutcome, RunnerError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(WorkerOutcome::new(self.response.clone()))
    }
}

struct FirstPickRouter;

#[async_trait]
impl SupervisorRouter for FirstPickRouter {
    async fn route(
        &self,
        _supervisor: &SupervisorConfig,
        _task: &str,
        candidates: &[RoutingCandidate],
        _iteration: u32,
    ) -> Result<RoutingDecision, RunnerError> {
        Ok(RoutingDecision::select(&candidates[0].name).complete())
    }
}

async fn spawn_server(delay: Duration, response: &str) -> (String, SharedState) {
    let engine = ExecutionEngine::new(
        StateStore::in_memory(),
        EventBus::with_defaults(),
        Arc::new(MockRunner {
            delay,
            response: response.to_string(),
        }),
        Arc::new(FirstPickRouter),
        EngineConfig::default(),
    );
    let state = Arc::new(ServerState::new(engine, TeamBuilder::with_defaults()));
    let (addr, _handle) = start_server(Arc::clone(&state), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    (format!("http://{}", addr), state)
}

fn llm_json() -> Value {
    json!({"provider": "openai", "model": "gpt-4o"})
}

fn supervisor_json() -> Value {
    json!({
        "llm_config": llm_json(),
        "system_prompt": "You are a team supervisor.",
        "user_prompt": "Coordinate the team.",
    })
}

fn team_json() -> Value {
    json!({
        "team_name": "research_team",
        "description": "Research and analysis",
        "top_supervisor_config": supervisor_json(),
        "sub_teams": [
            {
                "id": "team_a",
                "name": "Research Team",
                "description": "research phase",
                "supervisor_config": supervisor_json(),
                "worker_configs": [
                    {
                        "worker_id": "w_a",
                        "worker_name": "Researcher",
                        "llm_config": llm_json(),
                        "system_prompt": "You are a researcher.",
                        "user_prompt": "Research the topic.",
                    }
                ],
            },
            {
                "id": "team_b",
                "name": "Writing Team",
                "description": "writing phase",
                "supervisor_config": supervisor_json(),
                "worker_configs": [
                    {
                        "worker_id": "w_b",
                        "worker_name": "Writer",
                        "llm_config": llm_json(),
                        "system_prompt": "You are a writer.",
                        "user_prompt": "Write the report.",
                    }
                ],
            }
        ],
        "dependencies": {"team_b": ["team_a"]},
    })
}

async fn create_team(client: &reqwest::Client, base: &str) -> String {
    let resp = client
        .post(format!("{}/api/v1/hierarchical-teams", base))
        .json(&team_json())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "TEAM_CREATED");
    body["data"]["team_id"].as_str().unwrap().to_string()
}

async fn start_execution(client: &reqwest::Client, base: &str, team_id: &str) -> String {
    let resp = client
        .post(format!("{}/api/v1/hierarchical-teams/{}/execute", base, team_id))
        .json(&json!({"execution_config": {"stream_events": true}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "EXECUTION_STARTED");
    assert_eq!(body["data"]["team_id"], team_id);
    assert_eq!(body["data"]["status"], "started");
    let execution_id = body["data"]["execution_id"].as_str().unwrap().to_string();
    assert_eq!(execution_id.len(), 17);
    assert!(execution_id.starts_with("exec_"));
    assert_eq!(
        body["data"]["stream_url"],
        format!("/api/v1/executions/{}/stream", execution_id)
    );
    execution_id
}

async fn wait_for_terminal(client: &reqwest::Client, base: &str, execution_id: &str) -> Value {
    for _ in 0..200 {
        let resp = client
            .get(format!("{}/api/v1/executions/{}", base, execution_id))
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        let status = body["data"]["status"].as_str().unwrap_or("");
        if status == "completed" || status == "failed" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("execution {} never reached a terminal state", execution_id);
}

#[tokio::test]
async fn test_health_check() {
    let (base, _state) = spawn_server(Duration::from_millis(0), "ok").await;
    let resp = reqwest::get(format!("{}/api/v1/executions/health", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["code"], "HEALTHY");
    assert_eq!(body["data"]["status"], "healthy");
}

#[tokio::test]
async fn test_create_team_returns_well_formed_id() {
    let (base, _state) = spawn_server(Duration::from_millis(0), "ok").await;
    let client = reqwest::Client::new();

    let team_id = create_team(&client, &base).await;
    assert_eq!(team_id.len(), 12);
    assert!(team_id.starts_with("ht_"));
}

#[tokio::test]
async fn test_create_team_with_cycle_is_rejected() {
    let (base, _state) = spawn_server(Duration::from_millis(0), "ok").await;
    let client = reqwest::Client::new();

    let mut team = team_json();
    team["dependencies"] = json!({"team_a": ["team_b"], "team_b": ["team_a"]});
    let resp = client
        .post(format!("{}/api/v1/hierarchical-teams", base))
        .json(&team)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "TEAM_BUILD_ERROR");
}

#[tokio::test]
async fn test_execute_unknown_and_malformed_team_ids() {
    let (base, _state) = spawn_server(Duration::from_millis(0), "ok").await;
    let client = reqwest::Client::new();

    // Malformed id shape.
    let resp = client
        .post(format!("{}/api/v1/hierarchical-teams/not-an-id/execute", base))
        .json(&json!({"execution_config": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "TEAM_NOT_FOUND");

    // Well-formed but unregistered.
    let resp = client
        .post(format!("{}/api/v1/hierarchical-teams/ht_aaaaaaaaa/execute", base))
        .json(&json!({"execution_config": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_execute_rejects_invalid_config() {
    let (base, _state) = spawn_server(Duration::from_millis(0), "ok").await;
    let client = reqwest::Client::new();
    let team_id = create_team(&client, &base).await;

    let resp = client
        .post(format!("{}/api/v1/hierarchical-teams/{}/execute", base, team_id))
        .json(&json!({"execution_config": {"max_parallel_teams": 0}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_execution_status_lifecycle() {
    let (base, _state) = spawn_server(Duration::from_millis(50), "ok").await;
    let client = reqwest::Client::new();
    let team_id = create_team(&client, &base).await;
    let execution_id = start_execution(&client, &base, &team_id).await;

    let body = wait_for_terminal(&client, &base, &execution_id).await;
    assert_eq!(body["code"], "EXECUTION_FOUND");
    assert_eq!(body["data"]["status"], "completed");
    assert_eq!(body["data"]["team_id"], team_id);
    assert_eq!(body["data"]["progress"], 100);
    assert_eq!(body["data"]["teams_completed"], 2);
    assert_eq!(body["data"]["total_teams"], 2);
    assert!(body["data"]["completed_at"].is_string());
    assert!(body["data"]["duration"].is_u64());
}

#[tokio::test]
async fn test_malformed_execution_id_is_404_without_store_access() {
    let (base, _state) = spawn_server(Duration::from_millis(0), "ok").await;
    let client = reqwest::Client::new();

    for bad_id in ["short", "exec_has-dashes!", "exec_far_too_long_for_the_shape"] {
        let resp = client
            .get(format!("{}/api/v1/executions/{}", base, bad_id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404, "id {:?} should be rejected", bad_id);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "EXECUTION_NOT_FOUND");
    }
}

#[tokio::test]
async fn test_list_executions_pagination_and_filters() {
    let (base, _state) = spawn_server(Duration::from_millis(0), "ok").await;
    let client = reqwest::Client::new();
    let team_id = create_team(&client, &base).await;
    let execution_id = start_execution(&client, &base, &team_id).await;
    wait_for_terminal(&client, &base, &execution_id).await;

    // page_size above the cap clamps to 100; bad page clamps to 1.
    let resp = client
        .get(format!("{}/api/v1/executions?page=0&page_size=500", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["page"], 1);
    assert_eq!(body["data"]["page_size"], 100);
    assert_eq!(body["data"]["total_count"], 1);
    assert_eq!(body["data"]["executions"][0]["execution_id"], execution_id);

    // Status filter narrows the listing.
    let resp = client
        .get(format!("{}/api/v1/executions?execution_status=running", base))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["total_count"], 0);

    // Unknown status is a 400.
    let resp = client
        .get(format!("{}/api/v1/executions?execution_status=bogus", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_PARAMETER");
}

#[tokio::test]
async fn test_stop_execution_endpoint() {
    let (base, _state) = spawn_server(Duration::from_secs(30), "slow").await;
    let client = reqwest::Client::new();
    let team_id = create_team(&client, &base).await;
    let execution_id = start_execution(&client, &base, &team_id).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let resp = client
        .delete(format!(
            "{}/api/v1/executions/{}?graceful=true",
            base, execution_id
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "EXECUTION_STOPPED");

    let body = wait_for_terminal(&client, &base, &execution_id).await;
    assert_eq!(body["data"]["status"], "failed");

    // The stopped execution still serves a readable result with the
    // cancellation recorded.
    let resp = client
        .get(format!("{}/api/v1/executions/{}/results", base, execution_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["execution_summary"]["status"], "failed");
    let errors = body["data"]["errors"].as_array().unwrap();
    assert!(errors.iter().any(|e| e["error_code"] == "cancelled"));

    // Unknown id stops nothing.
    let resp = client
        .delete(format!("{}/api/v1/executions/exec_000000000000", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_sse_stream_carries_lifecycle_events() {
    let (base, _state) = spawn_server(Duration::from_millis(100), "streamed output").await;
    let client = reqwest::Client::new();
    let team_id = create_team(&client, &base).await;
    let execution_id = start_execution(&client, &base, &team_id).await;

    let resp = client
        .get(format!("{}/api/v1/executions/{}/stream", base, execution_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let content_type = resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));
    assert_eq!(resp.headers().get("cache-control").unwrap(), "no-cache");
    assert_eq!(resp.headers().get("access-control-allow-origin").unwrap(), "*");

    let mut stream = resp.bytes_stream();
    let mut buffer = String::new();
    while let Some(chunk) = stream.next().await {
        buffer.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
        if buffer.contains("event: execution_completed") {
            break;
        }
    }

    let frames: Vec<&str> = buffer.split("\n\n").filter(|f| !f.is_empty()).collect();
    assert!(frames[0].starts_with("event: execution_started"));
    assert!(frames[0].contains("data: {"));
    assert!(buffer.contains("event: supervisor_routing"));
    assert!(buffer.contains("event: agent_completed"));
    assert!(buffer.contains("event: execution_completed"));
    // Null fields are excluded from SSE payloads entirely.
    assert!(!buffer.contains("null"));
}

#[tokio::test]
async fn test_sse_replays_buffered_events_to_late_subscribers() {
    let (base, _state) = spawn_server(Duration::from_millis(0), "fast output").await;
    let client = reqwest::Client::new();
    let team_id = create_team(&client, &base).await;
    let execution_id = start_execution(&client, &base, &team_id).await;
    wait_for_terminal(&client, &base, &execution_id).await;

    // Everything already happened; the stream replays from the buffer.
    let resp = client
        .get(format!("{}/api/v1/executions/{}/stream", base, execution_id))
        .send()
        .await
        .unwrap();
    let body = resp.text().await.unwrap();

    let frames: Vec<&str> = body.split("\n\n").filter(|f| !f.is_empty()).collect();
    assert!(frames[0].starts_with("event: execution_started"));
    let completed_pos = body.find("event: execution_completed").unwrap();
    let routing_pos = body.find("event: supervisor_routing").unwrap();
    assert!(routing_pos < completed_pos);
}

#[tokio::test]
async fn test_sse_for_unknown_execution_is_404() {
    let (base, _state) = spawn_server(Duration::from_millis(0), "ok").await;
    let resp = reqwest::get(format!(
        "{}/api/v1/executions/exec_000000000000/stream",
        base
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_results_require_terminal_status_and_valid_format() {
    let (base, _state) = spawn_server(Duration::from_secs(5), "slow").await;
    let client = reqwest::Client::new();
    let team_id = create_team(&client, &base).await;
    let execution_id = start_execution(&client, &base, &team_id).await;

    // Still running: results are refused.
    let resp = client
        .get(format!("{}/api/v1/executions/{}/results", base, execution_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "EXECUTION_NOT_COMPLETED");

    // Bad format parameter.
    let resp = client
        .get(format!(
            "{}/api/v1/executions/{}/results?format=yaml",
            base, execution_id
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_FORMAT");

    client
        .delete(format!("{}/api/v1/executions/{}", base, execution_id))
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn test_results_for_completed_execution() {
    let (base, _state) = spawn_server(Duration::from_millis(0), "final report text").await;
    let client = reqwest::Client::new();
    let team_id = create_team(&client, &base).await;
    let execution_id = start_execution(&client, &base, &team_id).await;
    wait_for_terminal(&client, &base, &execution_id).await;

    let resp = client
        .get(format!("{}/api/v1/executions/{}/results", base, execution_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "RESULTS_RETRIEVED");
    assert_eq!(body["data"]["execution_id"], execution_id);
    assert_eq!(body["data"]["execution_summary"]["status"], "completed");
    assert_eq!(body["data"]["execution_summary"]["teams_executed"], 2);
    assert_eq!(body["data"]["team_results"]["team_a"]["status"], "completed");
    assert!(body["data"]["metrics"]["total_tokens_used"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_format_endpoint_validations_and_happy_path() {
    let (base, _state) = spawn_server(
        Duration::from_millis(0),
        "Survey of deep learning and 机器学习 systems",
    )
    .await;
    let client = reqwest::Client::new();
    let team_id = create_team(&client, &base).await;
    let execution_id = start_execution(&client, &base, &team_id).await;
    wait_for_terminal(&client, &base, &execution_id).await;

    let format_url = format!(
        "{}/api/v1/executions/{}/results/format",
        base, execution_id
    );

    // Missing template.
    let resp = client
        .post(&format_url)
        .json(&json!({"extraction_rules": {"summary": "summarize"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.json::<Value>().await.unwrap()["code"], "MISSING_TEMPLATE");

    // Missing rules.
    let resp = client
        .post(&format_url)
        .json(&json!({"output_template": {"title": "R"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.json::<Value>().await.unwrap()["code"], "MISSING_RULES");

    // Structurally invalid template.
    let resp = client
        .post(&format_url)
        .json(&json!({
            "output_template": "not an object",
            "extraction_rules": {"summary": "summarize"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.json::<Value>().await.unwrap()["code"], "INVALID_TEMPLATE");

    // Invalid rules.
    let resp = client
        .post(&format_url)
        .json(&json!({
            "output_template": {"title": "R"},
            "extraction_rules": {"summary": 12}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.json::<Value>().await.unwrap()["code"], "INVALID_RULES");

    // Happy path: substitution against the real execution output.
    let resp = client
        .post(&format_url)
        .json(&json!({
            "output_template": {"title": "R", "body": "{summary}", "list": ["{tech}"]},
            "extraction_rules": {
                "summary": "Summarize; limit 50 chars",
                "tech": "extract 2 key technologies"
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "FORMATTED_RESULTS_GENERATED");
    assert_eq!(body["data"]["title"], "R");
    assert!(body["data"]["body"].as_str().unwrap().chars().count() <= 53);
    assert_eq!(body["data"]["list"][0], "deep learning, 机器学习");
}
