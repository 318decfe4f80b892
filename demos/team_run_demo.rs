//! End-to-end orchestration walkthrough with mock LLM collaborators.
//!
//! Builds a three-team hierarchy with a linear dependency chain, runs it on
//! the engine, and prints the live event stream plus the final standardized
//! output. Run with `RUST_LOG=info cargo run --example team_run_demo`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use teamllm::config::{
    ExecutionConfig, HierarchicalTeam, LLMConfig, Provider, SubTeam, SupervisorConfig,
    WorkerConfig,
};
use teamllm::engine::{EngineConfig, ExecutionEngine};
use teamllm::event_bus::EventBus;
use teamllm::formatter::OutputFormatter;
use teamllm::runner::{
    AgentRunner, RoutingCandidate, RoutingDecision, RunnerError, SupervisorRouter, WorkerOutcome,
};
use teamllm::state_store::StateStore;
use teamllm::team_builder::TeamBuilder;

/// Stand-in for a real LLM provider: sleeps briefly, then answers.
struct DemoRunner;

#[async_trait]
impl AgentRunner for DemoRunner {
    async fn run_worker(
        &self,
        worker: &WorkerConfig,
        directive: &str,
        _prior_context: Option<&str>,
    ) -> Result<WorkerOutcome, RunnerError> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(
            WorkerOutcome::new(format!("{} handled '{}'", worker.worker_name, directive))
                .with_tokens(420)
                .with_api_calls(1),
        )
    }
}

/// Stand-in supervisor: always picks the first worker and calls it done.
struct DemoRouter;

#[async_trait]
impl SupervisorRouter for DemoRouter {
    async fn route(
        &self,
        _supervisor: &SupervisorConfig,
        _task: &str,
        candidates: &[RoutingCandidate],
        _iteration: u32,
    ) -> Result<RoutingDecision, RunnerError> {
        Ok(RoutingDecision::select(&candidates[0].name)
            .with_reasoning("only one specialist on the roster")
            .complete())
    }
}

fn sample_team() -> HierarchicalTeam {
    let llm = LLMConfig::new(Provider::OpenAI, "gpt-4o");
    let supervisor = SupervisorConfig::new(
        llm.clone(),
        "You are a team supervisor responsible for coordinating tasks.",
        "Coordinate the team to complete the research and analysis task.",
    );

    let sub_team = |id: &str, description: &str, worker_id: &str, worker_name: &str| {
        SubTeam::new(
            id,
            format!("{} team", worker_name),
            description,
            supervisor.clone(),
            vec![WorkerConfig::new(
                worker_id,
                worker_name,
                llm.clone(),
                format!("You are a {}.", worker_name.to_lowercase()),
                "Work on the assigned phase.",
            )],
        )
    };

    HierarchicalTeam::new("ai_research_team", "AI research and analysis")
        .with_top_supervisor(supervisor.clone())
        .with_sub_team(sub_team("research", "gather material", "w_res", "Researcher"))
        .with_sub_team(sub_team("analysis", "analyze findings", "w_ana", "Analyst"))
        .with_sub_team(sub_team("writing", "write the report", "w_wri", "Writer"))
        .with_dependency("analysis", vec!["research".to_string()])
        .with_dependency("writing", vec!["analysis".to_string()])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let store = StateStore::in_memory();
    let bus = EventBus::with_defaults();
    bus.start_cleanup().await;

    let engine = ExecutionEngine::new(
        store.clone(),
        bus.clone(),
        Arc::new(DemoRunner),
        Arc::new(DemoRouter),
        EngineConfig::default(),
    );

    let built = Arc::new(TeamBuilder::with_defaults().build(sample_team())?);
    println!("Execution order: {:?}", built.execution_order);

    let session = engine
        .start_execution(built, "ht_demo12345", ExecutionConfig::default())
        .await?;
    // Late subscription is fine: the bus replays buffered events first, so
    // the stream still begins at execution_started.
    let subscriber = bus.subscribe(Some(&session.execution_id)).await?;
    println!("Started execution {}", session.execution_id);

    while let Some(event) = subscriber.recv().await {
        println!(
            "[{}] {:<20} {}",
            event.source_type,
            event.event_type,
            event.content.as_deref().unwrap_or("")
        );
        if event.event_type == "execution_completed" {
            break;
        }
    }
    bus.unsubscribe(&subscriber).await;

    let output = OutputFormatter::new()
        .format_execution_results(&store, &session.execution_id)
        .await?;
    println!("\nFinal status:  {}", output.execution_summary.status);
    println!("Teams run:     {}", output.execution_summary.teams_executed);
    println!("Tokens used:   {}", output.metrics.total_tokens_used);
    println!("API calls:     {}", output.metrics.api_calls_made);
    for (team_id, result) in &output.team_results {
        println!("  {:<10} {}", team_id, result.output.as_deref().unwrap_or("(no output)"));
    }

    engine.shutdown().await;
    bus.close().await;
    Ok(())
}
