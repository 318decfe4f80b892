// src/lib.rs

// Import the top-level `teamllm` module.
pub mod teamllm;

// Re-exporting key items for easier external access.
pub use teamllm::config::{
    ExecutionConfig, GlobalConfig, HierarchicalTeam, LLMConfig, Provider, SubTeam,
    SupervisorConfig, WorkerConfig,
};
pub use teamllm::engine::{EngineConfig, ExecutionEngine, ExecutionSession};
pub use teamllm::event::{ExecutionEvent, SourceType};
pub use teamllm::event_bus::{EventBus, EventBusConfig, EventSubscriber};
pub use teamllm::formatter::OutputFormatter;
pub use teamllm::model::{ExecutionStatus, StandardizedOutput};
pub use teamllm::runner::{AgentRunner, RoutingDecision, SupervisorRouter, WorkerOutcome};
pub use teamllm::state_store::{StateStore, StateStoreConfig};
pub use teamllm::team_builder::{BuiltTeam, TeamBuilder};
pub use teamllm::template::TemplateProcessor;

// Module path aliases so examples and tests can use teamllm::config::...
pub use teamllm::{
    config, dependency, engine, event, event_bus, formatter, keys, model, runner, state_store,
    team_builder, template, tool_protocol,
};

#[cfg(feature = "server")]
pub use teamllm::server;
