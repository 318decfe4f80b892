//! Tool plug-in interface.
//!
//! Tools themselves (search, scraping, data processing, ...) live outside the
//! core. The core only needs two things: a [`ToolRunner`] trait that a plug-in
//! implements, and a [`ToolRegistry`] that resolves the tool names a
//! [`WorkerConfig`](crate::config::WorkerConfig) declares. The engine records
//! which tools a worker used; it never interprets tool output.
//!
//! # Example
//!
//! ```rust
//! use teamllm::tool_protocol::{ToolMetadata, ToolRegistry, ToolResult, ToolRunner};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct EchoTool;
//!
//! #[async_trait]
//! impl ToolRunner for EchoTool {
//!     fn metadata(&self) -> ToolMetadata {
//!         ToolMetadata::new("echo", "Returns its input unchanged")
//!     }
//!
//!     async fn execute(&self, input: serde_json::Value) -> ToolResult {
//!         ToolResult::success(input)
//!     }
//! }
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(Arc::new(EchoTool)).unwrap();
//! assert!(registry.get("echo").is_some());
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Outcome of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool ran without error.
    pub success: bool,
    /// Tool output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    /// A successful result carrying `output`.
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
        }
    }

    /// A failed result carrying `error`.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Name and description of a tool, used for registration and for the
/// capability listings workers see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    /// Unique tool name workers reference in their config.
    pub name: String,
    /// What the tool does.
    pub description: String,
}

impl ToolMetadata {
    /// Create metadata for a tool.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Errors raised by the tool registry.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// A tool with the same name is already registered.
    AlreadyRegistered(String),
    /// No tool with the requested name exists.
    NotFound(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::AlreadyRegistered(name) => {
                write!(f, "Tool '{}' is already registered", name)
            }
            ToolError::NotFound(name) => write!(f, "Tool '{}' not found", name),
        }
    }
}

impl Error for ToolError {}

/// Capability interface a tool plug-in implements.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// The tool's registration metadata.
    fn metadata(&self) -> ToolMetadata;

    /// Execute the tool with a JSON input payload.
    async fn execute(&self, input: serde_json::Value) -> ToolResult;

    /// Validate an input payload without executing. The default accepts
    /// anything; override for tools with structured parameters.
    fn validate_input(&self, _input: &serde_json::Value) -> Result<(), String> {
        Ok(())
    }
}

/// Name-indexed table of tool plug-ins shared by every worker runtime.
///
/// Registration is serialized (done before executions start); lookup clones
/// an `Arc` and takes no lock thereafter.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolRunner>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool under its metadata name. Fails on duplicates.
    pub fn register(&mut self, tool: Arc<dyn ToolRunner>) -> Result<(), ToolError> {
        let name = tool.metadata().name;
        if self.tools.contains_key(&name) {
            return Err(ToolError::AlreadyRegistered(name));
        }
        log::debug!("Registered tool '{}'", name);
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolRunner>> {
        self.tools.get(name).cloned()
    }

    /// Names of all registered tools, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Subset of `requested` names that are actually registered, preserving
    /// the requested order.
    pub fn resolve(&self, requested: &[String]) -> Vec<String> {
        requested
            .iter()
            .filter(|name| self.tools.contains_key(name.as_str()))
            .cloned()
            .collect()
    }

    /// Execute a registered tool by name.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        if let Err(reason) = tool.validate_input(&input) {
            return Ok(ToolResult::failure(reason));
        }
        Ok(tool.execute(input).await)
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.list())
            .finish()
    }
}
