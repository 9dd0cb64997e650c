//! Tool abstraction: providers load tools, the fabric executes them.
//!
//! Tools take JSON-schema-shaped arguments and return a string (or a
//! JSON-serialized payload). Every failure path (timeout, unknown tool,
//! provider error) materializes as a structured JSON error envelope
//! serialized to a string, so downstream LLM prompts treat tool results
//! uniformly as text and nodes can short-circuit on `{"error": true}`.

mod fabric;
mod profile;
mod remote;
mod web;

pub use fabric::ToolFabric;
pub use profile::apply_profile;
pub use remote::RemoteToolProvider;
pub use web::{NativeToolProvider, WebFetchTool, WebSearchTool, TOOL_WEB_FETCH, TOOL_WEB_SEARCH};

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

/// Tools that require caller approval before execution.
pub const DANGEROUS_TOOLS: &[&str] = &[TOOL_WEB_FETCH, TOOL_WEB_SEARCH];

/// Tool specification presented to the model.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolSpec {
    /// Globally unique tool name; external tools are namespaced
    /// `{provider}_{inner}` by their provider.
    pub name: String,
    pub description: Option<String>,
    /// JSON Schema for arguments.
    pub input_schema: Value,
}

/// Errors from loading or calling tools.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid arguments: {0}")]
    InvalidInput(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("execution error: {0}")]
    Execution(String),
}

impl ToolError {
    /// Error-code slug used in envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "tool_not_found",
            Self::InvalidInput(_) => "tool_invalid_input",
            Self::Transport(_) => "tool_transport_error",
            Self::Execution(_) => "tool_execution_error",
        }
    }
}

/// Builds the structured error envelope serialized as a JSON string.
pub fn error_envelope(
    error_code: &str,
    message: &str,
    tool_name: &str,
    details: Option<&str>,
) -> String {
    let mut envelope = json!({
        "error": true,
        "error_code": error_code,
        "message": message,
        "tool_name": tool_name,
    });
    if let Some(details) = details {
        envelope["details"] = json!(details);
    }
    envelope.to_string()
}

/// Detects an error envelope in a tool result payload. Returns the human
/// message (falling back to the error code) when the payload is one.
pub fn parse_tool_error(payload: &str) -> Option<String> {
    let trimmed = payload.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    if value.get("error").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    value
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| value.get("error_code").and_then(Value::as_str))
        .map(str::to_string)
        .or(Some("Tool error".to_string()))
}

/// One executable tool.
///
/// **Interaction**: Listed by the fabric into prompts via [`Tool::spec`];
/// invoked by `ToolFabric::aexecute` under the execution deadline.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn spec(&self) -> ToolSpec;

    /// Executes with JSON arguments; the Ok payload is the tool result
    /// string handed to the model.
    async fn call(&self, args: Value) -> Result<String, ToolError>;
}

/// Source of tools, loaded once at startup.
///
/// Providers namespace their tools to prevent collisions; a provider that
/// fails to load is skipped, not fatal.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn load_tools(&self) -> Result<Vec<std::sync::Arc<dyn Tool>>, ToolError>;
}
