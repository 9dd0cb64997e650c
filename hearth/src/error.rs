//! Graph execution error types.
//!
//! Used by `Node::run` and everything the graph calls into. Subsystems keep
//! their own error enums (`RunnerError`, `RegistryError`, `ToolError`,
//! `StoreError`); nodes map them into `AgentError` at the graph boundary.

use thiserror::Error;

/// Agent execution error.
///
/// Returned by `Node::run` when a step fails. Model unavailability gets its
/// own variant so callers can produce a graceful user-facing message instead
/// of crashing the turn.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Execution failed with a message (e.g. LLM call failed, bad state).
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// A required model could not be resolved or its backend failed to start.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// The run was cancelled by the caller (event stream closed).
    #[error("run cancelled")]
    Cancelled,
}

impl From<crate::runner::RunnerError> for AgentError {
    fn from(err: crate::runner::RunnerError) -> Self {
        AgentError::ModelUnavailable(err.to_string())
    }
}
