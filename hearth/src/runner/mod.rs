//! Local model backend process management.
//!
//! Any local inference backend sits behind [`LocalModelRunner`]; the provided
//! implementation is [`ProcessRunner`], which manages llama-server style
//! child processes speaking the backend HTTP contract (`GET /health`,
//! `POST /tokenize`, OpenAI-compatible `/v1` endpoints).
//!
//! Invariant: at most one process per model key at any time. The process
//! table is mutated only by the runner; readers take ports via `get_port`.

mod process;

pub use process::ProcessRunner;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use env_config::ModelSettings;

/// Errors from starting or talking to a local backend process.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The backend process could not be spawned, or exited before becoming
    /// ready. The message references the stderr log file for diagnosis.
    #[error("backend launch failed for '{model_key}': {message}")]
    BackendLaunch { model_key: String, message: String },

    /// The backend never became healthy within the configured attempts.
    #[error("health check timed out for '{model_key}' (see log: {log_path})")]
    HealthTimeout { model_key: String, log_path: PathBuf },

    /// The model file the backend should load does not exist.
    #[error("model file not found: {0}")]
    ModelFileMissing(PathBuf),

    /// The backend server binary could not be located.
    #[error("backend binary not found: {0}")]
    BinaryMissing(String),
}

/// Start configuration for one backend process.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Unique key for bookkeeping (e.g. `character_model`, `executor_model:code`).
    pub model_key: String,
    /// Model file to load.
    pub model_path: Option<PathBuf>,
    /// Requested port; 0 means allocate a free ephemeral port.
    pub requested_port: u16,
    /// Extra command line arguments (e.g. `--embedding`).
    pub extra_args: Vec<String>,
    /// Per-model execution parameters.
    pub model_settings: ModelSettings,
}

impl RunnerConfig {
    pub fn new(model_key: impl Into<String>) -> Self {
        Self {
            model_key: model_key.into(),
            model_path: None,
            requested_port: 0,
            extra_args: Vec::new(),
            model_settings: ModelSettings::default(),
        }
    }

    pub fn with_model_path(mut self, path: PathBuf) -> Self {
        self.model_path = Some(path);
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_model_settings(mut self, settings: ModelSettings) -> Self {
        self.model_settings = settings;
        self
    }
}

/// Snapshot of one backend's state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunnerStatus {
    pub is_running: bool,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub error: Option<String>,
}

/// Character-based token estimate used whenever the tokenize RPC is
/// unavailable or fails: `max(1, ceil(len/4))`.
pub fn estimate_tokens(text: &str) -> usize {
    std::cmp::max(1, text.len().div_ceil(4))
}

/// Local model execution runner.
///
/// Implementations manage the full lifecycle of local inference server
/// processes. `start` is idempotent per model key: starting an already
/// running key returns the existing port. `stop` on an unknown key is a
/// no-op.
#[async_trait]
pub trait LocalModelRunner: Send + Sync {
    /// Starts the backend for `config.model_key` and returns its port once
    /// the health endpoint reports ready.
    async fn start(&self, config: RunnerConfig) -> Result<u16, RunnerError>;

    /// Stops the backend for `model_key`: graceful terminate of the process
    /// tree with timeout, then forceful kill. Idempotent.
    async fn stop(&self, model_key: &str);

    fn is_running(&self, model_key: &str) -> bool;

    fn get_port(&self, model_key: &str) -> Option<u16>;

    fn get_status(&self, model_key: &str) -> RunnerStatus;

    /// Counts tokens via the backend's `POST /tokenize` endpoint; falls back
    /// to [`estimate_tokens`] on any failure.
    async fn count_tokens(&self, text: &str, model_key: &str) -> usize;

    /// Stops every tracked process.
    async fn cleanup(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: estimate is ceil(len/4), never below 1.
    #[test]
    fn estimate_tokens_rounds_up_and_floors_at_one() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(40)), 10);
    }

    /// **Scenario**: RunnerConfig builder sets fields.
    #[test]
    fn runner_config_builder() {
        let config = RunnerConfig::new("embedding_model")
            .with_model_path(PathBuf::from("/models/embed.gguf"))
            .with_extra_args(vec!["--embedding".into()]);
        assert_eq!(config.model_key, "embedding_model");
        assert_eq!(config.requested_port, 0);
        assert_eq!(config.extra_args, vec!["--embedding".to_string()]);
    }

    /// **Scenario**: RunnerError display references the log file for health timeouts.
    #[test]
    fn runner_error_display_mentions_log() {
        let err = RunnerError::HealthTimeout {
            model_key: "character_model".into(),
            log_path: PathBuf::from("logs/s.log"),
        };
        let s = err.to_string();
        assert!(s.contains("character_model"), "{}", s);
        assert!(s.contains("logs"), "{}", s);
    }
}
