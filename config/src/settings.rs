//! Validated application configuration consumed by the hearth core.
//!
//! The core never reads config files itself: it takes an [`AppConfig`] that
//! has already passed [`AppConfig::validate`]. Parsing is TOML with serde
//! defaults so a partial file (or none at all) yields a working config.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration load/validation error. Surfaced during startup; nothing is
/// partially initialized when this is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Web search backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchProvider {
    Google,
    #[default]
    DuckDuckGo,
}

/// Application-wide limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSettings {
    /// Maximum accepted user-input length in characters; longer input is truncated.
    pub max_input_length: usize,
    /// Maximum graph node entries per turn.
    pub graph_recursion_limit: usize,
    /// Tool execution deadline in seconds.
    pub tool_execution_timeout_secs: u64,
    /// Token budget for the trimmed local conversation context.
    pub max_local_context_tokens: usize,
    /// Attachment content size limit (characters, pre-decode).
    pub search_attachment_size: usize,
    /// Regex patterns redacted from user input before it reaches the graph.
    pub dangerous_patterns: Vec<String>,
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            max_input_length: 8000,
            graph_recursion_limit: 50,
            tool_execution_timeout_secs: 30,
            max_local_context_tokens: 2048,
            search_attachment_size: 100_000,
            dangerous_patterns: Vec::new(),
        }
    }
}

/// Episodic memory parameters. Mirrors the runtime `EmConfig`; kept here so
/// the whole tree loads from one TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmSettings {
    pub surprise_window: usize,
    pub surprise_gamma: f32,
    pub min_event_size: usize,
    pub max_event_size: usize,
    pub similarity_buffer_ratio: f32,
    pub total_retrieved_events: usize,
    pub repr_topk: usize,
    pub recency_weight: f32,
    pub use_boundary_refinement: bool,
    /// "modularity" or "conductance".
    pub refinement_metric: String,
    pub refinement_search_range: usize,
}

impl Default for EmSettings {
    fn default() -> Self {
        Self {
            surprise_window: 128,
            surprise_gamma: 1.0,
            min_event_size: 8,
            max_event_size: 128,
            similarity_buffer_ratio: 0.7,
            total_retrieved_events: 4,
            repr_topk: 4,
            recency_weight: 0.1,
            use_boundary_refinement: true,
            refinement_metric: "modularity".to_string(),
            refinement_search_range: 16,
        }
    }
}

/// Per-model execution parameters passed to the backend server and the chat
/// request body. Ignored fields depend on the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSettings {
    pub n_ctx: u32,
    pub n_gpu_layers: i32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub logprobs: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            n_ctx: 8192,
            n_gpu_layers: -1,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            logprobs: true,
        }
    }
}

/// Privacy policy flags consulted by the facade and the web tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacySettings {
    pub allow_web_search: bool,
    pub redact_pii: bool,
    /// Host substrings the web fetch tool refuses to contact.
    pub url_denylist: Vec<String>,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            allow_web_search: true,
            redact_pii: false,
            url_denylist: Vec::new(),
        }
    }
}

/// One allowlisted downloadable model.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AllowedModelEntry {
    pub repo_id: String,
    pub filename: Option<String>,
    pub revision: Option<String>,
    pub sha256: Option<String>,
}

/// Model download policy: allowlist plus per-owner rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadPolicyConfig {
    pub allowed: Vec<AllowedModelEntry>,
    pub allow_repo_owners: Vec<String>,
    pub require_allowlist: bool,
    pub require_revision: bool,
    pub require_sha256: bool,
    pub warn_on_unlisted: bool,
}

impl Default for DownloadPolicyConfig {
    fn default() -> Self {
        Self {
            allowed: Vec::new(),
            allow_repo_owners: Vec::new(),
            require_allowlist: false,
            require_revision: false,
            require_sha256: false,
            warn_on_unlisted: true,
        }
    }
}

/// Local backend process management settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Path to the backend server binary; discovered on PATH when absent.
    pub binary_path: Option<PathBuf>,
    /// Directory for per-process stderr logs.
    pub logs_dir: PathBuf,
    /// Managed models directory.
    pub models_dir: PathBuf,
    /// Health check attempts before giving up.
    pub health_check_attempts: u32,
    /// Delay between health check attempts, milliseconds.
    pub health_check_interval_ms: u64,
    /// Grace period for process-tree termination before a forceful kill, seconds.
    pub process_terminate_timeout_secs: u64,
    /// Bounded LRU capacity of the chat client cache.
    pub cache_size: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            binary_path: None,
            logs_dir: PathBuf::from("logs"),
            models_dir: PathBuf::from("models"),
            health_check_attempts: 60,
            health_check_interval_ms: 500,
            process_terminate_timeout_secs: 5,
            cache_size: 3,
        }
    }
}

/// Chat history retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    /// How many recent messages a turn loads.
    pub default_history_limit: usize,
    /// Per-session retention after each turn.
    pub keep_last: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            default_history_limit: 30,
            keep_last: 1000,
        }
    }
}

/// Allow/deny glob lists for one tool profile.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ToolProfile {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

/// Tool fabric settings: active profile, profile definitions, search provider
/// selection and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    pub profile: String,
    pub profiles: HashMap<String, ToolProfile>,
    pub search_provider: SearchProvider,
    pub google_api_key: Option<String>,
    pub google_engine_id: Option<String>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            profiles: HashMap::new(),
            search_provider: SearchProvider::default(),
            google_api_key: None,
            google_engine_id: None,
        }
    }
}

/// Root configuration consumed by the hearth core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub limits: LimitsSettings,
    pub em: EmSettings,
    pub model_defaults: ModelSettings,
    pub privacy: PrivacySettings,
    pub download: DownloadPolicyConfig,
    pub runner: RunnerSettings,
    pub history: HistorySettings,
    pub tools: ToolSettings,
}

impl AppConfig {
    /// Parses a TOML config file and validates it.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation gate. Returns the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_input_length == 0 {
            return Err(ConfigError::Invalid("limits.max_input_length must be > 0".into()));
        }
        if self.limits.graph_recursion_limit == 0 {
            return Err(ConfigError::Invalid("limits.graph_recursion_limit must be > 0".into()));
        }
        if self.limits.tool_execution_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "limits.tool_execution_timeout_secs must be > 0".into(),
            ));
        }
        for pattern in &self.limits.dangerous_patterns {
            if pattern.is_empty() {
                return Err(ConfigError::Invalid("limits.dangerous_patterns contains an empty pattern".into()));
            }
        }
        if self.em.surprise_window == 0 {
            return Err(ConfigError::Invalid("em.surprise_window must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.em.similarity_buffer_ratio) {
            return Err(ConfigError::Invalid(
                "em.similarity_buffer_ratio must be within [0, 1]".into(),
            ));
        }
        if self.em.min_event_size == 0 || self.em.min_event_size > self.em.max_event_size {
            return Err(ConfigError::Invalid(
                "em.min_event_size must be > 0 and <= em.max_event_size".into(),
            ));
        }
        if self.em.total_retrieved_events == 0 || self.em.repr_topk == 0 {
            return Err(ConfigError::Invalid(
                "em.total_retrieved_events and em.repr_topk must be > 0".into(),
            ));
        }
        match self.em.refinement_metric.as_str() {
            "modularity" | "conductance" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "em.refinement_metric must be 'modularity' or 'conductance', got '{other}'"
                )))
            }
        }
        if self.runner.health_check_attempts == 0 || self.runner.health_check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "runner.health_check_attempts and runner.health_check_interval_ms must be > 0".into(),
            ));
        }
        if self.runner.cache_size == 0 {
            return Err(ConfigError::Invalid("runner.cache_size must be > 0".into()));
        }
        if self.history.keep_last == 0 {
            return Err(ConfigError::Invalid("history.keep_last must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_similarity_ratio_rejected() {
        let mut config = AppConfig::default();
        config.em.similarity_buffer_ratio = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("similarity_buffer_ratio"));
    }

    #[test]
    fn invalid_refinement_metric_rejected() {
        let mut config = AppConfig::default();
        config.em.refinement_metric = "between".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("refinement_metric"));
    }

    #[test]
    fn min_event_size_above_max_rejected() {
        let mut config = AppConfig::default();
        config.em.min_event_size = 300;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearth.toml");
        std::fs::write(
            &path,
            "[limits]\nmax_input_length = 500\n\n[em]\nsurprise_window = 5\n",
        )
        .unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.limits.max_input_length, 500);
        assert_eq!(config.em.surprise_window, 5);
        assert_eq!(config.limits.graph_recursion_limit, 50);
        assert_eq!(config.runner.cache_size, 3);
    }

    #[test]
    fn search_provider_parses_lowercase() {
        let config: AppConfig =
            toml::from_str("[tools]\nsearch_provider = \"google\"\n").unwrap();
        assert_eq!(config.tools.search_provider, SearchProvider::Google);
    }
}
