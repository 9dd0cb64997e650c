//! llama-server process runner: spawn, health-check, stop, tokenize.
//!
//! Spawns one backend process per model key with stdout discarded and stderr
//! appended to a per-model timestamped log file. Readiness is polled on
//! `GET /health`; process-tree termination uses the process group on Unix
//! and a plain kill elsewhere.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use env_config::RunnerSettings;

use super::{estimate_tokens, LocalModelRunner, RunnerConfig, RunnerError, RunnerStatus};

/// Timeout for the tokenize RPC.
const TOKENIZE_TIMEOUT: Duration = Duration::from_secs(5);

static UNSAFE_KEY_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_.-]+").unwrap_or_else(|_| unreachable!()));

#[derive(Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct TokenizeBody {
    #[serde(default)]
    tokens: Vec<i64>,
}

struct ManagedProcess {
    child: Mutex<Child>,
    pid: Option<u32>,
    port: u16,
    log_path: PathBuf,
}

/// Manages llama-server child processes, one per model key.
///
/// **Interaction**: Used by `LlmService` behind the [`LocalModelRunner`]
/// trait; owns every subprocess lifetime.
pub struct ProcessRunner {
    binary_path: Option<PathBuf>,
    settings: RunnerSettings,
    http: reqwest::Client,
    processes: DashMap<String, Arc<ManagedProcess>>,
}

impl ProcessRunner {
    /// Creates a runner. When `settings.binary_path` is unset the backend
    /// binary is discovered on PATH (`llama-server`).
    pub fn new(settings: RunnerSettings) -> Self {
        let binary_path = settings
            .binary_path
            .clone()
            .or_else(|| which::which("llama-server").ok());
        info!(binary = ?binary_path, logs = %settings.logs_dir.display(), "process runner initialized");
        Self {
            binary_path,
            settings,
            http: reqwest::Client::new(),
            processes: DashMap::new(),
        }
    }

    /// Allocates a free ephemeral port by binding port 0 and reading back
    /// the assigned address.
    fn find_free_port() -> Result<u16, RunnerError> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).map_err(|e| {
            RunnerError::BackendLaunch {
                model_key: String::new(),
                message: format!("port allocation failed: {e}"),
            }
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| RunnerError::BackendLaunch {
                model_key: String::new(),
                message: format!("port allocation failed: {e}"),
            })?
            .port();
        Ok(port)
    }

    fn log_path_for(&self, model_key: &str) -> PathBuf {
        let safe_key = UNSAFE_KEY_CHARS.replace_all(model_key, "_");
        let stamp = chrono::Utc::now().timestamp();
        self.settings
            .logs_dir
            .join(format!("backend_{safe_key}_{stamp}.log"))
    }

    fn build_command(
        &self,
        binary: &Path,
        model_path: &Path,
        port: u16,
        config: &RunnerConfig,
        log_file: std::fs::File,
    ) -> Command {
        let mut cmd = Command::new(binary);
        cmd.arg("-m")
            .arg(model_path)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("-c")
            .arg(config.model_settings.n_ctx.to_string())
            .arg("-ngl")
            .arg(config.model_settings.n_gpu_layers.to_string())
            .args(&config.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log_file))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Polls `GET /health` until it returns `200 {"status":"ok"}`, the
    /// attempt budget runs out, or the child exits.
    async fn wait_until_healthy(
        &self,
        port: u16,
        model_key: &str,
        log_path: &Path,
        child: &Mutex<Child>,
    ) -> Result<(), RunnerError> {
        let interval = Duration::from_millis(self.settings.health_check_interval_ms);
        let url = format!("http://127.0.0.1:{port}/health");

        for attempt in 0..self.settings.health_check_attempts {
            if let Some(status) = child
                .lock()
                .await
                .try_wait()
                .ok()
                .flatten()
            {
                return Err(RunnerError::BackendLaunch {
                    model_key: model_key.to_string(),
                    message: format!(
                        "process exited with {status} before becoming ready (see log: {})",
                        log_path.display()
                    ),
                });
            }

            match self.http.get(&url).timeout(interval.max(Duration::from_millis(250))).send().await {
                Ok(resp) if resp.status().is_success() => {
                    if let Ok(body) = resp.json::<HealthBody>().await {
                        if body.status == "ok" {
                            debug!(model_key, attempt, "backend healthy");
                            return Ok(());
                        }
                    }
                }
                Ok(_) | Err(_) => {}
            }
            tokio::time::sleep(interval).await;
        }

        Err(RunnerError::HealthTimeout {
            model_key: model_key.to_string(),
            log_path: log_path.to_path_buf(),
        })
    }

    #[cfg(unix)]
    fn signal_group(pid: u32, signal: i32) {
        // Child was spawned with process_group(0), so its pid is the pgid.
        unsafe {
            libc::killpg(pid as i32, signal);
        }
    }

    async fn terminate(&self, model_key: &str, managed: Arc<ManagedProcess>) {
        let grace = Duration::from_secs(self.settings.process_terminate_timeout_secs);

        #[cfg(unix)]
        if let Some(pid) = managed.pid {
            Self::signal_group(pid, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = managed.child.lock().await.start_kill();
        }

        let graceful = {
            let mut child = managed.child.lock().await;
            tokio::time::timeout(grace, child.wait()).await.is_ok()
        };

        if !graceful {
            warn!(model_key, "graceful terminate timed out; killing process tree");
            #[cfg(unix)]
            if let Some(pid) = managed.pid {
                Self::signal_group(pid, libc::SIGKILL);
            }
            let mut child = managed.child.lock().await;
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[async_trait]
impl LocalModelRunner for ProcessRunner {
    async fn start(&self, config: RunnerConfig) -> Result<u16, RunnerError> {
        let model_key = config.model_key.clone();

        // Already running: return the existing port.
        if let Some(existing) = self.processes.get(&model_key) {
            info!(%model_key, port = existing.port, "backend already running");
            return Ok(existing.port);
        }

        let model_path = config
            .model_path
            .clone()
            .ok_or_else(|| RunnerError::BackendLaunch {
                model_key: model_key.clone(),
                message: "model_path is required".into(),
            })?;
        if !model_path.exists() {
            return Err(RunnerError::ModelFileMissing(model_path));
        }
        let binary = self
            .binary_path
            .clone()
            .ok_or_else(|| RunnerError::BinaryMissing("llama-server".into()))?;
        if !binary.exists() {
            return Err(RunnerError::BinaryMissing(binary.display().to_string()));
        }

        let port = if config.requested_port > 0 {
            config.requested_port
        } else {
            Self::find_free_port()?
        };

        std::fs::create_dir_all(&self.settings.logs_dir).map_err(|e| {
            RunnerError::BackendLaunch {
                model_key: model_key.clone(),
                message: format!("cannot create logs dir: {e}"),
            }
        })?;
        let log_path = self.log_path_for(&model_key);
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| RunnerError::BackendLaunch {
                model_key: model_key.clone(),
                message: format!("cannot open log file {}: {e}", log_path.display()),
            })?;

        info!(%model_key, port, model = %model_path.display(), "starting backend");
        let mut cmd = self.build_command(&binary, &model_path, port, &config, log_file);
        let child = cmd.spawn().map_err(|e| RunnerError::BackendLaunch {
            model_key: model_key.clone(),
            message: format!("spawn failed: {e}"),
        })?;
        let pid = child.id();

        let managed = Arc::new(ManagedProcess {
            child: Mutex::new(child),
            pid,
            port,
            log_path: log_path.clone(),
        });
        self.processes.insert(model_key.clone(), managed.clone());

        if let Err(err) = self
            .wait_until_healthy(port, &model_key, &log_path, &managed.child)
            .await
        {
            warn!(%model_key, error = %err, "backend failed to become healthy; stopping");
            self.stop(&model_key).await;
            return Err(err);
        }

        info!(%model_key, port, "backend ready");
        Ok(port)
    }

    async fn stop(&self, model_key: &str) {
        let Some((_, managed)) = self.processes.remove(model_key) else {
            debug!(model_key, "stop: not running");
            return;
        };
        info!(model_key, log = %managed.log_path.display(), "stopping backend");
        self.terminate(model_key, managed).await;
    }

    fn is_running(&self, model_key: &str) -> bool {
        self.processes.contains_key(model_key)
    }

    fn get_port(&self, model_key: &str) -> Option<u16> {
        self.processes.get(model_key).map(|p| p.port)
    }

    fn get_status(&self, model_key: &str) -> RunnerStatus {
        match self.processes.get(model_key) {
            Some(p) => RunnerStatus {
                is_running: true,
                port: Some(p.port),
                pid: p.pid,
                error: None,
            },
            None => RunnerStatus::default(),
        }
    }

    async fn count_tokens(&self, text: &str, model_key: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let Some(port) = self.get_port(model_key) else {
            return estimate_tokens(text);
        };

        let url = format!("http://127.0.0.1:{port}/tokenize");
        let result = self
            .http
            .post(&url)
            .json(&serde_json::json!({"content": text}))
            .timeout(TOKENIZE_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => match resp.json::<TokenizeBody>().await {
                Ok(body) => body.tokens.len(),
                Err(err) => {
                    debug!(model_key, error = %err, "tokenize response parse failed");
                    estimate_tokens(text)
                }
            },
            Ok(resp) => {
                debug!(model_key, status = %resp.status(), "tokenize endpoint returned error status");
                estimate_tokens(text)
            }
            Err(err) => {
                debug!(model_key, error = %err, "tokenize request failed");
                estimate_tokens(text)
            }
        }
    }

    async fn cleanup(&self) {
        let keys: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.stop(&key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_runner() -> ProcessRunner {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = RunnerSettings {
            logs_dir: dir.path().join("logs"),
            models_dir: dir.path().join("models"),
            binary_path: Some(dir.path().join("no-such-llama-server")),
            health_check_attempts: 2,
            health_check_interval_ms: 10,
            ..Default::default()
        };
        // Leak the tempdir so paths stay valid for the test body.
        std::mem::forget(dir);
        ProcessRunner::new(settings)
    }

    /// **Scenario**: start with a missing model file fails with ModelFileMissing.
    #[tokio::test]
    async fn start_missing_model_file_fails() {
        let runner = test_runner();
        let config = RunnerConfig::new("character_model")
            .with_model_path(PathBuf::from("/definitely/missing/model.gguf"));
        let err = runner.start(config).await.unwrap_err();
        assert!(matches!(err, RunnerError::ModelFileMissing(_)), "{err}");
    }

    /// **Scenario**: start with a missing binary fails with BinaryMissing.
    #[tokio::test]
    async fn start_missing_binary_fails() {
        let runner = test_runner();
        let model = std::env::temp_dir().join("hearth-test-model.gguf");
        std::fs::write(&model, b"gguf").unwrap();
        let config = RunnerConfig::new("character_model").with_model_path(model.clone());
        let err = runner.start(config).await.unwrap_err();
        std::fs::remove_file(&model).ok();
        assert!(matches!(err, RunnerError::BinaryMissing(_)), "{err}");
    }

    /// **Scenario**: stopping an unknown key is a no-op; status reports not running.
    #[tokio::test]
    async fn stop_unknown_key_is_noop() {
        let runner = test_runner();
        runner.stop("never_started").await;
        assert!(!runner.is_running("never_started"));
        assert_eq!(runner.get_status("never_started"), RunnerStatus::default());
        assert_eq!(runner.get_port("never_started"), None);
    }

    /// **Scenario**: count_tokens without a running backend uses the estimate.
    #[tokio::test]
    async fn count_tokens_falls_back_to_estimate() {
        let runner = test_runner();
        let n = runner.count_tokens(&"x".repeat(20), "character_model").await;
        assert_eq!(n, 5);
        assert_eq!(runner.count_tokens("", "character_model").await, 0);
    }

    /// **Scenario**: free port allocation returns a nonzero port.
    #[test]
    fn find_free_port_returns_nonzero() {
        let port = ProcessRunner::find_free_port().unwrap();
        assert!(port > 0);
    }
}
