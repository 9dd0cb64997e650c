//! Stateless LLM client factory keyed by role.
//!
//! No current-model state: model selection happens per request, which allows
//! concurrent multi-session use. Chat clients are cached in a bounded LRU
//! keyed by model key; eviction stops the backing runner. A per-model-key
//! mutex guards loading so two callers never start the same model twice; the
//! lock map itself sits behind its own mutex. After the first successful
//! start, subsequent callers see the cached client without blocking on the
//! load path.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::AgentError;
use crate::message::Message;
use crate::registry::ModelCatalog;
use crate::runner::{LocalModelRunner, RunnerConfig};

use super::{
    ChatClient, ChatRole, EmbeddingClient, LlmDirectory, LocalChatClient, LocalEmbeddingClient,
    TokenCounter,
};

const CHARACTER_MODEL_KEY: &str = "character_model";
const EMBEDDING_MODEL_KEY: &str = "embedding_model";

struct CacheState {
    /// LRU order: front = oldest, back = most recently used.
    order: VecDeque<String>,
    clients: HashMap<String, (Arc<dyn ChatClient>, u16)>,
}

/// Stateless factory returning chat/embedding clients keyed by role.
///
/// **Interaction**: Implements [`LlmDirectory`]; constructed by the facade
/// with the model catalog and a [`LocalModelRunner`].
pub struct LlmService {
    catalog: Arc<ModelCatalog>,
    runner: Arc<dyn LocalModelRunner>,
    cache_size: usize,
    cache: Mutex<CacheState>,
    embedding: Mutex<Option<(Arc<dyn EmbeddingClient>, u16)>>,
    /// Per-model-key load locks; the map itself is guarded by this mutex.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LlmService {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        runner: Arc<dyn LocalModelRunner>,
        cache_size: usize,
    ) -> Self {
        info!(cache_size, "llm service initialized (stateless mode)");
        Self {
            catalog,
            runner,
            cache_size: cache_size.max(1),
            cache: Mutex::new(CacheState {
                order: VecDeque::new(),
                clients: HashMap::new(),
            }),
            embedding: Mutex::new(None),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn model_key_for(role: ChatRole, task_type: Option<&str>) -> String {
        match role {
            ChatRole::Character => CHARACTER_MODEL_KEY.to_string(),
            ChatRole::Executor => {
                format!("executor_model:{}", task_type.unwrap_or("default"))
            }
        }
    }

    async fn lock_for(&self, model_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(model_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Starts the backend for `model_key` and caches a client, evicting the
    /// least recently used entry when the cache is full. Callers must hold
    /// the per-key lock.
    async fn load_chat_model(&self, model_key: &str) -> Result<Arc<dyn ChatClient>, AgentError> {
        let info = self.catalog.resolve_model_key(model_key).ok_or_else(|| {
            AgentError::ModelUnavailable(format!("no model assigned for '{model_key}'"))
        })?;
        if !info.path.exists() {
            return Err(AgentError::ModelUnavailable(format!(
                "model file not found: {}",
                info.path.display()
            )));
        }

        // Evict before starting the new process so at most cache_size
        // backends run at once.
        let evicted: Option<String> = {
            let mut cache = self.cache.lock().await;
            if cache.clients.len() >= self.cache_size {
                let oldest = cache.order.pop_front();
                if let Some(key) = &oldest {
                    cache.clients.remove(key);
                }
                oldest
            } else {
                None
            }
        };
        if let Some(oldest) = evicted {
            info!(model_key = %oldest, "evicting model from cache");
            self.runner.stop(&oldest).await;
        }

        let port = self
            .runner
            .start(
                RunnerConfig::new(model_key)
                    .with_model_path(info.path.clone())
                    .with_model_settings(info.settings.clone()),
            )
            .await?;

        let client: Arc<dyn ChatClient> =
            Arc::new(LocalChatClient::new(port, model_key, info.settings));
        let mut cache = self.cache.lock().await;
        cache.clients.insert(model_key.to_string(), (client.clone(), port));
        cache.order.push_back(model_key.to_string());
        info!(model_key, port, "chat model loaded");
        Ok(client)
    }

    /// Port of the character model's runner, when running. Used for token
    /// counting; never starts a backend.
    fn character_port(&self) -> Option<u16> {
        self.runner.get_port(CHARACTER_MODEL_KEY)
    }

    /// Chat client for a specific catalog model, bypassing role assignment.
    ///
    /// The override shares the LRU cache under the key `model:{id}` and the
    /// same per-key start lock.
    pub async fn get_client_for_model(
        &self,
        model_id: &str,
    ) -> Result<Arc<dyn ChatClient>, AgentError> {
        let info = self.catalog.get(model_id).ok_or_else(|| {
            AgentError::ModelUnavailable(format!("no model with id '{model_id}'"))
        })?;
        if !info.path.exists() {
            return Err(AgentError::ModelUnavailable(format!(
                "model file not found: {}",
                info.path.display()
            )));
        }
        let model_key = format!("model:{model_id}");

        let lock = self.lock_for(&model_key).await;
        let _guard = lock.lock().await;
        {
            let mut cache = self.cache.lock().await;
            if let Some((client, _)) = cache.clients.get(&model_key).cloned() {
                debug!(%model_key, "returning cached client");
                cache.order.retain(|k| k != &model_key);
                cache.order.push_back(model_key);
                return Ok(client);
            }
        }

        let evicted: Option<String> = {
            let mut cache = self.cache.lock().await;
            if cache.clients.len() >= self.cache_size {
                let oldest = cache.order.pop_front();
                if let Some(key) = &oldest {
                    cache.clients.remove(key);
                }
                oldest
            } else {
                None
            }
        };
        if let Some(oldest) = evicted {
            info!(model_key = %oldest, "evicting model from cache");
            self.runner.stop(&oldest).await;
        }

        let port = self
            .runner
            .start(
                RunnerConfig::new(model_key.as_str())
                    .with_model_path(info.path.clone())
                    .with_model_settings(info.settings.clone()),
            )
            .await?;
        let client: Arc<dyn ChatClient> =
            Arc::new(LocalChatClient::new(port, model_key.clone(), info.settings));
        let mut cache = self.cache.lock().await;
        cache.clients.insert(model_key.clone(), (client.clone(), port));
        cache.order.push_back(model_key.clone());
        info!(%model_key, port, "chat model loaded by id override");
        Ok(client)
    }
}

#[async_trait]
impl LlmDirectory for LlmService {
    async fn get_client(
        &self,
        role: ChatRole,
        task_type: Option<&str>,
    ) -> Result<Arc<dyn ChatClient>, AgentError> {
        let model_key = Self::model_key_for(role, task_type);
        let lock = self.lock_for(&model_key).await;
        let _guard = lock.lock().await;

        // Re-check the cache under the per-key lock.
        {
            let mut cache = self.cache.lock().await;
            if let Some((client, _)) = cache.clients.get(&model_key).cloned() {
                debug!(%model_key, "returning cached client");
                cache.order.retain(|k| k != &model_key);
                cache.order.push_back(model_key);
                return Ok(client);
            }
        }

        self.load_chat_model(&model_key).await
    }

    async fn get_embedding_client(&self) -> Result<Arc<dyn EmbeddingClient>, AgentError> {
        let lock = self.lock_for(EMBEDDING_MODEL_KEY).await;
        let _guard = lock.lock().await;

        {
            let cached = self.embedding.lock().await;
            if let Some((client, _)) = cached.as_ref() {
                debug!("returning cached embedding client");
                return Ok(client.clone());
            }
        }

        let info = self
            .catalog
            .resolve_model_key(EMBEDDING_MODEL_KEY)
            .ok_or_else(|| {
                AgentError::ModelUnavailable("no embedding model assigned".into())
            })?;
        if !info.path.exists() {
            return Err(AgentError::ModelUnavailable(format!(
                "embedding model file not found: {}",
                info.path.display()
            )));
        }

        let port = self
            .runner
            .start(
                RunnerConfig::new(EMBEDDING_MODEL_KEY)
                    .with_model_path(info.path.clone())
                    .with_model_settings(info.settings.clone())
                    .with_extra_args(vec!["--embedding".into()]),
            )
            .await?;

        let client: Arc<dyn EmbeddingClient> =
            Arc::new(LocalEmbeddingClient::new(port, EMBEDDING_MODEL_KEY));
        *self.embedding.lock().await = Some((client.clone(), port));
        info!(port, "embedding model loaded");
        Ok(client)
    }

    async fn count_tokens(&self, messages: &[Message]) -> usize {
        let mut total = 0usize;
        let use_server = self.character_port().is_some();
        for message in messages {
            let content = message.content();
            if content.is_empty() {
                continue;
            }
            total += if use_server {
                self.runner.count_tokens(content, CHARACTER_MODEL_KEY).await
            } else {
                crate::runner::estimate_tokens(content)
            };
        }
        total
    }

    async fn cleanup(&self) {
        info!("cleaning up llm service");
        self.runner.cleanup().await;
        let mut cache = self.cache.lock().await;
        cache.clients.clear();
        cache.order.clear();
        drop(cache);
        *self.embedding.lock().await = None;
    }
}

#[async_trait]
impl TokenCounter for LlmService {
    async fn count_text(&self, text: &str) -> Result<usize, AgentError> {
        Ok(if self.character_port().is_some() {
            self.runner.count_tokens(text, CHARACTER_MODEL_KEY).await
        } else {
            crate::runner::estimate_tokens(text)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{RunnerError, RunnerStatus};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runner stub that records starts/stops without spawning anything.
    struct FakeRunner {
        starts: AtomicUsize,
        stops: Mutex<Vec<String>>,
        next_port: AtomicUsize,
        ports: dashmap::DashMap<String, u16>,
    }

    impl FakeRunner {
        fn new() -> Self {
            Self {
                starts: AtomicUsize::new(0),
                stops: Mutex::new(Vec::new()),
                next_port: AtomicUsize::new(30000),
                ports: dashmap::DashMap::new(),
            }
        }
    }

    #[async_trait]
    impl LocalModelRunner for FakeRunner {
        async fn start(&self, config: RunnerConfig) -> Result<u16, RunnerError> {
            if let Some(port) = self.ports.get(&config.model_key) {
                return Ok(*port);
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            let port = self.next_port.fetch_add(1, Ordering::SeqCst) as u16;
            self.ports.insert(config.model_key, port);
            Ok(port)
        }

        async fn stop(&self, model_key: &str) {
            self.ports.remove(model_key);
            self.stops.lock().await.push(model_key.to_string());
        }

        fn is_running(&self, model_key: &str) -> bool {
            self.ports.contains_key(model_key)
        }

        fn get_port(&self, model_key: &str) -> Option<u16> {
            self.ports.get(model_key).map(|p| *p)
        }

        fn get_status(&self, _model_key: &str) -> RunnerStatus {
            RunnerStatus::default()
        }

        async fn count_tokens(&self, text: &str, _model_key: &str) -> usize {
            crate::runner::estimate_tokens(text)
        }

        async fn cleanup(&self) {
            self.ports.clear();
        }
    }

    fn catalog_with_models(dir: &std::path::Path, count: usize) -> Arc<ModelCatalog> {
        let catalog =
            ModelCatalog::open(dir.join("models.json"), dir.join("models")).unwrap();
        for i in 0..count {
            let path = dir.join(format!("model{i}.gguf"));
            std::fs::write(&path, b"gguf").unwrap();
            let info = catalog
                .add_local(path, format!("m{i}"), crate::registry::ModelPool::Text)
                .unwrap();
            if i == 0 {
                catalog.set_character_model(&info.id).unwrap();
            } else {
                catalog
                    .set_executor_model(&format!("task{i}"), &info.id)
                    .unwrap();
            }
        }
        Arc::new(catalog)
    }

    /// **Scenario**: requesting the same role twice starts the backend once
    /// and returns the cached client.
    #[tokio::test]
    async fn second_request_hits_cache() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let catalog = catalog_with_models(dir.path(), 1);
        let service = LlmService::new(catalog, runner.clone(), 3);

        service.get_client(ChatRole::Character, None).await.unwrap();
        service.get_client(ChatRole::Character, None).await.unwrap();
        assert_eq!(runner.starts.load(Ordering::SeqCst), 1, "one start only");
    }

    /// **Scenario**: the LRU evicts and stops the least recently used model
    /// when capacity is exceeded.
    #[tokio::test]
    async fn lru_evicts_oldest_and_stops_runner() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let catalog = catalog_with_models(dir.path(), 3);
        let service = LlmService::new(catalog, runner.clone(), 2);

        service.get_client(ChatRole::Character, None).await.unwrap();
        service
            .get_client(ChatRole::Executor, Some("task1"))
            .await
            .unwrap();
        // Touch character so executor:task1 becomes the LRU entry.
        service.get_client(ChatRole::Character, None).await.unwrap();
        service
            .get_client(ChatRole::Executor, Some("task2"))
            .await
            .unwrap();

        let stops = runner.stops.lock().await.clone();
        assert_eq!(stops, vec!["executor_model:task1".to_string()]);
    }

    /// **Scenario**: a role with no assigned model yields ModelUnavailable.
    #[tokio::test]
    async fn missing_assignment_yields_model_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let catalog = Arc::new(
            ModelCatalog::open(dir.path().join("models.json"), dir.path().join("models"))
                .unwrap(),
        );
        let service = LlmService::new(catalog, runner, 3);
        let result = service.get_client(ChatRole::Character, None).await;
        let err = match result {
            Err(e) => e,
            Ok(_) => panic!("expected ModelUnavailable error"),
        };
        assert!(matches!(err, AgentError::ModelUnavailable(_)), "{err}");
    }

    /// **Scenario**: count_tokens estimates per message when no backend runs.
    #[tokio::test]
    async fn count_tokens_estimates_without_backend() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let catalog = catalog_with_models(dir.path(), 1);
        let service = LlmService::new(catalog, runner, 3);
        let messages = vec![Message::human("x".repeat(8)), Message::ai("y".repeat(4))];
        assert_eq!(service.count_tokens(&messages).await, 3);
        assert_eq!(service.count_tokens(&[]).await, 0);
    }
}
