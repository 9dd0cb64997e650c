//! Application facade: assembles every component and owns their lifecycle.
//!
//! Construction is explicit dependency injection: the builder takes the
//! validated config plus optional component overrides (LLM directory,
//! history store, vector store, tool providers, prompts) and wires the rest.
//! `process_user_request` is the per-request entry point, yielding graph
//! events through an async stream and committing history when the turn
//! completes.

mod sanitize;

pub use sanitize::{process_attachments, sanitize_user_input};

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use env_config::AppConfig;

use crate::agent::{extract_routing_tag, ConversationGraph, GraphDeps};
use crate::context::ContextWindowManager;
use crate::graph::{ApprovalFn, CompilationError, CompiledStateGraph, RunConfig};
use crate::llm::{LlmDirectory, LlmService};
use crate::memory::{EmConfig, EpisodicMemory, InMemoryVectorStore, VectorStore};
use crate::message::Message;
use crate::prompts::{PromptResolver, StaticPrompts};
use crate::rag::{RagContextBuilder, RagEngine};
use crate::registry::{ModelCatalog, RegistryError};
use crate::runner::ProcessRunner;
use crate::session::{HistoryStore, InMemoryHistoryStore, SessionManager};
use crate::state::{AgentState, Attachment, InputMode};
use crate::stream::StreamEvent;
use crate::tools::{NativeToolProvider, ToolFabric, ToolProvider};

/// Errors surfaced during facade construction.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration invalid: {0}")]
    Config(#[from] env_config::ConfigError),
    #[error("model registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("graph compilation: {0}")]
    Compile(#[from] CompilationError),
}

/// One user request into [`App::process_user_request`].
#[derive(Clone, Default)]
pub struct UserRequest {
    pub input: String,
    pub mode: Option<InputMode>,
    pub attachments: Vec<Attachment>,
    pub skip_web_search: bool,
    pub session_id: String,
    /// Agent mode hint ("high" | "fast" | "direct"); routing tags override it.
    pub agent_mode: Option<String>,
    /// Per-request approval callback for dangerous tools.
    pub approval: Option<ApprovalFn>,
}

impl UserRequest {
    pub fn new(session_id: impl Into<String>, input: impl Into<String>, mode: InputMode) -> Self {
        Self {
            input: input.into(),
            mode: Some(mode),
            session_id: session_id.into(),
            ..Default::default()
        }
    }
}

/// Builder for [`App`]. Components left unset are constructed from config.
pub struct AppBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmDirectory>>,
    history: Option<Arc<dyn HistoryStore>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    providers: Option<Vec<Arc<dyn ToolProvider>>>,
    prompts: Option<Arc<dyn PromptResolver>>,
    enable_memory: bool,
}

impl AppBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            history: None,
            vector_store: None,
            providers: None,
            prompts: None,
            enable_memory: true,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmDirectory>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_history_store(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    pub fn with_tool_providers(mut self, providers: Vec<Arc<dyn ToolProvider>>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn with_prompts(mut self, prompts: Arc<dyn PromptResolver>) -> Self {
        self.prompts = Some(prompts);
        self
    }

    /// Disables episodic memory; the graph compiles in its degraded variant.
    pub fn without_memory(mut self) -> Self {
        self.enable_memory = false;
        self
    }

    /// Validates the config and initializes every component in dependency
    /// order: sessions → history → tool fabric → model registry → LLM
    /// service → context manager → RAG → memory (best-effort) → graph.
    pub async fn build(self) -> Result<App, AppError> {
        self.config.validate()?;
        info!("initializing hearth app");

        let history: Arc<dyn HistoryStore> = self
            .history
            .unwrap_or_else(|| Arc::new(InMemoryHistoryStore::new()));
        let vector_store: Arc<dyn VectorStore> = self
            .vector_store
            .unwrap_or_else(|| Arc::new(InMemoryVectorStore::new()));
        let sessions = Arc::new(SessionManager::new(
            history.clone(),
            Some(vector_store.clone()),
        ));

        let providers = self.providers.unwrap_or_else(|| {
            vec![Arc::new(NativeToolProvider::new(
                self.config.tools.clone(),
                self.config.privacy.clone(),
            )) as Arc<dyn ToolProvider>]
        });
        let tools = Arc::new(ToolFabric::new(
            providers,
            std::time::Duration::from_secs(self.config.limits.tool_execution_timeout_secs),
            &self.config.tools,
        ));
        tools.initialize().await;

        let llm: Arc<dyn LlmDirectory> = match self.llm {
            Some(llm) => llm,
            None => {
                let catalog = Arc::new(ModelCatalog::open(
                    self.config.runner.models_dir.join("models.json"),
                    self.config.runner.models_dir.clone(),
                )?);
                let runner = Arc::new(ProcessRunner::new(self.config.runner.clone()));
                Arc::new(LlmService::new(catalog, runner, self.config.runner.cache_size))
            }
        };

        let context = Arc::new(ContextWindowManager::new(
            self.config.limits.max_local_context_tokens,
        ));
        let rag_engine = Arc::new(RagEngine::new());
        let rag_builder = Arc::new(RagContextBuilder::new());
        let prompts: Arc<dyn PromptResolver> = self
            .prompts
            .unwrap_or_else(|| Arc::new(StaticPrompts::new()));

        // Episodic memory is best-effort: a missing embedding model degrades
        // the app instead of failing initialization.
        let memory = if self.enable_memory {
            match llm.get_embedding_client().await {
                Ok(embedding) => Some(Arc::new(EpisodicMemory::new(
                    EmConfig::from(&self.config.em),
                    embedding,
                    vector_store.clone(),
                ))),
                Err(err) => {
                    warn!(error = %err, "episodic memory unavailable; continuing degraded");
                    None
                }
            }
        } else {
            None
        };

        let graph = ConversationGraph::build(GraphDeps {
            llm: llm.clone(),
            context,
            rag_engine,
            rag_builder,
            tools: tools.clone(),
            memory,
            prompts,
            max_local_tokens: self.config.limits.max_local_context_tokens,
        })?;

        info!("hearth app initialized");
        Ok(App {
            config: self.config,
            sessions,
            history,
            tools,
            llm,
            graph,
        })
    }
}

/// The assembled runtime.
pub struct App {
    config: AppConfig,
    sessions: Arc<SessionManager>,
    history: Arc<dyn HistoryStore>,
    tools: Arc<ToolFabric>,
    llm: Arc<dyn LlmDirectory>,
    graph: CompiledStateGraph<AgentState>,
}

impl App {
    pub fn builder(config: AppConfig) -> AppBuilder {
        AppBuilder::new(config)
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn tools(&self) -> &Arc<ToolFabric> {
        &self.tools
    }

    /// Processes one user request, yielding typed graph events.
    ///
    /// The returned stream emits `on_chat_model_stream` chunks while the
    /// model generates and ends with `on_graph_end` carrying the final
    /// state. Dropping the stream cancels the run at the next node boundary;
    /// a cancelled turn commits nothing to history.
    pub fn process_user_request(
        &self,
        request: UserRequest,
    ) -> ReceiverStream<StreamEvent<AgentState>> {
        let (tx, rx) = mpsc::channel(128);

        let graph = self.graph.clone();
        let history = self.history.clone();
        let sessions = self.sessions.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let session_id = request.session_id.clone();
            info!(%session_id, mode = ?request.mode, "process_user_request");
            let resources = sessions.get_session_resources(&session_id);

            // 1. Sanitize.
            let sanitized = sanitize_user_input(
                &request.input,
                config.limits.max_input_length,
                &config.limits.dangerous_patterns,
            );

            // 2. Routing tag override.
            let (input, tag_agent_mode) = extract_routing_tag(&sanitized);
            let mut final_mode = request.mode.unwrap_or(InputMode::Direct);
            let mut agent_mode = request.agent_mode.clone();
            if let Some(tag_mode) = tag_agent_mode {
                final_mode = InputMode::Agent;
                agent_mode = Some(tag_mode);
            }
            if final_mode == InputMode::Agent && agent_mode.is_none() {
                agent_mode = Some("fast".to_string());
            }

            // 3. Attachments (best-effort decode; only used in search mode).
            let attachments =
                process_attachments(request.attachments, config.limits.search_attachment_size);

            // 4. Search metadata and privacy policy.
            let mut skip_web_search = request.skip_web_search;
            if final_mode == InputMode::Search && !config.privacy.allow_web_search {
                if !skip_web_search {
                    info!("web search disabled by privacy settings; forcing skip_web_search");
                }
                skip_web_search = true;
            }

            // 5. Recent history.
            let recent_history = match history
                .latest(&session_id, config.history.default_history_limit)
                .await
            {
                Ok(messages) => messages,
                Err(err) => {
                    error!(error = %err, "history load failed; starting from empty history");
                    Vec::new()
                }
            };

            // 6. Initial state, then stream the graph.
            let mut state =
                AgentState::initial(session_id.clone(), input.clone(), final_mode, recent_history);
            state.agent_mode = agent_mode;
            if final_mode == InputMode::Search {
                state.search_query = Some(input.clone());
                state.search_attachments = attachments;
                state.skip_web_search = skip_web_search;
            }

            let run_config = RunConfig {
                recursion_limit: Some(config.limits.graph_recursion_limit),
                approval: request.approval.clone(),
            };

            let mut inner = graph.stream(state, Some(run_config));
            let mut accumulated = String::new();
            let mut final_state: Option<AgentState> = None;
            let mut cancelled = false;

            while let Some(event) = inner.next().await {
                match &event {
                    StreamEvent::ChatModelStream { chunk, .. } => {
                        accumulated.push_str(&chunk.content);
                    }
                    StreamEvent::GraphEnd(state) => {
                        final_state = Some(state.clone());
                    }
                    _ => {}
                }
                if tx.send(event).await.is_err() {
                    cancelled = true;
                    break;
                }
            }
            if cancelled {
                info!(%session_id, "request cancelled; skipping history commit");
                return;
            }

            // 7. Commit history under the session write lock: overwrite with
            // the graph's history when present, otherwise append the turn.
            let _write_guard = resources.write_lock.lock().await;
            let now_iso = chrono::Utc::now().to_rfc3339();
            let mode_value = serde_json::json!(final_mode.as_str());

            let committed = match final_state.as_ref().filter(|s| !s.chat_history.is_empty()) {
                Some(state) => {
                    let mut final_history = state.chat_history.clone();
                    let tail_start = final_history.len().saturating_sub(2);
                    for message in final_history.iter_mut().skip(tail_start) {
                        *message = message
                            .clone()
                            .with_default_attribute("mode", mode_value.clone())
                            .with_default_attribute("timestamp", serde_json::json!(now_iso));
                    }
                    history.overwrite(&session_id, &final_history).await
                }
                None => {
                    let annotate = |message: Message| {
                        message
                            .with_default_attribute("mode", mode_value.clone())
                            .with_default_attribute("timestamp", serde_json::json!(now_iso))
                    };
                    history
                        .append(
                            &session_id,
                            &[
                                annotate(Message::human(input.clone())),
                                annotate(Message::ai(accumulated.clone())),
                            ],
                        )
                        .await
                }
            };
            if let Err(err) = committed {
                error!(error = %err, "history commit failed");
            }

            // 8. Touch and trim.
            if let Err(err) = history.touch(&session_id).await {
                warn!(error = %err, "session touch failed");
            }
            if let Err(err) = history
                .trim(&session_id, config.history.keep_last)
                .await
            {
                warn!(error = %err, "history trim failed");
            }
        });

        ReceiverStream::new(rx)
    }

    /// Shuts the runtime down in reverse initialization order: LLM service
    /// (stopping all runners), then sessions.
    pub async fn shutdown(&self) {
        info!("shutting down hearth app");
        self.llm.cleanup().await;
        for session_id in self.sessions.list_active_sessions() {
            self.sessions.release_session(&session_id);
        }
        info!("hearth app shut down");
    }
}
