//! Direct answer node: streaming chat with hierarchical context.
//!
//! Context layout per prompt: attention sink, persona and system text, the
//! retrieved memory block, then the token-trimmed local history. The reply
//! streams through the run context and lands in `chat_history`; generation
//! logprobs are captured for surprise-based memory formation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::context::ContextWindowManager;
use crate::error::AgentError;
use crate::graph::{Next, Node, RunContext};
use crate::llm::{ChatRole, DirectoryCounter, LlmDirectory, LlmResponse};
use crate::message::Message;
use crate::prompts::{keys, PromptResolver, ATTENTION_SINK_PREFIX};
use crate::state::AgentState;
use crate::stream::ChunkToStreamSender;

use super::node_ids;

/// Shown when the model produced neither text nor an error.
const EMPTY_RESPONSE_FALLBACK: &str =
    "No text response from the model. Please try again or check the backend.";
/// Shown when the character model cannot be started at all.
const MODEL_UNAVAILABLE_FALLBACK: &str =
    "The language model is currently unavailable. Please check the model configuration and try again.";

pub struct DirectAnswerNode {
    llm: Arc<dyn LlmDirectory>,
    context: Arc<ContextWindowManager>,
    prompts: Arc<dyn PromptResolver>,
    max_local_tokens: usize,
}

impl DirectAnswerNode {
    pub fn new(
        llm: Arc<dyn LlmDirectory>,
        context: Arc<ContextWindowManager>,
        prompts: Arc<dyn PromptResolver>,
        max_local_tokens: usize,
    ) -> Self {
        Self {
            llm,
            context,
            prompts,
            max_local_tokens,
        }
    }

    async fn build_messages(&self, state: &AgentState) -> Vec<Message> {
        let persona = self.prompts.resolve_or(keys::PERSONA, "");
        let system_prompt = self.prompts.resolve_or(keys::DIRECT_SYSTEM, "");
        let retrieved_memory = state
            .synthesized_memory
            .clone()
            .unwrap_or_else(|| "No relevant memories found.".to_string());

        let counter = DirectoryCounter(self.llm.clone());
        let (local_context, tokens) = self
            .context
            .build_local_context(&state.chat_history, Some(self.max_local_tokens), Some(&counter))
            .await;

        let mut system_parts = vec![
            ATTENTION_SINK_PREFIX.to_string(),
            String::new(),
            persona,
            String::new(),
            system_prompt,
            String::new(),
            "<retrieved_memory>".to_string(),
            retrieved_memory,
            "</retrieved_memory>".to_string(),
        ];
        if local_context.len() != state.chat_history.len() {
            info!(
                kept = local_context.len(),
                total = state.chat_history.len(),
                tokens,
                "conversation context trimmed"
            );
            system_parts.push(String::new());
            system_parts
                .push("... (earlier conversation omitted; rely on long-term memories) ...".into());
            system_parts.push("--- Recent conversation context ---".into());
        }

        let mut messages = vec![Message::system(system_parts.join("\n"))];
        messages.extend(local_context);
        messages.push(Message::human(format!(
            "<user_input>{}</user_input>",
            state.input
        )));
        messages
    }
}

#[async_trait]
impl Node<AgentState> for DirectAnswerNode {
    fn id(&self) -> &str {
        node_ids::DIRECT_ANSWER
    }

    async fn run(&self, state: AgentState) -> Result<(AgentState, Next), AgentError> {
        let ctx = RunContext::new(Default::default());
        self.run_with_context(state, &ctx).await
    }

    async fn run_with_context(
        &self,
        mut state: AgentState,
        ctx: &RunContext<AgentState>,
    ) -> Result<(AgentState, Next), AgentError> {
        info!("node: direct answer");

        let response = match self.llm.get_client(ChatRole::Character, None).await {
            Ok(client) => {
                let messages = self.build_messages(&state).await;
                let result = if let Some(stream_tx) = ctx.stream_tx.clone() {
                    let adapter = ChunkToStreamSender::new(stream_tx, self.id());
                    let (chunk_tx, chunk_rx) = adapter.channel();
                    let (result, ()) = tokio::join!(
                        client.invoke_stream(&messages, Some(chunk_tx)),
                        adapter.forward(chunk_rx),
                    );
                    result
                } else {
                    client.invoke(&messages).await
                };
                match result {
                    Ok(response) => response,
                    Err(err) => {
                        error!(error = %err, "direct answer generation failed");
                        LlmResponse {
                            content: EMPTY_RESPONSE_FALLBACK.to_string(),
                            ..Default::default()
                        }
                    }
                }
            }
            Err(err) => {
                // Model unavailable: log and answer gracefully instead of
                // failing the turn.
                error!(error = %err, "character model unavailable");
                LlmResponse {
                    content: MODEL_UNAVAILABLE_FALLBACK.to_string(),
                    ..Default::default()
                }
            }
        };

        let content = if response.content.is_empty() {
            EMPTY_RESPONSE_FALLBACK.to_string()
        } else {
            response.content
        };

        state.chat_history.push(Message::human(state.input.clone()));
        state.chat_history.push(Message::ai(content));
        state.generation_logprobs = response.logprobs;
        Ok((state, Next::Continue))
    }
}
