//! LLM client abstraction for model-backed graph nodes.
//!
//! Nodes depend on [`ChatClient`] / [`EmbeddingClient`] instead of concrete
//! HTTP clients; implementations are the local OpenAI-compatible clients
//! ([`LocalChatClient`], [`LocalEmbeddingClient`]) and mocks for tests.
//! [`LlmService`] is the stateless factory handing out clients keyed by role.
//!
//! # Streaming
//!
//! `ChatClient` supports streaming via `invoke_stream()`, which accepts an
//! optional `Sender<MessageChunk>` for emitting tokens as they arrive. The
//! method still returns the complete [`LlmResponse`] at the end. The default
//! implementation calls `invoke()` and sends the full content as one chunk.

mod local;
mod mock;
mod service;

pub use local::{LocalChatClient, LocalEmbeddingClient};
pub use mock::{MockEmbedder, MockLlm};
pub use service::LlmService;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::AgentError;
use crate::message::{Message, ToolCall};
use crate::state::TokenLogprob;
use crate::stream::MessageChunk;

/// Token usage for one LLM call (prompt + completion).
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Response from an LLM completion.
///
/// **Interaction**: Returned by `ChatClient::invoke()`; nodes write `content`
/// into a new AI message and store `logprobs` into
/// `AgentState::generation_logprobs` for surprise-based memory formation.
#[derive(Debug, Default)]
pub struct LlmResponse {
    /// Assistant message content (plain text).
    pub content: String,
    /// Structured tool calls when the backend produced them; the ReAct loop
    /// additionally parses calls out of the text itself.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage for this call, when the backend returns it.
    pub usage: Option<LlmUsage>,
    /// Per-token log-probabilities of the generated text, when requested.
    pub logprobs: Option<Vec<TokenLogprob>>,
}

/// Chat roles served by the LLM service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    /// Conversational persona model.
    Character,
    /// Task execution model for the ReAct loop.
    Executor,
}

/// LLM chat client: given messages, returns assistant text with optional
/// usage and logprobs.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Invoke one turn: read messages, return the complete response.
    async fn invoke(&self, messages: &[Message]) -> Result<LlmResponse, AgentError>;

    /// Streaming variant: invoke with optional chunk sender for token
    /// streaming. Default implementation calls `invoke()` and sends the full
    /// content as one chunk.
    async fn invoke_stream(
        &self,
        messages: &[Message],
        chunk_tx: Option<mpsc::Sender<MessageChunk>>,
    ) -> Result<LlmResponse, AgentError> {
        let response = self.invoke(messages).await?;
        if let Some(tx) = chunk_tx {
            if !response.content.is_empty() {
                let _ = tx
                    .send(MessageChunk {
                        content: response.content.clone(),
                    })
                    .await;
            }
        }
        Ok(response)
    }
}

/// Produces fixed-size float vectors from text, one vector per input in the
/// same order.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, AgentError>;
}

/// Counts tokens for a text, typically via a backend tokenize RPC.
///
/// **Interaction**: The context window manager accepts an optional counter
/// and falls back to character estimation when counting fails.
#[async_trait]
pub trait TokenCounter: Send + Sync {
    async fn count_text(&self, text: &str) -> Result<usize, AgentError>;
}

/// Directory of model clients keyed by role: the dependency-injection seam
/// between the conversation graph and the LLM service.
///
/// **Interaction**: Implemented by [`LlmService`] for production and by test
/// doubles in integration tests.
#[async_trait]
pub trait LlmDirectory: Send + Sync {
    /// Chat client for a role; `task_type` selects an executor variant.
    async fn get_client(
        &self,
        role: ChatRole,
        task_type: Option<&str>,
    ) -> Result<Arc<dyn ChatClient>, AgentError>;

    async fn get_embedding_client(&self) -> Result<Arc<dyn EmbeddingClient>, AgentError>;

    /// Total token count for the messages, estimated when no backend is up.
    async fn count_tokens(&self, messages: &[Message]) -> usize;

    /// Shuts down every backing runner.
    async fn cleanup(&self);
}

/// Adapts an [`LlmDirectory`] into a [`TokenCounter`] for the context
/// window manager.
pub struct DirectoryCounter(pub Arc<dyn LlmDirectory>);

#[async_trait]
impl TokenCounter for DirectoryCounter {
    async fn count_text(&self, text: &str) -> Result<usize, AgentError> {
        Ok(self.0.count_tokens(&[Message::human(text)]).await)
    }
}
