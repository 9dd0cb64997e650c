//! Clients for the local OpenAI-compatible backend endpoints.
//!
//! [`LocalChatClient`] posts to `/v1/chat/completions` on a runner-managed
//! port, with `logprobs` enabled and the sampling parameters the backend
//! accepts outside the standard schema (`top_p`, `top_k`, `repeat_penalty`)
//! carried in an `extra_body` envelope. Streaming parses the SSE chunk
//! format. [`LocalEmbeddingClient`] posts to `/v1/embeddings`.
//!
//! Transient transport failures and 5xx responses are retried up to 3 times
//! with exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use env_config::ModelSettings;

use crate::error::AgentError;
use crate::message::Message;
use crate::state::TokenLogprob;
use crate::stream::MessageChunk;

use super::{ChatClient, EmbeddingClient, LlmResponse, LlmUsage};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(200);

#[derive(Serialize)]
struct ExtraBody {
    top_p: f32,
    top_k: u32,
    repeat_penalty: f32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    temperature: f32,
    logprobs: bool,
    extra_body: ExtraBody,
}

#[derive(Deserialize, Default)]
struct WireLogprobEntry {
    #[serde(default)]
    token: String,
    #[serde(default)]
    logprob: f32,
}

#[derive(Deserialize, Default)]
struct WireLogprobs {
    #[serde(default)]
    content: Vec<WireLogprobEntry>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    logprobs: Option<WireLogprobs>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    #[serde(default)]
    logprobs: Option<WireLogprobs>,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

fn wire_role(message: &Message) -> &'static str {
    match message {
        Message::Human { .. } => "user",
        Message::Ai { .. } => "assistant",
        Message::System { .. } => "system",
        Message::Tool { .. } => "tool",
    }
}

fn usage_from(wire: Option<WireUsage>) -> Option<LlmUsage> {
    wire.map(|u| LlmUsage {
        prompt_tokens: u.prompt_tokens,
        completion_tokens: u.completion_tokens,
        total_tokens: u.total_tokens,
    })
}

fn logprobs_from(wire: Option<WireLogprobs>) -> Option<Vec<TokenLogprob>> {
    let entries = wire?.content;
    if entries.is_empty() {
        return None;
    }
    Some(
        entries
            .into_iter()
            .map(|e| TokenLogprob {
                token: e.token,
                logprob: e.logprob,
            })
            .collect(),
    )
}

/// Chat client bound to one backend process port.
pub struct LocalChatClient {
    http: reqwest::Client,
    base_url: String,
    model_key: String,
    settings: ModelSettings,
}

impl LocalChatClient {
    pub fn new(port: u16, model_key: impl Into<String>, settings: ModelSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("http://127.0.0.1:{port}"),
            model_key: model_key.into(),
            settings,
        }
    }

    fn request_body<'a>(&'a self, messages: &'a [Message], stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model_key,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: wire_role(m),
                    content: m.content(),
                })
                .collect(),
            stream,
            temperature: self.settings.temperature,
            logprobs: self.settings.logprobs,
            extra_body: ExtraBody {
                top_p: self.settings.top_p,
                top_k: self.settings.top_k,
                repeat_penalty: self.settings.repeat_penalty,
            },
        }
    }

    /// Sends the request, retrying transport errors and 5xx responses.
    async fn send_with_retry(
        &self,
        messages: &[Message],
        stream: bool,
    ) -> Result<reqwest::Response, AgentError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut last_error = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
            }
            let result = self
                .http
                .post(&url)
                .json(&self.request_body(messages, stream))
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_server_error() => {
                    last_error = format!("HTTP {}", resp.status());
                    debug!(model_key = %self.model_key, attempt, %last_error, "chat request retrying");
                }
                Ok(resp) if !resp.status().is_success() => {
                    return Err(AgentError::ExecutionFailed(format!(
                        "chat completion failed: HTTP {}",
                        resp.status()
                    )));
                }
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    last_error = err.to_string();
                    debug!(model_key = %self.model_key, attempt, %last_error, "chat request retrying");
                }
            }
        }
        warn!(model_key = %self.model_key, %last_error, "chat request failed after retries");
        Err(AgentError::ExecutionFailed(format!(
            "chat completion failed after {MAX_ATTEMPTS} attempts: {last_error}"
        )))
    }
}

#[async_trait]
impl ChatClient for LocalChatClient {
    async fn invoke(&self, messages: &[Message]) -> Result<LlmResponse, AgentError> {
        let response = self.send_with_retry(messages, false).await?;
        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::ExecutionFailed(format!("chat response parse: {e}")))?;

        let mut choices = body.choices;
        if choices.is_empty() {
            return Err(AgentError::ExecutionFailed(
                "chat completion returned no choices".into(),
            ));
        }
        let choice = choices.remove(0);
        Ok(LlmResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: Vec::new(),
            usage: usage_from(body.usage),
            logprobs: logprobs_from(choice.logprobs),
        })
    }

    async fn invoke_stream(
        &self,
        messages: &[Message],
        chunk_tx: Option<mpsc::Sender<MessageChunk>>,
    ) -> Result<LlmResponse, AgentError> {
        let response = self.send_with_retry(messages, true).await?;
        let mut byte_stream = response.bytes_stream();

        let mut buffer = String::new();
        let mut content = String::new();
        let mut logprobs: Vec<TokenLogprob> = Vec::new();
        let mut usage: Option<LlmUsage> = None;

        while let Some(bytes) = byte_stream.next().await {
            let bytes =
                bytes.map_err(|e| AgentError::ExecutionFailed(format!("chat stream: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            // SSE events are separated by a blank line; process complete lines only.
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                let chunk: ChatChunk = match serde_json::from_str(data) {
                    Ok(c) => c,
                    Err(err) => {
                        debug!(error = %err, "skipping unparseable SSE chunk");
                        continue;
                    }
                };
                if let Some(u) = usage_from(chunk.usage) {
                    usage = Some(u);
                }
                for choice in chunk.choices {
                    if let Some(delta) = choice.delta.content {
                        if !delta.is_empty() {
                            content.push_str(&delta);
                            if let Some(tx) = &chunk_tx {
                                let _ = tx
                                    .send(MessageChunk {
                                        content: delta.clone(),
                                    })
                                    .await;
                            }
                        }
                    }
                    if let Some(entries) = logprobs_from(choice.logprobs) {
                        logprobs.extend(entries);
                    }
                }
            }
        }

        Ok(LlmResponse {
            content,
            tool_calls: Vec::new(),
            usage,
            logprobs: if logprobs.is_empty() {
                None
            } else {
                Some(logprobs)
            },
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingDatum>,
}

/// Embedding client bound to one backend process port.
pub struct LocalEmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    model_key: String,
}

impl LocalEmbeddingClient {
    pub fn new(port: u16, model_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("http://127.0.0.1:{port}"),
            model_key: model_key.into(),
        }
    }
}

#[async_trait]
impl EmbeddingClient for LocalEmbeddingClient {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, AgentError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/v1/embeddings", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&EmbeddingRequest {
                model: &self.model_key,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| AgentError::ExecutionFailed(format!("embedding request: {e}")))?;
        if !response.status().is_success() {
            return Err(AgentError::ExecutionFailed(format!(
                "embedding request failed: HTTP {}",
                response.status()
            )));
        }
        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AgentError::ExecutionFailed(format!("embedding response parse: {e}")))?;
        if body.data.len() != texts.len() {
            return Err(AgentError::ExecutionFailed(format!(
                "embedding count mismatch: {} inputs, {} vectors",
                texts.len(),
                body.data.len()
            )));
        }
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}
