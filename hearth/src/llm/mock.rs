//! Mock LLM and embedding clients for tests.
//!
//! `MockLlm` returns scripted responses in order, then repeats a default.
//! `MockEmbedder` produces deterministic vectors from text content so cosine
//! comparisons are stable across runs.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::AgentError;
use crate::message::Message;
use crate::state::TokenLogprob;

use super::{ChatClient, EmbeddingClient, LlmResponse};

/// Scripted chat client.
pub struct MockLlm {
    default_content: String,
    scripted: Mutex<VecDeque<LlmResponse>>,
}

impl MockLlm {
    /// Client that always answers with `content`.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            default_content: content.into(),
            scripted: Mutex::new(VecDeque::new()),
        }
    }

    /// Queues responses returned (in order) before the default kicks in.
    pub fn with_responses(self, responses: Vec<LlmResponse>) -> Self {
        {
            let mut scripted = self
                .scripted
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            scripted.extend(responses);
        }
        self
    }

    /// Convenience: a response whose logprobs mark every whitespace token of
    /// `content` with the given logprob.
    pub fn response_with_uniform_logprobs(content: &str, logprob: f32) -> LlmResponse {
        LlmResponse {
            content: content.to_string(),
            logprobs: Some(
                content
                    .split_whitespace()
                    .map(|token| TokenLogprob {
                        token: token.to_string(),
                        logprob,
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ChatClient for MockLlm {
    async fn invoke(&self, _messages: &[Message]) -> Result<LlmResponse, AgentError> {
        let scripted = self
            .scripted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        Ok(scripted.unwrap_or_else(|| LlmResponse {
            content: self.default_content.clone(),
            ..Default::default()
        }))
    }
}

/// Deterministic embedding client: hashes each text into a fixed-size vector.
/// Identical texts embed identically; different texts almost surely differ.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(16)
    }
}

#[async_trait]
impl EmbeddingClient for MockEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, AgentError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; self.dimension];
                for (i, byte) in text.bytes().enumerate() {
                    vector[i % self.dimension] += f32::from(byte) / 255.0;
                }
                // Unit-normalize so cosine similarity behaves.
                let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for x in &mut vector {
                        *x /= norm;
                    }
                }
                vector
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: scripted responses come back in order, then the default repeats.
    #[tokio::test]
    async fn scripted_responses_then_default() {
        let llm = MockLlm::new("default").with_responses(vec![
            LlmResponse {
                content: "first".into(),
                ..Default::default()
            },
            LlmResponse {
                content: "second".into(),
                ..Default::default()
            },
        ]);
        assert_eq!(llm.invoke(&[]).await.unwrap().content, "first");
        assert_eq!(llm.invoke(&[]).await.unwrap().content, "second");
        assert_eq!(llm.invoke(&[]).await.unwrap().content, "default");
        assert_eq!(llm.invoke(&[]).await.unwrap().content, "default");
    }

    /// **Scenario**: uniform-logprob helper emits one entry per whitespace token.
    #[test]
    fn uniform_logprobs_one_per_token() {
        let response = MockLlm::response_with_uniform_logprobs("a b c", -0.1);
        let logprobs = response.logprobs.unwrap();
        assert_eq!(logprobs.len(), 3);
        assert!(logprobs.iter().all(|l| (l.logprob + 0.1).abs() < 1e-6));
    }

    /// **Scenario**: embeddings are deterministic and unit-length.
    #[tokio::test]
    async fn mock_embedder_deterministic_unit_vectors() {
        let embedder = MockEmbedder::default();
        let a = embedder.embed(&["hello"]).await.unwrap();
        let b = embedder.embed(&["hello", "world"]).await.unwrap();
        assert_eq!(a[0], b[0], "same text embeds identically");
        assert_ne!(b[0], b[1], "different texts differ");
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
