//! Retrieval-augmented context: chunk collection, embedding and ranking.
//!
//! [`RagEngine`] collects text chunks from the top web search result (via
//! the tool fabric's fetch tool) and from attachments. [`RagContextBuilder`]
//! embeds the query and the chunks (in batches, tolerating per-batch
//! failures), ranks by cosine similarity and assembles a source-annotated
//! context block.

mod splitter;

pub use splitter::RecursiveTextSplitter;

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::llm::EmbeddingClient;
use crate::memory::cosine_similarity;
use crate::state::Attachment;
use crate::tools::{parse_tool_error, ToolFabric, TOOL_WEB_FETCH};

/// Default chunking parameters.
pub const CHUNK_SIZE: usize = 500;
pub const CHUNK_OVERLAP: usize = 50;
/// Chunks embedded per batch.
pub const EMBEDDING_BATCH_SIZE: usize = 32;
/// Chunks kept in the final context.
pub const TOP_K_CHUNKS: usize = 5;
/// Context block size cap in characters.
pub const MAX_CONTEXT_CHARS: usize = 3000;

/// Collects text chunks from web content and attachments.
pub struct RagEngine {
    splitter: RecursiveTextSplitter,
}

impl RagEngine {
    pub fn new() -> Self {
        Self {
            splitter: RecursiveTextSplitter::new(CHUNK_SIZE, CHUNK_OVERLAP),
        }
    }

    /// Collects `(chunk_texts, chunk_sources)` from an optional top result
    /// URL and the attachments.
    ///
    /// Web fetching runs through the fabric's fetch tool and is skipped on
    /// `skip_web_fetch`, on error envelopes, and on empty content.
    /// Attachment chunks are tagged `file:{path}`.
    pub async fn collect_chunks(
        &self,
        top_url: Option<&str>,
        attachments: &[Attachment],
        tool_executor: Option<&Arc<ToolFabric>>,
        skip_web_fetch: bool,
    ) -> (Vec<String>, Vec<String>) {
        let mut chunk_texts = Vec::new();
        let mut chunk_sources = Vec::new();

        match (top_url, tool_executor, skip_web_fetch) {
            (Some(url), Some(fabric), false) => {
                let payload = fabric.aexecute(TOOL_WEB_FETCH, json!({"url": url})).await;
                if let Some(error) = parse_tool_error(&payload) {
                    warn!(url, %error, "web fetch failed; skipping web chunks");
                } else if payload.trim().is_empty() {
                    warn!(url, "web fetch returned empty content");
                } else {
                    let chunks = self.splitter.split_text(&payload);
                    debug!(url, chunks = chunks.len(), "web content chunked");
                    for chunk in chunks {
                        chunk_texts.push(chunk);
                        chunk_sources.push(url.to_string());
                    }
                }
            }
            (_, _, true) => {
                info!("web fetch disabled - using attachments only for RAG");
            }
            _ => {}
        }

        for attachment in attachments {
            if attachment.content.trim().is_empty() {
                continue;
            }
            let source = format!(
                "file:{}",
                attachment.path.as_deref().unwrap_or(&attachment.name)
            );
            for chunk in self.splitter.split_text(&attachment.content) {
                chunk_texts.push(chunk);
                chunk_sources.push(source.clone());
            }
        }

        (chunk_texts, chunk_sources)
    }
}

impl Default for RagEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Ranks chunks against a query and assembles the context block.
pub struct RagContextBuilder {
    batch_size: usize,
    top_k: usize,
    max_context_chars: usize,
}

impl RagContextBuilder {
    pub fn new() -> Self {
        Self {
            batch_size: EMBEDDING_BATCH_SIZE,
            top_k: TOP_K_CHUNKS,
            max_context_chars: MAX_CONTEXT_CHARS,
        }
    }

    /// Embeds the query and the chunks, ranks by cosine similarity and joins
    /// the top chunks into a `[Source: ...]`-annotated block.
    ///
    /// Per-batch embedding failures are tolerated (failed batches drop out);
    /// an unusable query embedding yields the empty context.
    pub async fn build_context(
        &self,
        chunk_texts: &[String],
        chunk_sources: &[String],
        query: &str,
        embedding_client: &Arc<dyn EmbeddingClient>,
    ) -> String {
        if chunk_texts.is_empty() {
            return String::new();
        }

        let query_embedding = match embedding_client.embed(&[query]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
            Ok(_) | Err(_) => {
                warn!("query embedding failed; returning empty RAG context");
                return String::new();
            }
        };

        // Embed chunks in batches; a failed batch is logged and skipped.
        let mut scored: Vec<(f32, usize)> = Vec::new();
        for (batch_index, batch) in chunk_texts.chunks(self.batch_size).enumerate() {
            let refs: Vec<&str> = batch.iter().map(String::as_str).collect();
            match embedding_client.embed(&refs).await {
                Ok(embeddings) => {
                    for (offset, embedding) in embeddings.iter().enumerate() {
                        let index = batch_index * self.batch_size + offset;
                        scored.push((cosine_similarity(&query_embedding, embedding), index));
                    }
                }
                Err(err) => {
                    warn!(batch = batch_index, error = %err, "chunk embedding batch failed; skipping");
                }
            }
        }
        if scored.is_empty() {
            return String::new();
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut blocks = Vec::new();
        for &(_, index) in scored.iter().take(self.top_k) {
            let source = chunk_sources
                .get(index)
                .map(String::as_str)
                .unwrap_or("unknown");
            blocks.push(format!("[Source: {source}]\n{}", chunk_texts[index]));
        }

        let mut context = blocks.join("\n\n---\n\n");
        if context.len() > self.max_context_chars {
            let mut cut = self.max_context_chars;
            while cut > 0 && !context.is_char_boundary(cut) {
                cut -= 1;
            }
            context.truncate(cut);
        }
        debug!(chars = context.len(), "RAG context assembled");
        context
    }
}

impl Default for RagContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::AgentError;
    use crate::llm::MockEmbedder;

    fn attachment(name: &str, content: &str) -> Attachment {
        Attachment {
            name: name.to_string(),
            path: None,
            content: content.to_string(),
        }
    }

    /// **Scenario**: attachments are chunked and tagged `file:{name}` when
    /// no path is given; web fetch is skipped when disabled.
    #[tokio::test]
    async fn attachments_chunked_and_tagged() {
        let engine = RagEngine::new();
        let (texts, sources) = engine
            .collect_chunks(
                Some("https://example.org"),
                &[attachment("notes.txt", "Some attachment content here.")],
                None,
                true,
            )
            .await;
        assert_eq!(texts.len(), 1);
        assert_eq!(sources, vec!["file:notes.txt"]);
    }

    /// **Scenario**: empty attachments produce no chunks.
    #[tokio::test]
    async fn empty_attachment_skipped() {
        let engine = RagEngine::new();
        let (texts, _) = engine
            .collect_chunks(None, &[attachment("empty.txt", "   ")], None, false)
            .await;
        assert!(texts.is_empty());
    }

    /// **Scenario**: build_context ranks the matching chunk first and
    /// prefixes sources.
    #[tokio::test]
    async fn context_ranks_by_similarity() {
        let builder = RagContextBuilder::new();
        let client: Arc<dyn EmbeddingClient> = Arc::new(MockEmbedder::default());
        let texts = vec![
            "rust borrow checker ownership".to_string(),
            "cooking pasta with tomatoes".to_string(),
        ];
        let sources = vec!["a".to_string(), "b".to_string()];
        let context = builder
            .build_context(&texts, &sources, "rust borrow checker ownership", &client)
            .await;
        assert!(context.starts_with("[Source: a]"), "{context}");
        assert!(context.contains("---"), "separator between blocks");
    }

    /// **Scenario**: empty chunk list yields the empty context.
    #[tokio::test]
    async fn empty_chunks_empty_context() {
        let builder = RagContextBuilder::new();
        let client: Arc<dyn EmbeddingClient> = Arc::new(MockEmbedder::default());
        let context = builder.build_context(&[], &[], "query", &client).await;
        assert!(context.is_empty());
    }

    /// **Scenario**: the context block is truncated at the character cap.
    #[tokio::test]
    async fn context_truncated_at_cap() {
        let builder = RagContextBuilder::new();
        let client: Arc<dyn EmbeddingClient> = Arc::new(MockEmbedder::default());
        let texts: Vec<String> = (0..10).map(|i| format!("chunk {i} {}", "x".repeat(480))).collect();
        let sources: Vec<String> = (0..10).map(|i| format!("s{i}")).collect();
        let context = builder.build_context(&texts, &sources, "chunk", &client).await;
        assert!(context.len() <= MAX_CONTEXT_CHARS);
    }

    /// Embedder that fails for batches containing a marker string.
    struct FlakyEmbedder;

    #[async_trait]
    impl EmbeddingClient for FlakyEmbedder {
        async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, AgentError> {
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(AgentError::ExecutionFailed("batch failed".into()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    /// **Scenario**: a failing embedding batch is skipped, not fatal.
    #[tokio::test]
    async fn failing_batch_tolerated() {
        let builder = RagContextBuilder {
            batch_size: 1,
            top_k: 5,
            max_context_chars: MAX_CONTEXT_CHARS,
        };
        let client: Arc<dyn EmbeddingClient> = Arc::new(FlakyEmbedder);
        let texts = vec!["good chunk".to_string(), "poison chunk".to_string()];
        let sources = vec!["a".to_string(), "b".to_string()];
        let context = builder.build_context(&texts, &sources, "query", &client).await;
        assert!(context.contains("good chunk"));
        assert!(!context.contains("poison"));
    }
}
