//! Episodic memory pipeline: formation and retrieval.
//!
//! Orchestrates segmentation, boundary refinement, representative token
//! selection, storage and two-stage retrieval. Every public method is
//! best-effort: failures are logged and yield empty results so a user turn
//! never fails on degraded memory.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::llm::EmbeddingClient;
use crate::memory::store::VectorStore;
use crate::state::{RecalledEpisode, SurpriseStats, TokenLogprob};

use super::boundary::{cosine_similarity_matrix, refine_boundaries};
use super::retrieval::TwoStageRetrieval;
use super::segmenter::{
    build_events, enforce_event_size, identify_event_boundaries, sentence_change_scores,
    split_sentences, surprise_from_logprobs,
};
use super::types::{EmConfig, EpisodicEvent};

/// Episodic memory formation and retrieval over one vector store.
///
/// **Interaction**: Constructed by the facade (best-effort); the graph's
/// memory nodes call [`retrieve_relevant_memories`](Self::retrieve_relevant_memories)
/// on entry and the formation methods after the terminal node.
pub struct EpisodicMemory {
    config: EmConfig,
    embedding: Arc<dyn EmbeddingClient>,
    retrieval: TwoStageRetrieval,
}

impl EpisodicMemory {
    pub fn new(
        config: EmConfig,
        embedding: Arc<dyn EmbeddingClient>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        let retrieval = TwoStageRetrieval::new(store, config.clone());
        info!("episodic memory initialized");
        Self {
            config,
            embedding,
            retrieval,
        }
    }

    /// Surprise-based formation from generation logprobs (the preferred
    /// path). Returns the stored events; empty on any failure.
    pub async fn process_logprobs_for_memory(
        &self,
        logprobs: &[TokenLogprob],
    ) -> Vec<EpisodicEvent> {
        if logprobs.is_empty() {
            warn!("logprobs empty; skipping memory formation");
            return Vec::new();
        }

        let valid: Vec<&TokenLogprob> = logprobs.iter().filter(|l| !l.token.is_empty()).collect();
        if valid.is_empty() {
            warn!("no valid logprob entries after normalization; skipping memory formation");
            return Vec::new();
        }
        let tokens: Vec<String> = valid.iter().map(|l| l.token.clone()).collect();
        let owned: Vec<TokenLogprob> = valid.into_iter().cloned().collect();

        let scores = surprise_from_logprobs(&owned);
        let boundaries =
            identify_event_boundaries(&scores, self.config.surprise_window, self.config.surprise_gamma);
        let events = build_events(&tokens, &scores, &boundaries);
        let events =
            enforce_event_size(events, self.config.min_event_size, self.config.max_event_size);
        debug!(events = events.len(), tokens = tokens.len(), "surprise segmentation complete");

        // Attention keys are not exposed by the backend, so the surprise
        // path stores the initial boundaries unrefined.
        self.finalize_and_store(events).await
    }

    /// Semantic-change formation from a conversation turn (fallback when
    /// logprobs are unavailable). Returns the stored events; empty on any
    /// failure.
    pub async fn process_conversation_turn_for_memory(
        &self,
        _user_input: &str,
        ai_response: &str,
    ) -> Vec<EpisodicEvent> {
        if ai_response.is_empty() {
            warn!("ai response empty; aborting memory formation");
            return Vec::new();
        }

        let sentences = split_sentences(ai_response);
        if sentences.len() < 2 {
            debug!("text too short for semantic segmentation; single event");
            let tokens: Vec<String> = ai_response
                .split_whitespace()
                .map(str::to_string)
                .collect();
            if tokens.is_empty() {
                return Vec::new();
            }
            let scores = vec![0.0f32; tokens.len()];
            let end = tokens.len();
            let event = EpisodicEvent::new(tokens, 0, end, scores);
            return self.finalize_and_store(vec![event]).await;
        }

        let sentence_refs: Vec<&str> = sentences.iter().map(String::as_str).collect();
        let embeddings = match self.embedding.embed(&sentence_refs).await {
            Ok(embeddings) => embeddings,
            Err(err) => {
                error!(error = %err, "sentence embedding failed; skipping memory formation");
                return Vec::new();
            }
        };

        let change_scores = sentence_change_scores(&embeddings);
        let mut sentence_boundaries = identify_event_boundaries(
            &change_scores,
            self.config.surprise_window,
            self.config.surprise_gamma,
        );

        // Refinement runs in sentence-index space where the similarity
        // signal lives; events are built from the refined boundaries.
        if self.config.use_boundary_refinement && embeddings.len() > 1 {
            let matrix = cosine_similarity_matrix(&embeddings);
            sentence_boundaries = refine_boundaries(&sentence_boundaries, &matrix, &self.config);
        }

        let mut events = Vec::new();
        let mut token_offset = 0usize;
        for pair in sentence_boundaries.windows(2) {
            let (start_sentence, end_sentence) = (pair[0], pair[1].min(sentences.len()));
            if start_sentence >= end_sentence {
                continue;
            }
            let span_text = sentences[start_sentence..end_sentence].join(" ");
            let tokens: Vec<String> = span_text.split_whitespace().map(str::to_string).collect();
            if tokens.is_empty() {
                continue;
            }
            // The boundary's change score stands in for every token's surprise.
            let span_score = change_scores.get(start_sentence).copied().unwrap_or(0.0);
            let scores = vec![span_score; tokens.len()];
            let end_offset = token_offset + tokens.len();
            events.push(EpisodicEvent::new(tokens, token_offset, end_offset, scores));
            token_offset = end_offset;
        }

        let events =
            enforce_event_size(events, self.config.min_event_size, self.config.max_event_size);
        info!(events = events.len(), "semantic segmentation complete");
        self.finalize_and_store(events).await
    }

    /// Common post-processing: representative tokens, embeddings, storage.
    async fn finalize_and_store(&self, mut events: Vec<EpisodicEvent>) -> Vec<EpisodicEvent> {
        if events.is_empty() {
            return events;
        }
        for event in &mut events {
            let representative = self.select_representative_tokens(event);
            if !representative.is_empty() {
                let texts: Vec<&str> = representative
                    .iter()
                    .filter_map(|&i| event.tokens.get(i).map(String::as_str))
                    .collect();
                match self.embedding.embed(&texts).await {
                    Ok(embeddings) => {
                        event.representative_embeddings = Some(embeddings);
                    }
                    Err(err) => {
                        warn!(error = %err, "representative token embedding failed");
                    }
                }
            }
            event.representative_tokens = Some(representative);
        }

        if let Err(err) = self.retrieval.add_events(&events).await {
            error!(error = %err, "storing episodic events failed");
        }
        events
    }

    /// Selects up to `repr_topk` token indices by descending surprise,
    /// returned ascending.
    fn select_representative_tokens(&self, event: &EpisodicEvent) -> Vec<usize> {
        if event.surprise_scores.is_empty() {
            return Vec::new();
        }
        let mut indexed: Vec<(f32, usize)> = event
            .surprise_scores
            .iter()
            .copied()
            .enumerate()
            .map(|(i, score)| (score, i))
            .collect();
        indexed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let mut selected: Vec<usize> = indexed
            .into_iter()
            .take(self.config.repr_topk)
            .map(|(_, i)| i)
            .collect();
        selected.sort_unstable();
        selected
    }

    /// Two-stage retrieval for a query string, shaped for consumers.
    /// Best-effort: any failure yields the empty list.
    pub async fn retrieve_relevant_memories(&self, query: &str) -> Vec<RecalledEpisode> {
        let query_embedding = match self.embedding.embed(&[query]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
            Ok(_) => {
                warn!("query embedding returned no vector");
                return Vec::new();
            }
            Err(err) => {
                error!(error = %err, "query embedding failed; memory retrieval degraded");
                return Vec::new();
            }
        };

        let events = match self.retrieval.retrieve(&query_embedding, None).await {
            Ok(events) => events,
            Err(err) => {
                error!(error = %err, "episodic retrieval failed");
                return Vec::new();
            }
        };

        info!(count = events.len(), "episodic memories retrieved");
        events
            .into_iter()
            .enumerate()
            .map(|(rank, event)| RecalledEpisode {
                id: event.store_id(),
                content: event.text(),
                summary: event.summary.clone().unwrap_or_else(|| {
                    format!(
                        "Episodic event from position {} to {}",
                        event.start_position, event.end_position
                    )
                }),
                surprise_stats: SurpriseStats {
                    mean_surprise: event.mean_surprise(),
                    max_surprise: event.max_surprise(),
                    event_size: event.tokens.len(),
                },
                representative_tokens: event.representative_tokens.clone().unwrap_or_default(),
                retrieval_rank: rank + 1,
            })
            .collect()
    }

    /// Current memory statistics for the stats node.
    pub async fn memory_statistics(&self) -> Value {
        let total_events = match self.retrieval.store().count().await {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "failed to count episodic events");
                return json!({"status": format!("Error retrieving statistics: {err}")});
            }
        };
        json!({
            "total_events": total_events,
            "configuration": {
                "surprise_gamma": self.config.surprise_gamma,
                "min_event_size": self.config.min_event_size,
                "max_event_size": self.config.max_event_size,
                "total_retrieved_events": self.config.total_retrieved_events,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockEmbedder;
    use crate::memory::InMemoryVectorStore;

    fn memory_with(config: EmConfig) -> EpisodicMemory {
        EpisodicMemory::new(
            config,
            Arc::new(MockEmbedder::default()),
            Arc::new(InMemoryVectorStore::new()),
        )
    }

    fn small_config() -> EmConfig {
        EmConfig {
            surprise_window: 5,
            surprise_gamma: 1.0,
            min_event_size: 1,
            max_event_size: 128,
            use_boundary_refinement: false,
            ..Default::default()
        }
    }

    fn spiky_logprobs() -> Vec<TokenLogprob> {
        let mut logprobs: Vec<TokenLogprob> = (0..20)
            .map(|i| TokenLogprob {
                token: format!("a{i}"),
                logprob: -0.1,
            })
            .collect();
        logprobs.push(TokenLogprob {
            token: "spike".into(),
            logprob: -5.0,
        });
        logprobs.extend((0..20).map(|i| TokenLogprob {
            token: format!("b{i}"),
            logprob: -0.1,
        }));
        logprobs
    }

    /// **Scenario**: surprise formation stores two events for a spiked
    /// series and every stored event satisfies the size invariants.
    #[tokio::test]
    async fn logprob_formation_stores_events() {
        let memory = memory_with(small_config());
        let events = memory.process_logprobs_for_memory(&spiky_logprobs()).await;
        assert_eq!(events.len(), 2);
        for event in &events {
            assert!(event.start_position < event.end_position);
            assert_eq!(event.surprise_scores.len(), event.tokens.len());
            assert!(event.representative_tokens.is_some());
            assert!(event.representative_embeddings.is_some());
            let repr = event.representative_tokens.as_ref().unwrap();
            assert!(repr.len() <= 4);
            assert!(repr.windows(2).all(|w| w[0] < w[1]), "ascending indices");
        }
        assert_eq!(
            memory.retrieval.store().count().await.unwrap(),
            2,
            "both events persisted"
        );
    }

    /// **Scenario**: representative tokens are the highest-surprise indices.
    #[tokio::test]
    async fn representative_tokens_by_surprise_rank() {
        let memory = memory_with(EmConfig {
            repr_topk: 2,
            ..small_config()
        });
        let event = EpisodicEvent::new(
            vec!["a".into(), "b".into(), "c".into(), "d".into()],
            0,
            4,
            vec![0.1, 5.0, 0.2, 3.0],
        );
        assert_eq!(memory.select_representative_tokens(&event), vec![1, 3]);
    }

    /// **Scenario**: empty logprobs form no events.
    #[tokio::test]
    async fn empty_logprobs_form_nothing() {
        let memory = memory_with(small_config());
        assert!(memory.process_logprobs_for_memory(&[]).await.is_empty());
        assert_eq!(memory.retrieval.store().count().await.unwrap(), 0);
    }

    /// **Scenario**: a single-sentence response becomes one event.
    #[tokio::test]
    async fn short_text_single_event() {
        let memory = memory_with(small_config());
        let events = memory
            .process_conversation_turn_for_memory("q", "just one sentence")
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tokens.len(), 3);
        assert_eq!(events[0].start_position, 0);
        assert_eq!(events[0].end_position, 3);
    }

    /// **Scenario**: retrieval after formation returns ranked episodes with
    /// surprise statistics; an empty store yields the empty list.
    #[tokio::test]
    async fn retrieval_returns_ranked_episodes() {
        let memory = memory_with(small_config());
        assert!(memory.retrieve_relevant_memories("anything").await.is_empty());

        memory.process_logprobs_for_memory(&spiky_logprobs()).await;
        let episodes = memory.retrieve_relevant_memories("a1 a2 a3").await;
        assert!(!episodes.is_empty());
        for (i, episode) in episodes.iter().enumerate() {
            assert_eq!(episode.retrieval_rank, i + 1);
            assert!(episode.id.starts_with("em_event_"));
            assert!(episode.surprise_stats.event_size > 0);
            assert!(!episode.content.is_empty());
        }
    }

    /// **Scenario**: statistics report the event count and configuration.
    #[tokio::test]
    async fn statistics_report_totals() {
        let memory = memory_with(small_config());
        memory.process_logprobs_for_memory(&spiky_logprobs()).await;
        let stats = memory.memory_statistics().await;
        assert_eq!(stats["total_events"], 2);
        assert_eq!(stats["configuration"]["min_event_size"], 1);
    }

    /// **Scenario**: multi-sentence text with refinement enabled still
    /// produces contiguous token events.
    #[tokio::test]
    async fn semantic_formation_contiguous_events() {
        let config = EmConfig {
            surprise_window: 2,
            min_event_size: 1,
            use_boundary_refinement: true,
            refinement_search_range: 2,
            ..Default::default()
        };
        let memory = memory_with(config);
        let text = "The weather is nice today. The sun shines brightly. \
                    Compilers translate source code. Parsers build syntax trees. \
                    Linkers resolve symbols.";
        let events = memory.process_conversation_turn_for_memory("q", text).await;
        assert!(!events.is_empty());
        let mut offset = 0;
        for event in &events {
            assert_eq!(event.start_position, offset);
            offset = event.end_position;
            assert_eq!(event.surprise_scores.len(), event.tokens.len());
        }
    }
}
