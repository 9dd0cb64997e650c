//! Two-stage retrieval: similarity buffer plus temporal contiguity buffer.
//!
//! Stage 1 spends `Ks = floor(K * ratio)` of the budget on a vector query
//! with an optional recency boost. Stage 2 spends the remainder on one
//! metadata `$or` query for events temporally adjacent to stage-1 hits.
//! Results are merged, deduplicated by position pair, sorted by start
//! position and capped at `K`.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::memory::store::{MetadataFilter, QueryResult, StoreError, VectorStore};

use super::types::{EmConfig, EpisodicEvent};

/// Episodic event storage and retrieval over a [`VectorStore`].
pub struct TwoStageRetrieval {
    store: Arc<dyn VectorStore>,
    config: EmConfig,
}

impl TwoStageRetrieval {
    pub fn new(store: Arc<dyn VectorStore>, config: EmConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Persists events that carry representative embeddings. One record per
    /// event: id `em_event_{start}_{end}`, document = space-joined tokens,
    /// embedding = mean of the representative embeddings.
    pub async fn add_events(&self, events: &[EpisodicEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let now_ts = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;

        let mut ids = Vec::new();
        let mut embeddings = Vec::new();
        let mut documents = Vec::new();
        let mut metadatas = Vec::new();

        for event in events {
            let Some(repr) = event
                .representative_embeddings
                .as_ref()
                .filter(|r| !r.is_empty())
            else {
                continue;
            };
            let dimension = repr[0].len();
            let mut mean = vec![0.0f32; dimension];
            for vector in repr {
                for (slot, value) in mean.iter_mut().zip(vector.iter()) {
                    *slot += value;
                }
            }
            for slot in &mut mean {
                *slot /= repr.len() as f32;
            }

            ids.push(event.store_id());
            embeddings.push(mean);
            documents.push(event.text());
            metadatas.push(json!({
                "start_position": event.start_position,
                "end_position": event.end_position,
                "created_ts": now_ts,
                "avg_surprise": event.mean_surprise(),
                "token_count": event.tokens.len(),
            }));
        }

        if ids.is_empty() {
            return Ok(());
        }
        let added = ids.len();
        self.store.add(ids, embeddings, documents, metadatas).await?;
        let total = self.store.count().await.unwrap_or(0);
        info!(added, total, "episodic events stored");
        Ok(())
    }

    /// Two-stage retrieval for a query embedding with budget `k`
    /// (defaults to the configured total).
    pub async fn retrieve(
        &self,
        query_embedding: &[f32],
        k: Option<usize>,
    ) -> Result<Vec<EpisodicEvent>, StoreError> {
        if self.store.count().await? == 0 {
            return Ok(Vec::new());
        }

        let total_k = k.unwrap_or(self.config.total_retrieved_events);
        let ks = (total_k as f32 * self.config.similarity_buffer_ratio) as usize;
        let kc = total_k.saturating_sub(ks);

        let similarity_events = self.similarity_stage(query_embedding, ks).await?;
        let contiguity_events = self.contiguity_stage(&similarity_events, kc).await?;

        debug!(
            similarity = similarity_events.len(),
            contiguity = contiguity_events.len(),
            "two-stage retrieval complete"
        );

        let mut merged = similarity_events;
        merged.extend(contiguity_events);
        let mut unique = dedup_events(merged);
        unique.sort_by_key(|e| e.start_position);
        unique.truncate(total_k);
        Ok(unique)
    }

    /// Similarity buffer: vector query re-ranked with the recency boost
    /// `score += recency_weight * ts / max_ts`.
    async fn similarity_stage(
        &self,
        query_embedding: &[f32],
        ks: usize,
    ) -> Result<Vec<EpisodicEvent>, StoreError> {
        if ks == 0 {
            return Ok(Vec::new());
        }
        let result = self.store.query(query_embedding, ks, None).await?;
        if result.is_empty() {
            return Ok(Vec::new());
        }

        let timestamps: Vec<f64> = result
            .metadatas
            .iter()
            .map(|m| m.get("created_ts").and_then(Value::as_f64).unwrap_or(0.0))
            .collect();
        let max_ts = timestamps.iter().copied().fold(0.0f64, f64::max);

        let mut scored: Vec<(f64, usize)> = result
            .distances
            .iter()
            .enumerate()
            .map(|(i, &distance)| {
                let mut score = f64::from(1.0 - distance);
                if self.config.recency_weight > 0.0 && max_ts > 0.0 {
                    score += f64::from(self.config.recency_weight) * (timestamps[i] / max_ts);
                }
                (score, i)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(ks)
            .filter_map(|(_, i)| result_to_event(&result, i))
            .collect())
    }

    /// Contiguity buffer: one `$or` metadata query for spans adjacent to the
    /// similarity hits, excluding events already retrieved.
    async fn contiguity_stage(
        &self,
        similarity_events: &[EpisodicEvent],
        kc: usize,
    ) -> Result<Vec<EpisodicEvent>, StoreError> {
        if kc == 0 || similarity_events.is_empty() {
            return Ok(Vec::new());
        }

        let mut or_filters = Vec::with_capacity(similarity_events.len() * 2);
        for event in similarity_events {
            // Previous neighbor ends where this event starts; next neighbor
            // starts where this event ends.
            or_filters.push(MetadataFilter::Eq(
                "end_position".into(),
                json!(event.start_position),
            ));
            or_filters.push(MetadataFilter::Eq(
                "start_position".into(),
                json!(event.end_position),
            ));
        }
        let filter = MetadataFilter::Or(or_filters);
        let result = self
            .store
            .get(&filter, kc + similarity_events.len() * 2)
            .await?;

        let known: std::collections::HashSet<String> =
            similarity_events.iter().map(EpisodicEvent::store_id).collect();
        let mut events: Vec<EpisodicEvent> = (0..result.len())
            .filter(|&i| !known.contains(&result.ids[i]))
            .filter_map(|i| result_to_event(&result, i))
            .collect();
        events = dedup_events(events);
        events.truncate(kc);
        Ok(events)
    }
}

/// Rebuilds an event from a stored record. The document supplies the tokens
/// and `avg_surprise`/`token_count` reconstruct a flat surprise profile.
fn result_to_event(result: &QueryResult, index: usize) -> Option<EpisodicEvent> {
    let metadata = result.metadatas.get(index)?;
    let document = result.documents.get(index)?;

    let (start, end) = match (
        metadata.get("start_position").and_then(Value::as_u64),
        metadata.get("end_position").and_then(Value::as_u64),
    ) {
        (Some(start), Some(end)) => (start as usize, end as usize),
        // Fallback: parse positions from the id `em_event_{start}_{end}`.
        _ => {
            let id = result.ids.get(index)?;
            let mut parts = id.rsplitn(3, '_');
            let end = parts.next()?.parse().ok()?;
            let start = parts.next()?.parse().ok()?;
            (start, end)
        }
    };

    let tokens: Vec<String> = document.split_whitespace().map(str::to_string).collect();
    let surprise_scores = match metadata.get("avg_surprise").and_then(Value::as_f64) {
        Some(avg) => {
            let count = metadata
                .get("token_count")
                .and_then(Value::as_u64)
                .map(|c| c as usize)
                .filter(|&c| c > 0)
                .unwrap_or_else(|| tokens.len().max(1));
            vec![avg as f32; count]
        }
        None => Vec::new(),
    };

    let mut event = EpisodicEvent::new(tokens, start, end, surprise_scores);
    event.summary = Some(document.clone());
    Some(event)
}

/// Removes duplicate events by `(start_position, end_position)`.
fn dedup_events(events: Vec<EpisodicEvent>) -> Vec<EpisodicEvent> {
    let mut seen = std::collections::HashSet::new();
    events
        .into_iter()
        .filter(|e| seen.insert((e.start_position, e.end_position)))
        .collect()
}
