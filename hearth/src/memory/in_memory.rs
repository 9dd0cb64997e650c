//! In-memory vector store.
//!
//! All data lives in a concurrent map and is lost when the store is dropped.
//! Queries scan every entry, which is adequate for local episodic memory
//! volumes; `get_oldest_ids` keeps only `(id, ts)` pairs in flight rather
//! than whole documents.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::store::{cosine_similarity, MetadataFilter, QueryResult, StoreError, VectorStore};

const DELETE_BATCH: usize = 1000;

#[derive(Clone)]
struct Entry {
    embedding: Vec<f32>,
    document: String,
    metadata: Value,
    created_ts: f64,
}

/// Pure in-memory vector store for episodic events.
///
/// **Interaction**: Used as `Arc<dyn VectorStore>` by the two-stage
/// retrieval pipeline and directly in tests.
#[derive(Default)]
pub struct InMemoryVectorStore {
    data: DashMap<String, Entry>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn created_ts(metadata: &Value) -> f64 {
        metadata
            .get("created_ts")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(
        &self,
        ids: Vec<String>,
        embeddings: Vec<Vec<f32>>,
        documents: Vec<String>,
        metadatas: Vec<Value>,
    ) -> Result<(), StoreError> {
        if ids.len() != embeddings.len() || ids.len() != documents.len() || ids.len() != metadatas.len()
        {
            return Err(StoreError::InvalidInput(format!(
                "mismatched lengths: {} ids, {} embeddings, {} documents, {} metadatas",
                ids.len(),
                embeddings.len(),
                documents.len(),
                metadatas.len()
            )));
        }
        for (((id, embedding), document), metadata) in ids
            .into_iter()
            .zip(embeddings)
            .zip(documents)
            .zip(metadatas)
        {
            let created_ts = Self::created_ts(&metadata);
            self.data.insert(
                id,
                Entry {
                    embedding,
                    document,
                    metadata,
                    created_ts,
                },
            );
        }
        Ok(())
    }

    async fn query(
        &self,
        query_embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<QueryResult, StoreError> {
        let mut scored: Vec<(String, f32, String, Value)> = self
            .data
            .iter()
            .filter(|entry| filter.map_or(true, |f| f.matches(&entry.metadata)))
            .map(|entry| {
                let distance = 1.0 - cosine_similarity(query_embedding, &entry.embedding);
                (
                    entry.key().clone(),
                    distance,
                    entry.document.clone(),
                    entry.metadata.clone(),
                )
            })
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        let mut result = QueryResult::default();
        for (id, distance, document, metadata) in scored {
            result.ids.push(id);
            result.distances.push(distance);
            result.documents.push(document);
            result.metadatas.push(metadata);
        }
        Ok(result)
    }

    async fn get(&self, filter: &MetadataFilter, limit: usize) -> Result<QueryResult, StoreError> {
        let mut result = QueryResult::default();
        for entry in self.data.iter() {
            if result.len() >= limit {
                break;
            }
            if filter.matches(&entry.metadata) {
                result.ids.push(entry.key().clone());
                result.distances.push(0.0);
                result.documents.push(entry.document.clone());
                result.metadatas.push(entry.metadata.clone());
            }
        }
        Ok(result)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.data.len())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), StoreError> {
        for batch in ids.chunks(DELETE_BATCH) {
            for id in batch {
                self.data.remove(id);
            }
        }
        Ok(())
    }

    async fn get_oldest_ids(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut items: Vec<(String, f64)> = self
            .data
            .iter()
            .map(|entry| (entry.key().clone(), entry.created_ts))
            .collect();
        items.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(items.into_iter().take(limit).map(|(id, _)| id).collect())
    }
}
