//! Vector store abstraction.
//!
//! Implementations are thread-safe by contract; callers serialize batch
//! adds. Distances are cosine (`1 - cosine_similarity`). Metadata filters
//! support equality and disjunction, enough for the contiguity buffer's
//! single `$or` query over event positions.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors from vector store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("invalid store input: {0}")]
    InvalidInput(String),
}

/// Metadata filter: field equality or a disjunction of filters.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataFilter {
    /// `metadata[field] == value`. Integer/float comparisons coerce through f64.
    Eq(String, Value),
    /// Any of the nested filters matches.
    Or(Vec<MetadataFilter>),
}

impl MetadataFilter {
    /// Whether `metadata` satisfies this filter.
    pub fn matches(&self, metadata: &Value) -> bool {
        match self {
            Self::Eq(field, expected) => {
                let Some(actual) = metadata.get(field) else {
                    return false;
                };
                if actual == expected {
                    return true;
                }
                match (actual.as_f64(), expected.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            Self::Or(filters) => filters.iter().any(|f| f.matches(metadata)),
        }
    }
}

/// Result of a query or metadata lookup, parallel arrays per hit.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub ids: Vec<String>,
    /// Cosine distance per hit; zero for pure metadata lookups.
    pub distances: Vec<f32>,
    pub documents: Vec<String>,
    pub metadatas: Vec<Value>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Vector storage contract.
///
/// `add` has upsert semantics. `delete` must batch internally when handed
/// more than 1000 ids. `get_oldest_ids` orders by the `created_ts` metadata
/// field and should avoid loading all documents into memory when the backend
/// allows it.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn add(
        &self,
        ids: Vec<String>,
        embeddings: Vec<Vec<f32>>,
        documents: Vec<String>,
        metadatas: Vec<Value>,
    ) -> Result<(), StoreError>;

    /// Nearest neighbors by cosine distance, optionally restricted by filter.
    async fn query(
        &self,
        query_embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<QueryResult, StoreError>;

    /// Metadata-only lookup (no embedding involved).
    async fn get(&self, filter: &MetadataFilter, limit: usize) -> Result<QueryResult, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    async fn delete(&self, ids: &[String]) -> Result<(), StoreError>;

    /// Ids of the oldest entries by `created_ts`, oldest first.
    async fn get_oldest_ids(&self, limit: usize) -> Result<Vec<String>, StoreError>;
}

/// Cosine similarity; 0.0 when either vector has zero magnitude.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// **Scenario**: Eq matches exact values and numerically-equal ints/floats.
    #[test]
    fn eq_filter_matches_with_numeric_coercion() {
        let metadata = json!({"start_position": 20, "tag": "x"});
        assert!(MetadataFilter::Eq("start_position".into(), json!(20)).matches(&metadata));
        assert!(MetadataFilter::Eq("start_position".into(), json!(20.0)).matches(&metadata));
        assert!(MetadataFilter::Eq("tag".into(), json!("x")).matches(&metadata));
        assert!(!MetadataFilter::Eq("start_position".into(), json!(21)).matches(&metadata));
        assert!(!MetadataFilter::Eq("missing".into(), json!(1)).matches(&metadata));
    }

    /// **Scenario**: Or matches when any branch matches.
    #[test]
    fn or_filter_is_disjunction() {
        let metadata = json!({"end_position": 5});
        let filter = MetadataFilter::Or(vec![
            MetadataFilter::Eq("end_position".into(), json!(9)),
            MetadataFilter::Eq("end_position".into(), json!(5)),
        ]);
        assert!(filter.matches(&metadata));
        let filter = MetadataFilter::Or(vec![
            MetadataFilter::Eq("end_position".into(), json!(9)),
        ]);
        assert!(!filter.matches(&metadata));
        assert!(!MetadataFilter::Or(vec![]).matches(&metadata));
    }

    /// **Scenario**: cosine similarity of identical, orthogonal and zero vectors.
    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
