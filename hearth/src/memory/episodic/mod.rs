//! Episodic memory: event segmentation, boundary refinement, storage and
//! two-stage retrieval.
//!
//! Two formation paths produce [`EpisodicEvent`]s: surprise-based (preferred,
//! from generation logprobs) and semantic-change-based (fallback, from
//! sentence embeddings). Retrieval combines a similarity buffer with a
//! temporal contiguity buffer. Everything is best-effort: formation errors
//! are swallowed and retrieval failures yield the empty result.

mod boundary;
mod integrator;
mod retrieval;
mod segmenter;
mod types;

pub use boundary::{conductance, cosine_similarity_matrix, modularity, refine_boundaries};
pub use integrator::EpisodicMemory;
pub use retrieval::TwoStageRetrieval;
pub use segmenter::{
    build_events, enforce_event_size, identify_event_boundaries, sentence_change_scores,
    split_sentences, surprise_from_logprobs,
};
pub use types::{EmConfig, EpisodicEvent, RefinementMetric};
