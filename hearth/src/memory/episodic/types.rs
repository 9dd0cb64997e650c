//! Episodic memory data types and configuration.

use env_config::EmSettings;

/// One contiguous token span identified as a coherent episodic unit.
///
/// Invariants: `start_position < end_position`;
/// `surprise_scores.len() == tokens.len()`.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodicEvent {
    pub tokens: Vec<String>,
    /// Starting position in the overall token sequence.
    pub start_position: usize,
    /// Ending position (exclusive) in the overall token sequence.
    pub end_position: usize,
    /// Surprise score per token (`-log P(token | context)`).
    pub surprise_scores: Vec<f32>,
    /// Indices of tokens that best represent this event, ascending.
    pub representative_tokens: Option<Vec<usize>>,
    /// Embeddings of the representative tokens.
    pub representative_embeddings: Option<Vec<Vec<f32>>>,
    pub summary: Option<String>,
}

impl EpisodicEvent {
    pub fn new(
        tokens: Vec<String>,
        start_position: usize,
        end_position: usize,
        surprise_scores: Vec<f32>,
    ) -> Self {
        Self {
            tokens,
            start_position,
            end_position,
            surprise_scores,
            representative_tokens: None,
            representative_embeddings: None,
            summary: None,
        }
    }

    /// Stable store id: `em_event_{start}_{end}`.
    pub fn store_id(&self) -> String {
        format!("em_event_{}_{}", self.start_position, self.end_position)
    }

    /// Space-joined token text.
    pub fn text(&self) -> String {
        self.tokens.join(" ")
    }

    pub fn mean_surprise(&self) -> f32 {
        if self.surprise_scores.is_empty() {
            0.0
        } else {
            self.surprise_scores.iter().sum::<f32>() / self.surprise_scores.len() as f32
        }
    }

    pub fn max_surprise(&self) -> f32 {
        self.surprise_scores
            .iter()
            .copied()
            .fold(0.0f32, f32::max)
    }
}

/// Boundary refinement metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefinementMetric {
    /// Graph modularity over the similarity matrix; higher is better.
    #[default]
    Modularity,
    /// Average community conductance; lower is better.
    Conductance,
}

impl std::str::FromStr for RefinementMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "modularity" => Ok(Self::Modularity),
            "conductance" => Ok(Self::Conductance),
            _ => Err(format!(
                "unknown refinement metric: {s} (use modularity or conductance)"
            )),
        }
    }
}

/// Immutable episodic memory parameters.
#[derive(Debug, Clone)]
pub struct EmConfig {
    /// Trailing window length for the surprise threshold.
    pub surprise_window: usize,
    /// Threshold adjustment: boundary when `score > mean + gamma * std`.
    pub surprise_gamma: f32,
    pub min_event_size: usize,
    pub max_event_size: usize,
    /// `Ks / K`: share of the retrieval budget spent on similarity.
    pub similarity_buffer_ratio: f32,
    /// `K`: total retrieval budget.
    pub total_retrieved_events: usize,
    /// Representative tokens selected per event.
    pub repr_topk: usize,
    /// Recency boost weight applied during similarity retrieval.
    pub recency_weight: f32,
    pub use_boundary_refinement: bool,
    pub refinement_metric: RefinementMetric,
    /// Maximum local search distance during refinement.
    pub refinement_search_range: usize,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            surprise_window: 128,
            surprise_gamma: 1.0,
            min_event_size: 8,
            max_event_size: 128,
            similarity_buffer_ratio: 0.7,
            total_retrieved_events: 4,
            repr_topk: 4,
            recency_weight: 0.1,
            use_boundary_refinement: true,
            refinement_metric: RefinementMetric::Modularity,
            refinement_search_range: 16,
        }
    }
}

impl From<&EmSettings> for EmConfig {
    fn from(settings: &EmSettings) -> Self {
        Self {
            surprise_window: settings.surprise_window,
            surprise_gamma: settings.surprise_gamma,
            min_event_size: settings.min_event_size,
            max_event_size: settings.max_event_size,
            similarity_buffer_ratio: settings.similarity_buffer_ratio,
            total_retrieved_events: settings.total_retrieved_events,
            repr_topk: settings.repr_topk,
            recency_weight: settings.recency_weight,
            use_boundary_refinement: settings.use_boundary_refinement,
            refinement_metric: settings
                .refinement_metric
                .parse()
                .unwrap_or_default(),
            refinement_search_range: settings.refinement_search_range,
        }
    }
}
