//! Per-turn state for the conversation graph.
//!
//! [`AgentState`] is created by [`AgentState::initial`], owned by a single
//! graph execution, and destroyed after the turn. Immutable input fields are
//! set once; accumulating fields are updated by nodes that read the current
//! value and return the successor state (no implicit list append).

use serde_json::Value;

use crate::message::Message;

/// User-facing processing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    Direct,
    Search,
    Agent,
    Stats,
}

impl InputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Search => "search",
            Self::Agent => "agent",
            Self::Stats => "stats",
        }
    }
}

impl std::str::FromStr for InputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" | "chat" => Ok(Self::Direct),
            "search" => Ok(Self::Search),
            "agent" => Ok(Self::Agent),
            "stats" => Ok(Self::Stats),
            _ => Err(format!("unknown mode: {s} (use direct, search, agent, or stats)")),
        }
    }
}

impl std::fmt::Display for InputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One search hit inside a [`SearchGroup`]. A failed query keeps an error
/// entry in place of results so the summarize prompt can mention it.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Results for one executed search query.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SearchGroup {
    pub query: String,
    pub results: Vec<SearchHit>,
}

/// One user-provided attachment flowing into search mode.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub content: String,
}

/// Surprise statistics attached to a recalled episode.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SurpriseStats {
    pub mean_surprise: f32,
    pub max_surprise: f32,
    pub event_size: usize,
}

/// One episodic memory returned by two-stage retrieval, shaped for consumers.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RecalledEpisode {
    /// Stable id `em_event_{start}_{end}`.
    pub id: String,
    /// Space-joined event tokens.
    pub content: String,
    pub summary: String,
    pub surprise_stats: SurpriseStats,
    pub representative_tokens: Vec<usize>,
    /// 1-based rank in the merged retrieval result.
    pub retrieval_rank: usize,
}

/// One generated token with its log-probability, captured for surprise-based
/// memory formation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TokenLogprob {
    pub token: String,
    pub logprob: f32,
}

/// State for one graph execution.
///
/// Input fields (`session_id` through `skip_web_search`) are set by
/// [`AgentState::initial`] and never change. Accumulating fields are written
/// by node return-merges; the runtime overwrites the state wholesale, so a
/// node that appends must read-then-return.
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    // Input
    pub session_id: String,
    pub input: String,
    pub mode: Option<InputMode>,
    /// Agent mode hint from routing tags: "high" | "fast" | "direct".
    pub agent_mode: Option<String>,
    pub chat_history: Vec<Message>,
    pub search_query: Option<String>,
    pub search_attachments: Vec<Attachment>,
    pub skip_web_search: bool,

    // ReAct loop
    pub scratchpad: Vec<Message>,
    /// Inter-node mailbox within the turn.
    pub messages: Vec<Message>,
    pub agent_outcome: Option<String>,
    /// Internal order the reasoning loop executes, produced by order generation.
    pub order: Option<Value>,
    /// Number of times the reasoning node has run this turn.
    pub reason_iterations: usize,

    // Memory pipeline
    pub recalled_episodes: Option<Vec<RecalledEpisode>>,
    pub synthesized_memory: Option<String>,
    pub generation_logprobs: Option<Vec<TokenLogprob>>,

    // Search mode
    pub search_queries: Option<Vec<String>>,
    pub search_results: Option<Vec<SearchGroup>>,
}

impl AgentState {
    /// Builds the initial state for a new request.
    pub fn initial(
        session_id: impl Into<String>,
        input: impl Into<String>,
        mode: InputMode,
        chat_history: Vec<Message>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            input: input.into(),
            mode: Some(mode),
            chat_history,
            ..Self::default()
        }
    }

    /// The last AI message in chat history, if any. Used by memory formation
    /// and by the facade when deciding what to persist.
    pub fn last_ai_reply(&self) -> Option<&Message> {
        self.chat_history.iter().rev().find(|m| m.is_ai())
    }
}
