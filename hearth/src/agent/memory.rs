//! Memory nodes: retrieval on entry, formation after the terminal node, and
//! diagnostics.
//!
//! Each node wraps an optional [`EpisodicMemory`]; without one (the memory
//! subsystem failed to initialize or was disabled) the nodes degrade to
//! placeholders so the graph definition stays identical across variants.
//! Memory never fails a turn: every operation is best-effort.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::graph::{Next, Node};
use crate::memory::EpisodicMemory;
use crate::state::{AgentState, InputMode};

use super::node_ids;
use super::routing::format_episodes;

const NO_MEMORIES: &str = "No relevant episodic memories found.";

/// Two-stage retrieval into `recalled_episodes` / `synthesized_memory`.
pub struct MemoryRetrievalNode {
    memory: Option<Arc<EpisodicMemory>>,
}

impl MemoryRetrievalNode {
    pub fn new(memory: Option<Arc<EpisodicMemory>>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Node<AgentState> for MemoryRetrievalNode {
    fn id(&self) -> &str {
        node_ids::MEMORY_RETRIEVAL
    }

    async fn run(&self, mut state: AgentState) -> Result<(AgentState, Next), AgentError> {
        info!("node: memory retrieval (two-stage)");

        let Some(memory) = &self.memory else {
            state.recalled_episodes = Some(Vec::new());
            state.synthesized_memory = Some(NO_MEMORIES.to_string());
            return Ok((state, Next::Continue));
        };

        let episodes = memory.retrieve_relevant_memories(&state.input).await;
        if episodes.is_empty() {
            info!("no relevant episodic memories found");
            state.synthesized_memory = Some(NO_MEMORIES.to_string());
        } else {
            info!(count = episodes.len(), "episodic memories recalled");
            state.synthesized_memory = Some(format_episodes(&episodes));
        }
        state.recalled_episodes = Some(episodes);
        Ok((state, Next::Continue))
    }
}

/// Memory formation from the finished turn: surprise-based when logprobs are
/// present, semantic-change otherwise.
pub struct MemoryFormationNode {
    memory: Option<Arc<EpisodicMemory>>,
}

impl MemoryFormationNode {
    pub fn new(memory: Option<Arc<EpisodicMemory>>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Node<AgentState> for MemoryFormationNode {
    fn id(&self) -> &str {
        node_ids::MEMORY_FORMATION
    }

    async fn run(&self, state: AgentState) -> Result<(AgentState, Next), AgentError> {
        info!("node: memory formation");

        let Some(memory) = &self.memory else {
            return Ok((state, Next::Continue));
        };
        let Some(ai_response) = state.last_ai_reply().map(|m| m.content().to_string()) else {
            warn!("no AI response found; skipping memory formation");
            return Ok((state, Next::Continue));
        };

        let formed = match &state.generation_logprobs {
            Some(logprobs) if !logprobs.is_empty() => {
                info!(tokens = logprobs.len(), "surprise-based memory formation");
                memory.process_logprobs_for_memory(logprobs).await
            }
            _ => {
                warn!("logprobs not available; falling back to semantic-change segmentation");
                memory
                    .process_conversation_turn_for_memory(&state.input, &ai_response)
                    .await
            }
        };

        if formed.is_empty() {
            info!("no episodic events formed from this turn");
        } else {
            let total_tokens: usize = formed.iter().map(|e| e.tokens.len()).sum();
            info!(
                events = formed.len(),
                total_tokens, "episodic events formed from turn"
            );
        }
        Ok((state, Next::Continue))
    }
}

/// Logs episodic memory statistics. For the stats route this is the terminal
/// content node; otherwise it runs after formation as a diagnostics step.
pub struct StatsNode {
    memory: Option<Arc<EpisodicMemory>>,
}

impl StatsNode {
    pub fn new(memory: Option<Arc<EpisodicMemory>>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Node<AgentState> for StatsNode {
    fn id(&self) -> &str {
        node_ids::STATS
    }

    async fn run(&self, mut state: AgentState) -> Result<(AgentState, Next), AgentError> {
        let Some(memory) = &self.memory else {
            return Ok((state, Next::Continue));
        };
        let stats = memory.memory_statistics().await;
        info!(%stats, "episodic memory statistics");

        // The stats route is user-facing: surface the snapshot as the reply.
        if state.mode == Some(InputMode::Stats) && state.last_ai_reply().is_none() {
            let rendered =
                serde_json::to_string_pretty(&stats).unwrap_or_else(|_| stats.to_string());
            state
                .chat_history
                .push(crate::message::Message::human(state.input.clone()));
            state
                .chat_history
                .push(crate::message::Message::ai(format!(
                    "Episodic memory statistics:\n{rendered}"
                )));
        }
        Ok((state, Next::Continue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockEmbedder;
    use crate::memory::{EmConfig, InMemoryVectorStore};

    fn memory() -> Arc<EpisodicMemory> {
        Arc::new(EpisodicMemory::new(
            EmConfig {
                surprise_window: 4,
                min_event_size: 1,
                ..Default::default()
            },
            Arc::new(MockEmbedder::default()),
            Arc::new(InMemoryVectorStore::new()),
        ))
    }

    /// **Scenario**: without a memory subsystem the retrieval node degrades
    /// to the placeholder and the formation node is a no-op.
    #[tokio::test]
    async fn placeholder_without_memory() {
        let retrieval = MemoryRetrievalNode::new(None);
        let state = AgentState::initial("s", "q", InputMode::Direct, vec![]);
        let (out, _) = retrieval.run(state).await.unwrap();
        assert!(out.recalled_episodes.as_ref().is_some_and(Vec::is_empty));
        assert_eq!(out.synthesized_memory.as_deref(), Some(NO_MEMORIES));

        let formation = MemoryFormationNode::new(None);
        let (out, _) = formation.run(out).await.unwrap();
        assert!(out.agent_outcome.is_none());
    }

    /// **Scenario**: an empty store retrieves the placeholder; a formed turn
    /// is later retrievable.
    #[tokio::test]
    async fn formation_then_retrieval() {
        let memory = memory();
        let retrieval = MemoryRetrievalNode::new(Some(memory.clone()));
        let formation = MemoryFormationNode::new(Some(memory.clone()));

        let mut state = AgentState::initial("s", "rust ownership", InputMode::Direct, vec![]);
        let (state_after, _) = retrieval.run(state.clone()).await.unwrap();
        assert_eq!(state_after.synthesized_memory.as_deref(), Some(NO_MEMORIES));

        state.chat_history.push(crate::message::Message::ai(
            "The borrow checker enforces ownership. Lifetimes describe borrows. \
             Move semantics transfer ownership of values.",
        ));
        let (state, _) = formation.run(state).await.unwrap();

        let (state, _) = retrieval.run(state).await.unwrap();
        let episodes = state.recalled_episodes.unwrap();
        assert!(!episodes.is_empty(), "formed memory is retrievable");
        assert!(state
            .synthesized_memory
            .unwrap()
            .contains("Recalled Event 1"));
    }

    /// **Scenario**: the stats route surfaces statistics as the reply.
    #[tokio::test]
    async fn stats_route_produces_reply() {
        let node = StatsNode::new(Some(memory()));
        let state = AgentState::initial("s", "/emstats", InputMode::Stats, vec![]);
        let (out, _) = node.run(state).await.unwrap();
        let last = out.chat_history.last().unwrap();
        assert!(last.is_ai());
        assert!(last.content().contains("total_events"));
    }
}
