//! Conversation graph: nodes, routing and the graph builder.
//!
//! The node registry is shared between the two compiled variants (with and
//! without episodic memory); the builder inserts memory-backed or
//! placeholder memory nodes based on a constructor flag, never duplicating
//! the graph definition.

mod builder;
mod chat;
mod memory;
mod react;
mod routing;
mod search;

pub use builder::{ConversationGraph, GraphDeps};
pub use chat::DirectAnswerNode;
pub use memory::{MemoryFormationNode, MemoryRetrievalNode, StatsNode};
pub use react::{
    AgentReasoningNode, GenerateOrderNode, SynthesizeFinalNode, ToolExecNode, UpdateScratchpadNode,
};
pub use routing::{
    extract_routing_tag, format_episodes, format_scratchpad, route_by_command,
    should_continue_react,
};
pub use search::{ExecuteSearchNode, GenerateSearchQueryNode, SummarizeSearchResultNode};

/// Node ids used by the conversation graph.
pub mod node_ids {
    pub const MEMORY_RETRIEVAL: &str = "memory_retrieval";
    pub const DIRECT_ANSWER: &str = "direct_answer";
    pub const GENERATE_SEARCH_QUERY: &str = "generate_search_query";
    pub const EXECUTE_SEARCH: &str = "execute_search";
    pub const SUMMARIZE_SEARCH_RESULT: &str = "summarize_search_result";
    pub const GENERATE_ORDER: &str = "generate_order";
    pub const AGENT_REASONING: &str = "agent_reasoning";
    pub const TOOL_NODE: &str = "tool_node";
    pub const UPDATE_SCRATCHPAD: &str = "update_scratchpad";
    pub const SYNTHESIZE_FINAL_RESPONSE: &str = "synthesize_final_response";
    pub const MEMORY_FORMATION: &str = "memory_formation";
    pub const STATS: &str = "stats";
}

/// Routing keys returned by [`route_by_command`].
pub mod routes {
    pub const AGENT_MODE: &str = "agent_mode";
    pub const SEARCH: &str = "search";
    pub const DIRECT_ANSWER: &str = "direct_answer";
    pub const STATS: &str = "stats";
}
