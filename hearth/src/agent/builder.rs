//! Conversation graph builder.
//!
//! One node registry serves both compiled variants: the memory nodes are
//! real when an episodic memory subsystem is attached and placeholders when
//! it is not. The route table:
//!
//! | From | Route | To |
//! |---|---|---|
//! | entry (memory_retrieval) | direct | direct_answer |
//! | entry | search | generate_search_query |
//! | entry | agent | generate_order |
//! | entry | stats | stats |
//! | generate_search_query | — | execute_search |
//! | execute_search | — | summarize_search_result |
//! | generate_order | — | agent_reasoning |
//! | agent_reasoning | continue | tool_node |
//! | agent_reasoning | end | synthesize_final_response |
//! | tool_node | — | update_scratchpad |
//! | update_scratchpad | — | agent_reasoning |
//! | terminals | — | memory_formation |
//! | memory_formation | — | stats → END |

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::ContextWindowManager;
use crate::graph::{CompilationError, CompiledStateGraph, StateGraph, END, START};
use crate::llm::LlmDirectory;
use crate::memory::EpisodicMemory;
use crate::prompts::PromptResolver;
use crate::rag::{RagContextBuilder, RagEngine};
use crate::state::AgentState;
use crate::tools::ToolFabric;

use super::chat::DirectAnswerNode;
use super::memory::{MemoryFormationNode, MemoryRetrievalNode, StatsNode};
use super::react::{
    AgentReasoningNode, GenerateOrderNode, SynthesizeFinalNode, ToolExecNode, UpdateScratchpadNode,
};
use super::routing::{route_by_command, should_continue_react};
use super::search::{ExecuteSearchNode, GenerateSearchQueryNode, SummarizeSearchResultNode};
use super::{node_ids, routes};

/// Shared dependencies injected into every node.
#[derive(Clone)]
pub struct GraphDeps {
    pub llm: Arc<dyn LlmDirectory>,
    pub context: Arc<ContextWindowManager>,
    pub rag_engine: Arc<RagEngine>,
    pub rag_builder: Arc<RagContextBuilder>,
    pub tools: Arc<ToolFabric>,
    /// Episodic memory; `None` selects the degraded graph variant.
    pub memory: Option<Arc<EpisodicMemory>>,
    pub prompts: Arc<dyn PromptResolver>,
    /// Token budget for trimmed local history.
    pub max_local_tokens: usize,
}

/// Builds the compiled conversation graph.
pub struct ConversationGraph;

impl ConversationGraph {
    /// Compiles the graph. `deps.memory` decides whether the memory nodes
    /// are backed or placeholders; the wiring is identical either way.
    pub fn build(deps: GraphDeps) -> Result<CompiledStateGraph<AgentState>, CompilationError> {
        let mut graph = StateGraph::<AgentState>::new();

        graph.add_node(
            node_ids::MEMORY_RETRIEVAL,
            Arc::new(MemoryRetrievalNode::new(deps.memory.clone())),
        );
        graph.add_node(
            node_ids::MEMORY_FORMATION,
            Arc::new(MemoryFormationNode::new(deps.memory.clone())),
        );
        graph.add_node(node_ids::STATS, Arc::new(StatsNode::new(deps.memory.clone())));

        graph.add_node(
            node_ids::DIRECT_ANSWER,
            Arc::new(DirectAnswerNode::new(
                deps.llm.clone(),
                deps.context.clone(),
                deps.prompts.clone(),
                deps.max_local_tokens,
            )),
        );

        graph.add_node(
            node_ids::GENERATE_SEARCH_QUERY,
            Arc::new(GenerateSearchQueryNode::new(
                deps.llm.clone(),
                deps.prompts.clone(),
            )),
        );
        graph.add_node(
            node_ids::EXECUTE_SEARCH,
            Arc::new(ExecuteSearchNode::new(deps.tools.clone())),
        );
        graph.add_node(
            node_ids::SUMMARIZE_SEARCH_RESULT,
            Arc::new(SummarizeSearchResultNode::new(
                deps.llm.clone(),
                deps.context.clone(),
                deps.rag_engine.clone(),
                deps.rag_builder.clone(),
                deps.tools.clone(),
                deps.prompts.clone(),
                deps.max_local_tokens,
            )),
        );

        graph.add_node(
            node_ids::GENERATE_ORDER,
            Arc::new(GenerateOrderNode::new(
                deps.llm.clone(),
                deps.tools.clone(),
                deps.prompts.clone(),
            )),
        );
        graph.add_node(
            node_ids::AGENT_REASONING,
            Arc::new(AgentReasoningNode::new(
                deps.llm.clone(),
                deps.tools.clone(),
                deps.prompts.clone(),
            )),
        );
        graph.add_node(
            node_ids::TOOL_NODE,
            Arc::new(ToolExecNode::new(deps.tools.clone())),
        );
        graph.add_node(node_ids::UPDATE_SCRATCHPAD, Arc::new(UpdateScratchpadNode));
        graph.add_node(
            node_ids::SYNTHESIZE_FINAL_RESPONSE,
            Arc::new(SynthesizeFinalNode::new(
                deps.llm.clone(),
                deps.context.clone(),
                deps.prompts.clone(),
                deps.max_local_tokens,
            )),
        );

        // Entry: memory retrieval, then route by mode.
        graph.add_edge(START, node_ids::MEMORY_RETRIEVAL);
        let route_map: HashMap<String, String> = [
            (routes::AGENT_MODE.to_string(), node_ids::GENERATE_ORDER.to_string()),
            (routes::SEARCH.to_string(), node_ids::GENERATE_SEARCH_QUERY.to_string()),
            (routes::DIRECT_ANSWER.to_string(), node_ids::DIRECT_ANSWER.to_string()),
            (routes::STATS.to_string(), node_ids::STATS.to_string()),
        ]
        .into_iter()
        .collect();
        graph.add_conditional_edges(
            node_ids::MEMORY_RETRIEVAL,
            Arc::new(route_by_command),
            Some(route_map),
        );

        // Direct and search flows end in memory formation.
        graph.add_edge(node_ids::DIRECT_ANSWER, node_ids::MEMORY_FORMATION);
        graph.add_edge(node_ids::GENERATE_SEARCH_QUERY, node_ids::EXECUTE_SEARCH);
        graph.add_edge(node_ids::EXECUTE_SEARCH, node_ids::SUMMARIZE_SEARCH_RESULT);
        graph.add_edge(node_ids::SUMMARIZE_SEARCH_RESULT, node_ids::MEMORY_FORMATION);

        // ReAct loop.
        graph.add_edge(node_ids::GENERATE_ORDER, node_ids::AGENT_REASONING);
        let react_map: HashMap<String, String> = [
            ("continue".to_string(), node_ids::TOOL_NODE.to_string()),
            ("end".to_string(), node_ids::SYNTHESIZE_FINAL_RESPONSE.to_string()),
        ]
        .into_iter()
        .collect();
        graph.add_conditional_edges(
            node_ids::AGENT_REASONING,
            Arc::new(should_continue_react),
            Some(react_map),
        );
        graph.add_edge(node_ids::TOOL_NODE, node_ids::UPDATE_SCRATCHPAD);
        graph.add_edge(node_ids::UPDATE_SCRATCHPAD, node_ids::AGENT_REASONING);
        graph.add_edge(node_ids::SYNTHESIZE_FINAL_RESPONSE, node_ids::MEMORY_FORMATION);

        // Formation, then diagnostics, then end. The stats node doubles as
        // the terminal content node for the stats route.
        graph.add_edge(node_ids::MEMORY_FORMATION, node_ids::STATS);
        graph.add_edge(node_ids::STATS, END);

        graph.compile()
    }
}
