//! Graph compilation error.
//!
//! Returned by `StateGraph::compile` when edges reference unknown nodes or
//! the entry point does not route to registered nodes.

use thiserror::Error;

/// Error when compiling a state graph (e.g. edge references unknown node).
///
/// Returned by `StateGraph::compile()`. Validation ensures every id in
/// edges (except START/END) exists in the node map, every conditional
/// path-map target exists, exactly one edge leaves START, and some path
/// reaches END.
#[derive(Debug, Error)]
pub enum CompilationError {
    /// A node id in an edge was not registered via `add_node` (and is not START/END).
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// No edge has from_id == START, or more than one such edge.
    #[error("graph must have exactly one edge from START")]
    MissingStart,

    /// No edge or conditional route reaches END.
    #[error("graph must have at least one route to END")]
    MissingEnd,

    /// A node has more than one outgoing unconditional edge.
    #[error("node has duplicate outgoing edges: {0}")]
    DuplicateEdge(String),

    /// A node has both an outgoing edge and conditional edges; it must have exactly one.
    #[error("node has both edge and conditional edges: {0}")]
    NodeHasBothEdgeAndConditional(String),

    /// A value in a conditional path_map is not a valid node id or END.
    #[error("conditional path_map invalid target: {0}")]
    InvalidConditionalPathMap(String),
}
