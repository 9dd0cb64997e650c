//! Next-step result from a graph node: continue linear chain, jump to a node, or end.
//!
//! The graph runner uses this to decide the next node or to stop. For nodes
//! with conditional edges the router's decision takes precedence.

/// Next step after running a node.
///
/// - **Continue**: follow the wired edge (next node in chain, or END if last).
/// - **Node(id)**: jump to the given node.
/// - **End**: stop; return current state as final result.
///
/// **Interaction**: Returned by `Node::run`; consumed by `CompiledStateGraph::invoke`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Next {
    /// Follow the wired edge; if current node is last, equivalent to End.
    Continue,
    /// Run the node with the given id next.
    Node(String),
    /// Stop and return the current state.
    End,
}
