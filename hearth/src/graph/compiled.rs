//! Compiled state graph: immutable, supports invoke and stream.
//!
//! Built by `StateGraph::compile`. Holds nodes and the next-node map derived
//! from explicit and conditional edges at compile time. The run loop counts
//! node entries against the configured recursion limit and treats a closed
//! stream receiver as cancellation.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::stream::StreamEvent;

use super::state_graph::END;
use super::{Next, NextEntry, Node, RunConfig, RunContext};

/// Compiled graph: immutable structure, supports invoke and stream.
///
/// Created by `StateGraph::compile()`. Runs from the first node; uses each
/// node's returned `Next` or the conditional router (when present) to choose
/// the next node. `stream()` yields typed events ending with
/// `StreamEvent::GraphEnd(final_state)`.
#[derive(Clone)]
pub struct CompiledStateGraph<S> {
    pub(super) nodes: HashMap<String, Arc<dyn Node<S>>>,
    /// First node to run (from START).
    pub(super) first_node_id: String,
    /// Map from node id to how to get next: Unconditional(to_id) or Conditional(router).
    pub(super) next_map: HashMap<String, NextEntry<S>>,
}

impl<S> CompiledStateGraph<S>
where
    S: Clone + Send + Sync + Debug + 'static,
{
    /// Shared run loop used by invoke() and stream(): steps through nodes
    /// until completion, the recursion limit, or cancellation.
    async fn run_loop(
        &self,
        state: &mut S,
        ctx: &RunContext<S>,
    ) -> Result<(), AgentError> {
        let recursion_limit = ctx.config.recursion_limit();
        let mut entries = 0usize;
        let mut current_id = self.first_node_id.clone();

        debug!(first = %current_id, recursion_limit, "graph run start");

        loop {
            if ctx.is_cancelled() {
                debug!(node = %current_id, "run cancelled by caller");
                return Err(AgentError::Cancelled);
            }
            entries += 1;
            if entries > recursion_limit {
                warn!(
                    entries,
                    recursion_limit, "recursion limit exceeded; terminating run with current state"
                );
                return Ok(());
            }

            let node = match self.nodes.get(&current_id) {
                Some(n) => n.clone(),
                None => {
                    return Err(AgentError::ExecutionFailed(format!(
                        "graph has no node '{current_id}'"
                    )))
                }
            };

            debug!(node = %current_id, entry = entries, "node start");
            ctx.emit(StreamEvent::NodeStart {
                node_id: current_id.clone(),
            })
            .await;

            let (new_state, next) = node.run_with_context(state.clone(), ctx).await?;
            *state = new_state;

            let next_id: Option<String> =
                if let Some(NextEntry::Conditional(router)) = self.next_map.get(&current_id) {
                    let target = router.resolve_next(state);
                    debug!(from = %current_id, to = %target, "conditional routing");
                    Some(target)
                } else {
                    match next {
                        Next::End => None,
                        Next::Node(id) => Some(id),
                        Next::Continue => self.next_map.get(&current_id).and_then(|e| {
                            if let NextEntry::Unconditional(id) = e {
                                Some(id.clone())
                            } else {
                                None
                            }
                        }),
                    }
                };

            match next_id {
                None => return Ok(()),
                Some(id) if id == END => return Ok(()),
                Some(id) => current_id = id,
            }
        }
    }

    /// Runs the graph with the given state to completion and returns the
    /// final state. No events are emitted.
    pub async fn invoke(&self, state: S, config: Option<RunConfig>) -> Result<S, AgentError> {
        if self.nodes.is_empty() || !self.nodes.contains_key(&self.first_node_id) {
            return Err(AgentError::ExecutionFailed("empty graph".into()));
        }
        let ctx = RunContext::new(config.unwrap_or_default());
        let mut state = state;
        self.run_loop(&mut state, &ctx).await?;
        Ok(state)
    }

    /// Streams graph execution, emitting typed events via a channel-backed
    /// stream. The final event of a completed run is `GraphEnd(final_state)`.
    ///
    /// Dropping the returned stream cancels the run at the next node
    /// boundary; in-flight tool executions end through their own deadline.
    pub fn stream(&self, state: S, config: Option<RunConfig>) -> ReceiverStream<StreamEvent<S>> {
        let (tx, rx) = mpsc::channel(128);
        let graph = self.clone();

        tokio::spawn(async move {
            if graph.nodes.is_empty() || !graph.nodes.contains_key(&graph.first_node_id) {
                return;
            }
            let mut ctx = RunContext::new(config.unwrap_or_default());
            ctx.stream_tx = Some(tx.clone());
            let mut state = state;
            match graph.run_loop(&mut state, &ctx).await {
                Ok(()) => {
                    let _ = tx.send(StreamEvent::GraphEnd(state)).await;
                }
                Err(AgentError::Cancelled) => {}
                Err(e) => {
                    warn!(error = %e, "graph run failed");
                }
            }
        });

        ReceiverStream::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio_stream::StreamExt;

    use crate::graph::{Next, Node, StateGraph, END, START};

    /// **Scenario**: When the graph is empty, invoke returns ExecutionFailed("empty graph").
    #[tokio::test]
    async fn invoke_empty_graph_returns_execution_failed() {
        let graph = CompiledStateGraph::<i32> {
            nodes: HashMap::new(),
            first_node_id: String::new(),
            next_map: HashMap::new(),
        };
        let result = graph.invoke(0, None).await;
        match &result {
            Err(AgentError::ExecutionFailed(msg)) => {
                assert!(msg.contains("empty graph"), "{}", msg)
            }
            _ => panic!("expected ExecutionFailed(\"empty graph\"), got {:?}", result),
        }
    }

    #[derive(Clone)]
    struct AddNode {
        id: &'static str,
        delta: i32,
    }

    #[async_trait]
    impl Node<i32> for AddNode {
        fn id(&self) -> &str {
            self.id
        }

        async fn run(&self, state: i32) -> Result<(i32, Next), AgentError> {
            Ok((state + self.delta, Next::Continue))
        }
    }

    /// Node that loops back to itself forever; the recursion limit must stop it.
    #[derive(Clone)]
    struct LoopNode;

    #[async_trait]
    impl Node<i32> for LoopNode {
        fn id(&self) -> &str {
            "loop"
        }
        async fn run(&self, state: i32) -> Result<(i32, Next), AgentError> {
            Ok((state + 1, Next::Node("loop".to_string())))
        }
    }

    fn build_two_step_graph() -> CompiledStateGraph<i32> {
        let mut graph = StateGraph::<i32>::new();
        graph.add_node("first", Arc::new(AddNode { id: "first", delta: 1 }));
        graph.add_node(
            "second",
            Arc::new(AddNode {
                id: "second",
                delta: 2,
            }),
        );
        graph.add_edge(START, "first");
        graph.add_edge("first", "second");
        graph.add_edge("second", END);
        graph.compile().expect("graph compiles")
    }

    /// **Scenario**: Linear two-node graph runs both nodes in order.
    #[tokio::test]
    async fn invoke_linear_graph_runs_in_order() {
        let graph = build_two_step_graph();
        assert_eq!(graph.invoke(0, None).await.unwrap(), 3);
    }

    /// **Scenario**: Graph with conditional edges routes to the correct node based on state.
    #[tokio::test]
    async fn invoke_conditional_edges_routes_by_state() {
        let mut graph = StateGraph::<i32>::new();
        graph.add_node("decide", Arc::new(AddNode { id: "decide", delta: 0 }));
        graph.add_node(
            "even_node",
            Arc::new(AddNode {
                id: "even_node",
                delta: 10,
            }),
        );
        graph.add_node(
            "odd_node",
            Arc::new(AddNode {
                id: "odd_node",
                delta: 100,
            }),
        );
        graph.add_edge(START, "decide");
        graph.add_edge("even_node", END);
        graph.add_edge("odd_node", END);
        let path_map: HashMap<String, String> = [
            ("even".to_string(), "even_node".to_string()),
            ("odd".to_string(), "odd_node".to_string()),
        ]
        .into_iter()
        .collect();
        graph.add_conditional_edges(
            "decide",
            Arc::new(|s: &i32| if s % 2 == 0 { "even".into() } else { "odd".into() }),
            Some(path_map),
        );
        let compiled = graph.compile().expect("graph compiles");
        assert_eq!(compiled.invoke(2, None).await.unwrap(), 12, "state 2 -> even_node -> +10");
        assert_eq!(compiled.invoke(1, None).await.unwrap(), 101, "state 1 -> odd_node -> +100");
    }

    /// **Scenario**: Node returning Next::Node(id) jumps to that node.
    #[tokio::test]
    async fn invoke_next_node_jumps_to_specified_node() {
        #[derive(Clone)]
        struct JumpNode;
        #[async_trait]
        impl Node<i32> for JumpNode {
            fn id(&self) -> &str {
                "first"
            }
            async fn run(&self, state: i32) -> Result<(i32, Next), AgentError> {
                Ok((state + 1, Next::Node("third".to_string())))
            }
        }

        let mut graph = StateGraph::<i32>::new();
        graph.add_node("first", Arc::new(JumpNode));
        graph.add_node(
            "second",
            Arc::new(AddNode {
                id: "second",
                delta: 10,
            }),
        );
        graph.add_node(
            "third",
            Arc::new(AddNode {
                id: "third",
                delta: 100,
            }),
        );
        graph.add_edge(START, "first");
        graph.add_edge("first", "second");
        graph.add_edge("second", "third");
        graph.add_edge("third", END);
        let compiled = graph.compile().expect("graph compiles");
        // first: 0+1=1, jumps to third: 1+100=101 (second skipped).
        assert_eq!(compiled.invoke(0, None).await.unwrap(), 101);
    }

    /// **Scenario**: A self-looping node is terminated by the recursion limit
    /// and the current state is returned instead of an error.
    #[tokio::test]
    async fn recursion_limit_terminates_loop_with_current_state() {
        let mut graph = StateGraph::<i32>::new();
        graph.add_node("loop", Arc::new(LoopNode));
        graph.add_edge(START, "loop");
        graph.add_edge("loop", END);
        let compiled = graph.compile().expect("graph compiles");
        let config = RunConfig {
            recursion_limit: Some(5),
            ..Default::default()
        };
        let out = compiled.invoke(0, Some(config)).await.unwrap();
        assert_eq!(out, 5, "exactly recursion_limit node entries ran");
    }

    /// **Scenario**: stream() emits NodeStart per node and ends with GraphEnd(final state).
    #[tokio::test]
    async fn stream_emits_node_starts_and_graph_end() {
        let graph = build_two_step_graph();
        let events: Vec<_> = graph.stream(0, None).collect().await;
        let starts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::NodeStart { node_id } => Some(node_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec!["first".to_string(), "second".to_string()]);
        match events.last() {
            Some(StreamEvent::GraphEnd(s)) => assert_eq!(*s, 3),
            other => panic!("last event should be GraphEnd(3), got {:?}", other),
        }
    }

    /// **Scenario**: Empty graph stream() does not panic and yields zero events.
    #[tokio::test]
    async fn stream_empty_graph_no_panic_zero_events() {
        let graph = CompiledStateGraph::<i32> {
            nodes: HashMap::new(),
            first_node_id: String::new(),
            next_map: HashMap::new(),
        };
        let events: Vec<_> = graph.stream(0, None).collect().await;
        assert!(events.is_empty(), "empty graph should emit 0 events, got {}", events.len());
    }

    /// **Scenario**: A failing node ends the stream without a GraphEnd event.
    #[tokio::test]
    async fn stream_failing_node_ends_without_graph_end() {
        #[derive(Clone)]
        struct FailNode;
        #[async_trait]
        impl Node<i32> for FailNode {
            fn id(&self) -> &str {
                "fail"
            }
            async fn run(&self, _state: i32) -> Result<(i32, Next), AgentError> {
                Err(AgentError::ExecutionFailed("boom".into()))
            }
        }
        let mut graph = StateGraph::<i32>::new();
        graph.add_node("fail", Arc::new(FailNode));
        graph.add_edge(START, "fail");
        graph.add_edge("fail", END);
        let compiled = graph.compile().expect("graph compiles");
        let events: Vec<_> = compiled.stream(0, None).collect().await;
        assert!(events
            .iter()
            .all(|e| !matches!(e, StreamEvent::GraphEnd(_))));
    }
}
