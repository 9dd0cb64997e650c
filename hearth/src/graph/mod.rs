//! State graph: nodes + explicit edges, conditional routing, compile and invoke.
//!
//! StateGraph: add nodes and edges, compile, then invoke with state or stream
//! typed events.

mod compile_error;
mod compiled;
mod conditional;
mod next;
mod node;
mod run_context;
mod state_graph;

pub use compile_error::CompilationError;
pub use compiled::CompiledStateGraph;
pub use conditional::{ConditionalRouter, ConditionalRouterFn, NextEntry};
pub use next::Next;
pub use node::Node;
pub use run_context::{ApprovalFn, RunConfig, RunContext};
pub use state_graph::{StateGraph, END, START};
