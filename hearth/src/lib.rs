//! # Hearth
//!
//! A local-first conversational runtime in Rust. One typed state flows through a
//! **state-in, state-out** graph of processing nodes; the graph suspends on local
//! model inference, invokes tools, retrieves and forms episodic memories, and
//! streams results back to the caller as typed events.
//!
//! ## Design principles
//!
//! - **Single state type**: Each turn owns one [`AgentState`] that every node
//!   reads from and writes to; nodes read-then-return, the runtime overwrites.
//! - **Local models as processes**: Inference backends are child processes
//!   managed by a [`runner::ProcessRunner`] behind the [`runner::LocalModelRunner`]
//!   trait; clients reach them over an OpenAI-compatible HTTP contract.
//! - **Best-effort memory**: The episodic memory pipeline never fails a turn;
//!   retrieval degrades to an empty result and formation errors are swallowed.
//! - **Explicit dependency injection**: The facade constructs every component
//!   once and passes references down; the only process-wide mutable state is
//!   the runner's process table.
//!
//! ## Main modules
//!
//! - [`graph`]: [`StateGraph`], [`CompiledStateGraph`], [`Node`], [`Next`],
//!   [`RunContext`]: build and run state graphs with conditional edges.
//! - [`stream`]: [`StreamEvent`] and chunk forwarding for streaming runs.
//! - [`message`]: [`Message`] (Human / Ai / System / Tool) and [`ToolCall`].
//! - [`state`]: [`AgentState`] and the per-turn value types.
//! - [`runner`]: local backend process lifecycle, health checks, tokenize RPC.
//! - [`registry`]: persistent model catalog, download policy and downloads.
//! - [`llm`]: [`ChatClient`] / [`EmbeddingClient`] traits, the local HTTP
//!   clients, mocks, and the role-keyed [`LlmService`] client factory.
//! - [`tools`]: [`Tool`] / [`ToolProvider`] traits, the [`ToolFabric`], native
//!   web tools and the remote JSON-RPC provider.
//! - [`memory`]: [`VectorStore`] trait, in-memory store, and the episodic
//!   memory pipelines (segmentation, refinement, two-stage retrieval).
//! - [`context`]: token-budgeted history trimming.
//! - [`rag`]: chunk collection, embedding and similarity-ranked context.
//! - [`session`]: per-session resources and the [`HistoryStore`] contract.
//! - [`prompts`]: template resolution for node prompts.
//! - [`agent`]: the conversation graph nodes and routing.
//! - [`app`]: the facade assembling everything; [`App::process_user_request`]
//!   is the per-request entry point.

pub mod agent;
pub mod app;
pub mod context;
pub mod error;
pub mod graph;
pub mod llm;
pub mod memory;
pub mod message;
pub mod prompts;
pub mod rag;
pub mod registry;
pub mod runner;
pub mod session;
pub mod state;
pub mod stream;
pub mod tools;

pub use app::App;
pub use error::AgentError;
pub use graph::{CompiledStateGraph, Next, Node, RunContext, StateGraph, END, START};
pub use llm::{ChatClient, EmbeddingClient, LlmService};
pub use message::{Message, ToolCall};
pub use session::HistoryStore;
pub use state::AgentState;
pub use stream::StreamEvent;
pub use tools::{Tool, ToolFabric, ToolProvider};
