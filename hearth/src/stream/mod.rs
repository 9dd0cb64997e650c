//! Streaming types for graph runs.
//!
//! The runtime emits typed events through an async-iterator abstraction
//! (`tokio` channel + `ReceiverStream`); downstream consumers (e.g. a
//! WebSocket handler) convert them to wire frames. The runtime assumes no
//! specific transport. Wire names follow the event contract:
//! `on_chat_model_stream` for generated text chunks and `on_graph_end` for
//! the final state snapshot; node and tool lifecycle events are emitted for
//! observability.

use std::fmt::Debug;

use tokio::sync::mpsc;

/// One chunk of streamed message content.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageChunk {
    pub content: String,
}

/// Streamed event emitted while running a graph.
#[derive(Clone, Debug)]
pub enum StreamEvent<S>
where
    S: Clone + Send + Sync + Debug + 'static,
{
    /// A node began execution.
    NodeStart { node_id: String },
    /// Chunk of generated text from a model-backed node.
    ChatModelStream { chunk: MessageChunk, node_id: String },
    /// A tool invocation started.
    ToolStart { name: String },
    /// A tool invocation finished; `is_error` when the result is an error envelope.
    ToolEnd { name: String, is_error: bool },
    /// Final state snapshot; always the last event of a completed run.
    GraphEnd(S),
}

impl<S> StreamEvent<S>
where
    S: Clone + Send + Sync + Debug + 'static,
{
    /// Wire name of this event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NodeStart { .. } => "on_node_start",
            Self::ChatModelStream { .. } => "on_chat_model_stream",
            Self::ToolStart { .. } => "on_tool_start",
            Self::ToolEnd { .. } => "on_tool_end",
            Self::GraphEnd(_) => "on_graph_end",
        }
    }
}

/// Adapter that converts [`MessageChunk`] into `StreamEvent::ChatModelStream`
/// and sends it to the run's stream sender.
///
/// Used by model-backed nodes to avoid manual channel setup and forward
/// loops. Call [`channel`](ChunkToStreamSender::channel) to get
/// `(chunk_tx, chunk_rx)`, pass `chunk_tx` to the client's streaming invoke,
/// then await [`forward`](ChunkToStreamSender::forward) alongside it with
/// `tokio::join!` so all chunks are forwarded before the node returns.
pub struct ChunkToStreamSender<S>
where
    S: Clone + Send + Sync + Debug + 'static,
{
    stream_tx: mpsc::Sender<StreamEvent<S>>,
    node_id: String,
}

impl<S> ChunkToStreamSender<S>
where
    S: Clone + Send + Sync + Debug + 'static,
{
    pub fn new(stream_tx: mpsc::Sender<StreamEvent<S>>, node_id: impl Into<String>) -> Self {
        Self {
            stream_tx,
            node_id: node_id.into(),
        }
    }

    /// Returns `(chunk_tx, chunk_rx)`. Pass `chunk_tx` to the streaming
    /// invoke, then await `forward(chunk_rx)` together with it.
    pub fn channel(&self) -> (mpsc::Sender<MessageChunk>, mpsc::Receiver<MessageChunk>) {
        mpsc::channel::<MessageChunk>(128)
    }

    /// Forwards chunks from `chunk_rx` as `ChatModelStream` events.
    /// Completes when `chunk_rx` is closed (the invoke dropped its sender).
    pub async fn forward(&self, mut chunk_rx: mpsc::Receiver<MessageChunk>) {
        while let Some(chunk) = chunk_rx.recv().await {
            let event = StreamEvent::ChatModelStream {
                chunk,
                node_id: self.node_id.clone(),
            };
            let _ = self.stream_tx.send(event).await;
        }
    }
}
