//! Run context passed into nodes for streaming-aware execution.
//!
//! Holds the per-run configuration (recursion limit, optional approval
//! callback) and the optional stream sender. Nodes that stream model output
//! read `stream_tx`; the tool node consults `config.approval` before running
//! tools that require confirmation.

use std::fmt::Debug;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::stream::StreamEvent;

/// Default maximum node entries per run.
pub const DEFAULT_RECURSION_LIMIT: usize = 50;

/// Approval callback: `(tool_name, args) -> approved?`.
///
/// Supplied per-request by the caller; consulted by the tool execution node
/// before invoking tools marked dangerous. Absent callback means approved.
pub type ApprovalFn = Arc<dyn Fn(&str, &Value) -> BoxFuture<'static, bool> + Send + Sync>;

/// Per-run configuration.
#[derive(Clone, Default)]
pub struct RunConfig {
    /// Maximum node entries before the run is terminated with the current state.
    pub recursion_limit: Option<usize>,
    /// Optional approval callback for dangerous tools.
    pub approval: Option<ApprovalFn>,
}

impl RunConfig {
    pub fn recursion_limit(&self) -> usize {
        self.recursion_limit.unwrap_or(DEFAULT_RECURSION_LIMIT)
    }
}

impl Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("recursion_limit", &self.recursion_limit)
            .field("has_approval", &self.approval.is_some())
            .finish()
    }
}

/// Run context passed into nodes for streaming-aware execution.
#[derive(Clone)]
pub struct RunContext<S>
where
    S: Clone + Send + Sync + Debug + 'static,
{
    /// Config for the current run.
    pub config: RunConfig,
    /// Optional sender for streaming events. Closed when the caller dropped
    /// the event stream; the run loop treats that as cancellation.
    pub stream_tx: Option<mpsc::Sender<StreamEvent<S>>>,
}

impl<S> RunContext<S>
where
    S: Clone + Send + Sync + Debug + 'static,
{
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            stream_tx: None,
        }
    }

    /// True when the caller has dropped the event stream.
    pub fn is_cancelled(&self) -> bool {
        self.stream_tx.as_ref().is_some_and(|tx| tx.is_closed())
    }

    /// Sends a stream event when streaming is active; drops it otherwise.
    pub async fn emit(&self, event: StreamEvent<S>) {
        if let Some(tx) = &self.stream_tx {
            let _ = tx.send(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug)]
    struct DummyState;

    /// **Scenario**: default recursion limit applies when not configured.
    #[test]
    fn default_recursion_limit() {
        let config = RunConfig::default();
        assert_eq!(config.recursion_limit(), DEFAULT_RECURSION_LIMIT);
        let config = RunConfig {
            recursion_limit: Some(7),
            ..Default::default()
        };
        assert_eq!(config.recursion_limit(), 7);
    }

    /// **Scenario**: is_cancelled reflects receiver drop; emit on a closed
    /// channel is a no-op.
    #[tokio::test]
    async fn cancelled_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel::<StreamEvent<DummyState>>(1);
        let mut ctx = RunContext::new(RunConfig::default());
        ctx.stream_tx = Some(tx);
        assert!(!ctx.is_cancelled());
        drop(rx);
        assert!(ctx.is_cancelled());
        ctx.emit(StreamEvent::NodeStart {
            node_id: "n".into(),
        })
        .await;
    }

    /// **Scenario**: context without sender is never cancelled.
    #[test]
    fn no_sender_never_cancelled() {
        let ctx: RunContext<DummyState> = RunContext::new(RunConfig::default());
        assert!(!ctx.is_cancelled());
    }
}
