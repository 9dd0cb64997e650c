//! End-to-end turns through the facade with mock models and stub tools.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::StreamExt;

use env_config::AppConfig;
use hearth::app::UserRequest;
use hearth::error::AgentError;
use hearth::llm::{
    ChatClient, ChatRole, EmbeddingClient, LlmDirectory, LlmResponse, MockEmbedder, MockLlm,
};
use hearth::message::Message;
use hearth::session::{HistoryStore, InMemoryHistoryStore};
use hearth::state::{Attachment, InputMode};
use hearth::stream::StreamEvent;
use hearth::tools::{error_envelope, Tool, ToolError, ToolProvider, ToolSpec};
use hearth::App;

struct MockDirectory(Arc<MockLlm>);

#[async_trait]
impl LlmDirectory for MockDirectory {
    async fn get_client(
        &self,
        _role: ChatRole,
        _task_type: Option<&str>,
    ) -> Result<Arc<dyn ChatClient>, AgentError> {
        Ok(self.0.clone())
    }
    async fn get_embedding_client(&self) -> Result<Arc<dyn EmbeddingClient>, AgentError> {
        Ok(Arc::new(MockEmbedder::default()))
    }
    async fn count_tokens(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| std::cmp::max(1, m.content().len() / 4))
            .sum()
    }
    async fn cleanup(&self) {}
}

/// Tool that always answers with a timeout error envelope.
struct AlwaysTimeoutTool;

#[async_trait]
impl Tool for AlwaysTimeoutTool {
    fn name(&self) -> &str {
        "stub_lookup"
    }
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "stub_lookup".into(),
            description: Some("Always times out".into()),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }
    async fn call(&self, _args: serde_json::Value) -> Result<String, ToolError> {
        Ok(error_envelope(
            "tool_timeout",
            "Tool 'stub_lookup' execution timed out.",
            "stub_lookup",
            None,
        ))
    }
}

struct StubProvider;

#[async_trait]
impl ToolProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }
    async fn load_tools(&self) -> Result<Vec<Arc<dyn Tool>>, ToolError> {
        Ok(vec![Arc::new(AlwaysTimeoutTool)])
    }
}

async fn build_app(
    llm: Arc<MockLlm>,
    history: Arc<dyn HistoryStore>,
    config: AppConfig,
) -> App {
    App::builder(config)
        .with_llm(Arc::new(MockDirectory(llm)))
        .with_history_store(history)
        .with_tool_providers(vec![Arc::new(StubProvider) as Arc<dyn ToolProvider>])
        .build()
        .await
        .expect("app builds")
}

fn action_block(tool: &str, query: &str) -> String {
    format!(
        "I will look this up.\n```json\n{{\"action\": {{\"tool_name\": \"{tool}\", \"args\": {{\"query\": \"{query}\"}}}}}}\n```"
    )
}

fn finish_block(answer: &str) -> String {
    format!("Enough retries.\n```json\n{{\"finish\": {{\"answer\": \"{answer}\"}}}}\n```")
}

fn text_response(content: &str) -> LlmResponse {
    LlmResponse {
        content: content.to_string(),
        ..Default::default()
    }
}

/// Scenario: direct chat emits at least one chat stream chunk, ends with a
/// graph end whose history tail is an AI message, and persists the annotated
/// turn.
#[tokio::test(flavor = "multi_thread")]
async fn direct_chat_streams_and_persists() {
    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let llm = Arc::new(MockLlm::new("Hi there, how can I help?"));
    let app = build_app(llm, history.clone(), AppConfig::default()).await;

    let events: Vec<_> = app
        .process_user_request(UserRequest::new("s1", "hello", InputMode::Direct))
        .collect()
        .await;

    let chunks: Vec<&StreamEvent<_>> = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::ChatModelStream { .. }))
        .collect();
    assert!(!chunks.is_empty(), "at least one on_chat_model_stream event");

    let final_state = match events.last() {
        Some(StreamEvent::GraphEnd(state)) => state.clone(),
        other => panic!("expected trailing GraphEnd, got {other:?}"),
    };
    let last = final_state.chat_history.last().expect("history tail");
    assert!(last.is_ai());
    assert_eq!(last.content(), "Hi there, how can I help?");

    // Wait for the post-stream history commit.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let stored = history.latest("s1", 10).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored[0].is_human());
    assert_eq!(stored[0].content(), "hello");
    assert!(stored[1].is_ai());
    for message in &stored {
        assert_eq!(
            message.attributes().get("mode"),
            Some(&serde_json::json!("direct"))
        );
        assert!(message.attributes().contains_key("timestamp"));
    }

    app.shutdown().await;
}

/// Scenario: a `<planning>` tag routes the turn into agent mode with
/// agent_mode "high" and the tags stripped from the delivered input.
#[tokio::test(flavor = "multi_thread")]
async fn planning_tag_overrides_mode() {
    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let llm = Arc::new(MockLlm::new("fallback").with_responses(vec![
        text_response(r#"{"task_summary": "refactor", "steps": ["step 1"]}"#),
        text_response(&finish_block("The parser was refactored.")),
        text_response("All done: the parser was refactored."),
    ]));
    let app = build_app(llm, history, AppConfig::default()).await;

    let events: Vec<_> = app
        .process_user_request(UserRequest::new(
            "s1",
            "<planning>refactor the parser</planning>",
            InputMode::Direct,
        ))
        .collect()
        .await;

    let final_state = match events.last() {
        Some(StreamEvent::GraphEnd(state)) => state.clone(),
        other => panic!("expected trailing GraphEnd, got {other:?}"),
    };
    assert_eq!(final_state.mode, Some(InputMode::Agent));
    assert_eq!(final_state.agent_mode.as_deref(), Some("high"));
    assert_eq!(final_state.input, "refactor the parser", "tags stripped");

    app.shutdown().await;
}

/// Scenario: with web search disallowed by privacy policy, a search turn is
/// forced into attachment-only mode: no queries, empty results, and a
/// summary produced from RAG over the attachment.
#[tokio::test(flavor = "multi_thread")]
async fn search_with_privacy_off_is_attachment_only() {
    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let llm = Arc::new(MockLlm::new("Summary drawn from the attachment."));
    let mut config = AppConfig::default();
    config.privacy.allow_web_search = false;
    let app = build_app(llm, history, config).await;

    let mut request = UserRequest::new("s1", "what does the doc say?", InputMode::Search);
    request.attachments = vec![Attachment {
        name: "doc.txt".into(),
        path: None,
        content: "The document describes the quarterly results in detail.".into(),
    }];

    let events: Vec<_> = app.process_user_request(request).collect().await;
    let final_state = match events.last() {
        Some(StreamEvent::GraphEnd(state)) => state.clone(),
        other => panic!("expected trailing GraphEnd, got {other:?}"),
    };

    assert!(final_state.skip_web_search, "privacy forces skip_web_search");
    assert_eq!(final_state.search_queries, Some(Vec::new()));
    assert_eq!(final_state.search_results, Some(Vec::new()));
    let last = final_state.chat_history.last().unwrap();
    assert!(last.is_ai());
    assert!(!last.content().is_empty());

    app.shutdown().await;
}

/// Scenario: a long base64 attachment reaches the graph decoded to its
/// plain-text content.
#[tokio::test(flavor = "multi_thread")]
async fn base64_attachment_reaches_graph_decoded() {
    use base64::Engine;

    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let llm = Arc::new(MockLlm::new("noted"));
    let app = build_app(llm, history, AppConfig::default()).await;

    let plain = "hello world ".repeat(12);
    let encoded = base64::engine::general_purpose::STANDARD.encode(plain.as_bytes());
    assert!(encoded.len() > 100, "decode heuristic requires length > 100");

    let mut request = UserRequest::new("s1", "summarize the doc", InputMode::Search);
    request.skip_web_search = true;
    request.attachments = vec![Attachment {
        name: "doc.txt".into(),
        path: None,
        content: encoded,
    }];

    let events: Vec<_> = app.process_user_request(request).collect().await;
    let final_state = match events.last() {
        Some(StreamEvent::GraphEnd(state)) => state.clone(),
        other => panic!("expected trailing GraphEnd, got {other:?}"),
    };
    assert_eq!(final_state.search_attachments.len(), 1);
    assert_eq!(final_state.search_attachments[0].content, plain);

    app.shutdown().await;
}

/// Scenario: the ReAct loop retries a failing tool twice, then finishes.
/// The scratchpad holds exactly two tool messages, the synthesize node
/// produces one final AI message, and history is appended once.
#[tokio::test(flavor = "multi_thread")]
async fn react_loop_terminates_after_retries() {
    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let llm = Arc::new(MockLlm::new("fallback").with_responses(vec![
        text_response(r#"{"task_summary": "look things up", "steps": ["search"]}"#),
        text_response(&action_block("stub_lookup", "first try")),
        text_response(&action_block("stub_lookup", "second try")),
        text_response(&finish_block("The tool kept timing out; no data available.")),
        text_response("I could not retrieve the data: the lookup tool timed out."),
    ]));
    let app = build_app(llm, history.clone(), AppConfig::default()).await;

    let events: Vec<_> = app
        .process_user_request(UserRequest::new("s1", "look this up", InputMode::Agent))
        .collect()
        .await;

    let final_state = match events.last() {
        Some(StreamEvent::GraphEnd(state)) => state.clone(),
        other => panic!("expected trailing GraphEnd, got {other:?}"),
    };

    let tool_messages: Vec<_> = final_state
        .scratchpad
        .iter()
        .filter(|m| m.is_tool())
        .collect();
    assert_eq!(tool_messages.len(), 2, "exactly two tool observations");
    for message in &tool_messages {
        let parsed: serde_json::Value = serde_json::from_str(message.content()).unwrap();
        assert_eq!(parsed["error"], true);
        assert_eq!(parsed["error_code"], "tool_timeout");
    }

    assert!(final_state.agent_outcome.is_some(), "finish reached");
    assert_eq!(final_state.messages.len(), 1, "one synthesized AI message");
    assert!(final_state.messages[0].is_ai());

    let tool_events: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::ToolEnd { is_error: true, .. }))
        .collect();
    assert_eq!(tool_events.len(), 2, "tool lifecycle events observed");

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let stored = history.latest("s1", 10).await.unwrap();
    assert_eq!(stored.len(), 2, "history appended once (human + ai)");
    assert!(stored[1].is_ai());

    app.shutdown().await;
}

/// Dropping the event stream cancels the run without a history commit.
#[tokio::test(flavor = "multi_thread")]
async fn dropping_stream_cancels_without_commit() {
    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let llm = Arc::new(MockLlm::new("response"));
    let app = build_app(llm, history.clone(), AppConfig::default()).await;

    let stream = app.process_user_request(UserRequest::new("s1", "hello", InputMode::Direct));
    drop(stream);

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let stored = history.latest("s1", 10).await.unwrap();
    assert!(stored.is_empty(), "cancelled turn commits nothing");

    app.shutdown().await;
}
