//! ReAct loop nodes: order generation, reasoning, tool execution,
//! scratchpad updates and final response synthesis.
//!
//! The reasoning node prompts for a plain-text thought followed by one JSON
//! block carrying either an `action` (tool call) or a `finish` (answer).
//! Parse failures append a self-correction message to the scratchpad and
//! re-enter reasoning; exceeding the iteration budget summarizes the
//! scratchpad into the outcome instead of failing the turn.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::context::ContextWindowManager;
use crate::error::AgentError;
use crate::graph::{Next, Node, RunContext};
use crate::llm::{ChatRole, LlmDirectory, LlmResponse};
use crate::message::{Message, ToolCall};
use crate::prompts::{keys, render, PromptResolver, EXECUTOR_ATTENTION_SINK};
use crate::state::AgentState;
use crate::stream::{ChunkToStreamSender, StreamEvent};
use crate::tools::{error_envelope, parse_tool_error, ToolFabric, ToolSpec, DANGEROUS_TOOLS};

use super::node_ids;
use super::routing::format_scratchpad;

static JSON_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*\n(.*?)\n\s*```").unwrap_or_else(|_| unreachable!()));

/// Formats tool specs for the reasoning prompt.
fn format_tools_for_prompt(specs: &[ToolSpec]) -> String {
    if specs.is_empty() {
        return "(no tools available)".to_string();
    }
    specs
        .iter()
        .map(|spec| {
            format!(
                "- {}: {}\n  args schema: {}",
                spec.name,
                spec.description.as_deref().unwrap_or("(no description)"),
                spec.input_schema
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Converts the user request into a structured execution order.
pub struct GenerateOrderNode {
    llm: Arc<dyn LlmDirectory>,
    tools: Arc<ToolFabric>,
    prompts: Arc<dyn PromptResolver>,
}

impl GenerateOrderNode {
    pub fn new(
        llm: Arc<dyn LlmDirectory>,
        tools: Arc<ToolFabric>,
        prompts: Arc<dyn PromptResolver>,
    ) -> Self {
        Self { llm, tools, prompts }
    }

    fn fallback_order(input: &str) -> Value {
        json!({
            "task_summary": input,
            "steps": [
                "Research the user's request using available tools.",
                "Synthesize the findings.",
            ],
        })
    }
}

#[async_trait]
impl Node<AgentState> for GenerateOrderNode {
    fn id(&self) -> &str {
        node_ids::GENERATE_ORDER
    }

    async fn run(&self, mut state: AgentState) -> Result<(AgentState, Next), AgentError> {
        info!("node: generate order");

        let system = format!(
            "{}\n\n--- Relevant Context from Past Conversations ---\n{}",
            self.prompts.resolve_or(keys::ORDER_GENERATION, ""),
            state
                .synthesized_memory
                .as_deref()
                .unwrap_or("No relevant context.")
        );
        let tools_text = format_tools_for_prompt(&self.tools.list_specs());
        let human = format!(
            "Based on the user's request and the provided context, generate a structured plan (Order).\n\n\
             --- User Request ---\n{}\n\n--- Available Tools ---\n{}\n\n\
             Please generate the JSON order now.",
            state.input, tools_text
        );

        let order = match self.llm.get_client(ChatRole::Character, None).await {
            Ok(client) => match client
                .invoke(&[Message::system(system), Message::human(human)])
                .await
            {
                Ok(response) => serde_json::from_str::<Value>(&response.content)
                    .unwrap_or_else(|_| Self::fallback_order(&state.input)),
                Err(err) => {
                    warn!(error = %err, "order generation failed; using fallback order");
                    Self::fallback_order(&state.input)
                }
            },
            Err(err) => {
                warn!(error = %err, "order model unavailable; using fallback order");
                Self::fallback_order(&state.input)
            }
        };

        state.order = Some(order);
        Ok((state, Next::Continue))
    }
}

/// Core ReAct reasoning node.
pub struct AgentReasoningNode {
    llm: Arc<dyn LlmDirectory>,
    tools: Arc<ToolFabric>,
    prompts: Arc<dyn PromptResolver>,
}

impl AgentReasoningNode {
    pub fn new(
        llm: Arc<dyn LlmDirectory>,
        tools: Arc<ToolFabric>,
        prompts: Arc<dyn PromptResolver>,
    ) -> Self {
        Self { llm, tools, prompts }
    }

    /// Parses the `thought + json block` contract. Returns
    /// `(thought, parsed_json)`.
    fn parse_reasoning_output(content: &str) -> Result<(String, Value), String> {
        let captures = JSON_BLOCK
            .captures(content)
            .ok_or_else(|| "Invalid format: JSON block not found in the output.".to_string())?;
        let json_match = captures.get(0).map(|m| m.start()).unwrap_or(0);
        let thought = content[..json_match].trim().to_string();
        let json_str = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        let parsed: Value =
            serde_json::from_str(json_str).map_err(|e| format!("Invalid JSON: {e}"))?;
        Ok((thought, parsed))
    }
}

#[async_trait]
impl Node<AgentState> for AgentReasoningNode {
    fn id(&self) -> &str {
        node_ids::AGENT_REASONING
    }

    async fn run(&self, state: AgentState) -> Result<(AgentState, Next), AgentError> {
        let ctx = RunContext::new(Default::default());
        self.run_with_context(state, &ctx).await
    }

    async fn run_with_context(
        &self,
        mut state: AgentState,
        ctx: &RunContext<AgentState>,
    ) -> Result<(AgentState, Next), AgentError> {
        info!(iteration = state.reason_iterations + 1, "node: agent reasoning");
        state.reason_iterations += 1;

        // Iteration budget exhausted: summarize the scratchpad into the
        // outcome instead of looping further.
        if state.reason_iterations > ctx.config.recursion_limit() {
            warn!(
                iterations = state.reason_iterations,
                "reasoning iteration budget exhausted; summarizing scratchpad"
            );
            state.agent_outcome = Some(format!(
                "The agent could not complete the task within the step budget. \
                 The following is the internal work log:\n{}",
                format_scratchpad(&state.scratchpad)
            ));
            state.messages = Vec::new();
            return Ok((state, Next::Continue));
        }

        // The agent mode hint ("high" | "fast" | "direct") doubles as the
        // executor task type; unknown types fall back to the default
        // assignment inside the service.
        let task_type = state.agent_mode.clone();
        let client = match self
            .llm
            .get_client(ChatRole::Executor, task_type.as_deref())
            .await
        {
            Ok(client) => client,
            Err(err) => {
                error!(error = %err, "executor model unavailable; ending loop");
                state.agent_outcome = Some(
                    "The execution model is unavailable; the task could not be carried out."
                        .to_string(),
                );
                state.messages = Vec::new();
                return Ok((state, Next::Continue));
            }
        };

        let tools_text = format_tools_for_prompt(&self.tools.list_specs());
        let system = format!(
            "{EXECUTOR_ATTENTION_SINK}\n\n--- System Instructions & Tools ---\n{}",
            render(
                &self.prompts.resolve_or(keys::REACT_SYSTEM, "{tools}"),
                &[("tools", tools_text.as_str())],
            )
        );

        let order_text = state
            .order
            .as_ref()
            .and_then(|order| serde_json::to_string_pretty(order).ok())
            .unwrap_or_else(|| "{}".to_string());
        let long_term = state
            .synthesized_memory
            .as_deref()
            .unwrap_or("No relevant long-term memories found.");
        let short_term = format_scratchpad(&state.scratchpad);
        let human = format!(
            "You must now execute the following order. Use the provided memories and your \
             reasoning abilities to complete the task.\n\n\
             --- Order ---\nUser's Original Request: {}\n\nExecution Plan:\n{}\n\n\
             --- Long-Term Memory (Context from past conversations) ---\n{}\n\n\
             --- Short-Term Memory (Your work history for this order) ---\n{}",
            state.input, order_text, long_term, short_term
        );

        let response = client
            .invoke(&[Message::system(system), Message::human(human)])
            .await
            .unwrap_or_else(|err| {
                error!(error = %err, "reasoning invocation failed");
                LlmResponse::default()
            });
        debug!(content = %response.content, "reasoning raw output");

        match Self::parse_reasoning_output(&response.content) {
            Ok((thought, parsed)) => {
                if let Some(action) = parsed.get("action") {
                    let Some(tool_name) = action.get("tool_name").and_then(Value::as_str) else {
                        let correction = Message::ai(
                            "My last attempt failed. The 'action' object must contain a \
                             'tool_name' key. I must correct my output.",
                        );
                        state.scratchpad.push(correction);
                        return Ok((state, Next::Continue));
                    };
                    let call = ToolCall {
                        id: format!("tool_call_{}", state.scratchpad.len()),
                        name: tool_name.to_string(),
                        args: action.get("args").cloned().unwrap_or_else(|| json!({})),
                    };
                    debug!(tool = %call.name, "tool call produced");
                    let message = Message::ai_with_tool_calls(thought, vec![call]);
                    state.scratchpad.push(message.clone());
                    state.messages = vec![message];
                } else if let Some(finish) = parsed.get("finish") {
                    let answer = finish
                        .get("answer")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    info!("finish action detected");
                    state.agent_outcome = Some(format!(
                        "Thought Process:\n{thought}\n\nTechnical Report:\n{answer}"
                    ));
                    state.messages = Vec::new();
                } else {
                    let correction = Message::ai(
                        "My last attempt failed. The JSON block must contain either an \
                         'action' or a 'finish' key. I must correct my output.",
                    );
                    state.scratchpad.push(correction);
                }
            }
            Err(parse_error) => {
                // Self-correction: record the failure in the scratchpad and
                // re-enter reasoning.
                warn!(error = %parse_error, "reasoning output unparseable; appending self-correction");
                let correction = Message::ai(format!(
                    "My last attempt failed. The response was not in the correct 'Thought then \
                     JSON' format. Error: {parse_error}. I must correct my output to be a plain \
                     text thought, followed by a valid JSON block in ```json code fences."
                ));
                state.scratchpad.push(correction);
            }
        }

        Ok((state, Next::Continue))
    }
}

/// Executes the tool calls of the last mailbox message through the fabric.
pub struct ToolExecNode {
    tools: Arc<ToolFabric>,
}

impl ToolExecNode {
    pub fn new(tools: Arc<ToolFabric>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl Node<AgentState> for ToolExecNode {
    fn id(&self) -> &str {
        node_ids::TOOL_NODE
    }

    async fn run(&self, state: AgentState) -> Result<(AgentState, Next), AgentError> {
        let ctx = RunContext::new(Default::default());
        self.run_with_context(state, &ctx).await
    }

    async fn run_with_context(
        &self,
        mut state: AgentState,
        ctx: &RunContext<AgentState>,
    ) -> Result<(AgentState, Next), AgentError> {
        info!("node: tool executor");

        let tool_calls: Vec<ToolCall> = match state.messages.last() {
            Some(message) if message.is_ai() && !message.tool_calls().is_empty() => {
                message.tool_calls().to_vec()
            }
            _ => {
                debug!("no tool calls in last message");
                return Ok((state, Next::Continue));
            }
        };

        for call in tool_calls {
            info!(tool = %call.name, call_id = %call.id, "executing tool call");
            ctx.emit(StreamEvent::ToolStart {
                name: call.name.clone(),
            })
            .await;

            // Dangerous tools go through the per-request approval callback.
            let denied = if DANGEROUS_TOOLS.contains(&call.name.as_str()) {
                match &ctx.config.approval {
                    Some(approval) => !(approval)(&call.name, &call.args).await,
                    None => false,
                }
            } else {
                false
            };

            let result = if denied {
                warn!(tool = %call.name, "tool execution denied by approval callback");
                error_envelope(
                    "tool_approval_denied",
                    &format!("Tool '{}' was not approved for execution.", call.name),
                    &call.name,
                    None,
                )
            } else {
                self.tools.aexecute(&call.name, call.args.clone()).await
            };

            let is_error = parse_tool_error(&result).is_some();
            ctx.emit(StreamEvent::ToolEnd {
                name: call.name.clone(),
                is_error,
            })
            .await;

            state.messages.push(Message::tool(result, call.id));
        }

        Ok((state, Next::Continue))
    }
}

/// Transfers trailing tool messages from the mailbox into the scratchpad.
pub struct UpdateScratchpadNode;

#[async_trait]
impl Node<AgentState> for UpdateScratchpadNode {
    fn id(&self) -> &str {
        node_ids::UPDATE_SCRATCHPAD
    }

    async fn run(&self, mut state: AgentState) -> Result<(AgentState, Next), AgentError> {
        info!("node: update scratchpad");

        let mut tool_messages: Vec<Message> = Vec::new();
        for message in state.messages.iter().rev() {
            if message.is_tool() {
                tool_messages.insert(0, message.clone());
            } else {
                break;
            }
        }
        if tool_messages.is_empty() {
            warn!("no tool messages found to update scratchpad");
            return Ok((state, Next::Continue));
        }
        debug!(count = tool_messages.len(), "tool results added to scratchpad");
        state.scratchpad.extend(tool_messages);
        Ok((state, Next::Continue))
    }
}

/// Converts the internal report into a natural user-facing response.
pub struct SynthesizeFinalNode {
    llm: Arc<dyn LlmDirectory>,
    context: Arc<ContextWindowManager>,
    prompts: Arc<dyn PromptResolver>,
    max_local_tokens: usize,
}

impl SynthesizeFinalNode {
    pub fn new(
        llm: Arc<dyn LlmDirectory>,
        context: Arc<ContextWindowManager>,
        prompts: Arc<dyn PromptResolver>,
        max_local_tokens: usize,
    ) -> Self {
        Self {
            llm,
            context,
            prompts,
            max_local_tokens,
        }
    }
}

#[async_trait]
impl Node<AgentState> for SynthesizeFinalNode {
    fn id(&self) -> &str {
        node_ids::SYNTHESIZE_FINAL_RESPONSE
    }

    async fn run(&self, state: AgentState) -> Result<(AgentState, Next), AgentError> {
        let ctx = RunContext::new(Default::default());
        self.run_with_context(state, &ctx).await
    }

    async fn run_with_context(
        &self,
        mut state: AgentState,
        ctx: &RunContext<AgentState>,
    ) -> Result<(AgentState, Next), AgentError> {
        info!("node: synthesize final response");

        let internal_report = match &state.agent_outcome {
            Some(outcome) => outcome.clone(),
            None => {
                warn!("no agent outcome; synthesizing from scratchpad as a fallback");
                format!(
                    "The agent could not produce a final report. The following is the internal \
                     work log:\n{}",
                    format_scratchpad(&state.scratchpad)
                )
            }
        };

        let persona = self.prompts.resolve_or(keys::PERSONA, "");
        let synthesis = render(
            &self.prompts.resolve_or(keys::SYNTHESIS, "{technical_report}"),
            &[("technical_report", internal_report.as_str())],
        );
        let system = format!(
            "{persona}\n\n{synthesis}\n\n--- Relevant Context from Past Conversations ---\n{}",
            state
                .synthesized_memory
                .as_deref()
                .unwrap_or("No relevant memories found.")
        );

        let (limited_history, _) = self
            .context
            .build_local_context(&state.chat_history, Some(self.max_local_tokens), None)
            .await;
        let mut messages = vec![Message::system(system)];
        messages.extend(limited_history);
        messages.push(Message::human(format!(
            "Please provide the final response for my request: {}",
            state.input
        )));

        let response = match self.llm.get_client(ChatRole::Character, None).await {
            Ok(client) => {
                let result = if let Some(stream_tx) = ctx.stream_tx.clone() {
                    let adapter = ChunkToStreamSender::new(stream_tx, self.id());
                    let (chunk_tx, chunk_rx) = adapter.channel();
                    let (result, ()) = tokio::join!(
                        client.invoke_stream(&messages, Some(chunk_tx)),
                        adapter.forward(chunk_rx),
                    );
                    result
                } else {
                    client.invoke(&messages).await
                };
                result.unwrap_or_else(|err| {
                    error!(error = %err, "final synthesis failed");
                    LlmResponse {
                        content: internal_report.clone(),
                        ..Default::default()
                    }
                })
            }
            Err(err) => {
                error!(error = %err, "synthesis model unavailable; returning raw report");
                LlmResponse {
                    content: internal_report.clone(),
                    ..Default::default()
                }
            }
        };

        let content = if response.content.is_empty() {
            internal_report
        } else {
            response.content
        };
        state.messages = vec![Message::ai(content.clone())];
        state.chat_history.push(Message::human(state.input.clone()));
        state.chat_history.push(Message::ai(content));
        state.generation_logprobs = response.logprobs;
        Ok((state, Next::Continue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: the thought/JSON contract parses actions, finishes, and
    /// rejects missing blocks.
    #[test]
    fn reasoning_output_parsing() {
        let content = "I should look this up.\n```json\n{\"action\": {\"tool_name\": \"native_web_search\", \"args\": {\"query\": \"x\"}}}\n```";
        let (thought, parsed) = AgentReasoningNode::parse_reasoning_output(content).unwrap();
        assert_eq!(thought, "I should look this up.");
        assert_eq!(parsed["action"]["tool_name"], "native_web_search");

        let finish = "Done.\n```json\n{\"finish\": {\"answer\": \"42\"}}\n```";
        let (_, parsed) = AgentReasoningNode::parse_reasoning_output(finish).unwrap();
        assert_eq!(parsed["finish"]["answer"], "42");

        assert!(AgentReasoningNode::parse_reasoning_output("no block here").is_err());
        assert!(
            AgentReasoningNode::parse_reasoning_output("t\n```json\nnot json\n```").is_err()
        );
    }

    /// **Scenario**: tool formatting includes name, description and schema.
    #[test]
    fn tool_prompt_formatting() {
        assert_eq!(format_tools_for_prompt(&[]), "(no tools available)");
        let specs = vec![ToolSpec {
            name: "native_web_search".into(),
            description: Some("Search the web".into()),
            input_schema: json!({"type": "object"}),
        }];
        let formatted = format_tools_for_prompt(&specs);
        assert!(formatted.contains("native_web_search"));
        assert!(formatted.contains("Search the web"));
        assert!(formatted.contains("args schema"));
    }

    /// **Scenario**: the fallback order carries the request and two steps.
    #[test]
    fn fallback_order_shape() {
        let order = GenerateOrderNode::fallback_order("do the thing");
        assert_eq!(order["task_summary"], "do the thing");
        assert_eq!(order["steps"].as_array().unwrap().len(), 2);
    }

    /// **Scenario**: update scratchpad moves only the trailing tool messages.
    #[tokio::test]
    async fn update_scratchpad_collects_trailing_tools() {
        use crate::state::InputMode;
        let node = UpdateScratchpadNode;
        let mut state = AgentState::initial("s", "x", InputMode::Agent, vec![]);
        state.messages = vec![
            Message::ai("thought"),
            Message::tool("result 1", "tool_call_0"),
            Message::tool("result 2", "tool_call_1"),
        ];
        let (out, _) = node.run(state).await.unwrap();
        assert_eq!(out.scratchpad.len(), 2);
        assert_eq!(out.scratchpad[0].content(), "result 1");
        assert_eq!(out.scratchpad[1].content(), "result 2");
    }
}
