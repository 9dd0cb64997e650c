//! Search mode nodes: query generation, execution, and RAG-backed summary.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::context::ContextWindowManager;
use crate::error::AgentError;
use crate::graph::{Next, Node, RunContext};
use crate::llm::{ChatRole, LlmDirectory, LlmResponse};
use crate::message::Message;
use crate::prompts::{keys, render, PromptResolver};
use crate::rag::{RagContextBuilder, RagEngine};
use crate::state::{AgentState, Attachment, SearchGroup, SearchHit};
use crate::stream::ChunkToStreamSender;
use crate::tools::{parse_tool_error, ToolFabric, TOOL_WEB_SEARCH};

use super::node_ids;

/// Formats attachment summaries for the query-generation prompt.
fn format_attachment_summaries(attachments: &[Attachment]) -> String {
    const MAX_ITEMS: usize = 3;
    const MAX_PREVIEW_CHARS: usize = 400;

    if attachments.is_empty() {
        return "(none)".to_string();
    }
    attachments
        .iter()
        .take(MAX_ITEMS)
        .map(|attachment| {
            let preview: String = attachment.content.chars().take(MAX_PREVIEW_CHARS).collect();
            format!("- {}: {}", attachment.name, preview)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Formats attachment blocks for the summarize prompt.
fn format_attachment_blocks(attachments: &[Attachment]) -> String {
    const MAX_PREVIEW_CHARS: usize = 500;
    const MAX_TOTAL_CHARS: usize = 1500;

    if attachments.is_empty() {
        return "No attachments were provided.".to_string();
    }
    let blocks: Vec<String> = attachments
        .iter()
        .map(|attachment| {
            let path = attachment.path.as_deref().unwrap_or("(path unavailable)");
            let preview = if attachment.content.chars().count() > MAX_PREVIEW_CHARS {
                let head: String = attachment.content.chars().take(MAX_PREVIEW_CHARS).collect();
                format!("{head}... (see RAG context for relevant excerpts)")
            } else {
                attachment.content.clone()
            };
            format!(
                "### {}\nPath: {}\nContent Preview:\n{}",
                attachment.name, path, preview
            )
        })
        .collect();

    let mut result = blocks.join("\n\n");
    if result.chars().count() > MAX_TOTAL_CHARS {
        let head: String = result.chars().take(MAX_TOTAL_CHARS).collect();
        result = format!("{head}\n... (attachments truncated)");
    }
    result
}

/// Generates up to two diverse search queries from the user request.
pub struct GenerateSearchQueryNode {
    llm: Arc<dyn LlmDirectory>,
    prompts: Arc<dyn PromptResolver>,
}

impl GenerateSearchQueryNode {
    pub fn new(llm: Arc<dyn LlmDirectory>, prompts: Arc<dyn PromptResolver>) -> Self {
        Self { llm, prompts }
    }
}

#[async_trait]
impl Node<AgentState> for GenerateSearchQueryNode {
    fn id(&self) -> &str {
        node_ids::GENERATE_SEARCH_QUERY
    }

    async fn run(&self, mut state: AgentState) -> Result<(AgentState, Next), AgentError> {
        if state.skip_web_search {
            info!("node: generate search query (skipped - web search disabled)");
            state.search_queries = Some(Vec::new());
            return Ok((state, Next::Continue));
        }
        info!("node: generate search query");

        let base_request = state
            .search_query
            .clone()
            .unwrap_or_else(|| state.input.clone());
        let attachments_text = format_attachment_summaries(&state.search_attachments);
        let template = self.prompts.resolve_or(keys::SEARCH_QUERY_GEN, "{input}");
        let prompt = render(
            &template,
            &[("input", base_request.as_str()), ("attachments", attachments_text.as_str())],
        );

        let response = match self.llm.get_client(ChatRole::Character, None).await {
            Ok(client) => client
                .invoke(&[Message::human(prompt)])
                .await
                .unwrap_or_default(),
            Err(err) => {
                error!(error = %err, "query generation model unavailable; using raw input");
                LlmResponse::default()
            }
        };

        let mut queries: Vec<String> = response
            .content
            .lines()
            .map(|line| line.trim().trim_start_matches("- ").trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        queries.truncate(2);
        if queries.len() < 2 {
            let fallback = state.input.trim().to_string();
            if !fallback.is_empty() && !queries.contains(&fallback) {
                queries.push(fallback);
            }
        }

        info!(?queries, "generated search queries");
        state.search_queries = Some(queries);
        Ok((state, Next::Continue))
    }
}

/// Executes the generated queries through the search tool and aggregates
/// per-query result groups; failed queries keep an error entry inline.
pub struct ExecuteSearchNode {
    tools: Arc<ToolFabric>,
}

impl ExecuteSearchNode {
    pub fn new(tools: Arc<ToolFabric>) -> Self {
        Self { tools }
    }

    fn parse_hits(payload: &str) -> Result<Vec<SearchHit>, String> {
        let parsed: Value =
            serde_json::from_str(payload).map_err(|_| "Failed to parse search results.".to_string())?;
        let Some(results) = parsed.get("results").and_then(Value::as_array) else {
            return Err("Unexpected search response format.".to_string());
        };
        Ok(results
            .iter()
            .map(|item| SearchHit {
                title: item.get("title").and_then(Value::as_str).unwrap_or_default().to_string(),
                url: item.get("url").and_then(Value::as_str).unwrap_or_default().to_string(),
                snippet: item
                    .get("snippet")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                error: None,
            })
            .collect())
    }
}

#[async_trait]
impl Node<AgentState> for ExecuteSearchNode {
    fn id(&self) -> &str {
        node_ids::EXECUTE_SEARCH
    }

    async fn run(&self, mut state: AgentState) -> Result<(AgentState, Next), AgentError> {
        if state.skip_web_search {
            info!("node: execute search (skipped by request)");
            state.search_results = Some(Vec::new());
            return Ok((state, Next::Continue));
        }
        info!("node: execute search");

        let queries = state.search_queries.clone().unwrap_or_default();
        let mut aggregated = Vec::with_capacity(queries.len());
        for query in queries {
            info!(%query, "executing search query");
            let payload = self
                .tools
                .aexecute(TOOL_WEB_SEARCH, json!({"query": query}))
                .await;

            let results = if let Some(error) = parse_tool_error(&payload) {
                warn!(%query, error, "search tool returned error");
                vec![SearchHit {
                    error: Some(error),
                    ..Default::default()
                }]
            } else {
                match Self::parse_hits(&payload) {
                    Ok(hits) => hits,
                    Err(error) => {
                        warn!(%query, error, "search payload unusable");
                        vec![SearchHit {
                            error: Some(error),
                            ..Default::default()
                        }]
                    }
                }
            };
            aggregated.push(SearchGroup { query, results });
        }

        state.search_results = Some(aggregated);
        Ok((state, Next::Continue))
    }
}

/// Summarizes search results with RAG context; in attachment-only mode the
/// web portion is skipped entirely.
pub struct SummarizeSearchResultNode {
    llm: Arc<dyn LlmDirectory>,
    context: Arc<ContextWindowManager>,
    rag_engine: Arc<RagEngine>,
    rag_builder: Arc<RagContextBuilder>,
    tools: Arc<ToolFabric>,
    prompts: Arc<dyn PromptResolver>,
    max_local_tokens: usize,
}

impl SummarizeSearchResultNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmDirectory>,
        context: Arc<ContextWindowManager>,
        rag_engine: Arc<RagEngine>,
        rag_builder: Arc<RagContextBuilder>,
        tools: Arc<ToolFabric>,
        prompts: Arc<dyn PromptResolver>,
        max_local_tokens: usize,
    ) -> Self {
        Self {
            llm,
            context,
            rag_engine,
            rag_builder,
            tools,
            prompts,
            max_local_tokens,
        }
    }

    fn top_result_url(search_results: &[SearchGroup]) -> Option<String> {
        for group in search_results {
            if let Some(hit) = group.results.first() {
                if hit.error.is_none() && !hit.url.is_empty() {
                    return Some(hit.url.clone());
                }
            }
        }
        None
    }
}

#[async_trait]
impl Node<AgentState> for SummarizeSearchResultNode {
    fn id(&self) -> &str {
        node_ids::SUMMARIZE_SEARCH_RESULT
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
        info!("node: summarize search result");

        let skip_web = state.skip_web_search;
        let search_results = if skip_web {
            Vec::new()
        } else {
            state.search_results.clone().unwrap_or_default()
        };
        let top_url = if skip_web {
            None
        } else {
            Self::top_result_url(&search_results)
        };

        let (chunk_texts, chunk_sources) = self
            .rag_engine
            .collect_chunks(
                top_url.as_deref(),
                &state.search_attachments,
                Some(&self.tools),
                skip_web,
            )
            .await;

        let rag_context = match self.llm.get_embedding_client().await {
            Ok(embedding) => {
                self.rag_builder
                    .build_context(&chunk_texts, &chunk_sources, &state.input, &embedding)
                    .await
            }
            Err(err) => {
                warn!(error = %err, "embedding client unavailable; skipping RAG ranking");
                String::new()
            }
        };

        let mut synthesized = state
            .synthesized_memory
            .clone()
            .unwrap_or_else(|| "No relevant memories.".to_string());
        if synthesized.chars().count() > 1000 {
            let head: String = synthesized.chars().take(1000).collect();
            synthesized = format!("{head}\n... (memory truncated)");
        }

        let persona = self.prompts.resolve_or(keys::PERSONA, "");
        let system_template = self.prompts.resolve_or(keys::SEARCH_SUMMARIZE, "");
        let system = format!(
            "{persona}\n\n{system_template}\n\n<relevant_memory>\n{synthesized}\n</relevant_memory>"
        );

        let search_results_text =
            serde_json::to_string_pretty(&search_results).unwrap_or_else(|_| "[]".to_string());
        let attachments_text = format_attachment_blocks(&state.search_attachments);
        let human = format!(
            "Please summarize the search results for: {}\n\n\
             <web_search_results>\n{}\n</web_search_results>\n\n\
             <rag_context>\n{}\n</rag_context>\n\n\
             <attachments>\n{}\n</attachments>\n\n\
             Provide a comprehensive answer with citations where applicable.",
            state.input, search_results_text, rag_context, attachments_text
        );

        let (limited_history, _) = self
            .context
            .build_local_context(&state.chat_history, Some(self.max_local_tokens / 2), None)
            .await;

        let mut messages = vec![Message::system(system)];
        messages.extend(limited_history);
        messages.push(Message::human(human));

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
                    error!(error = %err, "search summarization failed");
                    LlmResponse::default()
                })
            }
            Err(err) => {
                error!(error = %err, "summarization model unavailable");
                LlmResponse::default()
            }
        };

        state
            .chat_history
            .push(Message::human(state.input.clone()));
        state.chat_history.push(Message::ai(response.content));
        state.generation_logprobs = response.logprobs;
        Ok((state, Next::Continue))
    }
}
