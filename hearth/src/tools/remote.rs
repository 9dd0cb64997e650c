//! Remote tool provider over JSON-RPC HTTP.
//!
//! POSTs single JSON-RPC messages to an external tool server: `initialize`
//! handshake, then `tools/list` and `tools/call`. Loaded tools are namespaced
//! `{provider}_{inner}` to prevent collisions; JSON error envelopes produced
//! by the remote side pass through unchanged so downstream nodes detect
//! `{"error": true}` uniformly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{Tool, ToolError, ToolProvider, ToolSpec};

const PROTOCOL_VERSION: &str = "2025-03-26";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RemoteToolSpec {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    input_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ToolsListResult {
    #[serde(default)]
    tools: Vec<RemoteToolSpec>,
}

#[derive(Debug, Deserialize)]
struct CallContentItem {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolsCallResult {
    #[serde(default)]
    content: Vec<CallContentItem>,
    #[serde(default, rename = "isError")]
    is_error: bool,
}

/// Shared HTTP session against one remote tool server.
struct RemoteSession {
    client: reqwest::Client,
    endpoint: String,
    headers: Vec<(String, String)>,
    /// Session id from the server, echoed on subsequent requests.
    session_id: Mutex<Option<String>>,
}

impl RemoteSession {
    async fn post(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(REQUEST_TIMEOUT)
            .header("Accept", "application/json")
            .json(&body);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(session_id) = self
            .session_id
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
        {
            request = request.header("X-Session-Id", session_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        if let Some(session_id) = response
            .headers()
            .get("X-Session-Id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().unwrap_or_else(|p| p.into_inner()) =
                Some(session_id.to_string());
        }
        if !response.status().is_success() {
            return Err(ToolError::Transport(format!(
                "HTTP {} from {}",
                response.status(),
                self.endpoint
            )));
        }

        let parsed: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| ToolError::Transport(format!("response json: {e}")))?;
        if let Some(error) = parsed.error {
            return Err(ToolError::Execution(format!(
                "JSON-RPC error {}: {}",
                error.code, error.message
            )));
        }
        parsed
            .result
            .ok_or_else(|| ToolError::Transport("response has neither result nor error".into()))
    }
}

/// One tool proxied from a remote server.
struct RemoteTool {
    /// Namespaced name: `{provider}_{inner}`.
    name: String,
    inner_name: String,
    description: Option<String>,
    input_schema: Value,
    session: Arc<RemoteSession>,
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }

    async fn call(&self, args: Value) -> Result<String, ToolError> {
        let result = self
            .session
            .post(
                "tools/call",
                json!({"name": self.inner_name, "arguments": args}),
            )
            .await?;
        let call: ToolsCallResult = serde_json::from_value(result)
            .map_err(|e| ToolError::Transport(format!("tools/call result: {e}")))?;
        let text = call
            .content
            .into_iter()
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join("\n");
        if call.is_error {
            return Err(ToolError::Execution(if text.is_empty() {
                "remote tool reported an error".into()
            } else {
                text
            }));
        }
        // Remote error envelopes (JSON with `"error": true`) are returned
        // verbatim so downstream consumers can short-circuit on them.
        Ok(text)
    }
}

/// Provider that connects to a remote JSON-RPC tool server.
pub struct RemoteToolProvider {
    provider_name: String,
    session: Arc<RemoteSession>,
}

impl RemoteToolProvider {
    /// Builds a provider for `endpoint`. Extra headers (e.g. API keys) are
    /// sent on every request. No network traffic happens until `load_tools`.
    pub fn new(
        provider_name: impl Into<String>,
        endpoint: impl Into<String>,
        headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            session: Arc::new(RemoteSession {
                client: reqwest::Client::new(),
                endpoint: endpoint.into(),
                headers,
                session_id: Mutex::new(None),
            }),
        }
    }

    fn namespaced(&self, inner: &str) -> String {
        format!("{}_{}", self.provider_name, inner)
    }
}

#[async_trait]
impl ToolProvider for RemoteToolProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn load_tools(&self) -> Result<Vec<Arc<dyn Tool>>, ToolError> {
        self.session
            .post(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "clientInfo": {
                        "name": "hearth",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        debug!(provider = %self.provider_name, "remote tool server initialized");

        let result = self.session.post("tools/list", json!({})).await?;
        let listed: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| ToolError::Transport(format!("tools/list result: {e}")))?;

        let tools: Vec<Arc<dyn Tool>> = listed
            .tools
            .into_iter()
            .map(|spec| {
                Arc::new(RemoteTool {
                    name: self.namespaced(&spec.name),
                    inner_name: spec.name,
                    description: spec.description,
                    input_schema: spec.input_schema.unwrap_or_else(|| json!({"type": "object"})),
                    session: self.session.clone(),
                }) as Arc<dyn Tool>
            })
            .collect();
        info!(provider = %self.provider_name, count = tools.len(), "remote tools loaded");
        Ok(tools)
    }
}
