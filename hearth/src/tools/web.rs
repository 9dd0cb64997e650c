//! Native web tools: search and fetch.
//!
//! `native_web_search` queries the configured provider (Google Custom Search
//! or DuckDuckGo HTML) and returns `{"results": [{title, url, snippet}]}` as
//! a JSON string. `native_web_fetch` retrieves one page of text content with
//! the privacy URL denylist enforced before any request leaves the process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use env_config::{PrivacySettings, SearchProvider, ToolSettings};

use super::{Tool, ToolError, ToolProvider, ToolSpec};

/// Tool name: fetch text content from a URL.
pub const TOOL_WEB_FETCH: &str = "native_web_fetch";
/// Tool name: web search via the configured provider.
pub const TOOL_WEB_SEARCH: &str = "native_web_search";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(20);
/// Fetched bodies are truncated to this many characters before chunking.
const MAX_FETCH_CHARS: usize = 200_000;

fn http_client() -> Result<reqwest::Client, ToolError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(READ_TIMEOUT)
        .build()
        .map_err(|e| ToolError::Transport(e.to_string()))
}

fn string_arg(args: &Value, key: &str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidInput(format!("missing required argument '{key}'")))
}

/// Fetches one URL and returns its text content.
pub struct WebFetchTool {
    client: reqwest::Client,
    url_denylist: Vec<String>,
}

impl WebFetchTool {
    pub fn new(privacy: &PrivacySettings) -> Result<Self, ToolError> {
        Ok(Self {
            client: http_client()?,
            url_denylist: privacy.url_denylist.clone(),
        })
    }

    fn validate_url(&self, raw: &str) -> Result<url::Url, ToolError> {
        let parsed = url::Url::parse(raw)
            .map_err(|e| ToolError::InvalidInput(format!("invalid url '{raw}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ToolError::InvalidInput(format!(
                "unsupported url scheme '{}'",
                parsed.scheme()
            )));
        }
        let host = parsed.host_str().unwrap_or_default().to_lowercase();
        if self
            .url_denylist
            .iter()
            .any(|denied| host.contains(&denied.to_lowercase()))
        {
            return Err(ToolError::Execution(format!(
                "url host '{host}' is denied by policy"
            )));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        TOOL_WEB_FETCH
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_WEB_FETCH.into(),
            description: Some("Fetch the text content of a web page by URL.".into()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "The http(s) URL to fetch"}
                },
                "required": ["url"]
            }),
        }
    }

    async fn call(&self, args: Value) -> Result<String, ToolError> {
        let url = self.validate_url(&string_arg(&args, "url")?)?;
        info!(url = %url, "fetching web content");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ToolError::Execution(format!(
                "HTTP {} from {url}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !(content_type.starts_with("text/") || content_type.contains("json")) {
            return Err(ToolError::Execution(format!(
                "unsupported content type '{content_type}'"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        if body.trim().is_empty() {
            return Err(ToolError::Execution(format!("empty response from {url}")));
        }

        Ok(clip_fetch_content(body, &url))
    }
}

/// Caps fetched content at [`MAX_FETCH_CHARS`] characters. Character-based
/// so a cut never lands inside a multi-byte codepoint.
fn clip_fetch_content(body: String, url: &url::Url) -> String {
    if body.chars().count() <= MAX_FETCH_CHARS {
        return body;
    }
    debug!(url = %url, bytes = body.len(), "truncating fetched content");
    body.chars().take(MAX_FETCH_CHARS).collect()
}

static DDG_RESULT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#)
        .unwrap_or_else(|_| unreachable!())
});
static HTML_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^>]+>").unwrap_or_else(|_| unreachable!()));

fn strip_tags(html: &str) -> String {
    HTML_TAG.replace_all(html, "").trim().to_string()
}

/// Web search through Google Custom Search or the DuckDuckGo HTML endpoint.
pub struct WebSearchTool {
    client: reqwest::Client,
    provider: SearchProvider,
    google_api_key: Option<String>,
    google_engine_id: Option<String>,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(settings: &ToolSettings) -> Result<Self, ToolError> {
        Ok(Self {
            client: http_client()?,
            provider: settings.search_provider,
            google_api_key: settings.google_api_key.clone(),
            google_engine_id: settings.google_engine_id.clone(),
            max_results: 5,
        })
    }

    async fn search_google(&self, query: &str) -> Result<Vec<Value>, ToolError> {
        let (Some(key), Some(cx)) = (&self.google_api_key, &self.google_engine_id) else {
            return Err(ToolError::Execution(
                "google search requires google_api_key and google_engine_id".into(),
            ));
        };
        let response = self
            .client
            .get("https://www.googleapis.com/customsearch/v1")
            .query(&[("key", key.as_str()), ("cx", cx.as_str()), ("q", query)])
            .send()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ToolError::Execution(format!(
                "google search failed: HTTP {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        let items = body.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(items
            .into_iter()
            .take(self.max_results)
            .map(|item| {
                json!({
                    "title": item.get("title").and_then(Value::as_str).unwrap_or_default(),
                    "url": item.get("link").and_then(Value::as_str).unwrap_or_default(),
                    "snippet": item.get("snippet").and_then(Value::as_str).unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn search_duckduckgo(&self, query: &str) -> Result<Vec<Value>, ToolError> {
        let response = self
            .client
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ToolError::Execution(format!(
                "duckduckgo search failed: HTTP {}",
                response.status()
            )));
        }
        let html = response
            .text()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        Ok(Self::parse_duckduckgo_results(&html, self.max_results))
    }

    fn parse_duckduckgo_results(html: &str, max_results: usize) -> Vec<Value> {
        DDG_RESULT
            .captures_iter(html)
            .take(max_results)
            .map(|cap| {
                json!({
                    "title": strip_tags(&cap[2]),
                    "url": cap[1].to_string(),
                    "snippet": "",
                })
            })
            .collect()
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        TOOL_WEB_SEARCH
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_WEB_SEARCH.into(),
            description: Some("Search the web and return result titles, URLs and snippets.".into()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "The search query"}
                },
                "required": ["query"]
            }),
        }
    }

    async fn call(&self, args: Value) -> Result<String, ToolError> {
        let query = string_arg(&args, "query")?;
        info!(%query, provider = ?self.provider, "executing web search");
        let results = match self.provider {
            SearchProvider::Google => self.search_google(&query).await?,
            SearchProvider::DuckDuckGo => self.search_duckduckgo(&query).await?,
        };
        if results.is_empty() {
            warn!(%query, "search returned no results");
        }
        Ok(json!({ "results": results }).to_string())
    }
}

/// Provider bundling the built-in web tools under the `native_` namespace.
pub struct NativeToolProvider {
    tool_settings: ToolSettings,
    privacy: PrivacySettings,
}

impl NativeToolProvider {
    pub fn new(tool_settings: ToolSettings, privacy: PrivacySettings) -> Self {
        Self {
            tool_settings,
            privacy,
        }
    }
}

#[async_trait]
impl ToolProvider for NativeToolProvider {
    fn name(&self) -> &str {
        "native"
    }

    async fn load_tools(&self) -> Result<Vec<Arc<dyn Tool>>, ToolError> {
        Ok(vec![
            Arc::new(WebSearchTool::new(&self.tool_settings)?),
            Arc::new(WebFetchTool::new(&self.privacy)?),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: non-http(s) schemes and denied hosts are rejected before
    /// any request is made.
    #[test]
    fn fetch_validates_scheme_and_denylist() {
        let privacy = PrivacySettings {
            url_denylist: vec!["tracker.example".into()],
            ..Default::default()
        };
        let tool = WebFetchTool::new(&privacy).unwrap();

        assert!(matches!(
            tool.validate_url("ftp://example.com/x"),
            Err(ToolError::InvalidInput(_))
        ));
        assert!(matches!(
            tool.validate_url("not a url"),
            Err(ToolError::InvalidInput(_))
        ));
        assert!(matches!(
            tool.validate_url("https://sub.tracker.example/page"),
            Err(ToolError::Execution(_))
        ));
        assert!(tool.validate_url("https://docs.example.org/x").is_ok());
    }

    /// **Scenario**: missing required arguments yield InvalidInput.
    #[tokio::test]
    async fn missing_query_is_invalid_input() {
        let tool = WebSearchTool::new(&ToolSettings::default()).unwrap();
        let err = tool.call(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)), "{err}");
    }

    /// **Scenario**: DuckDuckGo HTML parsing extracts anchors with result__a class.
    #[test]
    fn duckduckgo_html_parsing() {
        let html = r#"
            <a rel="nofollow" class="result__a" href="https://one.example/">First <b>Result</b></a>
            <a rel="nofollow" class="result__a" href="https://two.example/">Second</a>
        "#;
        let results = WebSearchTool::parse_duckduckgo_results(html, 5);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["title"], "First Result");
        assert_eq!(results[0]["url"], "https://one.example/");
        assert_eq!(results[1]["title"], "Second");
    }

    /// **Scenario**: oversized multi-byte content is clipped on a character
    /// boundary without panicking; short content is returned untouched.
    #[test]
    fn clip_fetch_content_is_char_safe() {
        let url = url::Url::parse("https://docs.example.org/x").unwrap();

        let short = "héllo wörld".to_string();
        assert_eq!(clip_fetch_content(short.clone(), &url), short);

        let oversized = "é".repeat(MAX_FETCH_CHARS + 10);
        let clipped = clip_fetch_content(oversized, &url);
        assert_eq!(clipped.chars().count(), MAX_FETCH_CHARS);
        assert!(clipped.chars().all(|c| c == 'é'), "no mangled codepoints");
    }

    /// **Scenario**: the native provider loads both web tools.
    #[tokio::test]
    async fn native_provider_loads_both_tools() {
        let provider =
            NativeToolProvider::new(ToolSettings::default(), PrivacySettings::default());
        let tools = provider.load_tools().await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        assert!(names.contains(&TOOL_WEB_SEARCH));
        assert!(names.contains(&TOOL_WEB_FETCH));
    }
}
