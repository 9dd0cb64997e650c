//! Tool fabric: loads tools from providers and executes them uniformly.
//!
//! Initialization loads each provider best-effort (a failing provider is
//! logged and skipped), merges the tools, applies the active profile filter,
//! and builds the name map. The map is read-only thereafter except through
//! `set_profile`, which re-filters from the retained full list.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn};

use env_config::{ToolProfile, ToolSettings};

use super::{apply_profile, error_envelope, Tool, ToolProvider, ToolSpec};

/// Default tool execution deadline.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Uniform tool loading and execution.
///
/// **Interaction**: Built by the facade from a provider list; the tool node
/// and the RAG engine execute tools through [`ToolFabric::aexecute`].
pub struct ToolFabric {
    providers: Vec<Arc<dyn ToolProvider>>,
    tool_timeout: Duration,
    profiles: HashMap<String, ToolProfile>,
    profile_name: RwLock<String>,
    all_tools: RwLock<Vec<Arc<dyn Tool>>>,
    tool_map: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolFabric {
    pub fn new(
        providers: Vec<Arc<dyn ToolProvider>>,
        tool_timeout: Duration,
        settings: &ToolSettings,
    ) -> Self {
        Self {
            providers,
            tool_timeout,
            profiles: settings.profiles.clone(),
            profile_name: RwLock::new(settings.profile.clone()),
            all_tools: RwLock::new(Vec::new()),
            tool_map: RwLock::new(HashMap::new()),
        }
    }

    fn active_profile(&self) -> ToolProfile {
        let name = self
            .profile_name
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        self.profiles.get(&name).cloned().unwrap_or_default()
    }

    /// Loads tools from every provider. Provider failures are logged and
    /// skipped; the fabric keeps whatever loaded.
    pub async fn initialize(&self) {
        let mut loaded: Vec<Arc<dyn Tool>> = Vec::new();
        for provider in &self.providers {
            match provider.load_tools().await {
                Ok(tools) => {
                    info!(provider = provider.name(), count = tools.len(), "tools loaded");
                    loaded.extend(tools);
                }
                Err(err) => {
                    error!(provider = provider.name(), error = %err, "tool provider failed to load");
                }
            }
        }

        let filtered = apply_profile(loaded.clone(), &self.active_profile());
        let map: HashMap<String, Arc<dyn Tool>> = filtered
            .iter()
            .map(|t| (t.name().to_string(), t.clone()))
            .collect();

        let names: Vec<&str> = filtered.iter().map(|t| t.name()).collect();
        info!(
            total = loaded.len(),
            available = filtered.len(),
            tools = ?names,
            "tool fabric initialized"
        );

        *self.all_tools.write().unwrap_or_else(|p| p.into_inner()) = loaded;
        *self.tool_map.write().unwrap_or_else(|p| p.into_inner()) = map;
    }

    /// Switches the active profile and re-filters. Returns the number of
    /// available tools.
    pub fn set_profile(&self, profile_name: &str) -> usize {
        *self.profile_name.write().unwrap_or_else(|p| p.into_inner()) = profile_name.to_string();
        let all = self
            .all_tools
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let filtered = apply_profile(all, &self.active_profile());
        let count = filtered.len();
        let map: HashMap<String, Arc<dyn Tool>> = filtered
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect();
        *self.tool_map.write().unwrap_or_else(|p| p.into_inner()) = map;
        info!(profile = profile_name, count, "tool profile switched");
        count
    }

    /// Specs of every available tool, for prompt formatting.
    pub fn list_specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tool_map
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|t| t.spec())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Names of every available tool.
    pub fn list_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tool_map
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tool_map
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    /// Executes a tool asynchronously under the configured deadline.
    ///
    /// Never fails: timeouts, unknown tools and provider errors come back as
    /// JSON error envelopes so the caller can treat every result as a string.
    pub async fn aexecute(&self, tool_name: &str, args: Value) -> String {
        let Some(tool) = self.get(tool_name) else {
            warn!(tool_name, "tool not found");
            return error_envelope(
                "tool_not_found",
                &format!("Tool '{tool_name}' not found."),
                tool_name,
                None,
            );
        };

        info!(tool_name, "executing tool");
        match tokio::time::timeout(self.tool_timeout, tool.call(args)).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                error!(tool_name, error = %err, "tool execution failed");
                error_envelope(
                    err.code(),
                    &format!("Error executing tool {tool_name}: {err}"),
                    tool_name,
                    Some(&err.to_string()),
                )
            }
            Err(_) => {
                error!(tool_name, timeout = ?self.tool_timeout, "tool execution timed out");
                error_envelope(
                    "tool_timeout",
                    &format!("Tool '{tool_name}' execution timed out."),
                    tool_name,
                    None,
                )
            }
        }
    }

    /// Synchronous bridge over [`ToolFabric::aexecute`].
    ///
    /// Must be called from within a multi-threaded tokio runtime; the current
    /// worker blocks in place while the execution runs.
    pub fn execute(&self, tool_name: &str, args: Value) -> String {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(self.aexecute(tool_name, args))
        })
    }
}
