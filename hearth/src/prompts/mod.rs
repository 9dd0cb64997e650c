//! Prompt template resolution.
//!
//! Node prompts are strings injected through a resolver so the template text
//! stays replaceable without touching node code. Placeholders use
//! `{name}` syntax and are substituted with [`render`].

use std::collections::HashMap;

/// Fixed prefix that keeps the leading tokens stable across turns.
pub const ATTENTION_SINK_PREFIX: &str = "System: Initialize conversation.";
/// Attention sink used for the executor reasoning prompt.
pub const EXECUTOR_ATTENTION_SINK: &str = "System: Initialize professional agent.";

/// Template keys known to the conversation graph.
pub mod keys {
    pub const PERSONA: &str = "persona";
    pub const DIRECT_SYSTEM: &str = "direct_system";
    pub const ORDER_GENERATION: &str = "order_generation";
    pub const REACT_SYSTEM: &str = "react_system";
    pub const SYNTHESIS: &str = "synthesis";
    pub const SEARCH_SUMMARIZE: &str = "search_summarize";
    pub const SEARCH_QUERY_GEN: &str = "search_query_gen";
}

/// Resolves prompt templates by key.
pub trait PromptResolver: Send + Sync {
    fn resolve(&self, key: &str) -> Option<String>;

    /// Resolves with a fallback default.
    fn resolve_or(&self, key: &str, default: &str) -> String {
        self.resolve(key).unwrap_or_else(|| default.to_string())
    }
}

/// Substitutes `{name}` placeholders in a template.
pub fn render(template: &str, substitutions: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in substitutions {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

/// Built-in prompt set; overridable per key at construction.
pub struct StaticPrompts {
    templates: HashMap<String, String>,
}

impl StaticPrompts {
    pub fn new() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            keys::PERSONA.to_string(),
            "You are a helpful, knowledgeable assistant running locally on the user's machine."
                .to_string(),
        );
        templates.insert(
            keys::DIRECT_SYSTEM.to_string(),
            "Answer the user directly and conversationally. Use the retrieved memories when they \
             are relevant; ignore them when they are not."
                .to_string(),
        );
        templates.insert(
            keys::ORDER_GENERATION.to_string(),
            "Convert the user's request into a structured execution plan. Respond with a JSON \
             object of the form {\"task_summary\": string, \"steps\": [string, ...]} and nothing else."
                .to_string(),
        );
        templates.insert(
            keys::REACT_SYSTEM.to_string(),
            "You are a task execution agent. Work step by step. On each turn, first write your \
             thought as plain text, then emit exactly one JSON block in ```json fences containing \
             either {\"action\": {\"tool_name\": string, \"args\": object}} to call a tool, or \
             {\"finish\": {\"answer\": string}} when the order is complete.\n\n\
             Available tools:\n{tools}"
                .to_string(),
        );
        templates.insert(
            keys::SYNTHESIS.to_string(),
            "Rewrite the technical report below into a natural, user-facing answer to the \
             original request. Keep concrete results; drop internal reasoning.\n\n\
             --- Technical Report ---\n{technical_report}"
                .to_string(),
        );
        templates.insert(
            keys::SEARCH_SUMMARIZE.to_string(),
            "Summarize the gathered material into a direct answer. When citing information, \
             always include the source in [Source: URL] format."
                .to_string(),
        );
        templates.insert(
            keys::SEARCH_QUERY_GEN.to_string(),
            "Based on the user's request and the optional file attachments provided, propose two \
             diverse and effective web search queries separated by a newline.\n\
             User request: \"{input}\"\nAttachments summary:\n{attachments}"
                .to_string(),
        );
        Self { templates }
    }

    /// Replaces one template.
    pub fn with_template(mut self, key: impl Into<String>, template: impl Into<String>) -> Self {
        self.templates.insert(key.into(), template.into());
        self
    }
}

impl Default for StaticPrompts {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptResolver for StaticPrompts {
    fn resolve(&self, key: &str) -> Option<String> {
        self.templates.get(key).cloned()
    }
}
