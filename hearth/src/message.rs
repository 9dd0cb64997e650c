//! Message types for conversation state.
//!
//! A message is a tagged sum over the four speaker kinds. Tool-call carriers
//! are fields on `Ai`, not a separate variant; `Tool` messages answer a
//! specific call via `tool_call_id`. Messages are append-only within a turn:
//! once emitted into state they are never mutated, only annotated copies are
//! written back to history.

use std::collections::BTreeMap;

use serde_json::Value;

/// One tool invocation requested by the model.
///
/// **Interaction**: Produced by the reasoning node from parsed model output;
/// consumed by the tool execution node which answers each call with a
/// `Message::Tool` carrying the same id.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    /// Call id, unique within the turn (e.g. `tool_call_3`).
    pub id: String,
    /// Tool name as registered in the fabric.
    pub name: String,
    /// JSON-schema-shaped arguments.
    pub args: Value,
}

/// A single message in a conversation or scratchpad.
///
/// Kinds: human input, model output (optionally carrying tool calls),
/// system instructions, and tool results. `attributes` holds per-message
/// annotations such as `{mode, timestamp}` stamped by the facade.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Human {
        content: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        attributes: BTreeMap<String, Value>,
    },
    Ai {
        content: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        attributes: BTreeMap<String, Value>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    System {
        content: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        attributes: BTreeMap<String, Value>,
    },
    Tool {
        content: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        attributes: BTreeMap<String, Value>,
        tool_call_id: String,
    },
}

impl Message {
    /// Creates a human message.
    pub fn human(content: impl Into<String>) -> Self {
        Self::Human {
            content: content.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Creates an AI message without tool calls.
    pub fn ai(content: impl Into<String>) -> Self {
        Self::Ai {
            content: content.into(),
            attributes: BTreeMap::new(),
            tool_calls: Vec::new(),
        }
    }

    /// Creates an AI message carrying tool calls.
    pub fn ai_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Ai {
            content: content.into(),
            attributes: BTreeMap::new(),
            tool_calls,
        }
    }

    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Creates a tool result message answering `tool_call_id`.
    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self::Tool {
            content: content.into(),
            attributes: BTreeMap::new(),
            tool_call_id: tool_call_id.into(),
        }
    }

    /// Message text content.
    pub fn content(&self) -> &str {
        match self {
            Self::Human { content, .. }
            | Self::Ai { content, .. }
            | Self::System { content, .. }
            | Self::Tool { content, .. } => content,
        }
    }

    /// Wire kind tag: `human`, `ai`, `system`, `tool`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Human { .. } => "human",
            Self::Ai { .. } => "ai",
            Self::System { .. } => "system",
            Self::Tool { .. } => "tool",
        }
    }

    /// Per-message annotations.
    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        match self {
            Self::Human { attributes, .. }
            | Self::Ai { attributes, .. }
            | Self::System { attributes, .. }
            | Self::Tool { attributes, .. } => attributes,
        }
    }

    /// Tool calls carried by an AI message; empty for every other kind.
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Ai { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn is_ai(&self) -> bool {
        matches!(self, Self::Ai { .. })
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Self::Human { .. })
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, Self::Tool { .. })
    }

    /// Returns a copy with `key` set in attributes only when not already present.
    /// Existing annotations win; messages themselves are never mutated in place.
    pub fn with_default_attribute(mut self, key: &str, value: Value) -> Self {
        let attributes = match &mut self {
            Self::Human { attributes, .. }
            | Self::Ai { attributes, .. }
            | Self::System { attributes, .. }
            | Self::Tool { attributes, .. } => attributes,
        };
        attributes.entry(key.to_string()).or_insert(value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: constructors produce the correct variant with content and kind tag.
    #[test]
    fn message_constructors_and_kind() {
        let h = Message::human("hi");
        assert_eq!(h.kind(), "human");
        assert_eq!(h.content(), "hi");
        let a = Message::ai("reply");
        assert_eq!(a.kind(), "ai");
        let s = Message::system("sys");
        assert_eq!(s.kind(), "system");
        let t = Message::tool("out", "tool_call_0");
        assert_eq!(t.kind(), "tool");
        assert!(t.is_tool());
    }

    /// **Scenario**: tool_calls accessor returns calls for Ai and empty for other kinds.
    #[test]
    fn tool_calls_only_on_ai() {
        let call = ToolCall {
            id: "tool_call_0".into(),
            name: "native_web_search".into(),
            args: serde_json::json!({"query": "rust"}),
        };
        let ai = Message::ai_with_tool_calls("thinking", vec![call.clone()]);
        assert_eq!(ai.tool_calls(), &[call]);
        assert!(Message::human("x").tool_calls().is_empty());
        assert!(Message::tool("x", "id").tool_calls().is_empty());
    }

    /// **Scenario**: Each Message variant round-trips through serde with the kind tag.
    #[test]
    fn message_serialize_deserialize_roundtrip() {
        for msg in [
            Message::human("usr"),
            Message::ai("ast"),
            Message::system("sys"),
            Message::tool("obs", "tool_call_1"),
        ] {
            let json = serde_json::to_string(&msg).expect("serialize");
            let back: Message = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(msg, back);
        }
        let json = serde_json::to_string(&Message::human("x")).unwrap();
        assert!(json.contains("\"kind\":\"human\""), "{}", json);
    }

    /// **Scenario**: with_default_attribute sets a missing key but never overwrites.
    #[test]
    fn with_default_attribute_does_not_overwrite() {
        let msg = Message::ai("a")
            .with_default_attribute("mode", serde_json::json!("direct"))
            .with_default_attribute("mode", serde_json::json!("agent"));
        assert_eq!(msg.attributes().get("mode"), Some(&serde_json::json!("direct")));
    }
}
