//! Routing and formatting helpers for the conversation graph.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info};

use crate::message::Message;
use crate::state::{AgentState, InputMode, RecalledEpisode};

use super::routes;

/// Routing tags recognized in user input and the agent mode they map to.
const ROUTING_TAG_MAP: &[(&str, &str)] = &[
    ("planning", "high"),
    ("high", "high"),
    ("fast", "fast"),
    ("direct", "direct"),
    ("chat", "chat"),
];

static TAG_REGEXES: Lazy<Vec<(&'static str, Regex, Regex)>> = Lazy::new(|| {
    ROUTING_TAG_MAP
        .iter()
        .filter_map(|(tag, mode)| {
            let open = Regex::new(&format!("(?i)<{tag}>")).ok()?;
            let close = Regex::new(&format!("(?i)</{tag}>")).ok()?;
            Some((*mode, open, close))
        })
        .collect()
});

/// Extracts a routing tag from user input.
///
/// Supported tags: `<planning>`/`<high>` map to "high", `<fast>`, `<direct>`
/// and `<chat>` map to themselves. Both the opening and closing tag must be
/// present; matching is case-insensitive and the tags are stripped from the
/// returned input.
pub fn extract_routing_tag(user_input: &str) -> (String, Option<String>) {
    for (mode, open, close) in TAG_REGEXES.iter() {
        if open.is_match(user_input) && close.is_match(user_input) {
            let cleaned = open.replace_all(user_input, "");
            let cleaned = close.replace_all(&cleaned, "");
            return (cleaned.trim().to_string(), Some((*mode).to_string()));
        }
    }
    (user_input.to_string(), None)
}

/// Routes after memory retrieval based on the turn's mode.
pub fn route_by_command(state: &AgentState) -> String {
    let route = match state.mode {
        Some(InputMode::Agent) => routes::AGENT_MODE,
        Some(InputMode::Search) => routes::SEARCH,
        Some(InputMode::Stats) => routes::STATS,
        _ => routes::DIRECT_ANSWER,
    };
    info!(mode = ?state.mode, route, "routing decision");
    route.to_string()
}

/// ReAct termination rule.
///
/// Ends when `agent_outcome` is set; continues when the last scratchpad
/// message is an AI message carrying tool calls; ends otherwise (including
/// an empty scratchpad).
pub fn should_continue_react(state: &AgentState) -> String {
    if state.agent_outcome.is_some() {
        debug!("react loop ends: finish action detected");
        return "end".to_string();
    }
    match state.scratchpad.last() {
        Some(last) if last.is_ai() && !last.tool_calls().is_empty() => {
            debug!("react loop continues: pending tool calls");
            "continue".to_string()
        }
        _ => {
            debug!("react loop ends: no pending tool calls");
            "end".to_string()
        }
    }
}

/// Formats the scratchpad for the reasoning prompt.
///
/// Emits exactly one JSON `{thought, action}` object per AI message with a
/// tool call and one `{"observation": ...}` object per tool message, in
/// scratchpad order. AI messages without tool calls (e.g. self-corrections)
/// pass through as plain text.
pub fn format_scratchpad(scratchpad: &[Message]) -> String {
    let mut lines = Vec::with_capacity(scratchpad.len());
    for message in scratchpad {
        match message {
            Message::Ai {
                content,
                tool_calls,
                ..
            } if !tool_calls.is_empty() => {
                let call = &tool_calls[0];
                lines.push(
                    json!({
                        "thought": content,
                        "action": {
                            "tool_name": call.name,
                            "args": call.args,
                        },
                    })
                    .to_string(),
                );
            }
            Message::Ai { content, .. } => lines.push(content.clone()),
            Message::Tool { content, .. } => {
                lines.push(json!({"observation": content}).to_string());
            }
            _ => {}
        }
    }
    lines.join("\n")
}

/// Formats recalled episodes for prompt context.
pub fn format_episodes(episodes: &[RecalledEpisode]) -> String {
    if episodes.is_empty() {
        return "No relevant episodic memories found.".to_string();
    }
    episodes
        .iter()
        .enumerate()
        .map(|(i, episode)| {
            format!(
                "Recalled Event {} (Surprise Score: {:.3}):\n{}",
                i + 1,
                episode.surprise_stats.mean_surprise,
                episode.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;
    use crate::state::SurpriseStats;

    /// **Scenario**: `<planning>` routes to agent mode "high" and the tags
    /// are stripped from the delivered input.
    #[test]
    fn planning_tag_maps_to_high() {
        let (cleaned, mode) = extract_routing_tag("<planning>refactor the parser</planning>");
        assert_eq!(cleaned, "refactor the parser");
        assert_eq!(mode.as_deref(), Some("high"));
    }

    /// **Scenario**: tags are case-insensitive; unmatched tags pass through.
    #[test]
    fn tag_extraction_case_insensitive_and_strict() {
        let (cleaned, mode) = extract_routing_tag("<FAST>quick check</FAST>");
        assert_eq!(cleaned, "quick check");
        assert_eq!(mode.as_deref(), Some("fast"));

        let (cleaned, mode) = extract_routing_tag("<fast>missing close tag");
        assert_eq!(cleaned, "<fast>missing close tag");
        assert!(mode.is_none());

        let (cleaned, mode) = extract_routing_tag("no tags at all");
        assert_eq!(cleaned, "no tags at all");
        assert!(mode.is_none());
    }

    /// **Scenario**: modes map to their route keys with direct as fallback.
    #[test]
    fn route_by_command_maps_modes() {
        let mut state = AgentState::initial("s", "x", InputMode::Agent, vec![]);
        assert_eq!(route_by_command(&state), routes::AGENT_MODE);
        state.mode = Some(InputMode::Search);
        assert_eq!(route_by_command(&state), routes::SEARCH);
        state.mode = Some(InputMode::Stats);
        assert_eq!(route_by_command(&state), routes::STATS);
        state.mode = Some(InputMode::Direct);
        assert_eq!(route_by_command(&state), routes::DIRECT_ANSWER);
        state.mode = None;
        assert_eq!(route_by_command(&state), routes::DIRECT_ANSWER);
    }

    /// **Scenario**: termination rule: outcome ends, pending tool calls
    /// continue, anything else ends.
    #[test]
    fn react_termination_rule() {
        let mut state = AgentState::initial("s", "x", InputMode::Agent, vec![]);
        assert_eq!(should_continue_react(&state), "end", "empty scratchpad");

        state.scratchpad.push(Message::ai_with_tool_calls(
            "thinking",
            vec![ToolCall {
                id: "tool_call_0".into(),
                name: "native_web_search".into(),
                args: json!({"query": "q"}),
            }],
        ));
        assert_eq!(should_continue_react(&state), "continue");

        state.scratchpad.push(Message::tool("result", "tool_call_0"));
        assert_eq!(should_continue_react(&state), "end", "tool message last");

        state.agent_outcome = Some("done".into());
        assert_eq!(should_continue_react(&state), "end", "outcome wins");
    }

    /// **Scenario**: the formatted scratchpad contains exactly one JSON
    /// action block per tool-calling AI message and one observation per tool
    /// message, in order.
    #[test]
    fn scratchpad_format_contract() {
        let scratchpad = vec![
            Message::ai_with_tool_calls(
                "I should search",
                vec![ToolCall {
                    id: "tool_call_0".into(),
                    name: "native_web_search".into(),
                    args: json!({"query": "rust"}),
                }],
            ),
            Message::tool("{\"results\": []}", "tool_call_0"),
            Message::ai("correction note"),
        ];
        let formatted = format_scratchpad(&scratchpad);
        let lines: Vec<&str> = formatted.lines().collect();
        assert_eq!(lines.len(), 3);
        let action: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["thought"], "I should search");
        assert_eq!(action["action"]["tool_name"], "native_web_search");
        let observation: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert!(observation["observation"].is_string());
        assert_eq!(lines[2], "correction note");
        assert!(format_scratchpad(&[]).is_empty());
    }

    /// **Scenario**: episode formatting includes rank, surprise and content.
    #[test]
    fn episode_formatting() {
        assert_eq!(
            format_episodes(&[]),
            "No relevant episodic memories found."
        );
        let episodes = vec![RecalledEpisode {
            id: "em_event_0_5".into(),
            content: "remembered text".into(),
            summary: "remembered text".into(),
            surprise_stats: SurpriseStats {
                mean_surprise: 1.25,
                max_surprise: 2.0,
                event_size: 5,
            },
            representative_tokens: vec![0, 2],
            retrieval_rank: 1,
        }];
        let formatted = format_episodes(&episodes);
        assert!(formatted.contains("Recalled Event 1"));
        assert!(formatted.contains("1.250"));
        assert!(formatted.contains("remembered text"));
    }
}
