//! Profile-based tool filtering with glob support.
//!
//! A profile carries allow and deny glob lists. An empty allow list admits
//! every tool; deny patterns are applied afterwards and win.

use std::sync::Arc;

use glob::Pattern;
use tracing::warn;

use env_config::ToolProfile;

use super::Tool;

fn matches_any(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|p| match Pattern::new(p) {
        Ok(pattern) => pattern.matches(name),
        Err(err) => {
            warn!(pattern = %p, error = %err, "invalid tool profile glob; ignoring");
            false
        }
    })
}

/// Applies a profile's allow/deny lists to a tool list.
pub fn apply_profile(tools: Vec<Arc<dyn Tool>>, profile: &ToolProfile) -> Vec<Arc<dyn Tool>> {
    tools
        .into_iter()
        .filter(|tool| {
            let name = tool.name();
            let allowed = profile.allow.is_empty() || matches_any(&profile.allow, name);
            allowed && !matches_any(&profile.deny, name)
        })
        .collect()
}
