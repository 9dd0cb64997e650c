//! Token-budgeted context window management.
//!
//! Trims conversation history to fit a token budget using an optional token
//! counter. Pure: no side effects, no state beyond the default budget.

use tracing::debug;

use crate::llm::TokenCounter;
use crate::message::Message;
use crate::runner::estimate_tokens;

/// Builds the local context for LLM prompts by trimming history.
///
/// **Interaction**: Used by the direct-answer and summarize nodes with the
/// LLM service as the counter; counting failures fall back to estimation.
#[derive(Debug, Clone)]
pub struct ContextWindowManager {
    default_max_tokens: usize,
}

impl ContextWindowManager {
    pub fn new(default_max_tokens: usize) -> Self {
        Self { default_max_tokens }
    }

    pub fn default_max_tokens(&self) -> usize {
        self.default_max_tokens
    }

    /// Trims `full_history` to fit `max_tokens`, newest-first.
    ///
    /// Walks the history from the end, counting each message through
    /// `counter` (or the character estimate when absent or failing), and
    /// stops before a message would exceed the budget, but always keeps at
    /// least the newest message. Returns the kept messages in original order
    /// and the total counted tokens.
    pub async fn build_local_context(
        &self,
        full_history: &[Message],
        max_tokens: Option<usize>,
        counter: Option<&dyn TokenCounter>,
    ) -> (Vec<Message>, usize) {
        let max_tokens = max_tokens.unwrap_or(self.default_max_tokens);
        if full_history.is_empty() {
            return (Vec::new(), 0);
        }

        let mut local_context: Vec<Message> = Vec::new();
        let mut current_tokens = 0usize;

        for message in full_history.iter().rev() {
            let message_tokens = match counter {
                Some(counter) => match counter.count_text(message.content()).await {
                    Ok(count) => count,
                    Err(_) => estimate_tokens(message.content()),
                },
                None => estimate_tokens(message.content()),
            };

            if current_tokens + message_tokens > max_tokens && !local_context.is_empty() {
                break;
            }
            local_context.insert(0, message.clone());
            current_tokens += message_tokens;
        }

        if local_context.len() < full_history.len() {
            debug!(
                kept = local_context.len(),
                total = full_history.len(),
                tokens = current_tokens,
                "context trimmed"
            );
        }
        (local_context, current_tokens)
    }
}

impl Default for ContextWindowManager {
    fn default() -> Self {
        Self::new(2048)
    }
}
