//! Input sanitization and attachment processing.

use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::state::Attachment;

/// Standard base64 alphabet with optional padding.
static BASE64_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9+/]+={0,2}$").unwrap_or_else(|_| unreachable!()));

/// Bounds the input length and redacts configured dangerous patterns.
///
/// Patterns that fail to compile are skipped (validation rejects empty
/// patterns at startup; a syntactically invalid one degrades to a warning).
pub fn sanitize_user_input(input: &str, max_length: usize, dangerous_patterns: &[String]) -> String {
    let mut sanitized: String = input.chars().take(max_length).collect();
    for pattern in dangerous_patterns {
        match Regex::new(pattern) {
            Ok(regex) => {
                sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
            }
            Err(err) => {
                warn!(pattern, error = %err, "invalid dangerous pattern; skipping");
            }
        }
    }
    sanitized
}

/// Attempts to decode base64 content longer than 100 characters.
///
/// Newlines are stripped before the alphabet check; non-UTF-8 decodes are
/// rejected so binary payloads pass through untouched.
fn try_decode_base64(content: &str) -> Option<String> {
    if content.len() <= 100 {
        return None;
    }
    let stripped: String = content.chars().filter(|c| *c != '\n' && *c != '\r').collect();
    if !BASE64_PATTERN.is_match(&stripped) {
        return None;
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(stripped.as_bytes())
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// Processes attachments before they reach the graph.
///
/// Oversized attachments (beyond `size_limit * 1.35`, the base64 expansion
/// allowance) are dropped with a warning; base64 text content is replaced by
/// its decoded form; anything else passes through unchanged.
pub fn process_attachments(attachments: Vec<Attachment>, size_limit: usize) -> Vec<Attachment> {
    let safe_limit = (size_limit as f64 * 1.35) as usize;
    let mut processed = Vec::with_capacity(attachments.len());

    for mut attachment in attachments {
        if attachment.content.len() > safe_limit {
            warn!(
                name = %attachment.name,
                size = attachment.content.len(),
                limit = safe_limit,
                "attachment skipped: size exceeds limit"
            );
            continue;
        }
        if let Some(decoded) = try_decode_base64(&attachment.content) {
            attachment.content = decoded;
        }
        processed.push(attachment);
    }
    processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn attachment(content: impl Into<String>) -> Attachment {
        Attachment {
            name: "doc.txt".into(),
            path: None,
            content: content.into(),
        }
    }

    /// **Scenario**: input is truncated to the limit and dangerous patterns
    /// are redacted.
    #[test]
    fn sanitize_truncates_and_redacts() {
        let out = sanitize_user_input("hello world", 5, &[]);
        assert_eq!(out, "hello");

        let patterns = vec![r"secret-\d+".to_string()];
        let out = sanitize_user_input("the secret-42 is here", 100, &patterns);
        assert_eq!(out, "the [REDACTED] is here");
    }

    /// **Scenario**: a long base64 attachment is decoded to its UTF-8 text.
    #[test]
    fn long_base64_attachment_decoded() {
        let plain = "hello world ".repeat(12); // > 100 chars when encoded
        let encoded = base64::engine::general_purpose::STANDARD.encode(plain.as_bytes());
        assert!(encoded.len() > 100);
        let processed = process_attachments(vec![attachment(encoded)], 100_000);
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].content, plain);
    }

    /// **Scenario**: short or non-base64 content passes through unchanged.
    #[test]
    fn short_or_plain_content_untouched() {
        let short = base64::engine::general_purpose::STANDARD.encode(b"hi");
        let processed = process_attachments(vec![attachment(short.clone())], 100_000);
        assert_eq!(processed[0].content, short, "short base64 kept as-is");

        let plain = "just ordinary text, definitely not base64 ".repeat(5);
        let processed = process_attachments(vec![attachment(plain.clone())], 100_000);
        assert_eq!(processed[0].content, plain);
    }

    /// **Scenario**: base64 of non-UTF-8 bytes passes through undecoded.
    #[test]
    fn binary_base64_untouched() {
        let bytes: Vec<u8> = (0..120).map(|i| (i * 7 + 250) as u8).collect();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let processed = process_attachments(vec![attachment(encoded.clone())], 100_000);
        // Kept verbatim (non-UTF-8 decode rejected), never dropped.
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].content, encoded);
    }

    /// **Scenario**: oversized attachments are dropped at limit * 1.35.
    #[test]
    fn oversized_attachment_dropped() {
        let processed = process_attachments(vec![attachment("x".repeat(200))], 100);
        assert!(processed.is_empty());
        let processed = process_attachments(vec![attachment("x".repeat(130))], 100);
        assert_eq!(processed.len(), 1, "within the 1.35 allowance");
    }

    /// **Scenario**: base64 with embedded newlines still decodes.
    #[test]
    fn base64_with_newlines_decodes() {
        let plain = "line content ".repeat(12);
        let mut encoded = base64::engine::general_purpose::STANDARD.encode(plain.as_bytes());
        encoded.insert(40, '\n');
        encoded.insert(80, '\n');
        let processed = process_attachments(vec![attachment(encoded)], 100_000);
        assert_eq!(processed[0].content, plain);
    }
}
