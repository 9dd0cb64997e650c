//! Event segmentation: surprise-based boundaries and the semantic-change
//! fallback.
//!
//! Surprise for token *t* is `-log P(t | context)`. A position is a boundary
//! when its score exceeds `mean + gamma * std` over the trailing window.
//! Sequences shorter than the window become a single event; empty score
//! sequences produce no events.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::state::TokenLogprob;

use super::types::EpisodicEvent;

static SENTENCE_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]+\s+|\n+").unwrap_or_else(|_| unreachable!()));

/// Surprise scores from logprobs: `-logprob`, clamped to be non-negative.
pub fn surprise_from_logprobs(logprobs: &[TokenLogprob]) -> Vec<f32> {
    logprobs.iter().map(|l| (-l.logprob).max(0.0)).collect()
}

/// Splits text into sentences on terminal punctuation or newlines.
pub fn split_sentences(text: &str) -> Vec<String> {
    SENTENCE_SPLIT
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Cosine-distance change scores between consecutive embeddings; the first
/// element is always 0.
pub fn sentence_change_scores(embeddings: &[Vec<f32>]) -> Vec<f32> {
    if embeddings.is_empty() {
        return Vec::new();
    }
    let mut scores = Vec::with_capacity(embeddings.len());
    scores.push(0.0);
    for pair in embeddings.windows(2) {
        let similarity = crate::memory::store::cosine_similarity(&pair[0], &pair[1]);
        scores.push(1.0 - similarity);
    }
    scores
}

/// Identifies boundary positions from a score series.
///
/// Walks positions `i >= window`, thresholding each score against
/// `mean + gamma * std` of the trailing window `[i-window, i)`. Positions 0
/// and `len` are always boundaries; the result is deduplicated and sorted.
/// A series shorter than the window yields `[0, len]` (single span).
pub fn identify_event_boundaries(scores: &[f32], window: usize, gamma: f32) -> Vec<usize> {
    if scores.is_empty() {
        return Vec::new();
    }
    if scores.len() < window {
        debug!(
            len = scores.len(),
            window, "sequence too short for boundary detection; single event"
        );
        return vec![0, scores.len()];
    }

    let mut boundaries = vec![0usize];
    for i in window..scores.len() {
        let window_scores = &scores[i - window..i];
        if window_scores.len() > 1 {
            let mean = window_scores.iter().sum::<f32>() / window_scores.len() as f32;
            let variance = window_scores
                .iter()
                .map(|s| (s - mean).powi(2))
                .sum::<f32>()
                / window_scores.len() as f32;
            let threshold = mean + gamma * variance.sqrt();
            if scores[i] > threshold {
                debug!(position = i, score = scores[i], threshold, "boundary detected");
                boundaries.push(i);
            }
        }
    }
    boundaries.push(scores.len());
    boundaries.sort_unstable();
    boundaries.dedup();
    boundaries
}

/// Builds events between successive boundary positions.
///
/// Every token index in `[boundaries[i], boundaries[i+1])` lands in event
/// `i`; each event carries the matching slice of surprise scores.
pub fn build_events(tokens: &[String], scores: &[f32], boundaries: &[usize]) -> Vec<EpisodicEvent> {
    let mut events = Vec::new();
    for pair in boundaries.windows(2) {
        let (start, end) = (pair[0], pair[1].min(tokens.len()));
        if start >= end {
            continue;
        }
        events.push(EpisodicEvent::new(
            tokens[start..end].to_vec(),
            start,
            end,
            scores[start..end.min(scores.len())].to_vec(),
        ));
    }
    events
}

/// Normalizes event sizes to the `[min_size, max_size]` invariant.
///
/// Undersized events merge into their predecessor (the first merges
/// forward); oversized events split at `max_size`. Positions are rebuilt to
/// stay contiguous. A lone event covering the entire short sequence is kept
/// as-is.
pub fn enforce_event_size(
    events: Vec<EpisodicEvent>,
    min_size: usize,
    max_size: usize,
) -> Vec<EpisodicEvent> {
    if events.len() <= 1 {
        return events;
    }

    // Merge pass: fold an undersized event into its predecessor (an
    // undersized first event absorbs its successor instead).
    let mut merged: Vec<EpisodicEvent> = Vec::with_capacity(events.len());
    for event in events {
        match merged.last_mut() {
            Some(previous)
                if event.tokens.len() < min_size || previous.tokens.len() < min_size =>
            {
                previous.tokens.extend(event.tokens);
                previous.surprise_scores.extend(event.surprise_scores);
                previous.end_position = event.end_position;
            }
            _ => merged.push(event),
        }
    }

    // Split pass: break oversized events into spans of at most max_size,
    // shortening the penultimate span when a naive cut would leave an
    // undersized tail.
    let mut result = Vec::with_capacity(merged.len());
    for event in merged {
        if event.tokens.len() <= max_size {
            result.push(event);
            continue;
        }
        let len = event.tokens.len();
        let mut offset = 0usize;
        while offset < len {
            let remaining = len - offset;
            let take = if remaining > max_size && remaining - max_size < min_size {
                remaining - min_size
            } else {
                remaining.min(max_size)
            };
            let end = offset + take.max(1);
            result.push(EpisodicEvent::new(
                event.tokens[offset..end].to_vec(),
                event.start_position + offset,
                event.start_position + end,
                event.surprise_scores[offset..end.min(event.surprise_scores.len())].to_vec(),
            ));
            offset = end;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("t{i}")).collect()
    }

    /// **Scenario**: logprobs `[0.1]*20 + [5.0] + [0.1]*20` with window 5 and
    /// gamma 1.0 produce exactly two events split at index 20.
    #[test]
    fn surprise_spike_splits_into_two_events() {
        let mut logprobs: Vec<TokenLogprob> = (0..20)
            .map(|i| TokenLogprob {
                token: format!("a{i}"),
                logprob: -0.1,
            })
            .collect();
        logprobs.push(TokenLogprob {
            token: "spike".into(),
            logprob: -5.0,
        });
        logprobs.extend((0..20).map(|i| TokenLogprob {
            token: format!("b{i}"),
            logprob: -0.1,
        }));

        let scores = surprise_from_logprobs(&logprobs);
        let boundaries = identify_event_boundaries(&scores, 5, 1.0);
        assert_eq!(boundaries, vec![0, 20, 41]);

        let token_strings: Vec<String> = logprobs.iter().map(|l| l.token.clone()).collect();
        let events = build_events(&token_strings, &scores, &boundaries);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].start_position, 0);
        assert_eq!(events[0].end_position, 20);
        assert_eq!(events[1].start_position, 20);
        assert_eq!(events[1].end_position, 41);
        assert_eq!(events[1].tokens[0], "spike");
        for event in &events {
            assert_eq!(event.surprise_scores.len(), event.tokens.len());
            assert!(event.start_position < event.end_position);
        }
    }

    /// **Scenario**: a sequence shorter than the window is one event
    /// spanning the whole range.
    #[test]
    fn short_sequence_single_event() {
        let scores = vec![0.5, 0.9, 0.1];
        let boundaries = identify_event_boundaries(&scores, 5, 1.0);
        assert_eq!(boundaries, vec![0, 3]);
        let events = build_events(&tokens(3), &scores, &boundaries);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].end_position, 3);
    }

    /// **Scenario**: empty logprobs produce zero events.
    #[test]
    fn empty_scores_no_events() {
        let boundaries = identify_event_boundaries(&[], 5, 1.0);
        assert!(boundaries.is_empty());
        assert!(build_events(&[], &[], &boundaries).is_empty());
        assert!(surprise_from_logprobs(&[]).is_empty());
    }

    /// **Scenario**: surprise is non-negative even for positive logprobs.
    #[test]
    fn surprise_clamped_non_negative() {
        let scores = surprise_from_logprobs(&[TokenLogprob {
            token: "x".into(),
            logprob: 0.5,
        }]);
        assert_eq!(scores, vec![0.0]);
    }

    /// **Scenario**: sentence splitting handles punctuation and newlines.
    #[test]
    fn split_sentences_on_punctuation_and_newlines() {
        let sentences = split_sentences("First one. Second!  Third?\nFourth line");
        assert_eq!(sentences, vec!["First one", "Second", "Third", "Fourth line"]);
        assert!(split_sentences("").is_empty());
    }

    /// **Scenario**: change scores start at 0 and reflect cosine distance.
    #[test]
    fn change_scores_first_zero() {
        let embeddings = vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![0.0, 1.0]];
        let scores = sentence_change_scores(&embeddings);
        assert_eq!(scores.len(), 3);
        assert_eq!(scores[0], 0.0);
        assert!(scores[1].abs() < 1e-6, "identical embeddings -> 0 distance");
        assert!((scores[2] - 1.0).abs() < 1e-6, "orthogonal -> distance 1");
    }

    /// **Scenario**: undersized events merge into the predecessor; oversized
    /// events split at max size; positions stay contiguous.
    #[test]
    fn enforce_event_size_merges_and_splits() {
        let all_tokens = tokens(30);
        let scores = vec![0.1f32; 30];
        // Spans: [0,2) undersized, [2,26) oversized for max=10, [26,30) undersized.
        let events = build_events(&all_tokens, &scores, &[0, 2, 26, 30]);
        let normalized = enforce_event_size(events, 4, 10);

        let mut expected_start = 0;
        for event in &normalized {
            assert_eq!(event.start_position, expected_start, "contiguous positions");
            expected_start = event.end_position;
            assert!(event.tokens.len() <= 10);
            assert!(event.tokens.len() >= 4);
            assert_eq!(event.surprise_scores.len(), event.tokens.len());
        }
        assert_eq!(expected_start, 30, "full coverage");
    }

    /// **Scenario**: a single short event is left alone by size enforcement.
    #[test]
    fn enforce_event_size_keeps_single_short_event() {
        let events = build_events(&tokens(3), &[0.0; 3], &[0, 3]);
        let normalized = enforce_event_size(events.clone(), 8, 128);
        assert_eq!(normalized, events);
    }
}
