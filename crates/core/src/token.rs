//! Token counting.
//!
//! Rough heuristic over byte length, deliberately cheap: the engine
//! calls this on every ingested turn and every assembled section, so it
//! must not require a tokenizer model. Counts only need to be
//! *consistent*, not exact — budgeting and truncation work off relative
//! sizes, and every tier reports sizes with the same counter.
//!
//! Guarantees, per profile:
//! - deterministic: same text, same count
//! - monotonic: `count(a + b) >= count(a)` (concatenation never shrinks)
//! - `truncate(text, n)` always yields text with `count <= n`, cut on a
//!   character boundary

use serde::{Deserialize, Serialize};

/// Tokenization profile for a target model family.
///
/// The value is an approximate bytes-per-token divisor. English prose on
/// modern BPE tokenizers averages ~4 bytes per token; code and dense
/// scripts tokenize heavier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProfile {
    /// General prose, ~4 bytes per token.
    #[default]
    General,
    /// Code, CJK, or other dense input, ~3 bytes per token.
    Compact,
}

impl ModelProfile {
    pub fn bytes_per_token(self) -> usize {
        match self {
            ModelProfile::General => 4,
            ModelProfile::Compact => 3,
        }
    }
}

/// Pure token counter for a fixed [`ModelProfile`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCounter {
    profile: ModelProfile,
}

impl TokenCounter {
    pub fn new(profile: ModelProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> ModelProfile {
        self.profile
    }

    /// Approximate token count for `text`. Empty text counts as zero.
    pub fn count(&self, text: &str) -> usize {
        text.len().div_ceil(self.profile.bytes_per_token())
    }

    /// Longest prefix of `text` that counts at most `max_tokens`,
    /// cut on a character boundary (never mid-codepoint).
    pub fn truncate<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        let limit = max_tokens.saturating_mul(self.profile.bytes_per_token());
        if text.len() <= limit {
            return text;
        }
        let mut end = limit;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    }
}

/// Words ignored by term extraction. Small on purpose: sparse scoring
/// only needs the worst noise gone.
const STOP_WORDS: [&str; 18] = [
    "the", "a", "an", "and", "or", "of", "to", "in", "is", "it", "for", "on",
    "with", "as", "at", "this", "that", "be",
];

/// Lowercased alphanumeric terms of `text`, stop words removed.
///
/// The one tokenization used everywhere terms matter (sparse scoring,
/// entity name matching, local embeddings, budget adaptation), so all
/// of them agree on what a "term" is.
pub fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terms_drop_stop_words_and_punctuation() {
        let out = terms("The quick, brown fox is on the move!");
        assert_eq!(out, vec!["quick", "brown", "fox", "move"]);
    }

    #[test]
    fn terms_keep_duplicates_for_frequency_scoring() {
        let out = terms("rust rust rust");
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn count_empty_is_zero() {
        let counter = TokenCounter::default();
        assert_eq!(counter.count(""), 0);
    }

    #[test]
    fn count_rounds_up() {
        let counter = TokenCounter::new(ModelProfile::General);
        assert_eq!(counter.count("a"), 1);
        assert_eq!(counter.count("abcd"), 1);
        assert_eq!(counter.count("abcde"), 2);
    }

    #[test]
    fn count_is_monotonic_under_concatenation() {
        let counter = TokenCounter::default();
        let a = "hello world";
        let b = ", and more text after it";
        let joined = format!("{a}{b}");
        assert!(counter.count(&joined) >= counter.count(a));
        assert!(counter.count(&joined) >= counter.count(b));
    }

    #[test]
    fn compact_profile_counts_heavier() {
        let text = "fn main() { println!(\"hi\"); }";
        let general = TokenCounter::new(ModelProfile::General).count(text);
        let compact = TokenCounter::new(ModelProfile::Compact).count(text);
        assert!(compact >= general);
    }

    #[test]
    fn truncate_respects_budget() {
        let counter = TokenCounter::default();
        let text = "the quick brown fox jumps over the lazy dog";
        let cut = counter.truncate(text, 3);
        assert!(counter.count(cut) <= 3);
        assert!(text.starts_with(cut));
    }

    #[test]
    fn truncate_never_splits_a_codepoint() {
        let counter = TokenCounter::default();
        // Multibyte characters at the cut point must survive intact.
        let text = "日本語のテキストです、もっと長くします";
        for max in 1..8 {
            let cut = counter.truncate(text, max);
            assert!(counter.count(cut) <= max);
            assert!(text.starts_with(cut));
        }
    }

    #[test]
    fn truncate_is_identity_when_within_budget() {
        let counter = TokenCounter::default();
        let text = "short";
        assert_eq!(counter.truncate(text, 100), text);
    }
}
