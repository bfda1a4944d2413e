//! Keyword extraction for the keyword table and full-text retrieval.
//!
//! Text is segmented into Unicode words, lowercased and trimmed, and
//! stop-words are dropped. Keywords are ranked by frequency; ties keep
//! first-occurrence order, so extraction is deterministic.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use unicode_segmentation::UnicodeSegmentation;

/// Upper bound on keywords stored per segment.
pub const MAX_SEGMENT_KEYWORDS: usize = 10;

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for",
    "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "herself",
    "him", "himself", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just",
    "me", "more", "most", "my", "myself", "no", "nor", "not", "now", "of", "off", "on", "once",
    "only", "or", "other", "our", "ours", "ourselves", "out", "over", "own", "same", "she",
    "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "themselves", "then", "there", "these", "they", "this", "those", "through", "to", "too",
    "under", "until", "up", "very", "was", "we", "were", "what", "when", "where", "which",
    "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours", "yourself",
    "yourselves", "的", "了", "和", "是", "就", "都", "而", "及", "与", "着", "或", "一个", "没有",
    "我们", "你们", "他们", "它们", "这", "那", "在", "也", "有", "被", "把", "让",
];

static STOP_SET: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| STOP_WORDS.iter().copied().collect());

pub fn is_stop_word(word: &str) -> bool {
    STOP_SET.contains(word)
}

/// Normalize a single keyword the way extraction does.
pub fn normalize_keyword(word: &str) -> String {
    word.trim().to_lowercase()
}

/// Extract up to `max_keywords` keywords from `text`.
pub fn extract_keywords(text: &str, max_keywords: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for word in text.unicode_words() {
        let word = normalize_keyword(word);
        if word.is_empty() || is_stop_word(&word) {
            continue;
        }
        if word.chars().all(|c| c.is_ascii_punctuation()) {
            continue;
        }
        let count = counts.entry(word.clone()).or_insert(0);
        if *count == 0 {
            order.push(word);
        }
        *count += 1;
    }

    // Stable sort keeps first-occurrence order among equal counts.
    order.sort_by(|a, b| counts[b].cmp(&counts[a]));
    order.truncate(max_keywords);
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_then_first_occurrence() {
        let kws = extract_keywords("tokio runtime uses tokio tasks and tokio timers on runtime", 10);
        assert_eq!(kws, vec!["tokio", "runtime", "uses", "tasks", "timers"]);
    }

    #[test]
    fn test_stop_words_and_case() {
        let kws = extract_keywords("The Rust and THE rust", 10);
        assert_eq!(kws, vec!["rust"]);
    }

    #[test]
    fn test_truncates() {
        let text = (0..30).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        assert_eq!(extract_keywords(&text, MAX_SEGMENT_KEYWORDS).len(), 10);
    }

    #[test]
    fn test_empty_text() {
        assert!(extract_keywords("", 10).is_empty());
        assert!(extract_keywords("the of and", 10).is_empty());
    }
}
