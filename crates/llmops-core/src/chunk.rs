//! Recursive character splitter.
//!
//! Splits cleaned document text into chunks bounded by a token budget.
//! Length is always measured by a [`TokenCounter`], never by byte length.
//!
//! # Algorithm
//!
//! 1. Pick the first separator that is `""` or matches the text.
//! 2. Split on it, keeping each match attached to the end of the
//!    preceding fragment so that chunks reproduce the source text.
//! 3. Fragments shorter than `chunk_size` are buffered; longer ones are
//!    split recursively with the remaining separators.
//! 4. Buffered fragments are merged greedily. On flush, the trailing
//!    fragments whose total length is at most `chunk_overlap` are kept as
//!    the prefix of the next chunk.
//! 5. With no separators left, an oversized fragment is sliced on
//!    grapheme boundaries into windows of at most `chunk_size` tokens,
//!    each repeating the last `chunk_overlap` tokens of the one before.
//!
//! The empty separator `""` splits into grapheme clusters.

use std::collections::VecDeque;

use regex::Regex;
use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{Error, Result};
use crate::llm::TokenCounter;

/// Separators used when a process rule runs in `automatic` mode.
///
/// Each entry is a regular expression; `""` means grapheme split.
pub const DEFAULT_SEPARATORS: &[&str] = &[
    "\n\n",
    "\n",
    "。|！|？",
    r"\.\s|\!\s|\?\s",
    r"；|;\s",
    r"，|,\s",
    " ",
    "",
];

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

/// SHA-256 hex digest of a segment's content.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

enum Separator {
    Graphemes,
    Pattern(Regex),
}

impl Separator {
    fn compile(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Ok(Separator::Graphemes);
        }
        Regex::new(raw)
            .map(Separator::Pattern)
            .map_err(|e| Error::validation(format!("invalid separator {:?}: {}", raw, e)))
    }

    fn matches(&self, text: &str) -> bool {
        match self {
            Separator::Graphemes => true,
            Separator::Pattern(re) => re.is_match(text),
        }
    }

    fn split<'t>(&self, text: &'t str) -> Vec<&'t str> {
        match self {
            Separator::Graphemes => text.graphemes(true).collect(),
            Separator::Pattern(re) => {
                let mut out = Vec::new();
                let mut start = 0;
                for m in re.find_iter(text) {
                    if m.end() == start || m.end() == 0 {
                        continue;
                    }
                    out.push(&text[start..m.end()]);
                    start = m.end();
                }
                if start < text.len() {
                    out.push(&text[start..]);
                }
                out.retain(|s| !s.is_empty());
                out
            }
        }
    }
}

/// A configured recursive splitter.
pub struct RecursiveSplitter<'a> {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<Separator>,
    counter: &'a dyn TokenCounter,
}

impl<'a> RecursiveSplitter<'a> {
    /// Build a splitter. Fails with a validation error when
    /// `chunk_size` is zero, `chunk_overlap >= chunk_size`, or a separator
    /// is not a valid regular expression.
    pub fn new(
        chunk_size: usize,
        chunk_overlap: usize,
        separators: &[String],
        counter: &'a dyn TokenCounter,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::validation("chunk_size must be > 0"));
        }
        if chunk_overlap >= chunk_size {
            return Err(Error::validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap, chunk_size
            )));
        }
        let separators = separators
            .iter()
            .map(|s| Separator::compile(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            chunk_size,
            chunk_overlap,
            separators,
            counter,
        })
    }

    /// Split `text` into trimmed, non-empty chunks in source order.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_with(text, &self.separators)
    }

    fn len(&self, text: &str) -> usize {
        self.counter.count_tokens(text)
    }

    fn split_with(&self, text: &str, separators: &[Separator]) -> Vec<String> {
        let mut chunks = Vec::new();

        let chosen = separators.iter().position(|s| s.matches(text));
        let (separator, rest) = match chosen {
            Some(i) => (Some(&separators[i]), &separators[i + 1..]),
            None => (None, &separators[separators.len()..]),
        };
        let fragments = match separator {
            Some(sep) => sep.split(text),
            None => vec![text],
        };

        let mut good: Vec<&str> = Vec::new();
        for fragment in fragments {
            if self.len(fragment) < self.chunk_size {
                good.push(fragment);
                continue;
            }
            if !good.is_empty() {
                chunks.extend(self.merge(&good));
                good.clear();
            }
            if rest.is_empty() {
                chunks.extend(self.window(fragment));
            } else {
                chunks.extend(self.split_with(fragment, rest));
            }
        }
        if !good.is_empty() {
            chunks.extend(self.merge(&good));
        }
        chunks
    }

    fn merge(&self, fragments: &[&str]) -> Vec<String> {
        let mut out = Vec::new();
        let mut current: VecDeque<(&str, usize)> = VecDeque::new();
        let mut total = 0usize;

        for &fragment in fragments {
            let len = self.len(fragment);
            if total + len > self.chunk_size && !current.is_empty() {
                push_joined(&mut out, &current);
                while total > self.chunk_overlap
                    || (total + len > self.chunk_size && total > 0)
                {
                    match current.pop_front() {
                        Some((_, l)) => total -= l,
                        None => break,
                    }
                }
            }
            current.push_back((fragment, len));
            total += len;
        }
        push_joined(&mut out, &current);
        out
    }

    /// Slices `text` into windows of at most `chunk_size` tokens, each
    /// starting on the trailing `chunk_overlap` tokens of the previous one.
    fn window(&self, text: &str) -> Vec<String> {
        let graphemes: Vec<&str> = text.graphemes(true).collect();
        let tokens = |from: usize, to: usize| self.len(&graphemes[from..to].concat());
        let mut out = Vec::new();
        let mut start = 0;
        while start < graphemes.len() {
            let fits = partition_point(start + 1, graphemes.len() + 1, |end| {
                tokens(start, end) <= self.chunk_size
            });
            // A single grapheme over budget still forms a window.
            let end = (fits - 1).max(start + 1);
            let piece = graphemes[start..end].concat();
            let piece = piece.trim();
            if !piece.is_empty() {
                out.push(piece.to_string());
            }
            if end == graphemes.len() {
                break;
            }
            start = partition_point(start + 1, end, |from| {
                tokens(from, end) > self.chunk_overlap
            });
        }
        out
    }
}

/// First index in `lo..hi` where `pred` stops holding, or `hi`.
/// `pred` must hold on a prefix of the range and fail on the rest.
fn partition_point(mut lo: usize, mut hi: usize, pred: impl Fn(usize) -> bool) -> usize {
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

fn push_joined(out: &mut Vec<String>, current: &VecDeque<(&str, usize)>) {
    let joined: String = current.iter().map(|(s, _)| *s).collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ApproxTokenCounter, CharTokenCounter};

    fn defaults() -> Vec<String> {
        DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_short_text_single_chunk() {
        let splitter = RecursiveSplitter::new(100, 10, &defaults(), &CharTokenCounter).unwrap();
        let chunks = splitter.split_text("Hello, world!");
        assert_eq!(chunks, vec!["Hello, world!"]);
    }

    #[test]
    fn test_paragraphs_split_when_over_budget() {
        let a = "a".repeat(60);
        let b = "b".repeat(60);
        let text = format!("{}\n\n{}", a, b);
        let splitter = RecursiveSplitter::new(100, 10, &defaults(), &CharTokenCounter).unwrap();
        let chunks = splitter.split_text(&text);
        assert_eq!(chunks, vec![a, b]);
    }

    #[test]
    fn test_paragraphs_merge_under_budget() {
        let text = "First.\n\nSecond.";
        let splitter = RecursiveSplitter::new(100, 10, &defaults(), &CharTokenCounter).unwrap();
        let chunks = splitter.split_text(text);
        assert_eq!(chunks, vec!["First.\n\nSecond."]);
    }

    #[test]
    fn test_chunks_respect_budget() {
        let text = (0..200)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let splitter = RecursiveSplitter::new(50, 10, &defaults(), &CharTokenCounter).unwrap();
        let chunks = splitter.split_text(&text);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 50, "chunk too long: {}", c);
        }
    }

    #[test]
    fn test_overlap_carries_tail() {
        let text = "one two three four five six seven eight nine ten";
        let splitter =
            RecursiveSplitter::new(20, 10, &[" ".to_string()], &CharTokenCounter).unwrap();
        let chunks = splitter.split_text(text);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let last_word = pair[0].split(' ').last().unwrap();
            assert!(
                pair[1].split(' ').any(|w| w == last_word),
                "{:?} should carry {:?}",
                pair[1],
                last_word
            );
        }
    }

    #[test]
    fn test_window_slicing_without_separators() {
        let text = "x".repeat(25);
        let splitter = RecursiveSplitter::new(10, 2, &[], &CharTokenCounter).unwrap();
        let chunks = splitter.split_text(&text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[2].len(), 9);
    }

    #[test]
    fn test_window_slicing_counts_tokens() {
        let text = "x".repeat(100);
        let splitter = RecursiveSplitter::new(10, 2, &[], &ApproxTokenCounter).unwrap();
        let chunks = splitter.split_text(&text);
        let lens: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(lens, vec![40, 40, 36]);
        for chunk in &chunks {
            assert!(ApproxTokenCounter.count_tokens(chunk) <= 10);
        }
    }

    #[test]
    fn test_sentence_regex_separator() {
        let text = "First sentence. Second sentence! Third one? Done";
        let splitter = RecursiveSplitter::new(
            20,
            0,
            &[r"\.\s|\!\s|\?\s".to_string(), "".to_string()],
            &CharTokenCounter,
        )
        .unwrap();
        let chunks = splitter.split_text(text);
        assert_eq!(chunks[0], "First sentence.");
        assert_eq!(chunks[1], "Second sentence!");
    }

    #[test]
    fn test_multibyte_text() {
        let text = "第一句。第二句！第三句？".repeat(10);
        let splitter = RecursiveSplitter::new(12, 2, &defaults(), &CharTokenCounter).unwrap();
        let chunks = splitter.split_text(&text);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.chars().count() <= 12);
        }
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(RecursiveSplitter::new(0, 0, &defaults(), &CharTokenCounter).is_err());
        assert!(RecursiveSplitter::new(10, 10, &defaults(), &CharTokenCounter).is_err());
        assert!(RecursiveSplitter::new(10, 1, &["(".to_string()], &CharTokenCounter).is_err());
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta.\n\nGamma delta.\n\nEpsilon zeta eta theta.";
        let splitter = RecursiveSplitter::new(15, 3, &defaults(), &CharTokenCounter).unwrap();
        assert_eq!(splitter.split_text(text), splitter.split_text(text));
    }

    #[test]
    fn test_content_hash_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("").len(), 64);
    }
}
