//! Text cleaning applied between parsing and splitting.
//!
//! Two layers:
//!
//! | Function | When | Effect |
//! |----------|------|--------|
//! | [`clean_text`] | always, after parsing | Fixed substitutions and control-character removal |
//! | [`apply_pre_process_rules`] | per [`RuleSpec`](crate::models::RuleSpec) | Whitespace collapse, URL/email removal |

use std::sync::LazyLock;

use regex::Regex;

use crate::models::{RuleSpec, RULE_REMOVE_EXTRA_SPACE, RULE_REMOVE_URL_AND_EMAIL};

static MULTI_NEWLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("static regex"));

static MULTI_SPACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\t\f\r\x20\u{00a0}\u{1680}\u{180e}\u{2000}-\u{200a}\u{202f}\u{205f}\u{3000}]{2,}")
        .expect("static regex")
});

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9.-]+").expect("static regex")
});

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s]+").expect("static regex"));

/// Apply the fixed post-parse substitutions.
///
/// `<|` becomes `<`, `|>` becomes `>`, C0 control characters other than
/// TAB, LF and CR are dropped, as is `U+FFFE`.
pub fn clean_text(text: &str) -> String {
    let text = text.replace("<|", "<").replace("|>", ">");
    text.chars()
        .filter(|&c| {
            let is_c0 = (c as u32) < 0x20;
            let keep_c0 = matches!(c, '\t' | '\n' | '\r');
            (!is_c0 || keep_c0) && c != '\u{fffe}'
        })
        .collect()
}

/// Collapse runs of 3+ newlines to a blank line and runs of horizontal
/// whitespace to a single space.
pub fn collapse_whitespace(text: &str) -> String {
    let text = MULTI_NEWLINE.replace_all(text, "\n\n");
    MULTI_SPACE.replace_all(&text, " ").into_owned()
}

/// Strip email addresses first, then URLs.
pub fn remove_urls_and_emails(text: &str) -> String {
    let text = EMAIL.replace_all(text, "");
    URL.replace_all(&text, "").into_owned()
}

/// Apply whichever pre-processing toggles are enabled in `rule`.
pub fn apply_pre_process_rules(text: &str, rule: &RuleSpec) -> String {
    let mut out = text.to_string();
    if rule.is_enabled(RULE_REMOVE_EXTRA_SPACE) {
        out = collapse_whitespace(&out);
    }
    if rule.is_enabled(RULE_REMOVE_URL_AND_EMAIL) {
        out = remove_urls_and_emails(&out);
    }
    out
}
