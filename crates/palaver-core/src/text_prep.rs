//! Text handling for replies: length in characters, truncation, log previews,
//! and markdown stripping before a reply is spoken.
//!
//! All lengths are counted in Unicode scalar values, never bytes: replies are
//! routinely Cyrillic, where one character is two UTF-8 bytes.

use regex::Regex;
use std::sync::LazyLock;

/// Length of log previews produced by [`preview`].
pub const PREVIEW_LEN: usize = 100;

static RE_CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"【[^】]*】").unwrap());
static RE_FENCED_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static RE_INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`]+)`").unwrap());
static RE_EMPHASIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\*\*|\*)([^*]+)(\*\*|\*)").unwrap());
static RE_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*#{1,6}\s*").unwrap());
static RE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap());
static RE_LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:[-*+]|\d+[.)])\s+").unwrap());
static RE_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Number of characters in `text`.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Borrow at most `max` characters of `text`, cutting on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Short single-line rendering of `text` for log lines.
pub fn preview(text: &str) -> String {
    let flat = RE_WHITESPACE.replace_all(text.trim(), " ");
    if char_len(&flat) <= PREVIEW_LEN {
        flat.into_owned()
    } else {
        format!("{}...", truncate_chars(&flat, PREVIEW_LEN))
    }
}

/// Strip markdown and provider citation markers so a reply reads naturally
/// when spoken.
pub fn clean_for_speech(text: &str) -> String {
    let mut c = RE_CITATION.replace_all(text, "").into_owned();
    c = RE_FENCED_CODE.replace_all(&c, " ").into_owned();
    c = RE_INLINE_CODE.replace_all(&c, "$1").into_owned();
    c = RE_LINK.replace_all(&c, "$1").into_owned();
    c = RE_EMPHASIS.replace_all(&c, "$2").into_owned();
    c = RE_HEADING.replace_all(&c, "").into_owned();
    c = RE_LIST_MARKER.replace_all(&c, "").into_owned();
    c = RE_WHITESPACE.replace_all(&c, " ").into_owned();
    c.trim().to_string()
}
