//! Inbound text sanitization.
//!
//! Applied to every channel message before policy checks: strips control
//! characters (keeping tab/newline), truncates at [`MAX_TEXT_LEN`], redacts
//! overly long URLs, and extracts URL counts for message metadata.
//! Applying the function twice is equivalent to applying it once.

use std::sync::OnceLock;

use regex::Regex;

/// Messages longer than this are cut off.
pub const MAX_TEXT_LEN: usize = 4000;

/// URLs at or above this length are replaced with a redaction marker.
const LONG_URL_LEN: usize = 120;

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)https?://\S+").expect("static regex"))
}

fn long_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"(?i)https?://\S{{{LONG_URL_LEN},}}")).expect("static regex")
    })
}

/// Clean `text`, returning the sanitized string and a list of issue tags
/// (`control_chars_removed`, `truncated`, `urls:<n>`).
pub fn sanitize_text(text: &str) -> (String, Vec<String>) {
    let mut issues = Vec::new();

    let mut cleaned: String = text
        .chars()
        .filter(|&ch| ch >= ' ' || ch == '\n' || ch == '\t')
        .collect();
    if cleaned != text {
        issues.push("control_chars_removed".to_owned());
    }

    let urls = url_re().find_iter(&cleaned).count();

    if cleaned.chars().count() > MAX_TEXT_LEN {
        cleaned = cleaned.chars().take(MAX_TEXT_LEN).collect();
        issues.push("truncated".to_owned());
    }

    let redacted = long_url_re().replace_all(&cleaned, "[link_redacted]");
    cleaned = redacted.into_owned();

    if urls > 0 {
        issues.push(format!("urls:{urls}"));
    }

    (cleaned, issues)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let (out, issues) = sanitize_text("hello world");
        assert_eq!(out, "hello world");
        assert!(issues.is_empty());
    }

    #[test]
    fn control_chars_are_stripped_except_tab_newline() {
        let (out, issues) = sanitize_text("a\u{0}b\tc\nd\re");
        assert_eq!(out, "ab\tc\nde");
        assert!(issues.contains(&"control_chars_removed".to_owned()));
    }

    #[test]
    fn long_messages_are_truncated() {
        let long = "x".repeat(MAX_TEXT_LEN + 10);
        let (out, issues) = sanitize_text(&long);
        assert_eq!(out.chars().count(), MAX_TEXT_LEN);
        assert!(issues.contains(&"truncated".to_owned()));
    }

    #[test]
    fn urls_are_counted() {
        let (_, issues) = sanitize_text("see https://a.example and http://b.example");
        assert!(issues.contains(&"urls:2".to_owned()));
    }

    #[test]
    fn long_urls_are_redacted() {
        let url = format!("https://example.com/{}", "q".repeat(150));
        let (out, _) = sanitize_text(&format!("look at {url}"));
        assert!(out.contains("[link_redacted]"));
        assert!(!out.contains("example.com"));
    }

    #[test]
    fn short_urls_survive() {
        let (out, _) = sanitize_text("see https://example.com/page");
        assert!(out.contains("https://example.com/page"));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            "plain text",
            "ctrl\u{1}chars https://example.com",
            &format!("https://example.com/{}", "q".repeat(200)),
            &"y".repeat(MAX_TEXT_LEN + 100),
        ];
        for input in inputs {
            let (once, _) = sanitize_text(input);
            let (twice, _) = sanitize_text(&once);
            assert_eq!(once, twice, "not idempotent for {input:.40}");
        }
    }
}
