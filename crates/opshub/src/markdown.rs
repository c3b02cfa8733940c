// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Inline markup parsing for payload text
//!
//! Task descriptions arrive with markdown-ish inline markup: bold,
//! italic, links. The parameter builder needs them as styled spans (for
//! platforms with rich blocks) or flattened plain text. This is a small
//! scanner, not a regex pass: nested markers work, and unbalanced
//! markers degrade to literal text instead of corrupting the output.

use serde::{Deserialize, Serialize};

/// One styled run of text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// The text content
    pub text: String,
    /// Bold (`**` or `__`)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bold: bool,
    /// Italic (`*` or `_`)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub italic: bool,
    /// Link destination (`[text](url)`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl Span {
    fn text_with(text: String, bold: bool, italic: bool) -> Self {
        Self {
            text,
            bold,
            italic,
            link: None,
        }
    }
}

/// Parse inline markup into styled spans.
#[must_use]
pub fn parse_inline(input: &str) -> Vec<Span> {
    let chars: Vec<char> = input.chars().collect();
    let mut spans = Vec::new();
    parse_segment(&chars, false, false, &mut spans);
    spans
}

/// Flatten inline markup to plain text; links become `text (url)`.
#[must_use]
pub fn to_plain_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for span in parse_inline(input) {
        out.push_str(&span.text);
        if let Some(url) = &span.link {
            if url != &span.text {
                out.push_str(&format!(" ({url})"));
            }
        }
    }
    out
}

/// Find the next occurrence of `marker` at or after `from`.
fn find_marker(chars: &[char], marker: &[char], from: usize) -> Option<usize> {
    if marker.is_empty() || chars.len() < marker.len() {
        return None;
    }
    (from..=chars.len() - marker.len()).find(|&i| &chars[i..i + marker.len()] == marker)
}

fn flush(buffer: &mut String, bold: bool, italic: bool, out: &mut Vec<Span>) {
    if !buffer.is_empty() {
        out.push(Span::text_with(std::mem::take(buffer), bold, italic));
    }
}

fn parse_segment(chars: &[char], bold: bool, italic: bool, out: &mut Vec<Span>) {
    let mut buffer = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        // Double markers toggle bold, single markers italic. A marker
        // without a closer is literal text.
        if c == '*' || c == '_' {
            let double = i + 1 < chars.len() && chars[i + 1] == c;
            let marker_len = if double { 2 } else { 1 };
            let marker: Vec<char> = std::iter::repeat(c).take(marker_len).collect();

            if let Some(close) = find_marker(chars, &marker, i + marker_len) {
                // Empty emphasis ("**" immediately closed) is literal.
                if close > i + marker_len {
                    flush(&mut buffer, bold, italic, out);
                    let inner = &chars[i + marker_len..close];
                    if double {
                        parse_segment(inner, true, italic, out);
                    } else {
                        parse_segment(inner, bold, true, out);
                    }
                    i = close + marker_len;
                    continue;
                }
            }
            buffer.extend(marker);
            i += marker_len;
            continue;
        }

        if c == '[' {
            if let Some(close_bracket) = find_marker(chars, &[']'], i + 1) {
                if chars.get(close_bracket + 1) == Some(&'(') {
                    if let Some(close_paren) = find_marker(chars, &[')'], close_bracket + 2) {
                        let text: String = chars[i + 1..close_bracket].iter().collect();
                        let url: String = chars[close_bracket + 2..close_paren].iter().collect();
                        flush(&mut buffer, bold, italic, out);
                        out.push(Span {
                            text: if text.is_empty() { url.clone() } else { text },
                            bold,
                            italic,
                            link: Some(url),
                        });
                        i = close_paren + 1;
                        continue;
                    }
                }
            }
            buffer.push(c);
            i += 1;
            continue;
        }

        buffer.push(c);
        i += 1;
    }

    flush(&mut buffer, bold, italic, out);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(text: &str) -> Span {
        Span::text_with(text.to_string(), false, false)
    }

    #[test]
    fn test_plain_text_single_span() {
        assert_eq!(parse_inline("just words"), vec![plain("just words")]);
    }

    #[test]
    fn test_bold() {
        let spans = parse_inline("a **bold** word");
        assert_eq!(
            spans,
            vec![
                plain("a "),
                Span::text_with("bold".to_string(), true, false),
                plain(" word"),
            ]
        );
    }

    #[test]
    fn test_italic_both_markers() {
        assert_eq!(
            parse_inline("*one*"),
            vec![Span::text_with("one".to_string(), false, true)]
        );
        assert_eq!(
            parse_inline("_two_"),
            vec![Span::text_with("two".to_string(), false, true)]
        );
    }

    #[test]
    fn test_nested_italic_inside_bold() {
        let spans = parse_inline("**bold *both* bold**");
        assert_eq!(
            spans,
            vec![
                Span::text_with("bold ".to_string(), true, false),
                Span::text_with("both".to_string(), true, true),
                Span::text_with(" bold".to_string(), true, false),
            ]
        );
    }

    #[test]
    fn test_link() {
        let spans = parse_inline("see [the runbook](https://wiki/runbook) first");
        assert_eq!(spans[0], plain("see "));
        assert_eq!(spans[1].text, "the runbook");
        assert_eq!(spans[1].link.as_deref(), Some("https://wiki/runbook"));
        assert_eq!(spans[2], plain(" first"));
    }

    #[test]
    fn test_link_with_empty_text_uses_url() {
        let spans = parse_inline("[](https://x)");
        assert_eq!(spans[0].text, "https://x");
        assert_eq!(spans[0].link.as_deref(), Some("https://x"));
    }

    #[test]
    fn test_unbalanced_bold_is_literal() {
        assert_eq!(parse_inline("**broken"), vec![plain("**broken")]);
    }

    #[test]
    fn test_unbalanced_bracket_is_literal() {
        assert_eq!(parse_inline("a [link without end"), vec![plain("a [link without end")]);
        assert_eq!(parse_inline("[text] no url"), vec![plain("[text] no url")]);
    }

    #[test]
    fn test_empty_emphasis_is_literal() {
        assert_eq!(parse_inline("****"), vec![plain("****")]);
    }

    #[test]
    fn test_mixed_markers_degrade_gracefully() {
        // The stray underscore closes nothing and stays literal.
        let spans = parse_inline("**bold** and _ stray");
        assert_eq!(spans[0], Span::text_with("bold".to_string(), true, false));
        assert_eq!(spans[1], plain(" and _ stray"));
    }

    #[test]
    fn test_to_plain_text_flattens() {
        assert_eq!(
            to_plain_text("**Alert**: see [runbook](https://wiki/rb)"),
            "Alert: see runbook (https://wiki/rb)"
        );
    }

    #[test]
    fn test_to_plain_text_identity_on_plain_input() {
        let input = "no markup at all, just text.";
        assert_eq!(to_plain_text(input), input);
    }

    #[test]
    fn test_empty_input() {
        assert!(parse_inline("").is_empty());
        assert_eq!(to_plain_text(""), "");
    }
}
