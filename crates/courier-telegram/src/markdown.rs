//! MarkdownV2 and HTML helpers for streaming display.

/// Escape special characters for Telegram MarkdownV2.
///
/// MarkdownV2 requires escaping: `_ * [ ] ( ) ~ ` > # + - = | { } . !`
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        match ch {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '='
            | '|' | '{' | '}' | '.' | '!' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Escape HTML special characters for parse_mode=HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Render an expandable blockquote in MarkdownV2.
///
/// Syntax: every line prefixed with `>`, the first marked `**>`, and the
/// final line suffixed with `||`. Content must already be escaped.
pub fn expandable_blockquote_md2(escaped: &str) -> String {
    let lines: Vec<&str> = escaped.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let mut out = String::with_capacity(escaped.len() + lines.len() * 2 + 4);
    out.push_str("**>");
    out.push_str(lines[0]);
    for line in &lines[1..] {
        out.push_str("\n>");
        out.push_str(line);
    }
    out.push_str("||");
    out
}

/// Render an expandable blockquote in HTML. Content must already be escaped.
pub fn expandable_blockquote_html(escaped: &str) -> String {
    format!("<blockquote expandable>{escaped}</blockquote>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md2_escapes_specials() {
        let escaped = escape_markdown_v2("a.b!c(d)e[f]g");
        assert_eq!(escaped, "a\\.b\\!c\\(d\\)e\\[f\\]g");
    }

    #[test]
    fn md2_leaves_plain_text() {
        assert_eq!(escape_markdown_v2("Hello world 123"), "Hello world 123");
    }

    #[test]
    fn html_escapes_entities() {
        assert_eq!(escape_html("a < b & c > d"), "a &lt; b &amp; c &gt; d");
    }

    #[test]
    fn md2_blockquote_shape() {
        let quote = expandable_blockquote_md2("line one\nline two");
        assert!(quote.starts_with("**>line one"));
        assert!(quote.contains("\n>line two"));
        assert!(quote.ends_with("||"));
    }

    #[test]
    fn md2_blockquote_empty() {
        assert_eq!(expandable_blockquote_md2(""), "");
    }

    #[test]
    fn html_blockquote_shape() {
        assert_eq!(
            expandable_blockquote_html("thinking"),
            "<blockquote expandable>thinking</blockquote>"
        );
    }
}
