//! Rendering display blocks into Telegram markup.
//!
//! Streaming: all thinking collected into one expandable blockquote above
//! the text, truncated to fit. Final: text only, tool markers stripped.

use crate::display::{BlockKind, DisplayManager, ParseMode};
use crate::markdown::{
    escape_html, escape_markdown_v2, expandable_blockquote_html, expandable_blockquote_md2,
};
use crate::truncate::TruncationManager;

/// Emoji set used in tool/system markers. A bracketed span starting with
/// one of these is a marker, e.g. `[📄 analyze_pdf]` or `[✅ done]`.
const MARKER_EMOJIS: &[&str] = &[
    "📄", "🐍", "🎨", "🔍", "📤", "✅", "❌", "🌐", "📎", "🖼", "🎤", "🔧",
];

/// Remove tool markers and system status markers from the final response.
pub fn strip_tool_markers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    'outer: while let Some(open) = rest.find('[') {
        let (before, bracketed) = rest.split_at(open);
        for emoji in MARKER_EMOJIS {
            if bracketed[1..].starts_with(emoji) {
                if let Some(close) = bracketed.find(']') {
                    out.push_str(before);
                    rest = &bracketed[close + 1..];
                    // Swallow one newline directly after the marker.
                    if let Some(stripped) = rest.strip_prefix('\n') {
                        rest = stripped;
                    }
                    continue 'outer;
                }
            }
        }
        // Not a marker: keep the bracket and move on.
        out.push_str(before);
        out.push('[');
        rest = &bracketed[1..];
    }
    out.push_str(rest);

    collapse_blank_runs(out.trim())
}

/// Collapse runs of 3+ newlines down to a blank line.
fn collapse_blank_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0;
    for ch in text.chars() {
        if ch == '\n' {
            newlines += 1;
            if newlines <= 2 {
                out.push(ch);
            }
        } else {
            newlines = 0;
            out.push(ch);
        }
    }
    out
}

/// Render the display buffer for a streaming edit: thinking blockquote on
/// top, text below, truncated to the message limit.
pub fn render_streaming(dm: &DisplayManager, parse_mode: ParseMode) -> String {
    let thinking = dm.thinking();
    let text = dm.text();

    let tm = TruncationManager::new(parse_mode);
    let (thinking, text) = tm.truncate_for_display(&thinking, &text);

    let mut parts: Vec<String> = Vec::with_capacity(2);
    if !thinking.is_empty() {
        let quote = match parse_mode {
            ParseMode::MarkdownV2 => expandable_blockquote_md2(&escape_markdown_v2(&thinking)),
            ParseMode::Html => expandable_blockquote_html(&escape_html(&thinking)),
        };
        parts.push(quote);
    }
    if !text.is_empty() {
        let escaped = match parse_mode {
            ParseMode::MarkdownV2 => escape_markdown_v2(&text),
            ParseMode::Html => escape_html(&text),
        };
        parts.push(escaped);
    }

    parts.join("\n")
}

/// Render the final message: only text blocks, markers stripped.
pub fn render_final(dm: &DisplayManager, parse_mode: ParseMode) -> String {
    let text = strip_tool_markers(&dm.text());
    match parse_mode {
        ParseMode::MarkdownV2 => escape_markdown_v2(&text),
        ParseMode::Html => escape_html(&text),
    }
}

/// Plain-text fallback render when the parse mode is rejected by Telegram.
pub fn render_plain(dm: &DisplayManager, streaming: bool) -> String {
    if streaming {
        let tm = TruncationManager::new(ParseMode::Html);
        let (thinking, text) = tm.truncate_for_display(&dm.thinking(), &dm.text());
        if thinking.is_empty() {
            text
        } else {
            format!("{thinking}\n{text}")
        }
    } else {
        strip_tool_markers(&dm.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dm(thinking: &str, text: &str) -> DisplayManager {
        let mut dm = DisplayManager::new();
        dm.append(BlockKind::Thinking, thinking);
        dm.append(BlockKind::Text, text);
        dm
    }

    #[test]
    fn strips_tool_markers() {
        let input = "Let me check.\n[📄 analyze_pdf]\nThe document says X.";
        let cleaned = strip_tool_markers(input);
        assert!(!cleaned.contains("analyze_pdf"));
        assert!(cleaned.contains("Let me check."));
        assert!(cleaned.contains("The document says X."));
    }

    #[test]
    fn strips_status_markers() {
        let input = "[✅ execute_python]\nDone: 42";
        assert_eq!(strip_tool_markers(input), "Done: 42");
    }

    #[test]
    fn keeps_ordinary_brackets() {
        let input = "Array access a[0] and [citation] stay.";
        assert_eq!(strip_tool_markers(input), input);
    }

    #[test]
    fn collapses_marker_leftover_blank_lines() {
        let input = "Before\n\n[🐍 execute_python]\n\nAfter";
        let cleaned = strip_tool_markers(input);
        assert!(!cleaned.contains("\n\n\n"));
    }

    #[test]
    fn streaming_render_puts_thinking_above() {
        let rendered = render_streaming(&dm("pondering", "the answer"), ParseMode::Html);
        let thinking_pos = rendered.find("pondering").unwrap();
        let text_pos = rendered.find("the answer").unwrap();
        assert!(thinking_pos < text_pos);
        assert!(rendered.contains("<blockquote expandable>"));
    }

    #[test]
    fn streaming_render_md2_escapes() {
        let rendered = render_streaming(&dm("", "a.b"), ParseMode::MarkdownV2);
        assert_eq!(rendered, "a\\.b");
    }

    #[test]
    fn final_render_drops_thinking() {
        let rendered = render_final(&dm("secret reasoning", "public answer"), ParseMode::Html);
        assert!(!rendered.contains("secret reasoning"));
        assert!(rendered.contains("public answer"));
    }

    #[test]
    fn final_render_strips_markers() {
        let mut d = DisplayManager::new();
        d.append(BlockKind::Text, "Result:\n[🖼 analyze_image]\n42");
        let rendered = render_final(&d, ParseMode::Html);
        assert!(!rendered.contains("analyze_image"));
        assert!(rendered.contains("42"));
    }

    #[test]
    fn oversized_payload_keeps_text_intact() {
        let text = "x".repeat(4_000);
        let rendered = render_streaming(&dm(&"t".repeat(2_000), &text), ParseMode::Html);
        assert!(rendered.contains(&text));
        assert!(rendered.len() <= 4_096 + 100, "len {}", rendered.len());
    }
}
