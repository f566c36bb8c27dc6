//! Length management for the 4096-character message limit.
//!
//! Text is inviolate: the user must always see the full answer. Thinking
//! absorbs all truncation, cut from the beginning so the most recent
//! reasoning survives, and disappears entirely when its budget drops under
//! the minimum. MarkdownV2 escaping inflates rendered length more than
//! HTML, so it gets a stricter safety margin.

use courier_core::config::TELEGRAM_MESSAGE_LIMIT;

use crate::display::ParseMode;

/// Escape/markup overhead reserves per parse mode.
pub const SAFETY_MARGIN_HTML: usize = 46;
pub const SAFETY_MARGIN_MD2: usize = 146;

/// Below this many available characters, thinking is suppressed entirely.
pub const MIN_THINKING_SPACE: usize = 100;

pub struct TruncationManager {
    pub effective_limit: usize,
}

impl TruncationManager {
    pub fn new(parse_mode: ParseMode) -> Self {
        let margin = match parse_mode {
            ParseMode::Html => SAFETY_MARGIN_HTML,
            ParseMode::MarkdownV2 => SAFETY_MARGIN_MD2,
        };
        Self {
            effective_limit: TELEGRAM_MESSAGE_LIMIT - margin,
        }
    }

    /// Characters left for thinking after the text takes its share.
    pub fn available_for_thinking(&self, text_len: usize) -> usize {
        self.effective_limit.saturating_sub(text_len)
    }

    /// Fit (thinking, text) into the limit. Text is returned unchanged;
    /// thinking is front-truncated with an ellipsis or emptied.
    pub fn truncate_for_display(&self, thinking: &str, text: &str) -> (String, String) {
        let thinking_chars = thinking.chars().count();
        let text_chars = text.chars().count();

        if thinking_chars + text_chars <= self.effective_limit {
            return (thinking.to_string(), text.to_string());
        }

        let available = self.available_for_thinking(text_chars);
        if available < MIN_THINKING_SPACE {
            return (String::new(), text.to_string());
        }

        // Keep the last (available - 1) chars, prefix with an ellipsis.
        let keep = available - 1;
        let suffix: String = thinking
            .chars()
            .skip(thinking_chars - keep.min(thinking_chars))
            .collect();
        (format!("…{suffix}"), text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html() -> TruncationManager {
        TruncationManager::new(ParseMode::Html)
    }

    #[test]
    fn fits_unchanged() {
        let tm = html();
        let (thinking, text) = tm.truncate_for_display("short thinking", "short answer");
        assert_eq!(thinking, "short thinking");
        assert_eq!(text, "short answer");
    }

    #[test]
    fn text_never_truncated() {
        let tm = html();
        let text = "x".repeat(3_500);
        let thinking = "t".repeat(1_000);
        let (out_thinking, out_text) = tm.truncate_for_display(&thinking, &text);
        assert_eq!(out_text, text);
        assert!(out_thinking.chars().count() < 1_000 || out_thinking.is_empty());
    }

    #[test]
    fn thinking_cut_from_beginning() {
        let tm = html();
        let thinking = format!("old_part_{}_recent_part", "a".repeat(4_480));
        let text = "x".repeat(100);
        let (out_thinking, out_text) = tm.truncate_for_display(&thinking, &text);
        assert_eq!(out_text, text);
        assert!(out_thinking.starts_with('…'));
        assert!(out_thinking.ends_with("_recent_part"));
        assert!(!out_thinking.contains("old_part_"));
    }

    #[test]
    fn thinking_hidden_when_squeezed_out() {
        let tm = html();
        let text = "x".repeat(tm.effective_limit - 50);
        let (out_thinking, out_text) = tm.truncate_for_display(&"t".repeat(200), &text);
        assert_eq!(out_text, text);
        assert_eq!(out_thinking, "");
    }

    #[test]
    fn rendered_thinking_ends_with_input_suffix() {
        // Invariant: rendered thinking is empty or a suffix of the input
        // (modulo the ellipsis).
        let tm = html();
        let thinking = (0..5_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect::<String>();
        let text = "answer";
        let (out_thinking, _) = tm.truncate_for_display(&thinking, text);
        if !out_thinking.is_empty() {
            let without_ellipsis: String = out_thinking.chars().skip(1).collect();
            assert!(thinking.ends_with(&without_ellipsis));
        }
    }

    #[test]
    fn empty_inputs() {
        let tm = html();
        assert_eq!(tm.truncate_for_display("", ""), (String::new(), String::new()));
        let (thinking, text) = tm.truncate_for_display("think", "");
        assert_eq!(thinking, "think");
        assert_eq!(text, "");
    }

    #[test]
    fn md2_margin_is_stricter() {
        let md2 = TruncationManager::new(ParseMode::MarkdownV2);
        assert!(md2.effective_limit < html().effective_limit);
    }

    #[test]
    fn available_space_arithmetic() {
        let tm = html();
        assert_eq!(tm.available_for_thinking(100), tm.effective_limit - 100);
        assert_eq!(tm.available_for_thinking(tm.effective_limit - 50), 50);
        assert_eq!(tm.available_for_thinking(tm.effective_limit + 10), 0);
    }

    #[test]
    fn multibyte_thinking_truncates_on_char_boundaries() {
        let tm = html();
        let thinking = "💭".repeat(3_000); // 3000 chars, 12000 bytes
        let text = "x".repeat(2_000);
        let (out_thinking, _) = tm.truncate_for_display(&thinking, &text);
        // No panic and the result is valid UTF-8 by construction; length
        // in chars respects the budget.
        assert!(out_thinking.chars().count() <= tm.available_for_thinking(2_000));
    }
}
