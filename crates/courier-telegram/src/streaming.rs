//! Streaming display driver: one placeholder message per turn, edited in
//! place as deltas arrive.
//!
//! Edits are serialized (each send awaited) and throttled to one per
//! ~300 ms with delta coalescing. "Message is not modified" is a no-op;
//! a rejected parse mode falls back to plain text for that edit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{MessageId, ThreadId};
use teloxide::{ApiError, RequestError};
use tracing::{debug, warn};

use courier_agent::turn::TurnSink;
use courier_core::config::DISPLAY_EDIT_INTERVAL_MS;
use courier_core::metrics::Metrics;

use crate::display::{BlockKind, DisplayManager, ParseMode};
use crate::format::{render_final, render_plain, render_streaming};

pub struct StreamingDraft {
    bot: Bot,
    chat_id: ChatId,
    topic_id: Option<ThreadId>,
    parse_mode: ParseMode,
    metrics: Arc<Metrics>,
    display: DisplayManager,
    message_id: Option<MessageId>,
    last_render: String,
    last_edit: tokio::time::Instant,
}

impl StreamingDraft {
    pub fn new(
        bot: Bot,
        chat_id: ChatId,
        topic_id: Option<ThreadId>,
        parse_mode: ParseMode,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            bot,
            chat_id,
            topic_id,
            parse_mode,
            metrics,
            display: DisplayManager::new(),
            message_id: None,
            last_render: String::new(),
            // Allow the first edit immediately.
            last_edit: tokio::time::Instant::now()
                .checked_sub(Duration::from_millis(DISPLAY_EDIT_INTERVAL_MS))
                .unwrap_or_else(tokio::time::Instant::now),
        }
    }

    fn teloxide_mode(&self) -> teloxide::types::ParseMode {
        match self.parse_mode {
            ParseMode::MarkdownV2 => teloxide::types::ParseMode::MarkdownV2,
            ParseMode::Html => teloxide::types::ParseMode::Html,
        }
    }

    /// The message id of the placeholder, once sent.
    pub fn message_id(&self) -> Option<MessageId> {
        self.message_id
    }

    /// Send the placeholder message that all edits target.
    pub async fn begin(&mut self) -> courier_core::Result<()> {
        let mut req = self.bot.send_message(self.chat_id, "…");
        req.message_thread_id = self.topic_id;
        let sent = req
            .await
            .map_err(|e| courier_core::CourierError::Telegram(e.to_string()))?;
        self.message_id = Some(sent.id);
        Ok(())
    }

    /// True when a not-modified error should be swallowed.
    fn is_not_modified(err: &RequestError) -> bool {
        matches!(err, RequestError::Api(ApiError::MessageNotModified))
    }

    async fn push_edit(&mut self, rendered: String, plain_fallback: String) {
        let Some(message_id) = self.message_id else {
            return;
        };
        if rendered == self.last_render || rendered.is_empty() {
            return;
        }

        let result = self
            .bot
            .edit_message_text(self.chat_id, message_id, rendered.as_str())
            .parse_mode(self.teloxide_mode())
            .await;

        match result {
            Ok(_) => {
                self.metrics
                    .display_edits_sent
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.last_render = rendered;
            }
            Err(e) if Self::is_not_modified(&e) => {
                self.last_render = rendered;
            }
            Err(e) => {
                debug!(error = %e, "formatted edit rejected, falling back to plain");
                match self
                    .bot
                    .edit_message_text(self.chat_id, message_id, plain_fallback.as_str())
                    .await
                {
                    Ok(_) => {
                        self.metrics
                            .display_edits_sent
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        self.last_render = rendered;
                    }
                    Err(e2) if Self::is_not_modified(&e2) => {
                        self.last_render = rendered;
                    }
                    Err(e2) => warn!(error = %e2, "plain-text edit failed"),
                }
            }
        }
        self.last_edit = tokio::time::Instant::now();
    }

    /// Render and push an edit, unless inside the throttle window.
    /// Coalesced deltas ride the next allowed edit.
    pub async fn maybe_update(&mut self, force: bool) {
        if !force
            && self.last_edit.elapsed() < Duration::from_millis(DISPLAY_EDIT_INTERVAL_MS)
        {
            return;
        }
        if self.display.is_empty() {
            return;
        }
        let rendered = render_streaming(&self.display, self.parse_mode);
        let plain = render_plain(&self.display, true);
        self.push_edit(rendered, plain).await;
    }

    /// Final render: text only, markers stripped, forced edit.
    pub async fn finalize(&mut self) {
        let rendered = render_final(&self.display, self.parse_mode);
        if rendered.is_empty() {
            // Nothing visible survived (e.g. cancellation before any text):
            // leave the placeholder's last streaming state as-is.
            return;
        }
        let plain = render_plain(&self.display, false);
        self.push_edit(rendered, plain).await;
    }

    /// Replace the display with an error message and push it.
    pub async fn fail(&mut self, user_message: &str) {
        self.display = DisplayManager::new();
        self.display.append(BlockKind::Text, user_message);
        let rendered = render_final(&self.display, self.parse_mode);
        let plain = render_plain(&self.display, false);
        self.push_edit(rendered, plain).await;
    }

    pub fn visible_text(&self) -> String {
        self.display.text()
    }
}

#[async_trait]
impl TurnSink for StreamingDraft {
    async fn text_delta(&mut self, text: &str) {
        self.display.append(BlockKind::Text, text);
        self.maybe_update(false).await;
    }

    async fn thinking_delta(&mut self, text: &str) {
        self.display.append(BlockKind::Thinking, text);
        self.maybe_update(false).await;
    }

    async fn tool_started(&mut self, marker: &str) {
        // Markers coalesce with surrounding deltas; forcing an edit here
        // would break the one-edit-per-300ms bound on tool-heavy turns.
        self.display
            .append(BlockKind::Thinking, &format!("\n{marker}\n"));
        self.maybe_update(false).await;
    }

    async fn tool_finished(&mut self, name: &str, success: bool) {
        let status = if success { "✅" } else { "❌" };
        self.display
            .append(BlockKind::Thinking, &format!("\n[{status} {name}]\n"));
        self.maybe_update(false).await;
    }
}
