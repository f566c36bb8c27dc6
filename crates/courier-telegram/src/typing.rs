//! Chat action indicator — refreshes `sendChatAction` every 4 seconds.
//!
//! Telegram's action status expires after ~5 seconds. `stop()` aborts the
//! loop immediately; dropping the handle leaves a detached loop, so always
//! stop it.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{ChatAction, ThreadId};

pub struct TypingHandle(tokio::task::JoinHandle<()>);

impl TypingHandle {
    /// Spawn the indicator loop with the given action.
    pub fn start(bot: Bot, chat_id: ChatId, topic_id: Option<ThreadId>, action: ChatAction) -> Self {
        let handle = tokio::spawn(async move {
            loop {
                let mut req = bot.send_chat_action(chat_id, action);
                req.message_thread_id = topic_id;
                let _ = req.await;
                tokio::time::sleep(Duration::from_secs(4)).await;
            }
        });
        TypingHandle(handle)
    }

    /// Typing indicator for a text response.
    pub fn typing(bot: Bot, chat_id: ChatId, topic_id: Option<ThreadId>) -> Self {
        Self::start(bot, chat_id, topic_id, ChatAction::Typing)
    }

    pub fn stop(self) {
        self.0.abort();
    }
}
