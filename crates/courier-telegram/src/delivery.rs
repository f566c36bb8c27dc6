//! Telegram implementation of the tool-side file delivery sink: generated
//! images and documents go straight into the conversation via
//! `send_photo` / `send_document`.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{InputFile, MessageId, ThreadId};
use tracing::debug;

use courier_agent::tools::FileDelivery;
use courier_core::{CourierError, Result};

pub struct TelegramFileDelivery {
    bot: Bot,
}

impl TelegramFileDelivery {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn thread(topic_id: i64) -> Option<ThreadId> {
        (topic_id != 0).then(|| ThreadId(MessageId(topic_id as i32)))
    }
}

#[async_trait]
impl FileDelivery for TelegramFileDelivery {
    async fn deliver_photo(
        &self,
        chat_id: i64,
        topic_id: i64,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<i64> {
        let photo = InputFile::memory(bytes).file_name("image.png");
        let mut req = self.bot.send_photo(ChatId(chat_id), photo);
        req.message_thread_id = Self::thread(topic_id);
        if !caption.is_empty() {
            req.caption = Some(caption.to_string());
        }
        let sent = req
            .await
            .map_err(|e| CourierError::Telegram(format!("send_photo: {e}")))?;
        debug!(chat_id, message_id = sent.id.0, "generated photo delivered");
        Ok(i64::from(sent.id.0))
    }

    async fn deliver_document(
        &self,
        chat_id: i64,
        topic_id: i64,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<i64> {
        let doc = InputFile::memory(bytes).file_name(filename.to_string());
        let mut req = self.bot.send_document(ChatId(chat_id), doc);
        req.message_thread_id = Self::thread(topic_id);
        let sent = req
            .await
            .map_err(|e| CourierError::Telegram(format!("send_document: {e}")))?;
        debug!(chat_id, message_id = sent.id.0, "generated document delivered");
        Ok(i64::from(sent.id.0))
    }
}
