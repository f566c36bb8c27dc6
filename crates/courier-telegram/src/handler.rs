//! Telegram update handler registered in the teloxide Dispatcher.
//!
//! Runs for every incoming `Message`: filters bots, intercepts commands,
//! resolves chat/user/thread rows, registers media with the upload tracker,
//! and feeds the per-thread message queue. Heavy work (media ingestion,
//! batch processing) never blocks the handler.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::ChatAction;
use tracing::{info, warn};

use courier_cache::keys;
use courier_store::models::{Chat, ChatKind};
use courier_store::repo::{chats, messages as messages_repo, threads};

use crate::media::{ingest_media, MediaItem};
use crate::process::AppContext;
use crate::queue::{InboundMessage, MessageQueueManager};
use crate::typing::TypingHandle;

/// Main message handler.
pub async fn handle_message(
    bot: Bot,
    msg: Message,
    ctx: Arc<AppContext>,
    queue: Arc<MessageQueueManager>,
) -> ResponseResult<()> {
    // Ignore other bots and anonymous channel posts.
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    if from.is_bot {
        return Ok(());
    }

    let chat_id = msg.chat.id.0;
    let user_id = from.id.0 as i64;
    let topic_id = msg.thread_id.map(|t| i64::from(t.0 .0)).unwrap_or(0);
    let text = msg.text().or(msg.caption()).unwrap_or("").to_string();

    // Command interception.
    if let Some(reply) = handle_command(&ctx, &text, chat_id, user_id, topic_id).await {
        let mut req = bot.send_message(msg.chat.id, reply);
        req.message_thread_id = msg.thread_id;
        let _ = req.await;
        return Ok(());
    }

    let media_items = extract_media_items(&msg);
    if text.is_empty() && media_items.is_empty() {
        return Ok(());
    }

    // Resolve durable rows before queueing: the queue is keyed by the
    // internal thread id.
    let thread = match resolve_thread(&ctx, &msg, chat_id, user_id, topic_id).await {
        Ok(thread_id) => thread_id,
        Err(e) => {
            warn!(chat_id, user_id, error = %e, "thread resolution failed");
            let _ = bot
                .send_message(msg.chat.id, e.user_message())
                .await;
            return Ok(());
        }
    };

    let inbound = InboundMessage {
        chat_id,
        message_id: i64::from(msg.id.0),
        user_id,
        topic_id,
        text,
        file_ids: Vec::new(),
        received_at: chrono::Utc::now(),
    };

    if media_items.is_empty() {
        queue.add_message(thread, inbound).await;
        return Ok(());
    }

    // Media path: register the upload, ingest in the background, and only
    // then enqueue the message (with its provider file ids). The batch
    // processor waits for the chat's uploads to drain, so a caption never
    // races ahead of its photo.
    ctx.uploads.start_upload(chat_id).await;
    let ctx2 = Arc::clone(&ctx);
    let queue2 = Arc::clone(&queue);
    tokio::spawn(async move {
        let typing = TypingHandle::start(
            ctx2.bot.clone(),
            ChatId(chat_id),
            msg.thread_id,
            ChatAction::UploadDocument,
        );

        let mut inbound = inbound;
        for item in &media_items {
            match ingest_media(
                &ctx2.bot,
                &ctx2.cache,
                &ctx2.db,
                &ctx2.files_api,
                item,
                thread,
                chat_id,
                inbound.message_id,
            )
            .await
            {
                Ok(record) => inbound.file_ids.push(record.file_id),
                Err(e) => {
                    warn!(chat_id, error = %e, "media ingestion failed");
                }
            }
        }

        typing.stop();
        queue2.add_message(thread, inbound).await;
        ctx2.uploads.finish_upload(chat_id).await;
    });

    Ok(())
}

/// Handle slash commands. Returns `Some(reply)` when the message was a
/// command and is fully handled.
async fn handle_command(
    ctx: &Arc<AppContext>,
    text: &str,
    chat_id: i64,
    user_id: i64,
    topic_id: i64,
) -> Option<String> {
    let command = text.trim().split_whitespace().next()?;
    // Strip the @botname suffix used in groups.
    let command = command.split('@').next().unwrap_or(command);

    match command {
        "/start" => {
            let user = ctx.get_or_create_user(user_id, None).await.ok()?;
            Some(format!(
                "👋 Hi! Send me a message, an image, or a PDF and I'll help.\n\
                 Balance: ${}.",
                user.balance
            ))
        }
        "/stop" => {
            if ctx.generations.cancel(chat_id, user_id, topic_id) {
                Some("⏹ Stopping…".to_string())
            } else {
                Some("Nothing is running.".to_string())
            }
        }
        "/forget" => {
            let thread_row = ctx
                .db
                .with_conn(move |conn| threads::get_by_key(conn, chat_id, user_id, topic_id))
                .await
                .ok()
                .flatten();
            let Some(thread_row) = thread_row else {
                return Some("Nothing to forget yet.".to_string());
            };
            let thread_id = thread_row.id;
            let deleted = ctx
                .db
                .with_conn(move |conn| messages_repo::delete_for_thread(conn, thread_id))
                .await
                .unwrap_or(0);
            ctx.cache.delete(&keys::messages_key(thread_id)).await;
            ctx.cache.delete(&keys::files_key(thread_id)).await;
            info!(thread_id, deleted, "conversation forgotten");
            Some(format!("🧹 Forgot {deleted} messages. Starting fresh."))
        }
        _ if command.starts_with('/') => Some("Unknown command.".to_string()),
        _ => None,
    }
}

/// Upsert chat/user rows and get-or-create the thread for this triple.
async fn resolve_thread(
    ctx: &Arc<AppContext>,
    msg: &Message,
    chat_id: i64,
    user_id: i64,
    topic_id: i64,
) -> courier_core::Result<i64> {
    let kind = if msg.chat.is_private() {
        ChatKind::Private
    } else if msg.chat.is_group() {
        ChatKind::Group
    } else if msg.chat.is_supergroup() {
        ChatKind::Supergroup
    } else {
        ChatKind::Channel
    };
    let chat = Chat {
        chat_id,
        kind,
        is_forum: topic_id != 0,
    };

    let display_name = msg.from.as_ref().map(|u| u.full_name());
    ctx.get_or_create_user(user_id, display_name).await?;

    ctx.db
        .with_conn(move |conn| {
            chats::upsert(conn, &chat)?;
            threads::get_or_create(conn, chat_id, user_id, topic_id).map(|t| t.id)
        })
        .await
}

/// Pull supported media out of a message; the highest-resolution photo
/// variant wins.
fn extract_media_items(msg: &Message) -> Vec<MediaItem> {
    let mut items = Vec::new();

    if let Some(photos) = msg.photo() {
        if let Some(photo) = photos.last() {
            items.push(MediaItem {
                chat_file_id: photo.file.id.clone(),
                filename: None,
                declared_mime: Some("image/jpeg".to_string()),
            });
        }
    }
    if let Some(doc) = msg.document() {
        items.push(MediaItem {
            chat_file_id: doc.file.id.clone(),
            filename: doc.file_name.clone(),
            declared_mime: doc.mime_type.as_ref().map(|m| m.to_string()),
        });
    }
    if let Some(audio) = msg.audio() {
        items.push(MediaItem {
            chat_file_id: audio.file.id.clone(),
            filename: audio.file_name.clone(),
            declared_mime: audio.mime_type.as_ref().map(|m| m.to_string()),
        });
    }
    if let Some(voice) = msg.voice() {
        items.push(MediaItem {
            chat_file_id: voice.file.id.clone(),
            filename: None,
            declared_mime: Some("audio/ogg".to_string()),
        });
    }
    if let Some(video) = msg.video() {
        items.push(MediaItem {
            chat_file_id: video.file.id.clone(),
            filename: video.file_name.clone(),
            declared_mime: video.mime_type.as_ref().map(|m| m.to_string()),
        });
    }

    items
}

/// Build and drive the long-polling dispatcher. Never returns.
pub async fn run_dispatcher(bot: Bot, ctx: Arc<AppContext>, queue: Arc<MessageQueueManager>) {
    info!("starting Telegram long-polling dispatcher");

    let handler = Update::filter_message().endpoint(handle_message);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![ctx, queue])
        .default_handler(|_upd| async {})
        .build()
        .dispatch()
        .await;
}
