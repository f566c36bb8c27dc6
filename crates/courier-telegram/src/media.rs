//! Media ingestion pipeline:
//! resolve → download → detect MIME → upload to provider → cache bytes →
//! persist metadata.
//!
//! File metadata resolution against the database is sequential (the
//! session is single-lane); only transport downloads fan out in parallel.

use std::sync::Arc;

use chrono::Utc;
use teloxide::net::Download;
use teloxide::prelude::*;
use tracing::{debug, info, warn};

use courier_agent::files_api::FilesApiClient;
use courier_cache::{file_bytes, keys, CacheClient};
use courier_core::{mime, CourierError, Result};
use courier_store::models::{FileKind, FileSource, UserFile};
use courier_store::repo::files;
use courier_store::Database;

/// Upper bound on a single inbound file (Telegram bot API cap).
pub const MAX_FILE_BYTES: u64 = 20 * 1024 * 1024;

/// One media item extracted from an inbound message.
#[derive(Debug, Clone)]
pub struct MediaItem {
    pub chat_file_id: String,
    pub filename: Option<String>,
    pub declared_mime: Option<String>,
}

/// Download a Telegram file by its transport id.
pub async fn download_from_telegram(bot: &Bot, chat_file_id: &str) -> Result<Vec<u8>> {
    let file = bot
        .get_file(chat_file_id)
        .await
        .map_err(|e| CourierError::Telegram(format!("get_file: {e}")))?;

    if u64::from(file.size) > MAX_FILE_BYTES {
        return Err(CourierError::Telegram(format!(
            "file {} exceeds {} bytes",
            chat_file_id, MAX_FILE_BYTES
        )));
    }

    let mut buf: Vec<u8> = Vec::with_capacity(file.size as usize);
    bot.download_file(&file.path, &mut buf)
        .await
        .map_err(|e| CourierError::Telegram(format!("download_file: {e}")))?;
    Ok(buf)
}

/// Run the full pipeline for one inbound media item. Returns the persisted
/// file record; the caller references it by `file_id` in message content.
#[allow(clippy::too_many_arguments)]
pub async fn ingest_media(
    bot: &Bot,
    cache: &CacheClient,
    db: &Database,
    files_api: &FilesApiClient,
    item: &MediaItem,
    thread_id: i64,
    chat_id: i64,
    message_id: i64,
) -> Result<UserFile> {
    // An identical transport file already ingested and still live short-
    // circuits the whole pipeline.
    let existing = {
        let chat_file_id = item.chat_file_id.clone();
        db.with_conn(move |conn| files::get_by_chat_file_id(conn, &chat_file_id))
            .await?
    };
    if let Some(file) = existing {
        if file.is_live(Utc::now()) {
            debug!(file_id = %file.file_id, "media already ingested");
            return Ok(file);
        }
    }

    let bytes = download_from_telegram(bot, &item.chat_file_id).await?;
    let detected = mime::detect(
        Some(&bytes),
        item.filename.as_deref(),
        item.declared_mime.as_deref(),
    );
    let filename = item
        .filename
        .clone()
        .unwrap_or_else(|| format!("upload-{}", item.chat_file_id));

    let uploaded = files_api.upload(bytes.clone(), &filename, &detected).await?;

    // Small payloads stay warm for tools; oversized ones always re-fetch.
    file_bytes::store_file_bytes(cache, &item.chat_file_id, &bytes).await;

    let record = UserFile {
        file_id: uploaded.file_id,
        chat_file_id: item.chat_file_id.clone(),
        thread_id,
        chat_id: Some(chat_id),
        message_id: Some(message_id),
        kind: FileKind::from_mime(&detected),
        mime: detected,
        size: uploaded.size,
        expires_at: uploaded.expires_at,
        source: FileSource::User,
        metadata: serde_json::json!({"filename": filename}),
        created_at: Utc::now(),
    };

    // Metadata persists synchronously: the very next turn may reference it.
    {
        let record = record.clone();
        db.with_conn(move |conn| files::upsert(conn, &record)).await?;
    }
    // The thread's files listing changed.
    cache.delete(&keys::files_key(thread_id)).await;

    info!(
        file_id = %record.file_id,
        kind = record.kind.as_str(),
        mime = %record.mime,
        size = record.size,
        "media ingested"
    );
    Ok(record)
}

/// Fetch several files by provider id: metadata resolves sequentially in
/// one session pass, then the byte downloads run in parallel (cache slab
/// first, provider Files API second).
pub async fn download_many_by_provider_id(
    cache: &Arc<CacheClient>,
    db: &Database,
    files_api: &Arc<FilesApiClient>,
    file_ids: &[String],
) -> Vec<(UserFile, Result<Vec<u8>>)> {
    // Sequential metadata resolution — one ordered pass over the session.
    let ids = file_ids.to_vec();
    let records = db
        .with_conn(move |conn| {
            let mut out = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(record) = files::get(conn, id)? {
                    out.push(record);
                } else {
                    warn!(file_id = %id, "file metadata missing, skipping");
                }
            }
            Ok(out)
        })
        .await
        .unwrap_or_default();

    // Parallel transport downloads.
    let downloads = records.iter().map(|record| {
        let cache = Arc::clone(cache);
        let files_api = Arc::clone(files_api);
        let chat_file_id = record.chat_file_id.clone();
        let file_id = record.file_id.clone();
        async move {
            if let Some(bytes) = file_bytes::get_file_bytes(&cache, &chat_file_id).await {
                return Ok(bytes);
            }
            let bytes = files_api.download(&file_id).await?;
            file_bytes::store_file_bytes(&cache, &chat_file_id, &bytes).await;
            Ok(bytes)
        }
    });
    let bodies = futures_util::future::join_all(downloads).await;

    records.into_iter().zip(bodies).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_item_defaults() {
        let item = MediaItem {
            chat_file_id: "AgACAg".into(),
            filename: None,
            declared_mime: Some("image/jpg".into()),
        };
        // Normalization happens inside mime::detect at ingest time.
        assert_eq!(mime::detect(None, None, item.declared_mime.as_deref()), "image/jpeg");
    }
}
