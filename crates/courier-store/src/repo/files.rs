use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::models::{FileKind, FileSource, UserFile};

use super::{parse_enum, parse_ts};

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserFile> {
    let metadata: Option<String> = row.get(10)?;
    Ok(UserFile {
        file_id: row.get(0)?,
        chat_file_id: row.get(1)?,
        thread_id: row.get(2)?,
        chat_id: row.get(3)?,
        message_id: row.get(4)?,
        kind: parse_enum(&row.get::<_, String>(5)?, FileKind::parse, "file kind")?,
        mime: row.get(6)?,
        size: row.get(7)?,
        expires_at: parse_ts(&row.get::<_, String>(8)?)?,
        source: parse_enum(&row.get::<_, String>(9)?, FileSource::parse, "file source")?,
        metadata: metadata
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null),
        created_at: parse_ts(&row.get::<_, String>(11)?)?,
    })
}

const FILE_COLS: &str = "file_id, chat_file_id, thread_id, chat_id, message_id, kind, mime,
    size, expires_at, source, metadata, created_at";

pub fn upsert(conn: &Connection, file: &UserFile) -> rusqlite::Result<()> {
    let metadata = serde_json::to_string(&file.metadata).unwrap_or_else(|_| "null".into());
    conn.execute(
        "INSERT INTO user_files (file_id, chat_file_id, thread_id, chat_id, message_id,
                                 kind, mime, size, expires_at, source, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(file_id) DO UPDATE SET
            chat_file_id = excluded.chat_file_id,
            message_id = excluded.message_id,
            expires_at = excluded.expires_at,
            metadata = excluded.metadata",
        params![
            file.file_id,
            file.chat_file_id,
            file.thread_id,
            file.chat_id,
            file.message_id,
            file.kind.as_str(),
            file.mime,
            file.size,
            file.expires_at.to_rfc3339(),
            file.source.as_str(),
            metadata,
            file.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, file_id: &str) -> rusqlite::Result<Option<UserFile>> {
    conn.query_row(
        &format!("SELECT {FILE_COLS} FROM user_files WHERE file_id = ?1"),
        [file_id],
        row_to_file,
    )
    .optional()
}

pub fn get_by_chat_file_id(
    conn: &Connection,
    chat_file_id: &str,
) -> rusqlite::Result<Option<UserFile>> {
    conn.query_row(
        &format!(
            "SELECT {FILE_COLS} FROM user_files WHERE chat_file_id = ?1
             ORDER BY created_at DESC LIMIT 1"
        ),
        [chat_file_id],
        row_to_file,
    )
    .optional()
}

/// Files still live (not yet expired from the provider Files API).
pub fn live_for_thread(
    conn: &Connection,
    thread_id: i64,
    now: DateTime<Utc>,
) -> rusqlite::Result<Vec<UserFile>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FILE_COLS} FROM user_files
         WHERE thread_id = ?1 AND expires_at > ?2
         ORDER BY created_at ASC"
    ))?;
    let rows = stmt.query_map(params![thread_id, now.to_rfc3339()], row_to_file)?;
    rows.collect()
}

pub fn delete_expired(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM user_files WHERE expires_at <= ?1",
        [now.to_rfc3339()],
    )
}
