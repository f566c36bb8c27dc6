use rusqlite::{params, Connection, OptionalExtension};

use courier_core::TokenUsage;

use crate::models::{Role, StoredMessage};

use super::{parse_enum, parse_ts};

/// Upsert keyed on the composite (chat_id, message_id) PK. Replays from the
/// write-behind queue update token counts and thinking in place; the edit
/// counter only moves through `record_edit`.
pub fn upsert(conn: &Connection, msg: &StoredMessage) -> rusqlite::Result<()> {
    let attachments = serde_json::to_string(&msg.attachments).unwrap_or_else(|_| "[]".into());
    let thinking = msg
        .thinking_json
        .as_ref()
        .map(|v| serde_json::to_string(v).unwrap_or_default());
    conn.execute(
        "INSERT INTO messages (chat_id, message_id, thread_id, role, text_content,
                               attachments, input_tokens, output_tokens,
                               cache_read_tokens, cache_write_tokens, thinking_tokens,
                               thinking_json, edit_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(chat_id, message_id) DO UPDATE SET
            text_content = excluded.text_content,
            attachments = excluded.attachments,
            input_tokens = excluded.input_tokens,
            output_tokens = excluded.output_tokens,
            cache_read_tokens = excluded.cache_read_tokens,
            cache_write_tokens = excluded.cache_write_tokens,
            thinking_tokens = excluded.thinking_tokens,
            thinking_json = excluded.thinking_json",
        params![
            msg.chat_id,
            msg.message_id,
            msg.thread_id,
            msg.role.as_str(),
            msg.text,
            attachments,
            msg.usage.input,
            msg.usage.output,
            msg.usage.cache_read,
            msg.usage.cache_write,
            msg.usage.thinking,
            thinking,
            msg.edit_count,
            msg.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let attachments: String = row.get(5)?;
    let thinking: Option<String> = row.get(11)?;
    Ok(StoredMessage {
        chat_id: row.get(0)?,
        message_id: row.get(1)?,
        thread_id: row.get(2)?,
        role: parse_enum(&row.get::<_, String>(3)?, Role::parse, "role")?,
        text: row.get(4)?,
        attachments: serde_json::from_str(&attachments).unwrap_or_default(),
        usage: TokenUsage {
            input: row.get(6)?,
            output: row.get(7)?,
            cache_read: row.get(8)?,
            cache_write: row.get(9)?,
            thinking: row.get(10)?,
        },
        thinking_json: thinking.and_then(|s| serde_json::from_str(&s).ok()),
        edit_count: row.get(12)?,
        created_at: parse_ts(&row.get::<_, String>(13)?)?,
    })
}

const MESSAGE_COLS: &str = "chat_id, message_id, thread_id, role, text_content, attachments,
    input_tokens, output_tokens, cache_read_tokens, cache_write_tokens, thinking_tokens,
    thinking_json, edit_count, created_at";

pub fn get(
    conn: &Connection,
    chat_id: i64,
    message_id: i64,
) -> rusqlite::Result<Option<StoredMessage>> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLS} FROM messages WHERE chat_id = ?1 AND message_id = ?2"),
        params![chat_id, message_id],
        row_to_message,
    )
    .optional()
}

/// Recent messages for a thread in chronological order.
pub fn recent_for_thread(
    conn: &Connection,
    thread_id: i64,
    limit: usize,
) -> rusqlite::Result<Vec<StoredMessage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLS} FROM (
             SELECT * FROM messages WHERE thread_id = ?1
             ORDER BY created_at DESC, message_id DESC LIMIT ?2
         ) ORDER BY created_at ASC, message_id ASC"
    ))?;
    let rows = stmt.query_map(params![thread_id, limit as i64], row_to_message)?;
    rows.collect()
}

pub fn record_edit(conn: &Connection, chat_id: i64, message_id: i64, text: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE messages SET text_content = ?3, edit_count = edit_count + 1
         WHERE chat_id = ?1 AND message_id = ?2",
        params![chat_id, message_id, text],
    )?;
    Ok(())
}

/// Drop a thread's history (the `/forget` command). Cascades to owned
/// files and tool calls via foreign keys.
pub fn delete_for_thread(conn: &Connection, thread_id: i64) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM messages WHERE thread_id = ?1", [thread_id])
}

pub fn count_for_thread(conn: &Connection, thread_id: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE thread_id = ?1",
        [thread_id],
        |row| row.get(0),
    )
}
