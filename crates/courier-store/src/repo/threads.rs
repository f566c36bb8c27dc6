use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::models::Thread;

use super::parse_ts;

fn row_to_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        user_id: row.get(2)?,
        topic_id: row.get(3)?,
        title: row.get(4)?,
        files_context: row.get(5)?,
        needs_topic_naming: row.get(6)?,
        created_at: parse_ts(&row.get::<_, String>(7)?)?,
    })
}

const THREAD_COLS: &str =
    "id, chat_id, user_id, topic_id, title, files_context, needs_topic_naming, created_at";

pub fn get_by_key(
    conn: &Connection,
    chat_id: i64,
    user_id: i64,
    topic_id: i64,
) -> rusqlite::Result<Option<Thread>> {
    conn.query_row(
        &format!(
            "SELECT {THREAD_COLS} FROM threads
             WHERE chat_id = ?1 AND user_id = ?2 AND topic_id = ?3"
        ),
        params![chat_id, user_id, topic_id],
        row_to_thread,
    )
    .optional()
}

pub fn get(conn: &Connection, thread_id: i64) -> rusqlite::Result<Option<Thread>> {
    conn.query_row(
        &format!("SELECT {THREAD_COLS} FROM threads WHERE id = ?1"),
        [thread_id],
        row_to_thread,
    )
    .optional()
}

/// Threads are created on first message in a (chat, user, topic) triple.
pub fn get_or_create(
    conn: &Connection,
    chat_id: i64,
    user_id: i64,
    topic_id: i64,
) -> rusqlite::Result<Thread> {
    if let Some(existing) = get_by_key(conn, chat_id, user_id, topic_id)? {
        return Ok(existing);
    }
    conn.execute(
        "INSERT INTO threads (chat_id, user_id, topic_id, needs_topic_naming, created_at)
         VALUES (?1, ?2, ?3, 1, ?4)
         ON CONFLICT(chat_id, user_id, topic_id) DO NOTHING",
        params![chat_id, user_id, topic_id, Utc::now().to_rfc3339()],
    )?;
    get_by_key(conn, chat_id, user_id, topic_id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

pub fn set_title(conn: &Connection, thread_id: i64, title: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE threads SET title = ?2, needs_topic_naming = 0 WHERE id = ?1",
        params![thread_id, title],
    )?;
    Ok(())
}

pub fn set_files_context(
    conn: &Connection,
    thread_id: i64,
    files_context: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE threads SET files_context = ?2 WHERE id = ?1",
        params![thread_id, files_context],
    )?;
    Ok(())
}
