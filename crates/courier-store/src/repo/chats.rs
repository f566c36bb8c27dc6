use rusqlite::{params, Connection, OptionalExtension};

use crate::models::{Chat, ChatKind};

use super::parse_enum;

pub fn upsert(conn: &Connection, chat: &Chat) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO chats (chat_id, kind, is_forum) VALUES (?1, ?2, ?3)
         ON CONFLICT(chat_id) DO UPDATE SET
            kind = excluded.kind,
            is_forum = excluded.is_forum",
        params![chat.chat_id, chat.kind.as_str(), chat.is_forum],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, chat_id: i64) -> rusqlite::Result<Option<Chat>> {
    conn.query_row(
        "SELECT chat_id, kind, is_forum FROM chats WHERE chat_id = ?1",
        [chat_id],
        |row| {
            Ok(Chat {
                chat_id: row.get(0)?,
                kind: parse_enum(&row.get::<_, String>(1)?, ChatKind::parse, "chat kind")?,
                is_forum: row.get(2)?,
            })
        },
    )
    .optional()
}
