use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use courier_core::Usd;

use crate::models::User;

use super::parse_ts;

pub fn upsert(conn: &Connection, user: &User) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO users (user_id, display_name, language, balance_e4, model_id,
                            custom_prompt, total_messages, total_tokens, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(user_id) DO UPDATE SET
            display_name = excluded.display_name,
            language = excluded.language,
            model_id = excluded.model_id,
            custom_prompt = excluded.custom_prompt,
            updated_at = excluded.updated_at",
        params![
            user.user_id,
            user.display_name,
            user.language,
            user.balance.to_micros_e4(),
            user.model_id,
            user.custom_prompt,
            user.total_messages,
            user.total_tokens,
            user.created_at.to_rfc3339(),
            user.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, user_id: i64) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        "SELECT user_id, display_name, language, balance_e4, model_id, custom_prompt,
                total_messages, total_tokens, created_at, updated_at
         FROM users WHERE user_id = ?1",
        [user_id],
        |row| {
            Ok(User {
                user_id: row.get(0)?,
                display_name: row.get(1)?,
                language: row.get(2)?,
                balance: Usd::from_micros_e4(row.get(3)?),
                model_id: row.get(4)?,
                custom_prompt: row.get(5)?,
                total_messages: row.get(6)?,
                total_tokens: row.get(7)?,
                created_at: parse_ts(&row.get::<_, String>(8)?)?,
                updated_at: parse_ts(&row.get::<_, String>(9)?)?,
            })
        },
    )
    .optional()
}

pub fn set_balance(conn: &Connection, user_id: i64, balance: Usd) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE users SET balance_e4 = ?2, updated_at = ?3 WHERE user_id = ?1",
        params![user_id, balance.to_micros_e4(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn set_model(conn: &Connection, user_id: i64, model_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE users SET model_id = ?2, updated_at = ?3 WHERE user_id = ?1",
        params![user_id, model_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn set_custom_prompt(
    conn: &Connection,
    user_id: i64,
    prompt: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE users SET custom_prompt = ?2, updated_at = ?3 WHERE user_id = ?1",
        params![user_id, prompt, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn add_stats(
    conn: &Connection,
    user_id: i64,
    messages_delta: i64,
    tokens_delta: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE users SET total_messages = total_messages + ?2,
                          total_tokens = total_tokens + ?3,
                          updated_at = ?4
         WHERE user_id = ?1",
        params![user_id, messages_delta, tokens_delta, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}
