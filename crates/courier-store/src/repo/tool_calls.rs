use rusqlite::{params, Connection, OptionalExtension};

use courier_core::{TokenUsage, Usd};

use crate::models::ToolCallRecord;

use super::parse_ts;

pub fn upsert(conn: &Connection, call: &ToolCallRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO tool_calls (id, user_id, chat_id, thread_id, message_id, tool_name,
                                 model_id, input_tokens, output_tokens, cache_read_tokens,
                                 cache_write_tokens, cost_e4, duration_ms, success, error,
                                 created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT(id) DO NOTHING",
        params![
            call.id,
            call.user_id,
            call.chat_id,
            call.thread_id,
            call.message_id,
            call.tool_name,
            call.model_id,
            call.usage.input,
            call.usage.output,
            call.usage.cache_read,
            call.usage.cache_write,
            call.cost.to_micros_e4(),
            call.duration_ms,
            call.success,
            call.error,
            call.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolCallRecord> {
    Ok(ToolCallRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        chat_id: row.get(2)?,
        thread_id: row.get(3)?,
        message_id: row.get(4)?,
        tool_name: row.get(5)?,
        model_id: row.get(6)?,
        usage: TokenUsage {
            input: row.get(7)?,
            output: row.get(8)?,
            cache_read: row.get(9)?,
            cache_write: row.get(10)?,
            thinking: 0,
        },
        cost: Usd::from_micros_e4(row.get(11)?),
        duration_ms: row.get(12)?,
        success: row.get(13)?,
        error: row.get(14)?,
        created_at: parse_ts(&row.get::<_, String>(15)?)?,
    })
}

const CALL_COLS: &str = "id, user_id, chat_id, thread_id, message_id, tool_name, model_id,
    input_tokens, output_tokens, cache_read_tokens, cache_write_tokens, cost_e4,
    duration_ms, success, error, created_at";

pub fn get(conn: &Connection, id: &str) -> rusqlite::Result<Option<ToolCallRecord>> {
    conn.query_row(
        &format!("SELECT {CALL_COLS} FROM tool_calls WHERE id = ?1"),
        [id],
        row_to_call,
    )
    .optional()
}

pub fn for_user(
    conn: &Connection,
    user_id: i64,
    limit: usize,
) -> rusqlite::Result<Vec<ToolCallRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CALL_COLS} FROM tool_calls WHERE user_id = ?1
         ORDER BY created_at DESC LIMIT ?2"
    ))?;
    let rows = stmt.query_map(params![user_id, limit as i64], row_to_call)?;
    rows.collect()
}
