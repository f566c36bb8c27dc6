use rusqlite::{params, Connection};

use courier_core::Usd;

use crate::models::{BalanceOpKind, BalanceOperation};

use super::{parse_enum, parse_ts};

/// Insert one ledger row. `ON CONFLICT DO NOTHING` keeps replays
/// idempotent; returns whether the row was actually inserted.
pub fn insert(conn: &Connection, op: &BalanceOperation) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "INSERT INTO balance_operations (id, user_id, kind, amount_e4, balance_before_e4,
                                         balance_after_e4, related_payment,
                                         related_message_id, admin_user_id, description,
                                         created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO NOTHING",
        params![
            op.id,
            op.user_id,
            op.kind.as_str(),
            op.amount.to_micros_e4(),
            op.balance_before.to_micros_e4(),
            op.balance_after.to_micros_e4(),
            op.related_payment,
            op.related_message_id,
            op.admin_user_id,
            op.description,
            op.created_at.to_rfc3339(),
        ],
    )?;
    Ok(n > 0)
}

fn row_to_op(row: &rusqlite::Row<'_>) -> rusqlite::Result<BalanceOperation> {
    Ok(BalanceOperation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: parse_enum(&row.get::<_, String>(2)?, BalanceOpKind::parse, "op kind")?,
        amount: Usd::from_micros_e4(row.get(3)?),
        balance_before: Usd::from_micros_e4(row.get(4)?),
        balance_after: Usd::from_micros_e4(row.get(5)?),
        related_payment: row.get(6)?,
        related_message_id: row.get(7)?,
        admin_user_id: row.get(8)?,
        description: row.get(9)?,
        created_at: parse_ts(&row.get::<_, String>(10)?)?,
    })
}

/// All operations for a user in insertion order, for ledger replay.
pub fn for_user_chronological(
    conn: &Connection,
    user_id: i64,
) -> rusqlite::Result<Vec<BalanceOperation>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, kind, amount_e4, balance_before_e4, balance_after_e4,
                related_payment, related_message_id, admin_user_id, description, created_at
         FROM balance_operations WHERE user_id = ?1
         ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt.query_map([user_id], row_to_op)?;
    rows.collect()
}

/// Replay the ledger: sum of signed amounts in insertion order.
pub fn replay_balance(conn: &Connection, user_id: i64) -> rusqlite::Result<Usd> {
    let ops = for_user_chronological(conn, user_id)?;
    Ok(ops.iter().map(|op| op.amount).sum())
}
