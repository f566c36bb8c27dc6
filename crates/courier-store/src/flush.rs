//! Application of write-behind batches to the database.
//!
//! One popped batch is applied inside a single transaction, grouped by
//! kind. A failed transaction sends the whole batch to the dead-letter
//! list; the DLQ replay task feeds fresh entries back later. Appliers are
//! idempotent upserts, so at-least-once delivery is safe.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use courier_cache::{QueuedWrite, WriteKind, WriteQueue};
use courier_core::Result;

use crate::db::Database;
use crate::models::{BalanceOperation, StoredMessage, ToolCallRecord, UserFile};
use crate::repo::{balance_ops, files, messages, tool_calls, users};

/// How often the background flusher drains the queue.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
/// How often the dead-letter list is scanned for replay.
pub const DLQ_REPLAY_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Deserialize)]
struct UserStatsDelta {
    user_id: i64,
    #[serde(default)]
    messages_delta: i64,
    #[serde(default)]
    tokens_delta: i64,
}

fn apply_one(conn: &Connection, write: &QueuedWrite) -> rusqlite::Result<bool> {
    match write.kind {
        WriteKind::Message => match serde_json::from_value::<StoredMessage>(write.data.clone()) {
            Ok(msg) => {
                messages::upsert(conn, &msg)?;
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "skipping malformed message write");
                Ok(false)
            }
        },
        WriteKind::ToolCall => match serde_json::from_value::<ToolCallRecord>(write.data.clone()) {
            Ok(call) => {
                tool_calls::upsert(conn, &call)?;
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "skipping malformed tool-call write");
                Ok(false)
            }
        },
        WriteKind::File => match serde_json::from_value::<UserFile>(write.data.clone()) {
            Ok(file) => {
                files::upsert(conn, &file)?;
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "skipping malformed file write");
                Ok(false)
            }
        },
        WriteKind::BalanceOp => {
            match serde_json::from_value::<BalanceOperation>(write.data.clone()) {
                Ok(op) => {
                    // Only move the balance when the row is new; replays of
                    // an already-applied op must not double-apply.
                    if balance_ops::insert(conn, &op)? {
                        users::set_balance(conn, op.user_id, op.balance_after)?;
                    }
                    Ok(true)
                }
                Err(e) => {
                    warn!(error = %e, "skipping malformed balance-op write");
                    Ok(false)
                }
            }
        }
        WriteKind::UserStats => {
            match serde_json::from_value::<UserStatsDelta>(write.data.clone()) {
                Ok(delta) => {
                    users::add_stats(conn, delta.user_id, delta.messages_delta, delta.tokens_delta)?;
                    Ok(true)
                }
                Err(e) => {
                    warn!(error = %e, "skipping malformed user-stats write");
                    Ok(false)
                }
            }
        }
    }
}

/// Apply one batch in a single transaction, grouped by kind so related
/// rows land together. Returns the number of applied entries.
pub async fn apply_batch(db: &Database, writes: Vec<QueuedWrite>) -> Result<usize> {
    if writes.is_empty() {
        return Ok(0);
    }

    db.with_conn(move |conn| {
        let tx = conn.transaction()?;
        let mut applied = 0usize;

        // Fixed kind order: messages first so tool calls and files can
        // reference them, ledger rows last.
        const ORDER: [WriteKind; 5] = [
            WriteKind::Message,
            WriteKind::File,
            WriteKind::ToolCall,
            WriteKind::BalanceOp,
            WriteKind::UserStats,
        ];
        for kind in ORDER {
            for write in writes.iter().filter(|w| w.kind == kind) {
                if apply_one(&tx, write)? {
                    applied += 1;
                }
            }
        }

        tx.commit()?;
        Ok(applied)
    })
    .await
}

#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub applied: usize,
    pub dead_lettered: usize,
}

/// Pop one batch and apply it; on failure, dead-letter the entire batch.
pub async fn flush_once(db: &Database, queue: &WriteQueue) -> FlushOutcome {
    let batch = queue.pop_batch().await;
    if batch.is_empty() {
        return FlushOutcome::default();
    }
    let count = batch.len();

    match apply_batch(db, batch.clone()).await {
        Ok(applied) => {
            debug!(applied, popped = count, "write-behind batch applied");
            FlushOutcome {
                applied,
                dead_lettered: 0,
            }
        }
        Err(e) => {
            error!(error = %e, count, "write-behind batch failed, dead-lettering");
            for write in batch {
                queue.push_dead_letter(write).await;
            }
            FlushOutcome {
                applied: 0,
                dead_lettered: count,
            }
        }
    }
}

/// Background driver: drain the queue every `FLUSH_INTERVAL`.
pub fn spawn_flush_task(db: Arc<Database>, queue: Arc<WriteQueue>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(period_secs = FLUSH_INTERVAL.as_secs(), "write-behind flusher started");
        let mut tick = tokio::time::interval(FLUSH_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            flush_once(&db, &queue).await;
        }
    })
}

/// Background driver: replay fresh dead letters every `DLQ_REPLAY_INTERVAL`.
pub fn spawn_dlq_replay_task(queue: Arc<WriteQueue>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            period_secs = DLQ_REPLAY_INTERVAL.as_secs(),
            "dead-letter replay task started"
        );
        let mut tick = tokio::time::interval(DLQ_REPLAY_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            queue.replay_dlq().await;
        }
    })
}
