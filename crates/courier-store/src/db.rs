//! Database handle and schema. The connection lives behind an async mutex:
//! the session is single-lane by construction, so any fan-out must resolve
//! its DB work sequentially before going parallel on I/O.

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use courier_core::{CourierError, Result};

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating parent directories as needed) and initialise schema.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::prepare(conn, path)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::prepare(conn, ":memory:")
    }

    fn prepare(conn: Connection, path: &str) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(db_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        init_schema(&conn).map_err(db_err)?;
        info!(path, "database ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a closure against the connection. All repository access goes
    /// through here; the mutex serialises every session use.
    pub async fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().await;
        f(&mut conn).map_err(db_err)
    }
}

pub(crate) fn db_err(e: rusqlite::Error) -> CourierError {
    CourierError::Database(e.to_string())
}

/// Create all tables. Safe to call on every startup (idempotent).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            user_id         INTEGER PRIMARY KEY,
            display_name    TEXT,
            language        TEXT NOT NULL DEFAULT 'en',
            balance_e4      INTEGER NOT NULL DEFAULT 0,
            model_id        TEXT NOT NULL,
            custom_prompt   TEXT,
            total_messages  INTEGER NOT NULL DEFAULT 0,
            total_tokens    INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chats (
            chat_id   INTEGER PRIMARY KEY,
            kind      TEXT NOT NULL,
            is_forum  INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS threads (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id             INTEGER NOT NULL REFERENCES chats(chat_id),
            user_id             INTEGER NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
            topic_id            INTEGER NOT NULL DEFAULT 0,
            title               TEXT,
            files_context       TEXT,
            needs_topic_naming  INTEGER NOT NULL DEFAULT 1,
            created_at          TEXT NOT NULL,
            UNIQUE(chat_id, user_id, topic_id)
        );
        CREATE INDEX IF NOT EXISTS idx_threads_user
            ON threads(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            chat_id             INTEGER NOT NULL,
            message_id          INTEGER NOT NULL,
            thread_id           INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            role                TEXT NOT NULL,
            text_content        TEXT NOT NULL,
            attachments         TEXT,
            input_tokens        INTEGER NOT NULL DEFAULT 0,
            output_tokens       INTEGER NOT NULL DEFAULT 0,
            cache_read_tokens   INTEGER NOT NULL DEFAULT 0,
            cache_write_tokens  INTEGER NOT NULL DEFAULT 0,
            thinking_tokens     INTEGER NOT NULL DEFAULT 0,
            thinking_json       TEXT,
            edit_count          INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT NOT NULL,
            PRIMARY KEY (chat_id, message_id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_thread
            ON messages(thread_id, created_at);

        CREATE TABLE IF NOT EXISTS user_files (
            file_id       TEXT PRIMARY KEY,
            chat_file_id  TEXT NOT NULL,
            thread_id     INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            chat_id       INTEGER,
            message_id    INTEGER,
            kind          TEXT NOT NULL,
            mime          TEXT NOT NULL,
            size          INTEGER NOT NULL DEFAULT 0,
            expires_at    TEXT NOT NULL,
            source        TEXT NOT NULL,
            metadata      TEXT,
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_user_files_thread
            ON user_files(thread_id, expires_at);
        CREATE INDEX IF NOT EXISTS idx_user_files_chat_file
            ON user_files(chat_file_id);

        CREATE TABLE IF NOT EXISTS tool_calls (
            id                  TEXT PRIMARY KEY,
            user_id             INTEGER NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
            chat_id             INTEGER NOT NULL,
            thread_id           INTEGER,
            message_id          INTEGER,
            tool_name           TEXT NOT NULL,
            model_id            TEXT NOT NULL,
            input_tokens        INTEGER NOT NULL DEFAULT 0,
            output_tokens       INTEGER NOT NULL DEFAULT 0,
            cache_read_tokens   INTEGER NOT NULL DEFAULT 0,
            cache_write_tokens  INTEGER NOT NULL DEFAULT 0,
            cost_e4             INTEGER NOT NULL DEFAULT 0,
            duration_ms         INTEGER NOT NULL DEFAULT 0,
            success             INTEGER NOT NULL DEFAULT 1,
            error               TEXT,
            created_at          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tool_calls_user
            ON tool_calls(user_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS balance_operations (
            id                  TEXT PRIMARY KEY,
            user_id             INTEGER NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
            kind                TEXT NOT NULL,
            amount_e4           INTEGER NOT NULL,
            balance_before_e4   INTEGER NOT NULL,
            balance_after_e4    INTEGER NOT NULL,
            related_payment     TEXT,
            related_message_id  INTEGER,
            admin_user_id       INTEGER,
            description         TEXT NOT NULL,
            created_at          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_balance_ops_user
            ON balance_operations(user_id, created_at);",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| init_schema(conn)).await.unwrap();
        db.with_conn(|conn| init_schema(conn)).await.unwrap();
    }

    #[tokio::test]
    async fn open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deep/courier.db");
        let db = Database::open(path.to_str().unwrap()).unwrap();
        db.with_conn(|conn| conn.execute("INSERT INTO chats (chat_id, kind) VALUES (1, 'private')", []))
            .await
            .unwrap();
    }
}
