//! SQLite-backed journal. Rows keep the ordering and lookup keys as columns
//! and the full record as JSON, so the schema does not chase the model.

use anyhow::Result;
use chat_proto::{CallSession, Conversation, Message};
use chatcore::{Journal, Snapshot, SyncError};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::debug;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
  id TEXT PRIMARY KEY,
  conversation_id TEXT NOT NULL REFERENCES conversations(id),
  created_at INTEGER NOT NULL,
  body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_by_conversation ON messages(conversation_id, created_at, id);

CREATE TABLE IF NOT EXISTS calls (
  id TEXT PRIMARY KEY,
  conversation_id TEXT NOT NULL REFERENCES conversations(id),
  status TEXT NOT NULL,
  body TEXT NOT NULL
);
"#;

#[derive(Clone)]
pub struct SqliteJournal {
    pool: Pool<SqliteConnectionManager>,
}

fn storage<E: std::fmt::Display>(e: E) -> SyncError {
    SyncError::Storage(e.to_string())
}

impl SqliteJournal {
    /// Open (creating if needed) the journal database and run migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path)
            .with_init(|c| c.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;"));
        Self::with_pool(Pool::new(manager)?)
    }

    /// Private in-memory database. A single pooled connection, since every
    /// `:memory:` connection is its own database.
    pub fn memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys=ON;"));
        Self::with_pool(Pool::builder().max_size(1).build(manager)?)
    }

    fn with_pool(pool: Pool<SqliteConnectionManager>) -> Result<Self> {
        pool.get()?.execute_batch(SCHEMA)?;
        Ok(Self { pool })
    }

    /// Read back everything, messages in history order.
    pub fn load(&self) -> Result<Snapshot> {
        let conn = self.pool.get()?;
        Ok(Snapshot {
            conversations: load_bodies(&conn, "SELECT body FROM conversations ORDER BY created_at")?,
            messages: load_bodies(
                &conn,
                "SELECT body FROM messages ORDER BY conversation_id, created_at, id",
            )?,
            calls: load_bodies(&conn, "SELECT body FROM calls")?,
        })
    }
}

fn load_bodies<T: DeserializeOwned>(conn: &Connection, sql: &str) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for body in rows {
        out.push(serde_json::from_str(&body?)?);
    }
    Ok(out)
}

fn upsert_conversation(conn: &Connection, c: &Conversation) -> chatcore::Result<()> {
    let body = serde_json::to_string(c).map_err(storage)?;
    let kind = serde_json::to_value(c.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    conn.execute(
        "INSERT INTO conversations (id, kind, created_at, body) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET body = excluded.body",
        params![c.id.to_string(), kind, c.created_at, body],
    )
    .map_err(storage)?;
    Ok(())
}

impl Journal for SqliteJournal {
    fn save_conversation(&self, conversation: &Conversation) -> chatcore::Result<()> {
        let conn = self.pool.get().map_err(storage)?;
        upsert_conversation(&conn, conversation)
    }

    fn save_messages(
        &self,
        messages: &[Message],
        conversation: Option<&Conversation>,
    ) -> chatcore::Result<()> {
        let mut conn = self.pool.get().map_err(storage)?;
        let tx = conn.transaction().map_err(storage)?;
        if let Some(c) = conversation {
            upsert_conversation(&tx, c)?;
        }
        for m in messages {
            let body = serde_json::to_string(m).map_err(storage)?;
            tx.execute(
                "INSERT INTO messages (id, conversation_id, created_at, body) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET created_at = excluded.created_at, body = excluded.body",
                params![m.id.to_string(), m.conversation_id.to_string(), m.created_at, body],
            )
            .map_err(storage)?;
        }
        tx.commit().map_err(storage)?;
        debug!(count = messages.len(), "messages journaled");
        Ok(())
    }

    fn save_call(&self, call: &CallSession) -> chatcore::Result<()> {
        let conn = self.pool.get().map_err(storage)?;
        let body = serde_json::to_string(call).map_err(storage)?;
        let status = serde_json::to_value(call.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        conn.execute(
            "INSERT INTO calls (id, conversation_id, status, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, body = excluded.body",
            params![call.id.to_string(), call.conversation_id.to_string(), status, body],
        )
        .map_err(storage)?;
        Ok(())
    }
}
