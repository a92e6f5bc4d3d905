//! SQLite-backed [`DiskBackend`].
//!
//! One row per document: the index per scope, one row per part, one row
//! per flat document and one per raw reply. Payloads are JSON text.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{DiskBackend, ThreadLocation};
use crate::db::{Database, DocumentTable, PartRow, unix_now};
use crate::error::StoreResult;
use crate::message::{Message, messages_from_value};

/// Row counts for operator tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub scopes: u64,
    pub parts: u64,
    pub part_bytes: u64,
    pub kv_documents: u64,
    pub raw_replies: u64,
}

/// Disk backend over a migrated [`Database`].
#[derive(Clone)]
pub struct SqliteBackend {
    db: Database,
}

impl SqliteBackend {
    /// Wrap a database whose schema is already up to date.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Open (or create) `path` and run schema migrations.
    pub async fn open(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        Ok(Self::new(Database::open_and_migrate(path).await?))
    }

    pub async fn open_in_memory() -> StoreResult<Self> {
        let db = Database::open_in_memory()?;
        db.run_migrations().await?;
        Ok(Self::new(db))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Scopes that have an index document.
    pub async fn scopes(&self) -> StoreResult<Vec<String>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare("SELECT scope FROM chat_index ORDER BY scope")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn stats(&self) -> StoreResult<BackendStats> {
        self.db
            .execute(|conn| {
                let count = |sql: &str| -> rusqlite::Result<u64> {
                    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                        .map(|n| n.max(0) as u64)
                };
                Ok(BackendStats {
                    scopes: count("SELECT count(*) FROM chat_index")?,
                    parts: count("SELECT count(*) FROM chat_parts")?,
                    part_bytes: count("SELECT COALESCE(SUM(length(data)), 0) FROM chat_parts")?,
                    kv_documents: count("SELECT count(*) FROM kv_store")?,
                    raw_replies: count("SELECT count(*) FROM raw_replies")?,
                })
            })
            .await
    }
}

fn parse_json(text: Option<String>) -> StoreResult<Option<Value>> {
    text.map(|t| serde_json::from_str(&t))
        .transpose()
        .map_err(Into::into)
}

#[async_trait]
impl DiskBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    #[instrument(skip(self))]
    async fn read_index(&self, scope: &str) -> StoreResult<Option<Value>> {
        parse_json(self.db.load_document(DocumentTable::Index, scope).await?)
    }

    #[instrument(skip(self, data))]
    async fn write_index(&self, scope: &str, data: &Value) -> StoreResult<()> {
        let text = serde_json::to_string(data)?;
        self.db.upsert_document(DocumentTable::Index, scope, text).await?;
        debug!("index written");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn read_part(
        &self,
        location: &ThreadLocation,
        part_id: &str,
    ) -> StoreResult<Option<Vec<Message>>> {
        let loc = location.clone();
        let part_id = part_id.to_string();
        let text = self
            .db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT data FROM chat_parts \
                         WHERE scope = ?1 AND session_dir = ?2 AND thread_dir = ?3 AND part_id = ?4",
                        rusqlite::params![loc.scope, loc.session_dir, loc.thread_dir, part_id],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?)
            })
            .await?;
        Ok(parse_json(text)?.map(messages_from_value))
    }

    #[instrument(skip(self, messages), fields(count = messages.len()))]
    async fn write_part(
        &self,
        location: &ThreadLocation,
        part_id: &str,
        messages: &[Message],
    ) -> StoreResult<()> {
        let row = PartRow {
            part_id: part_id.to_string(),
            data: serde_json::to_string(messages)?,
        };
        self.db
            .upsert_parts(&location.scope, &location.session_dir, &location.thread_dir, vec![row])
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_part(&self, location: &ThreadLocation, part_id: &str) -> StoreResult<()> {
        let loc = location.clone();
        let part_id = part_id.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "DELETE FROM chat_parts \
                     WHERE scope = ?1 AND session_dir = ?2 AND thread_dir = ?3 AND part_id = ?4",
                    rusqlite::params![loc.scope, loc.session_dir, loc.thread_dir, part_id],
                )?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    async fn delete_thread(&self, location: &ThreadLocation) -> StoreResult<()> {
        let removed = self
            .db
            .delete_parts(&location.scope, &location.session_dir, Some(location.thread_dir.as_str()))
            .await?;
        debug!(removed, "thread parts deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_session(&self, scope: &str, session_dir: &str) -> StoreResult<()> {
        let removed = self.db.delete_parts(scope, session_dir, None).await?;
        debug!(removed, "session parts deleted");
        Ok(())
    }

    #[instrument(skip(self, data))]
    async fn save_kv(&self, name: &str, data: &Value) -> StoreResult<()> {
        let text = serde_json::to_string(data)?;
        self.db.upsert_document(DocumentTable::Kv, name, text).await
    }

    #[instrument(skip(self))]
    async fn load_kv(&self, name: &str) -> StoreResult<Option<Value>> {
        parse_json(self.db.load_document(DocumentTable::Kv, name).await?)
    }

    #[instrument(skip(self, text), fields(len = text.len()))]
    async fn save_raw_reply(&self, session_id: &str, message_id: &str, text: &str) -> StoreResult<()> {
        let session_id = session_id.to_string();
        let message_id = message_id.to_string();
        let text = text.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO raw_replies (session_id, message_id, text, updated_at) VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(session_id, message_id) DO UPDATE SET text = excluded.text, updated_at = excluded.updated_at",
                    rusqlite::params![session_id, message_id, text, unix_now()],
                )?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    async fn load_raw_reply(&self, session_id: &str, message_id: &str) -> StoreResult<Option<String>> {
        let session_id = session_id.to_string();
        let message_id = message_id.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT text FROM raw_replies WHERE session_id = ?1 AND message_id = ?2",
                        rusqlite::params![session_id, message_id],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn delete_raw_reply(&self, session_id: &str, message_id: &str) -> StoreResult<()> {
        let session_id = session_id.to_string();
        let message_id = message_id.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "DELETE FROM raw_replies WHERE session_id = ?1 AND message_id = ?2",
                    rusqlite::params![session_id, message_id],
                )?;
                Ok(())
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn backend() -> SqliteBackend {
        SqliteBackend::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn index_upsert_replaces_document() {
        let b = backend().await;
        assert!(b.read_index("").await.unwrap().is_none());
        b.write_index("", &json!({"version": 1, "sessions": {}})).await.unwrap();
        b.write_index("", &json!({"version": 1, "sessions": {"a": {}}})).await.unwrap();
        let doc = b.read_index("").await.unwrap().unwrap();
        assert!(doc["sessions"].get("a").is_some());
        assert_eq!(b.scopes().await.unwrap(), vec![String::new()]);
    }

    #[tokio::test]
    async fn parts_are_isolated_by_scope_and_thread() {
        let b = backend().await;
        let work = ThreadLocation::new("work", "s_1", "t_1");
        let home = ThreadLocation::new("home", "s_1", "t_1");
        let msgs = vec![Message::user("hi").with_id("m1").with_timestamp(1)];

        b.write_part(&work, "part_0001", &msgs).await.unwrap();
        assert_eq!(b.read_part(&work, "part_0001").await.unwrap(), Some(msgs));
        assert_eq!(b.read_part(&home, "part_0001").await.unwrap(), None);

        b.delete_thread(&work).await.unwrap();
        b.delete_thread(&work).await.unwrap();
        assert_eq!(b.read_part(&work, "part_0001").await.unwrap(), None);
    }

    #[tokio::test]
    async fn kv_and_raw_replies_round_trip() {
        let b = backend().await;
        b.save_kv("chat_store_v1", &json!({"sessions": {}})).await.unwrap();
        assert_eq!(
            b.load_kv("chat_store_v1").await.unwrap(),
            Some(json!({"sessions": {}}))
        );

        b.save_raw_reply("s", "m", "full output").await.unwrap();
        assert_eq!(
            b.load_raw_reply("s", "m").await.unwrap().as_deref(),
            Some("full output")
        );
        b.delete_raw_reply("s", "m").await.unwrap();
        assert!(b.load_raw_reply("s", "m").await.unwrap().is_none());

        let stats = b.stats().await.unwrap();
        assert_eq!(stats.kv_documents, 1);
        assert_eq!(stats.raw_replies, 0);
    }
}
