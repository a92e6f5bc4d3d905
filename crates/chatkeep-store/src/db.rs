//! SQLite connection handle for the on-disk chat backend.
//!
//! [`Database`] wraps a `rusqlite::Connection` behind an `Arc<Mutex<>>` and
//! runs every statement on `tokio::task::spawn_blocking`, so part reads and
//! index writes never stall the runtime that drives the debounce timers.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::schema;

/// Tables holding one JSON document per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentTable {
    /// Session index, keyed by scope.
    Index,
    /// Flat chat documents, keyed by name.
    Kv,
}

impl DocumentTable {
    fn upsert_sql(self) -> &'static str {
        match self {
            Self::Index => {
                "INSERT INTO chat_index (scope, data, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(scope) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at"
            }
            Self::Kv => {
                "INSERT INTO kv_store (name, data, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(name) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at"
            }
        }
    }

    fn select_sql(self) -> &'static str {
        match self {
            Self::Index => "SELECT data FROM chat_index WHERE scope = ?1",
            Self::Kv => "SELECT data FROM kv_store WHERE name = ?1",
        }
    }
}

/// One part of a thread batch written by [`Database::upsert_parts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRow {
    pub part_id: String,
    /// JSON array of messages.
    pub data: String,
}

/// Seconds since the epoch, stamped into `updated_at` columns.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Thread-safe handle to the chat database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database at `path` and apply pragmas.
    ///
    /// Blocks briefly on file I/O; prefer [`Database::open_and_migrate`]
    /// from async code.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening chat database");

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory chat database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the database file and bring its schema up to date.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all pending schema migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute(schema::run_all).await
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// ```ignore
    /// let parts: i64 = db.execute(|conn| {
    ///     Ok(conn.query_row("SELECT count(*) FROM chat_parts", [], |row| row.get(0))?)
    /// }).await?;
    /// ```
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    /// Like [`Database::execute`] but hands out `&mut Connection` so the
    /// closure can open a transaction.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }

    // ── chat rows ────────────────────────────────────────────────────

    /// Insert or replace the document stored under `key`.
    pub async fn upsert_document(&self, table: DocumentTable, key: &str, data: String) -> StoreResult<()> {
        let key = key.to_string();
        self.execute(move |conn| {
            conn.execute(table.upsert_sql(), params![key, data, unix_now()])?;
            Ok(())
        })
        .await
    }

    pub async fn load_document(&self, table: DocumentTable, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        self.execute(move |conn| {
            Ok(conn
                .query_row(table.select_sql(), params![key], |row| row.get::<_, String>(0))
                .optional()?)
        })
        .await
    }

    /// Write a batch of parts of one thread in a single transaction. Either
    /// every row lands or none does.
    pub async fn upsert_parts(
        &self,
        scope: &str,
        session_dir: &str,
        thread_dir: &str,
        rows: Vec<PartRow>,
    ) -> StoreResult<usize> {
        let (scope, session_dir, thread_dir) =
            (scope.to_string(), session_dir.to_string(), thread_dir.to_string());
        self.execute_mut(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO chat_parts (scope, session_dir, thread_dir, part_id, data, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(scope, session_dir, thread_dir, part_id) \
                     DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
                )?;
                let now = unix_now();
                for row in &rows {
                    stmt.execute(params![scope, session_dir, thread_dir, row.part_id, row.data, now])?;
                }
            }
            tx.commit()?;
            Ok(rows.len())
        })
        .await
    }

    /// Delete the parts of a thread, or of every thread of the session when
    /// `thread_dir` is `None`. Returns the number of rows removed.
    pub async fn delete_parts(
        &self,
        scope: &str,
        session_dir: &str,
        thread_dir: Option<&str>,
    ) -> StoreResult<usize> {
        let (scope, session_dir) = (scope.to_string(), session_dir.to_string());
        let thread_dir = thread_dir.map(str::to_string);
        self.execute(move |conn| {
            let removed = match thread_dir {
                Some(thread_dir) => conn.execute(
                    "DELETE FROM chat_parts WHERE scope = ?1 AND session_dir = ?2 AND thread_dir = ?3",
                    params![scope, session_dir, thread_dir],
                )?,
                None => conn.execute(
                    "DELETE FROM chat_parts WHERE scope = ?1 AND session_dir = ?2",
                    params![scope, session_dir],
                )?,
            };
            Ok(removed)
        })
        .await
    }

    // ── pragmas ──────────────────────────────────────────────────────

    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        debug!("applying SQLite pragmas");

        // WAL: index writes do not block part reads.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // NORMAL is safe with WAL; a power cut loses at most the last commit.
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        // Parts are up to ~320k chars of JSON; keep hot pages mapped.
        conn.pragma_update(None, "mmap_size", 134_217_728_i64)?;
        conn.pragma_update(None, "cache_size", -32_000_i32)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;

        // A CLI invocation may race a running store on the same file.
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

        info!("database pragmas applied (WAL, mmap 128MiB, cache 31MiB)");
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────
