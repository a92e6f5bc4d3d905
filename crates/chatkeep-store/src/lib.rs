//! # chatkeep-store
//!
//! Persistence engine for multi-session chat history.
//!
//! Each session owns a current thread plus any number of archived threads.
//! Message bodies live in bounded parts on a disk backend; a small flat
//! document (session fields, archive records, read pointers) is persisted
//! on two cadences, a fast cache tier for instant restarts and the disk
//! backend for durability. Everything is partitioned by scope.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │  ChatStore (facade, loaded windows)        │
//! ├─────────────────────┬──────────────────────┤
//! │  TaskQueue (FIFO)   │  PersistenceScheduler│
//! │  MigrationEngine    │  fast tier  (moka)   │
//! │  ShardedStore       │  slow tier  (kv)     │
//! │  PartStore          │                      │
//! ├─────────────────────┴──────────────────────┤
//! │  DiskBackend: SqliteBackend | MemoryBackend│
//! │  Database (rusqlite WAL) + migrations      │
//! └────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use chatkeep_store::{ChatStore, LocalCache, Message, SqliteBackend, StoreConfig};
//!
//! let config = StoreConfig::load("chatkeep.toml")?;
//! let backend = Arc::new(SqliteBackend::open(config.database_path()).await?);
//! let cache = Arc::new(LocalCache::new("chat", config.fast_cache.quota_bytes));
//! let store = ChatStore::open(config, Some(backend), cache, "alice").await;
//!
//! store.switch_session("general");
//! store.append_message("general", Message::user("hello"));
//! store.flush().await;
//! ```

pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod fast_cache;
pub mod index;
pub mod message;
pub mod migrate;
pub mod part_store;
pub mod queue;
pub mod sanitize;
pub mod scheduler;
pub mod schema;
pub mod scope;
pub mod session;
pub mod sharded;
pub mod store;

// ── re-exports ───────────────────────────────────────────────────────

pub use backend::{BackendStats, DiskBackend, MemoryBackend, SqliteBackend, ThreadLocation};
pub use config::{
    FastCacheConfig, PartLimits, PersistConfig, SanitizeLimits, SessionDefaults, StoreConfig,
};
pub use db::{Database, DocumentTable, PartRow};
pub use error::{StoreError, StoreResult};
pub use fast_cache::{CacheStats, FastCache, LocalCache};
pub use index::{PartMeta, SessionEntry, SessionIndex, Thread};
pub use message::{
    CompactedSummary, Message, MessageMeta, MessagePatch, MessageSnapshot, RawReplyRef,
    RawSnapshot, Role, SummaryItem,
};
pub use migrate::{MigrationEngine, MigrationReport};
pub use part_store::{AppendOutcome, PartStore};
pub use queue::TaskQueue;
pub use scheduler::PersistenceScheduler;
pub use scope::{ScopeGeneration, ScopeTicket, make_scoped_key, normalize_scope_id};
pub use session::{Archive, ChatState, SessionSettings, SessionState};
pub use sharded::ShardedStore;
pub use store::{AUTO_ARCHIVE_NAME, ChatStore, DEFAULT_ARCHIVE_NAME, SummaryUpdate};
