//! Disk backend abstraction.
//!
//! The store never touches files directly; every durable byte goes through
//! a [`DiskBackend`]. Implementations:
//!
//! - [`SqliteBackend`]: production backend on top of [`crate::Database`].
//! - [`MemoryBackend`]: in-process maps with failure injection, for tests.

mod memory;
mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::{BackendStats, SqliteBackend};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreResult;
use crate::message::Message;

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Where one thread's parts live.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadLocation {
    /// Normalized scope id; empty for the default scope.
    pub scope: String,
    pub session_dir: String,
    pub thread_dir: String,
}

impl ThreadLocation {
    pub fn new(
        scope: impl Into<String>,
        session_dir: impl Into<String>,
        thread_dir: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            session_dir: session_dir.into(),
            thread_dir: thread_dir.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Core trait
// ---------------------------------------------------------------------------

/// Durable key/value storage for indexes, parts, flat documents and raw
/// replies.
///
/// Every method may fail with [`crate::StoreError::BackendUnavailable`]
/// when the host has no disk access (yet). Deletes are idempotent.
#[async_trait]
pub trait DiskBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// The session index document of `scope`, if one was ever written.
    async fn read_index(&self, scope: &str) -> StoreResult<Option<Value>>;

    async fn write_index(&self, scope: &str, data: &Value) -> StoreResult<()>;

    /// Messages of one part, `None` if the part does not exist.
    async fn read_part(
        &self,
        location: &ThreadLocation,
        part_id: &str,
    ) -> StoreResult<Option<Vec<Message>>>;

    async fn write_part(
        &self,
        location: &ThreadLocation,
        part_id: &str,
        messages: &[Message],
    ) -> StoreResult<()>;

    async fn delete_part(&self, location: &ThreadLocation, part_id: &str) -> StoreResult<()>;

    /// Remove every part of a thread.
    async fn delete_thread(&self, location: &ThreadLocation) -> StoreResult<()>;

    /// Remove every thread of a session directory.
    async fn delete_session(&self, scope: &str, session_dir: &str) -> StoreResult<()>;

    /// Save a flat document under `name`.
    async fn save_kv(&self, name: &str, data: &Value) -> StoreResult<()>;

    async fn load_kv(&self, name: &str) -> StoreResult<Option<Value>>;

    async fn save_raw_reply(&self, session_id: &str, message_id: &str, text: &str) -> StoreResult<()>;

    async fn load_raw_reply(&self, session_id: &str, message_id: &str) -> StoreResult<Option<String>>;

    async fn delete_raw_reply(&self, session_id: &str, message_id: &str) -> StoreResult<()>;
}
