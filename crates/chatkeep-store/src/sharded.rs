//! Sharded store: the session index plus the part store of one scope.
//!
//! Thread operations check a [`Thread`] out of the index by value, run the
//! part-level operation on it, and check it back in by key. The index lock
//! is a `std::sync::Mutex` and is never held across an `.await`. After each
//! structural change the whole index is written back to the backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, instrument, warn};

use crate::backend::DiskBackend;
use crate::config::PartLimits;
use crate::error::{StoreError, StoreResult};
use crate::index::{SessionEntry, SessionIndex, Thread};
use crate::message::{Message, MessagePatch, MessageSnapshot};
use crate::part_store::{AppendOutcome, PartStore};

pub struct ShardedStore {
    parts: PartStore,
    scope: String,
    index: Mutex<SessionIndex>,
    available: AtomicBool,
}

impl ShardedStore {
    pub fn new(backend: Arc<dyn DiskBackend>, scope: impl Into<String>, limits: PartLimits) -> Self {
        let scope = scope.into();
        Self {
            parts: PartStore::new(backend, scope.clone(), limits),
            scope,
            index: Mutex::new(SessionIndex::default()),
            available: AtomicBool::new(false),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn part_store(&self) -> &PartStore {
        &self.parts
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn lock_index(&self) -> MutexGuard<'_, SessionIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::BackendUnavailable)
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Index lifecycle
    // ═══════════════════════════════════════════════════════════════════

    /// Load the index. An absent document is an empty index; a failing
    /// backend leaves the store unavailable.
    #[instrument(skip(self), fields(scope = %self.scope))]
    pub async fn init(&self) -> bool {
        match self.parts.backend().read_index(&self.scope).await {
            Ok(doc) => {
                let index = doc.map(SessionIndex::from_value).unwrap_or_default();
                let sessions = index.sessions.len();
                *self.lock_index() = index;
                self.available.store(true, Ordering::SeqCst);
                info!(sessions, backend = self.parts.backend().name(), "session index loaded");
                true
            }
            Err(err) => {
                warn!(%err, "session index unavailable");
                self.available.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Persist the whole index. Failures are logged and reported as `false`.
    pub async fn write_index(&self) -> bool {
        if !self.is_available() {
            return false;
        }
        let doc = self.lock_index().to_value();
        match self.parts.backend().write_index(&self.scope, &doc).await {
            Ok(()) => true,
            Err(err) => {
                warn!(scope = %self.scope, %err, "failed to write session index");
                false
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Read paths (never create)
    // ═══════════════════════════════════════════════════════════════════

    pub fn has_session(&self, session_id: &str) -> bool {
        self.lock_index().sessions.contains_key(session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.lock_index().sessions.keys().cloned().collect()
    }

    pub fn session_dir(&self, session_id: &str) -> Option<String> {
        self.lock_index().session(session_id).map(|e| e.dir.clone())
    }

    /// Copy of a thread's metadata; `""` addresses the current thread.
    pub fn thread(&self, session_id: &str, archive_id: &str) -> Option<Thread> {
        self.lock_index().get_thread(session_id, archive_id).cloned()
    }

    pub fn thread_total(&self, session_id: &str, archive_id: &str) -> usize {
        self.lock_index()
            .get_thread(session_id, archive_id)
            .map_or(0, |t| t.total)
    }

    pub fn thread_part_ids(&self, session_id: &str, archive_id: &str) -> Vec<String> {
        self.lock_index()
            .get_thread(session_id, archive_id)
            .map(Thread::part_ids)
            .unwrap_or_default()
    }

    pub fn last_message_snapshot(&self, session_id: &str, archive_id: &str) -> Option<MessageSnapshot> {
        self.lock_index()
            .get_thread(session_id, archive_id)
            .and_then(|t| t.last_message.clone())
    }

    pub fn last_message_at(&self, session_id: &str) -> i64 {
        self.lock_index()
            .get_thread(session_id, "")
            .map_or(0, |t| t.last_message_at)
    }

    pub async fn read_part(&self, session_id: &str, archive_id: &str, part_id: &str) -> StoreResult<Vec<Message>> {
        self.ensure_available()?;
        let Some((dir, thread)) = self.checkout_existing(session_id, archive_id) else {
            return Ok(Vec::new());
        };
        self.parts.read_part(&dir, &thread, part_id).await
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Check-out / check-in
    // ═══════════════════════════════════════════════════════════════════

    fn checkout_or_create(&self, session_id: &str, archive_id: &str) -> (String, Thread) {
        let mut index = self.lock_index();
        let entry = index.ensure_session(session_id);
        let dir = entry.dir.clone();
        (dir, entry.thread_mut(archive_id).clone())
    }

    fn checkout_existing(&self, session_id: &str, archive_id: &str) -> Option<(String, Thread)> {
        let index = self.lock_index();
        let entry = index.session(session_id)?;
        Some((entry.dir.clone(), entry.thread(archive_id)?.clone()))
    }

    /// Put a thread back unless its slot was replaced in the meantime.
    fn checkin(&self, session_id: &str, archive_id: &str, thread: Thread) {
        let mut index = self.lock_index();
        let Some(entry) = index.sessions.get_mut(session_id) else {
            debug!(session_id, "session vanished before check-in");
            return;
        };
        let same_slot = entry
            .thread(archive_id)
            .is_some_and(|slot| slot.thread_dir == thread.thread_dir);
        if same_slot {
            *entry.thread_mut(archive_id) = thread;
        } else {
            debug!(session_id, archive_id, "thread replaced before check-in");
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Thread operations
    // ═══════════════════════════════════════════════════════════════════

    pub async fn append_message(
        &self,
        session_id: &str,
        archive_id: &str,
        msg: &Message,
    ) -> StoreResult<AppendOutcome> {
        self.ensure_available()?;
        let (dir, mut thread) = self.checkout_or_create(session_id, archive_id);
        let result = self.parts.append_message(&dir, &mut thread, msg).await;
        self.checkin(session_id, archive_id, thread);
        let outcome = result?;
        self.write_index().await;
        Ok(outcome)
    }

    pub async fn update_message(
        &self,
        session_id: &str,
        archive_id: &str,
        message_id: &str,
        patch: &MessagePatch,
        known_part: Option<&str>,
    ) -> StoreResult<Option<Message>> {
        self.ensure_available()?;
        let Some((dir, mut thread)) = self.checkout_existing(session_id, archive_id) else {
            return Ok(None);
        };
        let result = self
            .parts
            .update_message(&dir, &mut thread, message_id, patch, known_part)
            .await;
        self.checkin(session_id, archive_id, thread);
        let updated = result?;
        if updated.is_some() {
            self.write_index().await;
        }
        Ok(updated)
    }

    pub async fn delete_message(
        &self,
        session_id: &str,
        archive_id: &str,
        message_id: &str,
        known_part: Option<&str>,
    ) -> StoreResult<bool> {
        self.ensure_available()?;
        let Some((dir, mut thread)) = self.checkout_existing(session_id, archive_id) else {
            return Ok(false);
        };
        let result = self
            .parts
            .delete_message(&dir, &mut thread, message_id, known_part)
            .await;
        self.checkin(session_id, archive_id, thread);
        let deleted = result?;
        if deleted {
            self.write_index().await;
        }
        Ok(deleted)
    }

    pub async fn replace_thread_messages(
        &self,
        session_id: &str,
        archive_id: &str,
        messages: &[Message],
    ) -> StoreResult<()> {
        self.ensure_available()?;
        let (dir, mut thread) = self.checkout_or_create(session_id, archive_id);
        let result = self
            .parts
            .replace_thread_messages(&dir, &mut thread, messages)
            .await;
        self.checkin(session_id, archive_id, thread);
        result?;
        self.write_index().await;
        Ok(())
    }

    /// Move the current thread's metadata under `archive_id` and start a
    /// fresh current thread. No message is copied.
    #[instrument(skip(self))]
    pub async fn clone_current_to_archive(&self, session_id: &str, archive_id: &str) -> StoreResult<()> {
        self.ensure_available()?;
        {
            let mut index = self.lock_index();
            let entry = index.ensure_session(session_id);
            let current = std::mem::replace(&mut entry.current, Thread::new());
            entry.archives.insert(archive_id.to_string(), current);
        }
        self.write_index().await;
        Ok(())
    }

    /// Destroy a thread's storage and replace it with an empty thread.
    #[instrument(skip(self))]
    pub async fn reset_thread(&self, session_id: &str, archive_id: &str) -> StoreResult<()> {
        self.ensure_available()?;
        let Some((dir, thread)) = self.checkout_existing(session_id, archive_id) else {
            return Ok(());
        };
        self.parts.delete_thread(&dir, &thread).await?;
        if let Some(entry) = self.lock_index().sessions.get_mut(session_id) {
            *entry.thread_mut(archive_id) = Thread::new();
        }
        self.write_index().await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_archive(&self, session_id: &str, archive_id: &str) -> StoreResult<()> {
        self.ensure_available()?;
        if archive_id.is_empty() {
            return Err(StoreError::InvalidArgument("archive id must not be empty".into()));
        }
        let removed = {
            let mut index = self.lock_index();
            index.sessions.get_mut(session_id).and_then(|entry| {
                let thread = entry.archives.remove(archive_id)?;
                Some((entry.dir.clone(), thread))
            })
        };
        let Some((dir, thread)) = removed else {
            return Ok(());
        };
        self.parts.delete_thread(&dir, &thread).await?;
        self.write_index().await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_session(&self, session_id: &str) -> StoreResult<()> {
        self.ensure_available()?;
        let Some(entry) = self.lock_index().sessions.remove(session_id) else {
            return Ok(());
        };
        self.parts
            .backend()
            .delete_session(&self.scope, &entry.dir)
            .await?;
        self.write_index().await;
        Ok(())
    }

    /// Rename an index entry. Refuses to overwrite an existing `to`.
    #[instrument(skip(self))]
    pub async fn rename_session(&self, from: &str, to: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        {
            let mut index = self.lock_index();
            if from == to || index.sessions.contains_key(to) {
                return Ok(false);
            }
            let Some(entry) = index.sessions.remove(from) else {
                return Ok(false);
            };
            index.sessions.insert(to.to_string(), entry);
        }
        self.write_index().await;
        Ok(true)
    }

    /// Create an empty entry for `session_id` if none exists.
    pub fn ensure_session(&self, session_id: &str) -> bool {
        let mut index = self.lock_index();
        let created = !index.sessions.contains_key(session_id);
        index.ensure_session(session_id);
        created
    }

    /// Insert a fully built entry and persist the index.
    pub async fn commit_session(&self, session_id: &str, entry: SessionEntry) -> bool {
        self.lock_index().sessions.insert(session_id.to_string(), entry);
        self.write_index().await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn limits() -> PartLimits {
        PartLimits {
            message_limit: 2,
            char_limit: 10_000,
            recent_parts: 2,
        }
    }

    async fn ready(backend: Arc<MemoryBackend>) -> ShardedStore {
        let store = ShardedStore::new(backend, "", limits());
        assert!(store.init().await);
        store
    }

    fn msg(id: &str, ts: i64) -> Message {
        Message::user(id).with_id(id).with_timestamp(ts)
    }

    #[tokio::test]
    async fn writes_fail_fast_when_unavailable() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_unavailable(true);
        let store = ShardedStore::new(backend, "", limits());
        assert!(!store.init().await);
        let err = store.append_message("s", "", &msg("a", 1)).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn append_persists_index_and_lazily_creates_session() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ready(backend.clone()).await;
        assert!(store.thread("s", "").is_none());

        for i in 0..3 {
            store.append_message("s", "", &msg(&format!("m{i}"), i + 1)).await.unwrap();
        }
        assert_eq!(store.thread_total("s", ""), 3);
        assert_eq!(store.thread_part_ids("s", ""), vec!["part_0001", "part_0002"]);

        let doc = backend.index_document("").unwrap();
        assert_eq!(doc["sessions"]["s"]["current"]["total"], 3);

        // A fresh instance sees the same index.
        let reopened = ready(backend).await;
        assert_eq!(reopened.thread_total("s", ""), 3);
        assert_eq!(reopened.last_message_snapshot("s", "").unwrap().id, "m2");
    }

    #[tokio::test]
    async fn clone_current_moves_metadata_only() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ready(backend.clone()).await;
        store.append_message("s", "", &msg("a", 1)).await.unwrap();
        let writes = backend.part_writes();
        let before = store.thread("s", "").unwrap();

        store.clone_current_to_archive("s", "arc").await.unwrap();
        assert_eq!(backend.part_writes(), writes);
        assert_eq!(store.thread("s", "arc").unwrap(), before);
        assert_eq!(store.thread_total("s", ""), 0);
        assert_ne!(store.thread("s", "").unwrap().thread_dir, before.thread_dir);

        let read = store.read_part("s", "arc", "part_0001").await.unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn delete_archive_and_session_remove_storage() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ready(backend.clone()).await;
        store.append_message("s", "", &msg("a", 1)).await.unwrap();
        store.clone_current_to_archive("s", "arc").await.unwrap();
        store.append_message("s", "", &msg("b", 2)).await.unwrap();
        assert_eq!(backend.part_count(), 2);

        store.delete_archive("s", "arc").await.unwrap();
        assert!(store.thread("s", "arc").is_none());
        assert_eq!(backend.part_count(), 1);

        store.delete_session("s").await.unwrap();
        assert!(!store.has_session("s"));
        assert_eq!(backend.part_count(), 0);
    }

    #[tokio::test]
    async fn rename_refuses_to_overwrite() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ready(backend).await;
        store.ensure_session("a");
        store.ensure_session("b");
        assert!(!store.rename_session("a", "b").await.unwrap());
        assert!(store.rename_session("a", "c").await.unwrap());
        assert!(store.has_session("c"));
        assert!(!store.has_session("a"));
    }

    #[tokio::test]
    async fn reset_thread_starts_over() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ready(backend.clone()).await;
        for i in 0..3 {
            store.append_message("s", "", &msg(&format!("m{i}"), i + 1)).await.unwrap();
        }
        store.reset_thread("s", "").await.unwrap();
        assert_eq!(store.thread_total("s", ""), 0);
        assert!(store.last_message_snapshot("s", "").is_none());
        assert_eq!(backend.part_count(), 0);
    }

    #[tokio::test]
    async fn update_and_delete_on_missing_thread_are_misses() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ready(backend).await;
        let patch = MessagePatch::content("x");
        assert!(store.update_message("s", "", "m", &patch, None).await.unwrap().is_none());
        assert!(!store.delete_message("s", "", "m", None).await.unwrap());
        assert!(!store.has_session("s"));
    }
}
