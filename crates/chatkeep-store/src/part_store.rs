//! Ordered shards of one thread.
//!
//! A thread's messages are split into parts of at most `message_limit`
//! messages and about `char_limit` characters. Parts only ever grow at the
//! tail: a new part is opened before an insert that would overflow the open
//! one, and a part is never split afterwards.
//!
//! None of these operations are atomic. Callers must serialize them per
//! thread (the store runs them on its [`crate::queue::TaskQueue`]).
//! Metadata in the [`Thread`] is only advanced after the backend accepted
//! the write it describes.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::backend::{DiskBackend, ThreadLocation};
use crate::config::PartLimits;
use crate::error::StoreResult;
use crate::index::{PartMeta, Thread, part_id};
use crate::message::{Message, MessagePatch};

/// Where an appended message landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub part_id: String,
    pub created_new_part: bool,
}

/// Part-level reads and writes for threads of one scope.
#[derive(Clone)]
pub struct PartStore {
    backend: Arc<dyn DiskBackend>,
    scope: String,
    limits: PartLimits,
}

impl PartStore {
    pub fn new(backend: Arc<dyn DiskBackend>, scope: impl Into<String>, limits: PartLimits) -> Self {
        Self {
            backend,
            scope: scope.into(),
            limits,
        }
    }

    pub fn limits(&self) -> PartLimits {
        self.limits
    }

    pub fn backend(&self) -> &Arc<dyn DiskBackend> {
        &self.backend
    }

    fn location(&self, session_dir: &str, thread: &Thread) -> ThreadLocation {
        ThreadLocation::new(self.scope.as_str(), session_dir, thread.thread_dir.as_str())
    }

    /// Whether a message of `chars` must open a new part after `open`.
    fn must_roll(&self, open: Option<(usize, usize)>, chars: usize) -> bool {
        match open {
            None => true,
            Some((count, used)) => {
                count >= self.limits.message_limit
                    || (count > 0 && used + chars > self.limits.char_limit)
            }
        }
    }

    // ── append ───────────────────────────────────────────────────────

    #[instrument(skip(self, thread, msg), fields(thread = %thread.thread_dir, message_id = %msg.id))]
    pub async fn append_message(
        &self,
        session_dir: &str,
        thread: &mut Thread,
        msg: &Message,
    ) -> StoreResult<AppendOutcome> {
        let loc = self.location(session_dir, thread);
        let chars = msg.char_count();
        let open = thread.parts.last().map(|p| (p.count, p.chars));

        let outcome = if self.must_roll(open, chars) {
            let n = thread.next_part.max(1);
            let pid = part_id(n);
            self.backend
                .write_part(&loc, &pid, std::slice::from_ref(msg))
                .await?;
            thread.next_part = n + 1;
            thread.parts.push(PartMeta {
                id: pid.clone(),
                count: 1,
                chars,
            });
            debug!(part_id = %pid, "opened new part");
            AppendOutcome {
                part_id: pid,
                created_new_part: true,
            }
        } else {
            // `must_roll` is false only when a last part exists.
            let pid = thread.parts.last().map(|p| p.id.clone()).unwrap_or_default();
            let mut messages = self.backend.read_part(&loc, &pid).await?.unwrap_or_default();
            messages.push(msg.clone());
            self.backend.write_part(&loc, &pid, &messages).await?;
            if let Some(meta) = thread.part_mut(&pid) {
                meta.count += 1;
                meta.chars += chars;
            }
            AppendOutcome {
                part_id: pid,
                created_new_part: false,
            }
        };

        thread.total += 1;
        thread.set_last_message(Some(msg));
        Ok(outcome)
    }

    // ── update / delete ──────────────────────────────────────────────

    /// Search order: the known part first, then every other part from
    /// newest to oldest.
    fn search_order(thread: &Thread, known_part: Option<&str>) -> Vec<String> {
        let known = known_part.filter(|pid| thread.part(pid).is_some());
        let mut order: Vec<String> = known.map(str::to_string).into_iter().collect();
        order.extend(
            thread
                .parts
                .iter()
                .rev()
                .filter(|p| Some(p.id.as_str()) != known)
                .map(|p| p.id.clone()),
        );
        order
    }

    /// Patch a stored message. `Ok(None)` when no part holds `message_id`.
    #[instrument(skip(self, thread, patch), fields(thread = %thread.thread_dir))]
    pub async fn update_message(
        &self,
        session_dir: &str,
        thread: &mut Thread,
        message_id: &str,
        patch: &MessagePatch,
        known_part: Option<&str>,
    ) -> StoreResult<Option<Message>> {
        let loc = self.location(session_dir, thread);
        for pid in Self::search_order(thread, known_part) {
            let mut messages = self.backend.read_part(&loc, &pid).await?.unwrap_or_default();
            let Some(pos) = messages.iter().position(|m| m.id == message_id) else {
                continue;
            };

            let before = messages[pos].char_count();
            patch.apply(&mut messages[pos]);
            let after = messages[pos].char_count();
            self.backend.write_part(&loc, &pid, &messages).await?;

            if let Some(meta) = thread.part_mut(&pid) {
                meta.chars = (meta.chars + after).saturating_sub(before);
            }
            let updated = messages.swap_remove(pos);
            let is_last = thread
                .last_message
                .as_ref()
                .is_some_and(|snap| snap.id == message_id);
            if is_last {
                thread.set_last_message(Some(&updated));
            }
            return Ok(Some(updated));
        }
        debug!(message_id, "update target not found in any part");
        Ok(None)
    }

    /// Remove a stored message. `Ok(false)` when no part holds it.
    #[instrument(skip(self, thread), fields(thread = %thread.thread_dir))]
    pub async fn delete_message(
        &self,
        session_dir: &str,
        thread: &mut Thread,
        message_id: &str,
        known_part: Option<&str>,
    ) -> StoreResult<bool> {
        let loc = self.location(session_dir, thread);
        for pid in Self::search_order(thread, known_part) {
            let mut messages = self.backend.read_part(&loc, &pid).await?.unwrap_or_default();
            let Some(pos) = messages.iter().position(|m| m.id == message_id) else {
                continue;
            };
            let removed = messages.remove(pos);

            if messages.is_empty() {
                self.backend.delete_part(&loc, &pid).await?;
                thread.parts.retain(|p| p.id != pid);
                debug!(part_id = %pid, "dropped emptied part");
            } else {
                self.backend.write_part(&loc, &pid, &messages).await?;
                if let Some(meta) = thread.part_mut(&pid) {
                    meta.count = meta.count.saturating_sub(1);
                    meta.chars = meta.chars.saturating_sub(removed.char_count());
                }
            }
            thread.total = thread.total.saturating_sub(1);

            let was_last = thread
                .last_message
                .as_ref()
                .is_some_and(|snap| snap.id == message_id);
            if thread.total == 0 {
                thread.set_last_message(None);
            } else if was_last {
                self.refresh_last_message(&loc, thread).await?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Re-read the tail of the newest part into the snapshot.
    async fn refresh_last_message(&self, loc: &ThreadLocation, thread: &mut Thread) -> StoreResult<()> {
        let Some(last) = thread.parts.last().map(|p| p.id.clone()) else {
            thread.set_last_message(None);
            return Ok(());
        };
        let tail = self.backend.read_part(loc, &last).await?.unwrap_or_default();
        thread.set_last_message(tail.last());
        Ok(())
    }

    // ── bulk ─────────────────────────────────────────────────────────

    /// Drop all stored parts of the thread and re-bucket `messages` from
    /// part 1 with the usual rolling rule.
    #[instrument(skip(self, thread, messages), fields(thread = %thread.thread_dir, count = messages.len()))]
    pub async fn replace_thread_messages(
        &self,
        session_dir: &str,
        thread: &mut Thread,
        messages: &[Message],
    ) -> StoreResult<()> {
        let loc = self.location(session_dir, thread);
        self.backend.delete_thread(&loc).await?;
        thread.reset_counters();

        let mut start = 0;
        while start < messages.len() {
            let mut end = start;
            let mut used = 0;
            while end < messages.len() {
                let chars = messages[end].char_count();
                if end > start && self.must_roll(Some((end - start, used)), chars) {
                    break;
                }
                used += chars;
                end += 1;
            }

            let pid = thread.allocate_part_id();
            if let Err(err) = self.backend.write_part(&loc, &pid, &messages[start..end]).await {
                warn!(part_id = %pid, %err, "re-bucketing stopped at failed part write");
                return Err(err);
            }
            thread.parts.push(PartMeta {
                id: pid,
                count: end - start,
                chars: used,
            });
            thread.total += end - start;
            start = end;
        }

        thread.set_last_message(messages.last());
        Ok(())
    }

    /// Messages of one part; an absent part reads as empty.
    pub async fn read_part(&self, session_dir: &str, thread: &Thread, pid: &str) -> StoreResult<Vec<Message>> {
        let loc = self.location(session_dir, thread);
        Ok(self.backend.read_part(&loc, pid).await?.unwrap_or_default())
    }

    pub async fn delete_thread(&self, session_dir: &str, thread: &Thread) -> StoreResult<()> {
        let loc = self.location(session_dir, thread);
        self.backend.delete_thread(&loc).await
    }
}

// ── tests ────────────────────────────────────────────────────────────
