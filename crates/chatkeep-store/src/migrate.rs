//! One-time move of legacy flat sessions into the sharded layout.
//!
//! Legacy documents embed every message: the current thread in
//! `session.messages` and each archive in `archive.messages`. Migration
//! writes those arrays into parts and records the threads in the index.
//!
//! A session's entry is built off-index and committed in one step, so a
//! migration that stops half way (error or scope switch) never leaves a
//! partial entry behind; the session is simply migrated again on the next
//! hydration. Sessions already present in the index are skipped, which
//! makes the whole run idempotent.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::SanitizeLimits;
use crate::error::{StoreError, StoreResult};
use crate::index::SessionEntry;
use crate::message::{Message, now_millis};
use crate::sanitize::sanitize_message;
use crate::scope::ScopeTicket;
use crate::session::{ChatState, SessionState};
use crate::sharded::ShardedStore;

/// What migration changed for one session; applied to the flat document
/// by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratedSession {
    pub session_id: String,
    /// `(archive id, message count)` for every legacy archive.
    pub archive_counts: Vec<(String, usize)>,
    /// Derived read time, set only when the document had none.
    pub last_read_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: Vec<MigratedSession>,
    /// Sessions that failed and will be retried on the next hydration.
    pub failed: Vec<String>,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.migrated.is_empty() && self.failed.is_empty()
    }
}

pub struct MigrationEngine {
    sharded: Arc<ShardedStore>,
    limits: SanitizeLimits,
}

impl MigrationEngine {
    pub fn new(sharded: Arc<ShardedStore>, limits: SanitizeLimits) -> Self {
        Self { sharded, limits }
    }

    /// Sessions that still need to move: absent from the index and holding
    /// at least one message.
    pub fn pending_sessions(&self, state: &ChatState) -> Vec<String> {
        state
            .sessions
            .iter()
            .filter(|(sid, session)| !self.sharded.has_session(sid) && session.has_embedded_messages())
            .map(|(sid, _)| sid.clone())
            .collect()
    }

    /// Migrate every pending session of `state`.
    ///
    /// Per-session failures are collected in the report. A stale ticket
    /// aborts the run with [`StoreError::StaleScope`].
    #[instrument(skip(self, state, ticket), fields(scope = %self.sharded.scope()))]
    pub async fn run(&self, state: &ChatState, ticket: &ScopeTicket) -> StoreResult<MigrationReport> {
        let mut report = MigrationReport::default();
        for sid in self.pending_sessions(state) {
            ticket.check()?;
            let Some(session) = state.sessions.get(&sid) else {
                continue;
            };
            match self.migrate_session(&sid, session, ticket).await {
                Ok(done) => report.migrated.push(done),
                Err(err @ StoreError::StaleScope(_)) => return Err(err),
                Err(err) => {
                    warn!(session_id = %sid, %err, "session migration failed, will retry");
                    report.failed.push(sid);
                }
            }
        }
        if !report.is_empty() {
            info!(
                migrated = report.migrated.len(),
                failed = report.failed.len(),
                "legacy sessions migrated"
            );
        }
        Ok(report)
    }

    async fn migrate_session(
        &self,
        session_id: &str,
        session: &SessionState,
        ticket: &ScopeTicket,
    ) -> StoreResult<MigratedSession> {
        let parts = self.sharded.part_store();
        let mut entry = SessionEntry::new();
        let live = session.live_archive().map(|a| a.id.clone());

        if live.is_none() {
            let messages = self.clean(&session.messages);
            parts
                .replace_thread_messages(&entry.dir, &mut entry.current, &messages)
                .await?;
        }

        let mut archive_counts = Vec::with_capacity(session.archives.len());
        for archive in &session.archives {
            ticket.check()?;
            let is_live = live.as_deref() == Some(archive.id.as_str());
            let source = if is_live {
                &session.messages
            } else {
                &archive.messages
            };
            let messages = self.clean(source);
            let dir = entry.dir.clone();
            let thread = entry.thread_mut(&archive.id);
            parts.replace_thread_messages(&dir, thread, &messages).await?;
            if is_live && thread.last_message_at == 0 {
                thread.last_message_at = now_millis();
            }
            archive_counts.push((archive.id.clone(), thread.total));
        }

        ticket.check()?;
        if !self.sharded.commit_session(session_id, entry).await {
            return Err(StoreError::Backend(format!(
                "index write failed for session {session_id}"
            )));
        }
        debug!(session_id, archives = archive_counts.len(), "session migrated");

        Ok(MigratedSession {
            session_id: session_id.to_string(),
            archive_counts,
            last_read_at: derived_read_at(session),
        })
    }

    fn clean(&self, messages: &[Message]) -> Vec<Message> {
        messages
            .iter()
            .map(|m| {
                let mut m = sanitize_message(m, &self.limits);
                m.ensure_id();
                m
            })
            .collect()
    }
}

/// Timestamp of the read message, looked up in the embedded array of the
/// archive the session points at (a dangling pointer finds nothing), else
/// in the detached messages.
fn derived_read_at(session: &SessionState) -> Option<i64> {
    if session.last_read_at.is_some() {
        return None;
    }
    let read_id = session.last_read_message_id.trim();
    if read_id.is_empty() {
        return None;
    }
    let pointer = session
        .current_archive_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());
    let source: &[Message] = match pointer {
        Some(id) => session
            .archives
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.messages.as_slice())
            .unwrap_or_default(),
        None => &session.messages,
    };
    source.iter().find(|m| m.id == read_id).map(|m| m.timestamp)
}

/// Apply a migration result to the flat document: counts recorded, bodies
/// stripped from archive records, read time derived.
pub fn apply_report(state: &mut ChatState, report: &MigrationReport) {
    for done in &report.migrated {
        let Some(session) = state.sessions.get_mut(&done.session_id) else {
            continue;
        };
        for (archive_id, count) in &done.archive_counts {
            if let Some(archive) = session.archive_mut(archive_id) {
                archive.message_count = *count;
                archive.messages.clear();
            }
        }
        if done.last_read_at.is_some() && session.last_read_at.is_none() {
            session.last_read_at = done.last_read_at;
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::PartLimits;
    use crate::scope::ScopeGeneration;
    use crate::session::Archive;

    fn archive(id: &str, messages: Vec<Message>) -> Archive {
        Archive {
            id: id.into(),
            name: format!("Archive {id}"),
            timestamp: 1,
            message_count: 0,
            summaries: Vec::new(),
            compacted_summary: None,
            compacted_summary_last_raw: None,
            memory_table_snapshot: None,
            messages,
        }
    }

    fn msgs(prefix: &str, n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                Message::user(format!("{prefix}{i}"))
                    .with_id(format!("{prefix}{i}"))
                    .with_timestamp(i as i64 + 1)
            })
            .collect()
    }

    async fn engine() -> (MigrationEngine, Arc<ShardedStore>) {
        let backend = Arc::new(MemoryBackend::new());
        let limits = PartLimits {
            message_limit: 2,
            ..PartLimits::default()
        };
        let sharded = Arc::new(ShardedStore::new(backend, "", limits));
        assert!(sharded.init().await);
        (
            MigrationEngine::new(sharded.clone(), SanitizeLimits::default()),
            sharded,
        )
    }

    fn legacy_state() -> ChatState {
        let mut session = SessionState::default();
        session.messages = msgs("c", 3);
        session.last_read_message_id = "c1".into();
        session.archives = vec![archive("old", msgs("o", 5))];
        let mut state = ChatState::default();
        state.sessions.insert("s".into(), session);
        state.sessions.insert("empty".into(), SessionState::default());
        state.current_id = "s".into();
        state
    }

    #[tokio::test]
    async fn migrates_current_and_archives_once() {
        let (engine, sharded) = engine().await;
        let generation = ScopeGeneration::new();
        let mut state = legacy_state();

        let report = engine.run(&state, &generation.ticket("")).await.unwrap();
        assert_eq!(report.migrated.len(), 1);
        assert_eq!(sharded.thread_total("s", ""), 3);
        assert_eq!(sharded.thread_total("s", "old"), 5);
        assert_eq!(sharded.thread_part_ids("s", "old").len(), 3);
        assert!(!sharded.has_session("empty"));

        apply_report(&mut state, &report);
        let session = &state.sessions["s"];
        assert_eq!(session.archives[0].message_count, 5);
        assert!(session.archives[0].messages.is_empty());
        assert_eq!(session.last_read_at, Some(2));

        // Second run is a no-op.
        let again = engine.run(&legacy_state(), &generation.ticket("")).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(sharded.thread_total("s", "old"), 5);
    }

    #[tokio::test]
    async fn live_archive_takes_the_detached_messages() {
        let (engine, sharded) = engine().await;
        let generation = ScopeGeneration::new();
        let mut state = legacy_state();
        let session = state.sessions.get_mut("s").unwrap();
        session.archives.push(archive("live", Vec::new()));
        session.current_archive_id = Some("live".into());

        engine.run(&state, &generation.ticket("")).await.unwrap();
        assert_eq!(sharded.thread_total("s", "live"), 3);
        assert_eq!(sharded.thread_total("s", ""), 0);
    }

    #[tokio::test]
    async fn dangling_pointer_migrates_current_thread() {
        let (engine, sharded) = engine().await;
        let generation = ScopeGeneration::new();
        let mut state = legacy_state();
        state.sessions.get_mut("s").unwrap().current_archive_id = Some("gone".into());

        engine.run(&state, &generation.ticket("")).await.unwrap();
        assert_eq!(sharded.thread_total("s", ""), 3);
    }

    #[tokio::test]
    async fn read_time_comes_from_the_pointed_archive() {
        let (engine, _) = engine().await;
        let generation = ScopeGeneration::new();
        let mut state = legacy_state();
        let session = state.sessions.get_mut("s").unwrap();
        session.last_read_message_id = "l1".into();
        session.archives.push(archive(
            "live",
            vec![Message::assistant("read").with_id("l1").with_timestamp(42)],
        ));
        session.current_archive_id = Some("live".into());

        let report = engine.run(&state, &generation.ticket("")).await.unwrap();
        assert_eq!(report.migrated[0].last_read_at, Some(42));
    }

    #[tokio::test]
    async fn unknown_read_message_leaves_read_time_unset() {
        let (engine, _) = engine().await;
        let generation = ScopeGeneration::new();
        let mut state = legacy_state();
        state.sessions.get_mut("s").unwrap().last_read_message_id = "nope".into();

        let report = engine.run(&state, &generation.ticket("")).await.unwrap();
        assert_eq!(report.migrated[0].last_read_at, None);
        apply_report(&mut state, &report);
        assert_eq!(state.sessions["s"].last_read_at, None);

        // A dangling archive pointer finds nothing either.
        let (engine, _) = self::engine().await;
        let mut state = legacy_state();
        state.sessions.get_mut("s").unwrap().current_archive_id = Some("gone".into());
        let report = engine.run(&state, &generation.ticket("")).await.unwrap();
        assert_eq!(report.migrated[0].last_read_at, None);
    }

    #[tokio::test]
    async fn stale_ticket_leaves_no_partial_entry() {
        let (engine, sharded) = engine().await;
        let generation = ScopeGeneration::new();
        let ticket = generation.ticket("");
        generation.advance();

        let err = engine.run(&legacy_state(), &ticket).await.unwrap_err();
        assert!(matches!(err, StoreError::StaleScope(_)));
        assert!(!sharded.has_session("s"));
    }
}
