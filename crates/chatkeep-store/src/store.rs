//! The chat store facade.
//!
//! [`ChatStore`] owns the flat chat document of one scope and, once the
//! disk backend answers, the sharded store that holds message bodies.
//! Mutations are applied to the in-memory document synchronously; their
//! disk side is queued on the scope's [`TaskQueue`] and the flat document
//! is persisted by the [`PersistenceScheduler`]. Getters are pull-style and
//! never touch disk.
//!
//! Only a window of the open thread is materialized per session: the most
//! recent parts after hydration, extended one part at a time by
//! [`ChatStore::load_older_messages`].
//!
//! # Scope switches
//!
//! Every async operation captures a [`ScopeTicket`]. [`ChatStore::set_scope`]
//! invalidates all outstanding tickets, flushes the outgoing scope, and
//! builds fresh components for the new one; results computed for the old
//! scope are dropped before they touch state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Local;
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::DiskBackend;
use crate::config::{SessionDefaults, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::fast_cache::FastCache;
use crate::message::{
    CompactedSummary, Message, MessagePatch, MessageSnapshot, RawReplyRef, RawSnapshot, Role,
    SummaryItem, now_millis,
};
use crate::migrate::{MigrationEngine, apply_report};
use crate::queue::TaskQueue;
use crate::sanitize::{sanitize_message, sanitize_session, sanitize_state};
use crate::scheduler::{PersistenceScheduler, SnapshotFn};
use crate::scope::{
    BASE_STORE_KEY, LEGACY_ADOPTED_KEY, ScopeGeneration, ScopeTicket, make_scoped_key,
    normalize_scope_id,
};
use crate::session::{Archive, ChatState, SessionSettings, SessionState};
use crate::sharded::ShardedStore;

/// Name given to the archive created when a detached conversation is put
/// aside by [`ChatStore::load_archived_messages`].
pub const AUTO_ARCHIVE_NAME: &str = "Auto archive";

/// Name of archives created without an explicit name.
pub const DEFAULT_ARCHIVE_NAME: &str = "Archive";

static DATE_IN_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\d{4}/\d{2}/\d{2}").ok());

fn has_date(name: &str) -> bool {
    DATE_IN_NAME.as_ref().is_some_and(|re| re.is_match(name))
}

/// ` (YYYY/MM/DD HH:MM)` in local time.
fn timestamp_suffix() -> String {
    format!(" ({})", Local::now().format("%Y/%m/%d %H:%M"))
}

fn clean_id(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn thread_key(session_id: &str, archive_id: &str) -> String {
    let aid = if archive_id.is_empty() { "current" } else { archive_id };
    format!("{session_id}::{aid}")
}

/// One summary rewrite for [`ChatStore::update_summary_items`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryUpdate {
    pub at: i64,
    pub from_text: String,
    pub to_text: String,
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal state
// ═══════════════════════════════════════════════════════════════════════

/// Pagination state of one loaded thread.
#[derive(Debug, Default, Clone)]
struct ThreadView {
    /// Loaded part ids, oldest first.
    loaded_parts: Vec<String>,
    /// Message id to the part holding it.
    message_parts: HashMap<String, String>,
}

/// Per-scope components, replaced wholesale on a scope switch.
struct ScopeParts {
    sharded: Option<Arc<ShardedStore>>,
    queue: TaskQueue,
    scheduler: PersistenceScheduler,
}

struct Facade {
    scope_id: String,
    store_key: String,
    state: ChatState,
    defaults: SessionDefaults,
    views: HashMap<String, ThreadView>,
    /// Session id to the key of the thread its `messages` window shows.
    loaded: HashMap<String, String>,
    use_sharded: bool,
    skip_message_persist: bool,
    /// Sessions whose embedded messages failed to migrate. They stay flat
    /// until the next hydration retries them.
    legacy: HashSet<String>,
    /// Thread keys whose stored messages a queued job is moving out or
    /// deleting. Only the window counts for them until the job lands.
    emptied: HashSet<String>,
    parts: Arc<ScopeParts>,
}

struct Inner {
    config: StoreConfig,
    backend: Option<Arc<dyn DiskBackend>>,
    fast: Arc<dyn FastCache>,
    generation: ScopeGeneration,
    facade: Mutex<Facade>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Facade> {
        self.facade.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Facade {
    fn new(scope_id: String, defaults: SessionDefaults, parts: Arc<ScopeParts>) -> Self {
        let store_key = make_scoped_key(BASE_STORE_KEY, &scope_id);
        Self {
            state: ChatState {
                scope_id: scope_id.clone(),
                ..ChatState::default()
            },
            scope_id,
            store_key,
            defaults,
            views: HashMap::new(),
            loaded: HashMap::new(),
            use_sharded: false,
            skip_message_persist: false,
            legacy: HashSet::new(),
            emptied: HashSet::new(),
            parts,
        }
    }

    fn persist(&self) {
        self.parts.scheduler.schedule();
    }

    fn persistable(&self, config: &StoreConfig) -> Option<Value> {
        let mut doc = sanitize_state(&self.state, self.skip_message_persist, &config.sanitize);
        for sid in &self.legacy {
            if let (Some(src), Some(dst)) = (self.state.sessions.get(sid), doc.sessions.get_mut(sid)) {
                *dst = sanitize_session(src, false, &config.sanitize);
            }
        }
        doc.scope_id = self.scope_id.clone();
        serde_json::to_value(&doc).ok()
    }

    fn sharded(&self) -> Option<Arc<ShardedStore>> {
        if self.use_sharded {
            self.parts.sharded.clone()
        } else {
            None
        }
    }

    /// The sharded store, unless `session_id` still lives in the flat
    /// document.
    fn sharded_for(&self, session_id: &str) -> Option<Arc<ShardedStore>> {
        if self.legacy.contains(session_id) {
            None
        } else {
            self.sharded()
        }
    }

    fn is_sharded_session(&self, session_id: &str) -> bool {
        self.use_sharded && !self.legacy.contains(session_id)
    }

    fn ensure_session(&mut self, session_id: &str) -> &mut SessionState {
        if !self.state.sessions.contains_key(session_id) {
            info!(session_id, scope = %self.scope_id, "session created");
        }
        let defaults = &self.defaults;
        self.state
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(defaults))
    }

    fn open_key(&self, session_id: &str) -> String {
        self.state
            .sessions
            .get(session_id)
            .map(SessionState::open_archive_key)
            .unwrap_or_default()
    }

    /// Messages of a thread: the sharded total, or the window length in
    /// flat mode. A shown window counts too, since queued appends may not
    /// have reached the index yet.
    fn thread_total(&self, session_id: &str, archive_id: &str) -> usize {
        let window = self
            .state
            .sessions
            .get(session_id)
            .map_or(0, |s| s.messages.len());
        match self.sharded_for(session_id) {
            Some(sharded) => {
                let key = thread_key(session_id, archive_id);
                let shown = self.loaded.get(session_id) == Some(&key);
                let window = if shown { window } else { 0 };
                if self.emptied.contains(&key) {
                    return window;
                }
                sharded.thread_total(session_id, archive_id).max(window)
            }
            None => window,
        }
    }

    fn last_message(&self, session_id: &str) -> Option<MessageSnapshot> {
        let session = self.state.sessions.get(session_id)?;
        if let Some(last) = session.messages.last() {
            return Some(MessageSnapshot::from(last));
        }
        let sharded = self.sharded_for(session_id)?;
        sharded
            .last_message_snapshot(session_id, &session.open_archive_key())
            .or_else(|| sharded.last_message_snapshot(session_id, ""))
    }

    fn list_sessions(&self) -> Vec<String> {
        let mut ids: Vec<(String, i64)> = self
            .state
            .sessions
            .keys()
            .map(|sid| {
                let at = self.last_message(sid).map_or(0, |m| m.timestamp);
                (sid.clone(), at)
            })
            .collect();
        ids.sort_by(|a, b| b.1.cmp(&a.1));
        ids.into_iter().map(|(sid, _)| sid).collect()
    }

    /// Queue a sharded write for `session_id`. Flat sessions have none.
    fn enqueue<F, Fut>(&self, session_id: &str, label: &'static str, make: F)
    where
        F: FnOnce(Arc<ShardedStore>) -> Fut,
        Fut: Future<Output = StoreResult<()>> + Send + 'static,
    {
        if let Some(sharded) = self.sharded_for(session_id) {
            self.parts.queue.enqueue(label, make(sharded));
        }
    }

    /// Show a thread of a session through an empty window while `job`
    /// moves or drops its stored messages.
    fn empty_thread<Fut>(
        &mut self,
        weak: Weak<Inner>,
        ticket: ScopeTicket,
        session_id: &str,
        archive_id: &str,
        label: &'static str,
        job: Fut,
    ) where
        Fut: Future<Output = StoreResult<()>> + Send + 'static,
    {
        let key = thread_key(session_id, archive_id);
        self.views.insert(key.clone(), ThreadView::default());
        self.loaded.insert(session_id.to_string(), key.clone());
        self.emptied.insert(key.clone());
        if let Some(session) = self.state.sessions.get_mut(session_id) {
            session.messages.clear();
        }
        self.parts.queue.enqueue(label, async move {
            let result = job.await;
            if !ticket.is_stale() {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().emptied.remove(&key);
                }
            }
            result
        });
    }

    /// Forget the open thread's view and reset its storage.
    fn reset_open_thread(&mut self, weak: Weak<Inner>, ticket: ScopeTicket, session_id: &str) {
        let Some(sharded) = self.sharded_for(session_id) else {
            return;
        };
        let aid = self.open_key(session_id);
        let sid = session_id.to_string();
        let owned_aid = aid.clone();
        self.empty_thread(weak, ticket, session_id, &aid, "reset_thread", async move {
            sharded.reset_thread(&sid, &owned_aid).await
        });
    }
}

fn live_index(session: &SessionState) -> Option<usize> {
    let id = session.live_archive_id()?;
    session.archives.iter().position(|a| a.id == id)
}

fn open_summaries(session: &SessionState) -> &[SummaryItem] {
    match session.live_archive() {
        Some(archive) => &archive.summaries,
        None => &session.detached_summaries,
    }
}

fn open_summaries_mut(session: &mut SessionState) -> &mut Vec<SummaryItem> {
    match live_index(session) {
        Some(idx) => &mut session.archives[idx].summaries,
        None => &mut session.detached_summaries,
    }
}

fn open_compacted(session: &SessionState) -> (Option<&CompactedSummary>, Option<&RawSnapshot>) {
    match session.live_archive() {
        Some(a) => (a.compacted_summary.as_ref(), a.compacted_summary_last_raw.as_ref()),
        None => (
            session.compacted_summary.as_ref(),
            session.compacted_summary_last_raw.as_ref(),
        ),
    }
}

fn open_compacted_mut(
    session: &mut SessionState,
) -> (&mut Option<CompactedSummary>, &mut Option<RawSnapshot>) {
    match live_index(session) {
        Some(idx) => {
            let archive = &mut session.archives[idx];
            (
                &mut archive.compacted_summary,
                &mut archive.compacted_summary_last_raw,
            )
        }
        None => (
            &mut session.compacted_summary,
            &mut session.compacted_summary_last_raw,
        ),
    }
}

/// Point `msg` at its out-of-band raw reply, filling missing halves.
fn ensure_raw_ref(msg: &mut Message, session_id: &str) -> Option<RawReplyRef> {
    let message_id = clean_id(&msg.id)?.to_string();
    let reference = msg.raw_original_ref.get_or_insert_with(|| RawReplyRef {
        session_id: session_id.to_string(),
        message_id: message_id.clone(),
    });
    if reference.session_id.is_empty() {
        reference.session_id = session_id.to_string();
    }
    if reference.message_id.is_empty() {
        reference.message_id = message_id;
    }
    Some(reference.clone())
}

fn build_parts(
    weak: &Weak<Inner>,
    config: &StoreConfig,
    backend: Option<&Arc<dyn DiskBackend>>,
    fast: &Arc<dyn FastCache>,
    scope_id: &str,
    ticket: ScopeTicket,
) -> Arc<ScopeParts> {
    let key = make_scoped_key(BASE_STORE_KEY, scope_id);
    let sharded = backend.map(|b| Arc::new(ShardedStore::new(Arc::clone(b), scope_id, config.parts)));
    let label = if scope_id.is_empty() { "default" } else { scope_id };
    let queue = TaskQueue::start(format!("chat:{label}"));
    let scheduler = PersistenceScheduler::new(
        key.clone(),
        Arc::clone(fast),
        backend.cloned(),
        snapshot_fn(weak.clone(), key),
        config.persist,
        ticket,
    );
    Arc::new(ScopeParts {
        sharded,
        queue,
        scheduler,
    })
}

/// Snapshot provider for the scheduler. Yields nothing once the facade has
/// moved to another document key.
fn snapshot_fn(weak: Weak<Inner>, key: String) -> SnapshotFn {
    Arc::new(move || {
        let inner = weak.upgrade()?;
        let facade = inner.lock();
        if facade.store_key != key {
            return None;
        }
        facade.persistable(&inner.config)
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  ChatStore
// ═══════════════════════════════════════════════════════════════════════

/// Cheaply cloneable handle to the chat store of one scope.
#[derive(Clone)]
pub struct ChatStore {
    inner: Arc<Inner>,
}

impl ChatStore {
    /// Build an empty store. Must be called inside a tokio runtime; call
    /// [`ChatStore::hydrate`] (or use [`ChatStore::open`]) to load data.
    ///
    /// Without a backend the store keeps everything in memory plus the fast
    /// cache tier.
    pub fn new(
        config: StoreConfig,
        backend: Option<Arc<dyn DiskBackend>>,
        fast: Arc<dyn FastCache>,
        scope: &str,
    ) -> Self {
        let scope_id = normalize_scope_id(scope);
        let generation = ScopeGeneration::new();
        let inner = Arc::new_cyclic(|weak| {
            let parts = build_parts(
                weak,
                &config,
                backend.as_ref(),
                &fast,
                &scope_id,
                generation.ticket(&scope_id),
            );
            let facade = Facade::new(scope_id.clone(), config.session_defaults.clone(), parts);
            Inner {
                config,
                backend,
                fast,
                generation,
                facade: Mutex::new(facade),
            }
        });
        Self { inner }
    }

    /// [`ChatStore::new`] followed by [`ChatStore::hydrate`].
    pub async fn open(
        config: StoreConfig,
        backend: Option<Arc<dyn DiskBackend>>,
        fast: Arc<dyn FastCache>,
        scope: &str,
    ) -> Self {
        let store = Self::new(config, backend, fast, scope);
        store.hydrate().await;
        store
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn scope_id(&self) -> String {
        self.inner.lock().scope_id.clone()
    }

    /// Whether message bodies live in the sharded store.
    pub fn is_sharded(&self) -> bool {
        self.inner.lock().use_sharded
    }

    /// Whether the fast tier was switched off after a quota failure.
    pub fn fast_tier_disabled(&self) -> bool {
        self.inner.lock().parts.scheduler.is_fast_disabled()
    }

    fn ticket(&self) -> ScopeTicket {
        let scope = self.inner.lock().scope_id.clone();
        self.inner.generation.ticket(&scope)
    }

    fn parts(&self) -> Arc<ScopeParts> {
        Arc::clone(&self.inner.lock().parts)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Hydration
    // ═══════════════════════════════════════════════════════════════════

    /// Load the scope's data: fast tier snapshot, then the flat document
    /// from disk, then the sharded index (migrating legacy sessions) and the
    /// recent window of the current session.
    ///
    /// Returns `false` when the scope changed before hydration finished.
    #[instrument(skip(self))]
    pub async fn hydrate(&self) -> bool {
        let ticket = self.ticket();
        let (scope_id, key) = {
            let f = self.inner.lock();
            (f.scope_id.clone(), f.store_key.clone())
        };

        if let Some(state) = self.load_fast(&scope_id, &key).await {
            if ticket.is_stale() {
                return false;
            }
            self.install_state(state);
            debug!(key = %key, "painted from fast tier");
        }

        self.hydrate_flat(&ticket, &scope_id, &key).await;
        if ticket.is_stale() {
            return false;
        }
        self.hydrate_sharded(&ticket).await
    }

    async fn legacy_adopted(&self) -> bool {
        self.inner
            .fast
            .load(LEGACY_ADOPTED_KEY)
            .await
            .is_some_and(|v| v == Value::from("1"))
    }

    async fn mark_legacy_adopted(&self) {
        if let Err(err) = self.inner.fast.store(LEGACY_ADOPTED_KEY, &Value::from("1")).await {
            debug!(%err, "could not record legacy adoption");
        }
    }

    async fn load_fast(&self, scope_id: &str, key: &str) -> Option<ChatState> {
        let scoped = self
            .inner
            .fast
            .load(key)
            .await
            .and_then(ChatState::from_value)
            .filter(|s| s.matches_scope(scope_id));
        if let Some(state) = scoped {
            if !scope_id.is_empty() {
                self.mark_legacy_adopted().await;
            }
            return Some(state);
        }
        if scope_id.is_empty() || self.legacy_adopted().await {
            return None;
        }
        let legacy = self
            .inner
            .fast
            .load(BASE_STORE_KEY)
            .await
            .and_then(ChatState::from_value)?;
        self.mark_legacy_adopted().await;
        info!(scope = scope_id, "adopting unscoped chat data");
        Some(legacy)
    }

    async fn load_flat(
        &self,
        backend: &Arc<dyn DiskBackend>,
        scope_id: &str,
        key: &str,
        ticket: &ScopeTicket,
    ) -> StoreResult<Option<ChatState>> {
        let mut doc = backend
            .load_kv(key)
            .await?
            .and_then(ChatState::from_value)
            .filter(|s| s.matches_scope(scope_id));
        ticket.check()?;

        if doc.is_none() && !scope_id.is_empty() && !self.legacy_adopted().await {
            if let Some(legacy) = backend
                .load_kv(BASE_STORE_KEY)
                .await?
                .and_then(ChatState::from_value)
            {
                ticket.check()?;
                self.mark_legacy_adopted().await;
                info!(scope = scope_id, "adopting unscoped chat document from disk");
                if let Err(err) = backend.save_kv(key, &serde_json::to_value(&legacy)?).await {
                    debug!(%err, "could not copy unscoped document");
                }
                doc = Some(legacy);
            }
        }
        if doc.is_some() && !scope_id.is_empty() {
            self.mark_legacy_adopted().await;
        }
        Ok(doc)
    }

    async fn hydrate_flat(&self, ticket: &ScopeTicket, scope_id: &str, key: &str) {
        let Some(backend) = self.inner.backend.clone() else {
            return;
        };
        let persist = self.inner.config.persist;
        let mut attempt = 0;
        loop {
            match self.load_flat(&backend, scope_id, key, ticket).await {
                Ok(Some(state)) => {
                    if ticket.is_stale() {
                        return;
                    }
                    let sessions = state.sessions.len();
                    self.install_state(state);
                    self.parts().scheduler.write_fast_now().await;
                    info!(key, sessions, "chat store hydrated from disk");
                    return;
                }
                Ok(None) => return,
                Err(err) if err.is_unavailable() && attempt < persist.hydrate_retries => {
                    attempt += 1;
                    warn!(attempt, max = persist.hydrate_retries, "backend unavailable, retrying hydrate");
                    tokio::time::sleep(persist.hydrate_backoff(attempt)).await;
                    if ticket.is_stale() {
                        return;
                    }
                }
                Err(err) => {
                    debug!(%err, "disk load skipped");
                    return;
                }
            }
        }
    }

    fn install_state(&self, state: ChatState) {
        let mut state = sanitize_state(&state, false, &self.inner.config.sanitize);
        state.resolve_current_id();
        let mut f = self.inner.lock();
        state.scope_id = f.scope_id.clone();
        f.state = state;
        f.views.clear();
        f.loaded.clear();
        f.legacy.clear();
        f.emptied.clear();
    }

    async fn hydrate_sharded(&self, ticket: &ScopeTicket) -> bool {
        let Some(sharded) = self.parts().sharded.clone() else {
            return true;
        };
        if !sharded.init().await {
            return !ticket.is_stale();
        }

        let migration = {
            let mut f = self.inner.lock();
            if ticket.is_stale() {
                return false;
            }
            f.use_sharded = true;
            f.skip_message_persist = true;
            for sid in sharded.session_ids() {
                f.ensure_session(&sid);
            }
            // Enqueued under the lock so no user write can slip in front.
            let snapshot = f.state.clone();
            let engine = MigrationEngine::new(Arc::clone(&sharded), self.inner.config.sanitize);
            let job_ticket = ticket.clone();
            let (tx, rx) = oneshot::channel();
            f.parts.queue.enqueue("migrate", async move {
                match engine.run(&snapshot, &job_ticket).await {
                    Ok(report) => {
                        let _ = tx.send(Some(report));
                        Ok(())
                    }
                    Err(err) => {
                        let _ = tx.send(None);
                        Err(err)
                    }
                }
            });
            rx
        };

        let report = migration.await.ok().flatten();
        let (current, open, flat) = {
            let mut f = self.inner.lock();
            if ticket.is_stale() {
                return false;
            }
            if let Some(report) = &report {
                apply_report(&mut f.state, report);
            }
            // Whatever did not reach the index keeps its embedded messages.
            let legacy: HashSet<String> = f
                .state
                .sessions
                .iter()
                .filter(|(sid, s)| !sharded.has_session(sid) && s.has_embedded_messages())
                .map(|(sid, _)| sid.clone())
                .collect();
            if !legacy.is_empty() {
                warn!(sessions = legacy.len(), "sessions left unmigrated, keeping them flat");
            }
            f.legacy = legacy;
            let current = f.state.current_id.clone();
            let open = f.open_key(&current);
            let flat = f.legacy.contains(&current);
            (current, open, flat)
        };
        if !current.is_empty() && !flat {
            match self.load_recent(&current, &open, ticket).await {
                Ok(_) => {}
                Err(StoreError::StaleScope(_)) => return false,
                Err(err) => warn!(%err, "loading recent messages failed"),
            }
        }

        let mut f = self.inner.lock();
        if ticket.is_stale() {
            return false;
        }
        let Facade { state, legacy, .. } = &mut *f;
        for (sid, session) in state.sessions.iter_mut() {
            if *sid != current && !legacy.contains(sid) {
                session.messages.clear();
            }
        }
        f.loaded.retain(|sid, _| *sid == current);
        f.persist();
        info!(sessions = f.state.sessions.len(), "sharded store ready");
        true
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Windows and pagination
    // ═══════════════════════════════════════════════════════════════════

    /// Replace the session's window with the newest parts of a thread.
    async fn load_recent(
        &self,
        session_id: &str,
        archive_id: &str,
        ticket: &ScopeTicket,
    ) -> StoreResult<Vec<Message>> {
        let (sharded, queue) = {
            let f = self.inner.lock();
            (
                f.sharded_for(session_id).ok_or(StoreError::BackendUnavailable)?,
                f.parts.queue.clone(),
            )
        };
        // Queued writes must land before the window is read back.
        queue.drain().await;
        ticket.check()?;

        let key = thread_key(session_id, archive_id);
        let ids: Vec<String> = match sharded.thread(session_id, archive_id) {
            Some(thread) => {
                let ids = thread.part_ids();
                let keep = self.inner.config.parts.recent_parts;
                ids[ids.len().saturating_sub(keep)..].to_vec()
            }
            None => Vec::new(),
        };

        let mut merged = Vec::new();
        let mut view = ThreadView::default();
        for pid in &ids {
            let list = sharded.read_part(session_id, archive_id, pid).await?;
            ticket.check()?;
            for msg in &list {
                view.message_parts.insert(msg.id.clone(), pid.clone());
            }
            merged.extend(list);
        }
        view.loaded_parts = ids;

        let mut f = self.inner.lock();
        ticket.check()?;
        f.views.insert(key.clone(), view);
        f.loaded.insert(session_id.to_string(), key);
        f.ensure_session(session_id).messages = merged.clone();
        Ok(merged)
    }

    /// The session's window, loading the recent parts of the open thread
    /// (or `archive_id`) if another thread is shown.
    pub async fn ensure_recent_messages_loaded(
        &self,
        session_id: &str,
        archive_id: Option<&str>,
    ) -> Vec<Message> {
        let Some(sid) = clean_id(session_id) else {
            return Vec::new();
        };
        let ticket = self.ticket();
        let aid = {
            let mut f = self.inner.lock();
            f.ensure_session(sid);
            let aid = archive_id
                .and_then(clean_id)
                .map(str::to_string)
                .unwrap_or_else(|| f.open_key(sid));
            let key = thread_key(sid, &aid);
            if !f.is_sharded_session(sid) || f.loaded.get(sid) == Some(&key) {
                return f.state.sessions.get(sid).map(|s| s.messages.clone()).unwrap_or_default();
            }
            aid
        };
        match self.load_recent(sid, &aid, &ticket).await {
            Ok(messages) => messages,
            Err(StoreError::StaleScope(_)) => Vec::new(),
            Err(err) => {
                warn!(session_id = sid, %err, "loading recent messages failed");
                Vec::new()
            }
        }
    }

    /// Whether parts older than the loaded window exist.
    pub fn has_older_messages(&self, session_id: &str, archive_id: Option<&str>) -> bool {
        let Some(sid) = clean_id(session_id) else {
            return false;
        };
        let f = self.inner.lock();
        let Some(sharded) = f.sharded_for(sid) else {
            return false;
        };
        let aid = archive_id
            .and_then(clean_id)
            .map(str::to_string)
            .unwrap_or_else(|| f.open_key(sid));
        let Some(thread) = sharded.thread(sid, &aid) else {
            return false;
        };
        let key = thread_key(sid, &aid);
        let oldest = f
            .views
            .get(&key)
            .filter(|_| f.loaded.get(sid) == Some(&key))
            .and_then(|v| v.loaded_parts.first());
        match oldest {
            None => !thread.parts.is_empty(),
            Some(oldest) => thread.parts.iter().position(|p| p.id == *oldest).is_some_and(|i| i > 0),
        }
    }

    /// Prepend up to `part_count` older parts to the window. Returns the
    /// messages that were added, oldest first.
    pub async fn load_older_messages(
        &self,
        session_id: &str,
        archive_id: Option<&str>,
        part_count: usize,
    ) -> Vec<Message> {
        let Some(sid) = clean_id(session_id) else {
            return Vec::new();
        };
        let ticket = self.ticket();
        let (sharded, queue, aid) = {
            let mut f = self.inner.lock();
            let Some(sharded) = f.sharded_for(sid) else {
                return Vec::new();
            };
            f.ensure_session(sid);
            let aid = archive_id
                .and_then(clean_id)
                .map(str::to_string)
                .unwrap_or_else(|| f.open_key(sid));
            (sharded, f.parts.queue.clone(), aid)
        };
        queue.drain().await;
        if ticket.is_stale() {
            return Vec::new();
        }

        let key = thread_key(sid, &aid);
        let Some(thread) = sharded.thread(sid, &aid) else {
            return Vec::new();
        };
        let all = thread.part_ids();
        let loaded: Vec<String> = {
            let f = self.inner.lock();
            if f.loaded.get(sid) == Some(&key) {
                f.views.get(&key).map(|v| v.loaded_parts.clone()).unwrap_or_default()
            } else {
                Vec::new()
            }
        };
        let oldest_idx = all
            .iter()
            .position(|p| loaded.contains(p))
            .unwrap_or(all.len());
        let start = oldest_idx.saturating_sub(part_count.max(1));
        let pick = all[start..oldest_idx].to_vec();
        if pick.is_empty() {
            return Vec::new();
        }

        let mut older = Vec::new();
        let mut mapping = Vec::new();
        for pid in &pick {
            match sharded.read_part(sid, &aid, pid).await {
                Ok(list) => {
                    if ticket.is_stale() {
                        return Vec::new();
                    }
                    mapping.extend(list.iter().map(|m| (m.id.clone(), pid.clone())));
                    older.extend(list);
                }
                Err(err) => {
                    warn!(session_id = sid, part_id = %pid, %err, "loading older part failed");
                    return Vec::new();
                }
            }
        }

        let mut f = self.inner.lock();
        if ticket.is_stale() {
            return Vec::new();
        }
        let window_matches = f.loaded.get(sid) == Some(&key);
        let view = f.views.entry(key.clone()).or_default();
        if !window_matches {
            *view = ThreadView::default();
        }
        let mut parts = pick;
        parts.extend(view.loaded_parts.drain(..));
        view.loaded_parts = parts;
        view.message_parts.extend(mapping);
        f.loaded.insert(sid.to_string(), key);

        let session = f.ensure_session(sid);
        let current = if window_matches {
            std::mem::take(&mut session.messages)
        } else {
            Vec::new()
        };
        let mut window = older.clone();
        window.extend(current);
        session.messages = window;
        older
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Sessions
    // ═══════════════════════════════════════════════════════════════════

    /// Session ids by last message time, newest first.
    pub fn list_sessions(&self) -> Vec<String> {
        self.inner.lock().list_sessions()
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        clean_id(session_id).is_some_and(|sid| self.inner.lock().state.sessions.contains_key(sid))
    }

    pub fn current_id(&self) -> String {
        self.inner.lock().state.current_id.clone()
    }

    pub fn set_current(&self, session_id: &str) {
        let mut f = self.inner.lock();
        f.state.current_id = session_id.trim().to_string();
        f.persist();
    }

    /// Make `session_id` current, creating it if needed.
    pub fn switch_session(&self, session_id: &str) -> bool {
        let Some(sid) = clean_id(session_id) else {
            return false;
        };
        let mut f = self.inner.lock();
        f.state.current_id = sid.to_string();
        f.ensure_session(sid);
        f.persist();
        true
    }

    /// Remove a session and its threads. When it was current, the most
    /// recently active remaining session becomes current.
    pub fn delete_session(&self, session_id: &str) -> bool {
        let Some(sid) = clean_id(session_id) else {
            return false;
        };
        let mut f = self.inner.lock();
        if f.state.sessions.remove(sid).is_none() {
            return false;
        }
        if f.state.current_id == sid {
            f.state.current_id = f.list_sessions().into_iter().next().unwrap_or_default();
        }
        let prefix = format!("{sid}::");
        f.views.retain(|key, _| !key.starts_with(&prefix));
        f.loaded.remove(sid);
        let owned = sid.to_string();
        f.legacy.remove(sid);
        f.enqueue(sid, "delete_session", move |sharded| async move {
            sharded.delete_session(&owned).await
        });
        f.persist();
        true
    }

    /// Rename a session. Refuses to overwrite an existing one.
    pub fn rename_session(&self, from: &str, to: &str) -> bool {
        let (Some(from), Some(to)) = (clean_id(from), clean_id(to)) else {
            return false;
        };
        let mut f = self.inner.lock();
        if from == to || f.state.sessions.contains_key(to) {
            return false;
        }
        let Some(session) = f.state.sessions.remove(from) else {
            return false;
        };
        f.state.sessions.insert(to.to_string(), session);
        if f.state.current_id == from {
            f.state.current_id = to.to_string();
        }
        let prefix = format!("{from}::");
        f.views.retain(|key, _| !key.starts_with(&prefix));
        f.loaded.remove(from);
        if f.legacy.remove(from) {
            f.legacy.insert(to.to_string());
        } else {
            let (old_id, new_id) = (from.to_string(), to.to_string());
            f.enqueue(to, "rename_session", move |sharded| async move {
                sharded.rename_session(&old_id, &new_id).await.map(|_| ())
            });
        }
        f.persist();
        true
    }

    /// Drop the open thread's messages plus draft, last raw response and
    /// unread count.
    pub fn clear(&self, session_id: &str) -> bool {
        let Some(sid) = clean_id(session_id) else {
            return false;
        };
        let mut f = self.inner.lock();
        let Some(session) = f.state.sessions.get_mut(sid) else {
            return false;
        };
        session.messages.clear();
        session.draft.clear();
        session.last_raw_response.clear();
        session.last_raw_at = 0;
        session.unread_count = 0;
        let ticket = self.inner.generation.ticket(&f.scope_id);
        f.reset_open_thread(Arc::downgrade(&self.inner), ticket, sid);
        f.persist();
        true
    }

    /// Drop the open thread's messages and the unread count.
    pub fn clear_messages(&self, session_id: &str) -> bool {
        let Some(sid) = clean_id(session_id) else {
            return false;
        };
        let mut f = self.inner.lock();
        let Some(session) = f.state.sessions.get_mut(sid) else {
            return false;
        };
        session.messages.clear();
        session.unread_count = 0;
        let ticket = self.inner.generation.ticket(&f.scope_id);
        f.reset_open_thread(Arc::downgrade(&self.inner), ticket, sid);
        f.persist();
        true
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Messages
    // ═══════════════════════════════════════════════════════════════════

    /// The loaded window of a session.
    pub fn messages(&self, session_id: &str) -> Vec<Message> {
        self.inner
            .lock()
            .state
            .sessions
            .get(session_id.trim())
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// Newest message of the window, else the open thread's snapshot.
    pub fn last_message(&self, session_id: &str) -> Option<MessageSnapshot> {
        self.inner.lock().last_message(clean_id(session_id)?)
    }

    pub fn find_message(&self, session_id: &str, message_id: &str) -> Option<Message> {
        self.inner
            .lock()
            .state
            .sessions
            .get(session_id.trim())?
            .find_message(message_id)
            .cloned()
    }

    pub fn has_messages(&self, session_id: &str) -> bool {
        let Some(sid) = clean_id(session_id) else {
            return false;
        };
        let f = self.inner.lock();
        if f.state.sessions.get(sid).is_some_and(|s| !s.messages.is_empty()) {
            return true;
        }
        let Some(sharded) = f.sharded_for(sid) else {
            return false;
        };
        sharded.thread_total(sid, &f.open_key(sid)) > 0
            || sharded.last_message_snapshot(sid, "").is_some()
    }

    /// Append to the open thread of a session, creating it if needed.
    /// Assistant messages raise the unread count.
    pub fn append_message(&self, session_id: &str, message: Message) -> Option<Message> {
        let sid = clean_id(session_id)?;
        let mut msg = message;
        msg.ensure_id();

        let mut f = self.inner.lock();
        f.ensure_session(sid);
        self.save_raw_original(&f, &mut msg, sid);

        let aid = f.open_key(sid);
        let key = thread_key(sid, &aid);
        if let Some(sharded) = f.sharded_for(sid) {
            // An empty thread is fully shown by an empty window.
            if !f.loaded.contains_key(sid) && sharded.thread_total(sid, &aid) == 0 {
                f.loaded.insert(sid.to_string(), key.clone());
                f.views.insert(key.clone(), ThreadView::default());
            }
        }

        let session = f.ensure_session(sid);
        session.messages.push(msg.clone());
        if msg.role == Role::Assistant {
            session.unread_count += 1;
        }

        let sanitized = sanitize_message(&msg, &self.inner.config.sanitize);
        let weak = Arc::downgrade(&self.inner);
        let ticket = self.inner.generation.ticket(&f.scope_id);
        let (owned_sid, message_id) = (sid.to_string(), msg.id.clone());
        f.enqueue(sid, "append_message", move |sharded| async move {
            let outcome = sharded.append_message(&owned_sid, &aid, &sanitized).await?;
            ticket.check()?;
            if let Some(inner) = weak.upgrade() {
                let mut f = inner.lock();
                if f.loaded.get(&owned_sid) == Some(&key) {
                    let view = f.views.entry(key).or_default();
                    if outcome.created_new_part && !view.loaded_parts.contains(&outcome.part_id) {
                        view.loaded_parts.push(outcome.part_id.clone());
                    }
                    view.message_parts.insert(message_id, outcome.part_id);
                }
            }
            Ok(())
        });
        f.persist();
        Some(msg)
    }

    /// Patch a message of the window. `None` when it is not loaded.
    pub fn update_message(&self, session_id: &str, message_id: &str, patch: MessagePatch) -> Option<Message> {
        let sid = clean_id(session_id)?;
        let mut f = self.inner.lock();
        let session = f.state.sessions.get_mut(sid)?;
        let idx = session.messages.iter().position(|m| m.id == message_id)?;
        let mut updated = session.messages[idx].clone();
        patch.apply(&mut updated);
        updated.ensure_id();
        if patch.raw_original.is_some() {
            self.save_raw_original(&f, &mut updated, sid);
        }
        if let Some(session) = f.state.sessions.get_mut(sid) {
            session.messages[idx] = updated.clone();
        }

        let aid = f.open_key(sid);
        let known_part = f
            .views
            .get(&thread_key(sid, &aid))
            .and_then(|v| v.message_parts.get(message_id))
            .cloned();
        let stored = MessagePatch::from_message(&sanitize_message(&updated, &self.inner.config.sanitize));
        let (owned_sid, target) = (sid.to_string(), message_id.to_string());
        f.enqueue(sid, "update_message", move |sharded| async move {
            sharded
                .update_message(&owned_sid, &aid, &target, &stored, known_part.as_deref())
                .await
                .map(|_| ())
        });
        f.persist();
        Some(updated)
    }

    /// Delete a message of the window along with its raw reply. A read
    /// pointer on the deleted message moves to its predecessor.
    pub fn delete_message(&self, session_id: &str, message_id: &str) -> bool {
        let (Some(sid), Some(target_id)) = (clean_id(session_id), clean_id(message_id)) else {
            return false;
        };
        let mut f = self.inner.lock();
        let Some(session) = f.state.sessions.get_mut(sid) else {
            return false;
        };
        let Some(idx) = session.messages.iter().position(|m| m.id == target_id) else {
            return false;
        };
        let target = session.messages.remove(idx);

        if target.role == Role::Assistant && session.unread_count > 0 {
            session.unread_count -= 1;
        }
        if session.last_read_message_id == target_id {
            let fallback = idx
                .checked_sub(1)
                .and_then(|i| session.messages.get(i))
                .or_else(|| session.messages.last());
            match fallback {
                Some(m) => {
                    session.last_read_message_id = m.id.clone();
                    session.last_read_at = Some(if m.timestamp > 0 { m.timestamp } else { now_millis() });
                }
                None => {
                    session.last_read_message_id.clear();
                    session.last_read_at = Some(0);
                }
            }
        }

        self.delete_raw_original(&f, &target, sid);
        let aid = f.open_key(sid);
        let known_part = f
            .views
            .get_mut(&thread_key(sid, &aid))
            .and_then(|v| v.message_parts.remove(target_id));
        let (owned_sid, owned_target) = (sid.to_string(), target_id.to_string());
        f.enqueue(sid, "delete_message", move |sharded| async move {
            sharded
                .delete_message(&owned_sid, &aid, &owned_target, known_part.as_deref())
                .await
                .map(|_| ())
        });
        f.persist();
        true
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Read tracking
    // ═══════════════════════════════════════════════════════════════════

    /// Mark `message_id` (or the last message) as read and zero the unread
    /// count.
    pub fn mark_read(&self, session_id: &str, message_id: Option<&str>) -> bool {
        let Some(sid) = clean_id(session_id) else {
            return false;
        };
        let mut f = self.inner.lock();
        let (read_id, read_at) = match message_id.and_then(clean_id) {
            Some(mid) => {
                let at = f
                    .state
                    .sessions
                    .get(sid)
                    .and_then(|s| s.find_message(mid))
                    .map(|m| m.timestamp)
                    .filter(|ts| *ts > 0)
                    .unwrap_or_else(now_millis);
                (mid.to_string(), at)
            }
            None => {
                let Some(last) = f.last_message(sid).filter(|m| !m.id.is_empty()) else {
                    return false;
                };
                let at = if last.timestamp > 0 { last.timestamp } else { now_millis() };
                (last.id, at)
            }
        };
        let session = f.ensure_session(sid);
        session.last_read_message_id = read_id;
        session.unread_count = 0;
        session.last_read_at = Some(read_at);
        f.persist();
        true
    }

    pub fn last_read_message_id(&self, session_id: &str) -> String {
        self.inner
            .lock()
            .state
            .sessions
            .get(session_id.trim())
            .map(|s| s.last_read_message_id.clone())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, session_id: &str) -> u32 {
        let f = self.inner.lock();
        let Some(session) = f.state.sessions.get(session_id.trim()) else {
            return 0;
        };
        if f.is_sharded_session(session_id.trim()) {
            return session.unread_count;
        }
        let from = Self::read_index(session).map_or(0, |i| i + 1);
        session.messages[from..]
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count() as u32
    }

    fn read_index(session: &SessionState) -> Option<usize> {
        let read_id = clean_id(&session.last_read_message_id)?;
        session.messages.iter().position(|m| m.id == read_id)
    }

    /// First assistant message after the read pointer.
    ///
    /// When the pointer lies outside the loaded window, falls back to the
    /// read time, then to counting `unread_count` assistant messages back
    /// from the end.
    pub fn first_unread_message_id(&self, session_id: &str) -> Option<String> {
        let f = self.inner.lock();
        let session = f.state.sessions.get(session_id.trim())?;
        let msgs = &session.messages;
        let start = Self::read_index(session);
        let is_assistant = |m: &&Message| m.role == Role::Assistant;

        if f.is_sharded_session(session_id.trim()) && start.is_none() {
            let unread = session.unread_count as usize;
            if unread == 0 {
                return None;
            }
            let read_at = session.last_read_at.unwrap_or(0);
            if read_at > 0 {
                if let Some(m) = msgs.iter().filter(is_assistant).find(|m| m.timestamp > read_at) {
                    return Some(m.id.clone());
                }
            }
            return msgs
                .iter()
                .rev()
                .filter(is_assistant)
                .nth(unread - 1)
                .map(|m| m.id.clone());
        }

        let from = start.map_or(0, |i| i + 1);
        msgs[from..].iter().find(is_assistant).map(|m| m.id.clone())
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Archives
    // ═══════════════════════════════════════════════════════════════════

    /// Freeze the open conversation as an archive and return its id.
    ///
    /// While a live archive is attached its thread already holds the
    /// conversation, so its record is refreshed (timestamp, count, memory
    /// snapshot, optional rename) and its id returned, whatever
    /// `force_create` says. Otherwise a new archive takes over the current
    /// thread. `None` when there is nothing to archive.
    pub fn archive_current_messages(
        &self,
        session_id: &str,
        name: &str,
        force_create: bool,
        memory_table_snapshot: Option<Value>,
    ) -> Option<String> {
        let sid = clean_id(session_id)?;
        let mut f = self.inner.lock();
        f.state.sessions.get(sid)?;
        let open = f.open_key(sid);
        let total = f.thread_total(sid, &open);
        if total == 0 {
            return None;
        }
        let use_sharded = f.is_sharded_session(sid);
        let now = now_millis();
        let suffix = timestamp_suffix();
        let clean_name = name.trim();

        let session = f.state.sessions.get_mut(sid)?;
        if let Some(idx) = live_index(session) {
            let window = (!use_sharded).then(|| session.messages.clone());
            let archive = &mut session.archives[idx];
            archive.timestamp = now;
            archive.message_count = total;
            if memory_table_snapshot.is_some() {
                archive.memory_table_snapshot = memory_table_snapshot;
            }
            if !clean_name.is_empty() {
                archive.name = if has_date(clean_name) {
                    clean_name.to_string()
                } else {
                    format!("{clean_name}{suffix}")
                };
            }
            if let Some(window) = window {
                archive.messages = window;
            }
            let id = archive.id.clone();
            debug!(session_id = sid, archive_id = %id, force_create, "live archive refreshed");
            f.persist();
            return Some(id);
        }

        let archive_id = Uuid::now_v7().to_string();
        let base = if clean_name.is_empty() {
            DEFAULT_ARCHIVE_NAME
        } else {
            clean_name
        };
        let archive = Archive {
            id: archive_id.clone(),
            name: if has_date(base) {
                base.to_string()
            } else {
                format!("{base}{suffix}")
            },
            timestamp: now,
            message_count: total,
            summaries: session.detached_summaries.clone(),
            compacted_summary: session
                .compacted_summary
                .as_ref()
                .filter(|c| !c.text.trim().is_empty())
                .map(|c| CompactedSummary {
                    at: c.at,
                    text: c.text.trim().to_string(),
                    raw: None,
                }),
            compacted_summary_last_raw: None,
            memory_table_snapshot,
            messages: if use_sharded {
                Vec::new()
            } else {
                session.messages.clone()
            },
        };
        session.archives.push(archive);
        info!(session_id = sid, archive_id = %archive_id, total, "archive created");

        // The archive takes over the stored current thread.
        if let Some(sharded) = f.sharded_for(sid) {
            let ticket = self.inner.generation.ticket(&f.scope_id);
            let (owned_sid, owned_aid) = (sid.to_string(), archive_id.clone());
            let job = async move { sharded.clone_current_to_archive(&owned_sid, &owned_aid).await };
            f.empty_thread(Arc::downgrade(&self.inner), ticket, sid, "", "clone_current_to_archive", job);
        }
        f.persist();
        Some(archive_id)
    }

    /// Archive the conversation (if any) and start an empty detached one.
    /// Returns the archive id when something was archived.
    pub fn start_new_chat(
        &self,
        session_id: &str,
        archive_name: &str,
        memory_table_snapshot: Option<Value>,
    ) -> Option<String> {
        let sid = clean_id(session_id)?;
        let total = {
            let f = self.inner.lock();
            f.state.sessions.get(sid)?;
            f.thread_total(sid, &f.open_key(sid))
        };
        let archive_id = if total > 0 {
            self.archive_current_messages(sid, archive_name, true, memory_table_snapshot)
        } else {
            None
        };

        let mut f = self.inner.lock();
        let session = f.state.sessions.get_mut(sid)?;
        session.messages.clear();
        session.current_archive_id = None;
        session.detached_summaries.clear();
        session.compacted_summary = None;
        session.draft.clear();
        session.last_raw_response.clear();
        session.unread_count = 0;
        if f.is_sharded_session(sid) {
            let key = thread_key(sid, "");
            f.views.insert(key.clone(), ThreadView::default());
            f.loaded.insert(sid.to_string(), key);
        }
        f.persist();
        archive_id
    }

    /// Archive records, newest first, with counts refreshed from the
    /// sharded threads.
    pub fn archives(&self, session_id: &str) -> Vec<Archive> {
        let mut f = self.inner.lock();
        let sharded = f.sharded_for(session_id.trim());
        let Some(session) = f.state.sessions.get_mut(session_id.trim()) else {
            return Vec::new();
        };
        if let Some(sharded) = sharded {
            for archive in &mut session.archives {
                if let Some(thread) = sharded.thread(session_id.trim(), &archive.id) {
                    archive.message_count = thread.total;
                }
            }
        }
        let mut list = session.archives.clone();
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        list
    }

    /// Attach an archive as the live conversation and load its recent
    /// window. A non-empty open conversation is archived first.
    #[instrument(skip(self, memory_table_snapshot))]
    pub async fn load_archived_messages(
        &self,
        session_id: &str,
        archive_id: &str,
        memory_table_snapshot: Option<Value>,
    ) -> bool {
        let (Some(sid), Some(aid)) = (clean_id(session_id), clean_id(archive_id)) else {
            return false;
        };
        let ticket = self.ticket();
        let (total, detached) = {
            let f = self.inner.lock();
            let Some(session) = f.state.sessions.get(sid) else {
                return false;
            };
            if session.archive(aid).is_none() {
                return false;
            }
            (
                f.thread_total(sid, &f.open_key(sid)),
                session.live_archive_id().is_none(),
            )
        };
        if total > 0 {
            let auto_name = if detached { AUTO_ARCHIVE_NAME } else { "" };
            self.archive_current_messages(sid, auto_name, false, memory_table_snapshot);
        }

        let use_sharded = {
            let mut f = self.inner.lock();
            let use_sharded = f.is_sharded_session(sid);
            let Some(session) = f.state.sessions.get_mut(sid) else {
                return false;
            };
            session.current_archive_id = Some(aid.to_string());
            if !use_sharded {
                session.messages = session.archive(aid).map(|a| a.messages.clone()).unwrap_or_default();
            }
            use_sharded
        };

        if use_sharded {
            if let Err(err) = self.load_recent(sid, aid, &ticket).await {
                if !matches!(err, StoreError::StaleScope(_)) {
                    warn!(session_id = sid, archive_id = aid, %err, "loading archive failed");
                }
                return false;
            }
        }
        if ticket.is_stale() {
            return false;
        }
        self.inner.lock().persist();
        true
    }

    pub fn delete_archive(&self, session_id: &str, archive_id: &str) -> bool {
        let (Some(sid), Some(aid)) = (clean_id(session_id), clean_id(archive_id)) else {
            return false;
        };
        let mut f = self.inner.lock();
        let Some(session) = f.state.sessions.get_mut(sid) else {
            return false;
        };
        session.archives.retain(|a| a.id != aid);
        if session.live_archive_id() == Some(aid) {
            session.current_archive_id = None;
        }
        let key = thread_key(sid, aid);
        f.views.remove(&key);
        if f.loaded.get(sid) == Some(&key) {
            f.loaded.remove(sid);
        }
        let (owned_sid, owned_aid) = (sid.to_string(), aid.to_string());
        f.enqueue(sid, "delete_archive", move |sharded| async move {
            sharded.delete_archive(&owned_sid, &owned_aid).await
        });
        f.persist();
        true
    }

    /// The live archive pointer.
    pub fn current_archive_id(&self, session_id: &str) -> Option<String> {
        self.inner
            .lock()
            .state
            .sessions
            .get(session_id.trim())?
            .live_archive_id()
            .map(str::to_string)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Summaries
    // ═══════════════════════════════════════════════════════════════════
    //
    // Summary operations target the live archive when one is attached,
    // else the session's detached summaries.

    fn with_session<T>(&self, session_id: &str, f: impl FnOnce(&mut SessionState) -> Option<T>) -> Option<T> {
        let sid = clean_id(session_id)?;
        let mut facade = self.inner.lock();
        let out = f(facade.ensure_session(sid));
        if out.is_some() {
            facade.persist();
        }
        out
    }

    pub fn summaries(&self, session_id: &str) -> Vec<SummaryItem> {
        self.inner
            .lock()
            .state
            .sessions
            .get(session_id.trim())
            .map(|s| open_summaries(s).to_vec())
            .unwrap_or_default()
    }

    /// Replace the summary list. Blank items are dropped; a missing time
    /// becomes now.
    pub fn set_summaries(&self, session_id: &str, items: Vec<SummaryItem>) -> bool {
        let now = now_millis();
        let normalized: Vec<SummaryItem> = items
            .into_iter()
            .filter_map(|item| {
                let text = item.text.trim();
                (!text.is_empty()).then(|| SummaryItem::new(if item.at > 0 { item.at } else { now }, text))
            })
            .collect();
        self.with_session(session_id, |s| {
            *open_summaries_mut(s) = normalized;
            Some(())
        })
        .is_some()
    }

    pub fn add_summary(&self, session_id: &str, text: &str) -> bool {
        let Some(text) = clean_id(text) else {
            return false;
        };
        let item = SummaryItem::new(now_millis(), text);
        self.with_session(session_id, |s| {
            open_summaries_mut(s).push(item);
            Some(())
        })
        .is_some()
    }

    pub fn remove_last_summary(&self, session_id: &str) -> bool {
        self.with_session(session_id, |s| open_summaries_mut(s).pop().map(|_| ()))
            .is_some()
    }

    pub fn clear_summaries(&self, session_id: &str) -> bool {
        self.with_session(session_id, |s| {
            open_summaries_mut(s).clear();
            Some(())
        })
        .is_some()
    }

    /// Remove items matching on `at|text`.
    pub fn delete_summary_items(&self, session_id: &str, items: &[SummaryItem]) -> bool {
        let keys: HashSet<String> = items.iter().map(SummaryItem::key).collect();
        if keys.is_empty() {
            return false;
        }
        self.with_session(session_id, |s| {
            open_summaries_mut(s).retain(|item| !keys.contains(&item.key()));
            Some(())
        })
        .is_some()
    }

    /// Rewrite item texts. Updates need a time, the old text and a
    /// non-blank new text.
    pub fn update_summary_items(&self, session_id: &str, updates: &[SummaryUpdate]) -> bool {
        let rewrites: HashMap<String, String> = updates
            .iter()
            .filter(|u| u.at != 0 && !u.from_text.is_empty() && !u.to_text.trim().is_empty())
            .map(|u| (format!("{}|{}", u.at, u.from_text), u.to_text.trim().to_string()))
            .collect();
        if rewrites.is_empty() {
            return false;
        }
        self.with_session(session_id, |s| {
            for item in open_summaries_mut(s).iter_mut() {
                if let Some(text) = rewrites.get(&item.key()) {
                    item.text = text.clone();
                }
            }
            Some(())
        })
        .is_some()
    }

    pub fn compacted_summary(&self, session_id: &str) -> Option<CompactedSummary> {
        let f = self.inner.lock();
        let session = f.state.sessions.get(session_id.trim())?;
        let (summary, _) = open_compacted(session);
        let summary = summary?;
        let text = clean_id(&summary.text)?;
        Some(CompactedSummary {
            at: summary.at,
            text: text.to_string(),
            raw: summary.raw.clone(),
        })
    }

    /// Raw output behind the compacted summary, falling back to the last
    /// raw snapshot.
    pub fn compacted_summary_raw(&self, session_id: &str) -> Option<String> {
        let f = self.inner.lock();
        let session = f.state.sessions.get(session_id.trim())?;
        let (summary, last_raw) = open_compacted(session);
        summary
            .and_then(|c| c.raw.as_deref())
            .filter(|r| !r.trim().is_empty())
            .or_else(|| last_raw.map(|r| r.raw.as_str()).filter(|r| !r.trim().is_empty()))
            .map(str::to_string)
    }

    /// Set the compacted summary. `raw: None` keeps the previous raw.
    pub fn set_compacted_summary(&self, session_id: &str, text: &str, at: Option<i64>, raw: Option<String>) -> bool {
        let Some(text) = clean_id(text) else {
            return false;
        };
        let at = at.filter(|t| *t > 0).unwrap_or_else(now_millis);
        self.with_session(session_id, |s| {
            let (summary, _) = open_compacted_mut(s);
            let raw = raw.or_else(|| summary.as_ref().and_then(|c| c.raw.clone()));
            *summary = Some(CompactedSummary {
                at,
                text: text.to_string(),
                raw,
            });
            Some(())
        })
        .is_some()
    }

    pub fn set_compacted_summary_raw(&self, session_id: &str, raw: &str, at: Option<i64>) -> bool {
        let Some(raw) = clean_id(raw) else {
            return false;
        };
        let at = at.filter(|t| *t > 0).unwrap_or_else(now_millis);
        self.with_session(session_id, |s| {
            let (_, last_raw) = open_compacted_mut(s);
            *last_raw = Some(RawSnapshot {
                at,
                raw: raw.to_string(),
            });
            Some(())
        })
        .is_some()
    }

    pub fn clear_compacted_summary(&self, session_id: &str) -> bool {
        self.with_session(session_id, |s| {
            let (summary, last_raw) = open_compacted_mut(s);
            *summary = None;
            *last_raw = None;
            Some(())
        })
        .is_some()
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Session fields
    // ═══════════════════════════════════════════════════════════════════

    pub fn draft(&self, session_id: &str) -> String {
        self.inner
            .lock()
            .state
            .sessions
            .get(session_id.trim())
            .map(|s| s.draft.clone())
            .unwrap_or_default()
    }

    pub fn set_draft(&self, session_id: &str, text: &str) -> bool {
        self.with_session(session_id, |s| {
            s.draft = text.to_string();
            Some(())
        })
        .is_some()
    }

    pub fn variable(&self, session_id: &str, key: &str) -> Option<Value> {
        self.inner
            .lock()
            .state
            .sessions
            .get(session_id.trim())?
            .variables
            .get(key)
            .cloned()
    }

    pub fn set_variable(&self, session_id: &str, key: &str, value: Value) -> bool {
        self.with_session(session_id, |s| {
            s.variables.insert(key.to_string(), value);
            Some(())
        })
        .is_some()
    }

    pub fn variables(&self, session_id: &str) -> BTreeMap<String, Value> {
        self.inner
            .lock()
            .state
            .sessions
            .get(session_id.trim())
            .map(|s| s.variables.clone())
            .unwrap_or_default()
    }

    pub fn delete_variable(&self, session_id: &str, key: &str) -> bool {
        let Some(key) = clean_id(key) else {
            return false;
        };
        self.with_session(session_id, |s| s.variables.remove(key).map(|_| ()))
            .is_some()
    }

    pub fn clear_variables(&self, session_id: &str) -> bool {
        self.with_session(session_id, |s| {
            s.variables.clear();
            Some(())
        })
        .is_some()
    }

    pub fn settings(&self, session_id: &str) -> Option<SessionSettings> {
        self.inner
            .lock()
            .state
            .sessions
            .get(session_id.trim())
            .map(|s| s.settings.clone())
    }

    pub fn set_settings(&self, session_id: &str, settings: SessionSettings) -> bool {
        self.with_session(session_id, |s| {
            s.settings = settings;
            Some(())
        })
        .is_some()
    }

    pub fn persona_lock(&self, session_id: &str) -> Option<String> {
        self.inner
            .lock()
            .state
            .sessions
            .get(session_id.trim())?
            .settings
            .persona_lock_id
            .clone()
            .filter(|id| !id.trim().is_empty())
    }

    pub fn set_persona_lock(&self, session_id: &str, persona_id: &str) -> bool {
        let Some(persona_id) = clean_id(persona_id) else {
            return false;
        };
        self.with_session(session_id, |s| {
            s.settings.persona_lock_id = Some(persona_id.to_string());
            Some(())
        })
        .is_some()
    }

    pub fn clear_persona_lock(&self, session_id: &str) -> bool {
        self.with_session(session_id, |s| {
            s.settings.persona_lock_id = None;
            Some(())
        })
        .is_some()
    }

    /// Keep the tail of a raw model response.
    pub fn set_last_raw_response(&self, session_id: &str, text: &str) -> bool {
        let max = self.inner.config.sanitize.max_last_raw_chars;
        let chars = text.chars().count();
        let kept: String = if chars > max {
            text.chars().skip(chars - max).collect()
        } else {
            text.to_string()
        };
        self.with_session(session_id, |s| {
            s.last_raw_response = kept;
            s.last_raw_at = now_millis();
            Some(())
        })
        .is_some()
    }

    pub fn last_raw_response(&self, session_id: &str) -> String {
        self.inner
            .lock()
            .state
            .sessions
            .get(session_id.trim())
            .map(|s| s.last_raw_response.clone())
            .unwrap_or_default()
    }

    pub fn last_raw_at(&self, session_id: &str) -> i64 {
        self.inner
            .lock()
            .state
            .sessions
            .get(session_id.trim())
            .map_or(0, |s| s.last_raw_at)
    }

    // ── pending queue ────────────────────────────────────────────────

    /// Queue a composed message without sending it.
    pub fn add_pending_message(&self, session_id: &str, message: Message) -> Option<Message> {
        let mut msg = message;
        msg.status = Some("pending".into());
        msg.ensure_id();
        let stored = msg.clone();
        self.with_session(session_id, |s| {
            s.pending.push(stored);
            Some(())
        })?;
        Some(msg)
    }

    pub fn pending_messages(&self, session_id: &str) -> Vec<Message> {
        self.inner
            .lock()
            .state
            .sessions
            .get(session_id.trim())
            .map(|s| s.pending.clone())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .state
            .sessions
            .get(session_id.trim())
            .map_or(0, |s| s.pending.len())
    }

    pub fn remove_pending_message(&self, session_id: &str, message_id: &str) -> bool {
        let Some(target) = clean_id(message_id) else {
            return false;
        };
        let Some(sid) = clean_id(session_id) else {
            return false;
        };
        let mut f = self.inner.lock();
        let Some(session) = f.state.sessions.get_mut(sid) else {
            return false;
        };
        let before = session.pending.len();
        session.pending.retain(|m| m.id != target);
        let changed = session.pending.len() != before;
        if changed {
            f.persist();
        }
        changed
    }

    pub fn update_pending_message(&self, session_id: &str, message_id: &str, content: &str) -> Option<Message> {
        let sid = clean_id(session_id)?;
        let mut f = self.inner.lock();
        let session = f.state.sessions.get_mut(sid)?;
        let msg = session.pending.iter_mut().find(|m| m.id == message_id)?;
        msg.content = content.to_string();
        msg.timestamp = now_millis();
        let updated = msg.clone();
        f.persist();
        Some(updated)
    }

    pub fn clear_pending_messages(&self, session_id: &str) -> bool {
        let Some(sid) = clean_id(session_id) else {
            return false;
        };
        let mut f = self.inner.lock();
        let Some(session) = f.state.sessions.get_mut(sid) else {
            return false;
        };
        session.pending.clear();
        f.persist();
        true
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Raw replies
    // ═══════════════════════════════════════════════════════════════════

    fn save_raw_original(&self, f: &Facade, msg: &mut Message, session_id: &str) {
        if msg.role != Role::Assistant || !msg.has_raw_original() {
            return;
        }
        let Some(backend) = self.inner.backend.clone() else {
            return;
        };
        let Some(reference) = ensure_raw_ref(msg, session_id) else {
            return;
        };
        let text = msg.raw_original.clone().unwrap_or_default();
        f.parts.queue.enqueue("save_raw_reply", async move {
            backend
                .save_raw_reply(&reference.session_id, &reference.message_id, &text)
                .await
        });
    }

    fn delete_raw_original(&self, f: &Facade, msg: &Message, session_id: &str) {
        let Some(backend) = self.inner.backend.clone() else {
            return;
        };
        let reference = msg.raw_original_ref.clone().unwrap_or_else(|| RawReplyRef {
            session_id: session_id.to_string(),
            message_id: msg.id.clone(),
        });
        if reference.session_id.is_empty() || reference.message_id.is_empty() {
            return;
        }
        f.parts.queue.enqueue("delete_raw_reply", async move {
            backend
                .delete_raw_reply(&reference.session_id, &reference.message_id)
                .await
        });
    }

    /// Full provider output of a loaded message, fetched from side storage
    /// when not in memory.
    pub async fn load_raw_original(&self, session_id: &str, message_id: &str) -> Option<String> {
        let sid = clean_id(session_id)?;
        let reference = {
            let mut f = self.inner.lock();
            let msg = f
                .state
                .sessions
                .get_mut(sid)?
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)?;
            if msg.has_raw_original() {
                return msg.raw_original.clone();
            }
            ensure_raw_ref(msg, sid)?
        };
        let backend = self.inner.backend.clone()?;
        let loaded = match backend
            .load_raw_reply(&reference.session_id, &reference.message_id)
            .await
        {
            Ok(Some(text)) if !text.trim().is_empty() => text,
            Ok(_) => return None,
            Err(err) => {
                debug!(message_id, %err, "raw reply unavailable");
                return None;
            }
        };
        let mut f = self.inner.lock();
        if let Some(msg) = f
            .state
            .sessions
            .get_mut(sid)
            .and_then(|s| s.messages.iter_mut().find(|m| m.id == message_id))
        {
            msg.raw_original = Some(loaded.clone());
        }
        Some(loaded)
    }

    /// Load raw originals of the newest rich assistant replies of the
    /// window. Returns how many were found.
    pub async fn prefetch_raw_originals(&self, session_id: &str) -> usize {
        let limit = self.inner.config.sanitize.raw_original_autoload;
        let ids: Vec<String> = {
            let f = self.inner.lock();
            let Some(session) = f.state.sessions.get(session_id.trim()) else {
                return 0;
            };
            session
                .messages
                .iter()
                .rev()
                .filter(|m| m.is_rich_assistant() && !m.has_raw_original() && !m.id.is_empty())
                .take(limit)
                .map(|m| m.id.clone())
                .collect()
        };
        join_all(ids.iter().map(|id| self.load_raw_original(session_id, id)))
            .await
            .into_iter()
            .flatten()
            .count()
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Scope and lifecycle
    // ═══════════════════════════════════════════════════════════════════

    /// Switch to another scope: invalidate outstanding work, flush the
    /// outgoing scope, then hydrate the new one.
    #[instrument(skip(self))]
    pub async fn set_scope(&self, scope: &str) -> bool {
        let next = normalize_scope_id(scope);
        let (previous, old) = {
            let f = self.inner.lock();
            (f.scope_id.clone(), Arc::clone(&f.parts))
        };
        if next == previous {
            return true;
        }
        info!(from = %previous, to = %next, "switching chat scope");

        self.inner.generation.advance();
        old.queue.drain().await;
        old.scheduler.flush().await;
        if let Some(sharded) = &old.sharded {
            sharded.write_index().await;
        }
        old.scheduler.cancel();
        old.queue.close();

        let ticket = self.inner.generation.ticket(&next);
        let parts = build_parts(
            &Arc::downgrade(&self.inner),
            &self.inner.config,
            self.inner.backend.as_ref(),
            &self.inner.fast,
            &next,
            ticket,
        );
        {
            let mut f = self.inner.lock();
            *f = Facade::new(next, self.inner.config.session_defaults.clone(), parts);
        }
        self.hydrate().await
    }

    /// Run every queued write, persist both tiers and the index.
    pub async fn flush(&self) {
        let (parts, use_sharded) = {
            let f = self.inner.lock();
            (Arc::clone(&f.parts), f.use_sharded)
        };
        parts.queue.drain().await;
        parts.scheduler.flush().await;
        if use_sharded {
            if let Some(sharded) = &parts.sharded {
                sharded.write_index().await;
            }
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::PartLimits;
    use crate::fast_cache::LocalCache;
    use serde_json::json;

    fn config() -> StoreConfig {
        StoreConfig {
            parts: PartLimits {
                message_limit: 2,
                char_limit: 10_000,
                recent_parts: 2,
            },
            ..StoreConfig::default()
        }
    }

    fn cache() -> Arc<LocalCache> {
        Arc::new(LocalCache::new("test", 1024 * 1024))
    }

    async fn sharded_store(backend: Arc<MemoryBackend>) -> ChatStore {
        let store = ChatStore::open(config(), Some(backend), cache(), "").await;
        assert!(store.is_sharded());
        store
    }

    fn user(id: &str, ts: i64) -> Message {
        Message::user(id).with_id(id).with_timestamp(ts)
    }

    fn assistant(id: &str, ts: i64) -> Message {
        Message::assistant(id).with_id(id).with_timestamp(ts)
    }

    #[tokio::test]
    async fn memory_only_store_keeps_messages() {
        let store = ChatStore::open(config(), None, cache(), "").await;
        assert!(!store.is_sharded());
        store.append_message("s", user("a", 1));
        store.append_message("s", assistant("b", 2));
        assert_eq!(store.messages("s").len(), 2);
        assert_eq!(store.unread_count("s"), 1);
        assert_eq!(store.first_unread_message_id("s").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn appends_reach_the_sharded_store() {
        let backend = Arc::new(MemoryBackend::new());
        let store = sharded_store(backend.clone()).await;
        for i in 0..5 {
            store.append_message("s", user(&format!("m{i}"), i + 1));
        }
        store.flush().await;

        let restarted = sharded_store(backend).await;
        restarted.switch_session("s");
        let window = restarted.ensure_recent_messages_loaded("s", None).await;
        // The two newest parts: [m2, m3] and [m4].
        let ids: Vec<_> = window.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
        assert!(restarted.has_older_messages("s", None));

        let older = restarted.load_older_messages("s", None, 1).await;
        let older_ids: Vec<_> = older.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(older_ids, vec!["m0", "m1"]);
        assert_eq!(restarted.messages("s").len(), 5);
        assert!(!restarted.has_older_messages("s", None));
        assert!(restarted.load_older_messages("s", None, 1).await.is_empty());
    }

    #[tokio::test]
    async fn delete_moves_read_pointer_back() {
        let store = ChatStore::open(config(), None, cache(), "").await;
        store.append_message("s", assistant("a", 1));
        store.append_message("s", assistant("b", 2));
        assert!(store.mark_read("s", Some("b")));
        assert_eq!(store.unread_count("s"), 0);

        assert!(store.delete_message("s", "b"));
        assert_eq!(store.last_read_message_id("s"), "a");
        assert!(!store.delete_message("s", "b"));
    }

    #[tokio::test]
    async fn first_unread_counts_back_when_pointer_is_outside_window() {
        let backend = Arc::new(MemoryBackend::new());
        let store = sharded_store(backend).await;
        store.append_message("s", assistant("a", 1));
        store.append_message("s", user("u", 2));
        store.append_message("s", assistant("b", 3));
        store.append_message("s", assistant("c", 4));
        assert_eq!(store.unread_count("s"), 3);
        // No read pointer, no read time: count back three replies.
        assert_eq!(store.first_unread_message_id("s").as_deref(), Some("a"));

        store.mark_read("s", Some("gone"));
        assert_eq!(store.first_unread_message_id("s"), None);
    }

    #[tokio::test]
    async fn archive_and_reload() {
        let backend = Arc::new(MemoryBackend::new());
        let store = sharded_store(backend).await;
        store.switch_session("s");
        store.append_message("s", user("a", 1));
        store.append_message("s", assistant("b", 2));
        store.add_summary("s", "first half");

        let archive_id = store.start_new_chat("s", "Trip", None).unwrap();
        assert!(store.messages("s").is_empty());
        assert!(store.summaries("s").is_empty());
        store.flush().await;

        let archives = store.archives("s");
        assert_eq!(archives.len(), 1);
        assert_eq!(archives[0].message_count, 2);
        assert!(archives[0].name.starts_with("Trip ("));
        assert_eq!(archives[0].summaries[0].text, "first half");

        assert!(store.load_archived_messages("s", &archive_id, None).await);
        assert_eq!(store.current_archive_id("s").as_deref(), Some(archive_id.as_str()));
        assert_eq!(store.messages("s").len(), 2);
        assert_eq!(store.summaries("s")[0].text, "first half");

        // Appends go to the live archive.
        store.append_message("s", user("c", 3));
        store.flush().await;
        assert_eq!(store.archives("s")[0].message_count, 3);

        assert!(store.delete_archive("s", &archive_id));
        assert!(store.current_archive_id("s").is_none());
    }

    #[tokio::test]
    async fn dated_names_are_left_alone() {
        let store = ChatStore::open(config(), None, cache(), "").await;
        store.append_message("s", user("a", 1));
        let id = store
            .archive_current_messages("s", "Notes 2024/05/01", false, Some(json!({"rows": 1})))
            .unwrap();
        let archive = store.archives("s").into_iter().find(|a| a.id == id).unwrap();
        assert_eq!(archive.name, "Notes 2024/05/01");
        assert_eq!(archive.memory_table_snapshot, Some(json!({"rows": 1})));
        assert_eq!(archive.messages.len(), 1);
        assert!(store.archive_current_messages("empty", "", false, None).is_none());
    }

    #[tokio::test]
    async fn summary_operations() {
        let store = ChatStore::open(config(), None, cache(), "").await;
        store.set_summaries(
            "s",
            vec![SummaryItem::new(5, " one "), SummaryItem::new(0, "two"), SummaryItem::new(7, "  ")],
        );
        let list = store.summaries("s");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0], SummaryItem::new(5, "one"));
        assert!(list[1].at > 0);

        assert!(store.update_summary_items(
            "s",
            &[SummaryUpdate {
                at: 5,
                from_text: "one".into(),
                to_text: "uno".into(),
            }]
        ));
        assert_eq!(store.summaries("s")[0].text, "uno");
        assert!(store.delete_summary_items("s", &[SummaryItem::new(5, "uno")]));
        assert_eq!(store.summaries("s").len(), 1);
        assert!(store.remove_last_summary("s"));
        assert!(!store.remove_last_summary("s"));

        assert!(store.set_compacted_summary("s", "short", Some(9), Some("raw-1".into())));
        assert!(store.set_compacted_summary("s", "shorter", None, None));
        let compacted = store.compacted_summary("s").unwrap();
        assert_eq!(compacted.text, "shorter");
        assert_eq!(compacted.raw.as_deref(), Some("raw-1"));
        assert!(store.clear_compacted_summary("s"));
        assert!(store.set_compacted_summary_raw("s", "fallback", None));
        assert_eq!(store.compacted_summary_raw("s").as_deref(), Some("fallback"));
    }

    #[tokio::test]
    async fn session_fields_and_pending_queue() {
        let store = ChatStore::open(config(), None, cache(), "").await;
        assert!(store.set_draft("s", "half a thought"));
        assert!(store.set_variable("s", "mood", json!("calm")));
        assert_eq!(store.variable("s", "mood"), Some(json!("calm")));
        assert!(store.delete_variable("s", "mood"));
        assert!(!store.delete_variable("s", "mood"));
        assert!(store.set_persona_lock("s", "p1"));
        assert_eq!(store.persona_lock("s").as_deref(), Some("p1"));
        assert!(!store.set_persona_lock("s", " "));
        assert!(store.clear_persona_lock("s"));
        assert!(store.persona_lock("s").is_none());

        let long = "x".repeat(store.config().sanitize.max_last_raw_chars + 5);
        store.set_last_raw_response("s", &long);
        assert_eq!(
            store.last_raw_response("s").chars().count(),
            store.config().sanitize.max_last_raw_chars
        );
        assert!(store.last_raw_at("s") > 0);

        let pending = store.add_pending_message("s", Message::user("later")).unwrap();
        assert_eq!(pending.status.as_deref(), Some("pending"));
        let edited = store.update_pending_message("s", &pending.id, "sooner").unwrap();
        assert_eq!(edited.content, "sooner");
        assert_eq!(store.pending_count("s"), 1);
        assert!(store.remove_pending_message("s", &pending.id));
        assert!(store.clear_pending_messages("s"));
        assert_eq!(store.pending_count("s"), 0);
    }

    #[tokio::test]
    async fn rename_and_delete_sessions() {
        let store = ChatStore::open(config(), None, cache(), "").await;
        store.switch_session("a");
        store.append_message("a", user("m1", 10));
        store.append_message("b", user("m2", 20));
        assert!(!store.rename_session("a", "b"));
        assert!(store.rename_session("a", "c"));
        assert_eq!(store.current_id(), "c");
        assert_eq!(store.list_sessions(), vec!["b", "c"]);

        assert!(store.delete_session("c"));
        assert_eq!(store.current_id(), "b");
        assert!(!store.has_session("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn hydrate_retries_and_migrates_legacy_document_once() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_kv(
            BASE_STORE_KEY,
            json!({
                "sessions": {"s": {"messages": [
                    {"id": "m1", "role": "user", "content": "hi", "timestamp": 1},
                    {"id": "m2", "role": "assistant", "content": "hello", "timestamp": 2}
                ]}},
                "currentId": "s"
            }),
        );
        backend.unavailable_for(2);

        let store = ChatStore::open(config(), Some(backend.clone()), cache(), "").await;
        assert!(store.is_sharded());
        assert_eq!(store.messages("s").len(), 2);
        store.flush().await;
        let writes = backend.part_writes();

        // The flat document no longer embeds bodies.
        let doc = backend.kv_document(BASE_STORE_KEY).unwrap();
        assert!(doc["sessions"]["s"].get("messages").is_none_or(|m| m.as_array().is_some_and(Vec::is_empty)));

        let again = ChatStore::open(config(), Some(backend.clone()), cache(), "").await;
        assert_eq!(again.messages("s").len(), 2);
        assert_eq!(backend.part_writes(), writes);
    }

    #[tokio::test]
    async fn quota_failure_keeps_disk_persistence() {
        let backend = Arc::new(MemoryBackend::new());
        let tiny = Arc::new(LocalCache::new("tiny", 16));
        let store = ChatStore::open(config(), Some(backend.clone()), tiny, "").await;
        store.append_message("s", user("hello there", 1));
        store.flush().await;

        assert!(store.fast_tier_disabled());
        let doc = backend.kv_document(BASE_STORE_KEY).unwrap();
        assert!(doc["sessions"].get("s").is_some());
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ChatStore::open(config(), Some(backend.clone()), cache(), "alice").await;
        store.switch_session("s");
        store.append_message("s", user("a1", 1));

        assert!(store.set_scope("bob").await);
        assert_eq!(store.scope_id(), "bob");
        assert!(!store.has_session("s"));
        store.switch_session("s");
        store.append_message("s", user("b1", 2));
        store.flush().await;

        assert!(store.set_scope("alice").await);
        let ids: Vec<_> = store.messages("s").into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a1"]);
    }

    #[tokio::test]
    async fn results_for_a_stale_scope_are_dropped() {
        let backend = Arc::new(MemoryBackend::new());
        let seed = ChatStore::open(config(), Some(backend.clone()), cache(), "alice").await;
        seed.switch_session("s");
        seed.append_message("s", user("s1", 1));
        seed.append_message("t", user("t1", 2));
        seed.flush().await;

        let store = ChatStore::open(config(), Some(backend.clone()), cache(), "alice").await;
        backend.set_read_delay(std::time::Duration::from_millis(50));
        let (loaded, switched) = tokio::join!(
            store.ensure_recent_messages_loaded("t", None),
            store.set_scope("bob"),
        );
        assert!(switched);
        assert!(loaded.is_empty());
        assert!(!store.has_session("t"));
    }

    #[tokio::test]
    async fn updates_reach_the_stored_part() {
        let backend = Arc::new(MemoryBackend::new());
        let store = sharded_store(backend.clone()).await;
        store.switch_session("s");
        store.append_message("s", assistant("x", 1));
        let updated = store
            .update_message("s", "x", MessagePatch::content("edited").status("done"))
            .unwrap();
        assert_eq!(updated.content, "edited");
        assert!(store.update_message("s", "missing", MessagePatch::content("?")).is_none());
        store.flush().await;

        let restarted = sharded_store(backend).await;
        let stored = restarted.find_message("s", "x").unwrap();
        assert_eq!(stored.content, "edited");
        assert_eq!(stored.status.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn raw_originals_go_to_side_storage() {
        let backend = Arc::new(MemoryBackend::new());
        let store = sharded_store(backend.clone()).await;
        let mut reply = assistant("r", 1);
        reply.meta.render_rich = true;
        reply.raw_original = Some("<full>".into());
        store.append_message("s", reply);
        store.flush().await;
        assert_eq!(backend.raw_reply_count(), 1);

        let restarted = sharded_store(backend.clone()).await;
        restarted.switch_session("s");
        restarted.ensure_recent_messages_loaded("s", None).await;
        assert!(restarted.messages("s")[0].raw_original.is_none());
        assert_eq!(restarted.prefetch_raw_originals("s").await, 1);
        assert_eq!(restarted.messages("s")[0].raw_original.as_deref(), Some("<full>"));

        restarted.delete_message("s", "r");
        restarted.flush().await;
        assert_eq!(backend.raw_reply_count(), 0);
    }

    fn ids(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.id.clone()).collect()
    }

    #[tokio::test]
    async fn failed_migration_keeps_legacy_messages_for_the_next_hydration() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_kv(
            BASE_STORE_KEY,
            json!({
                "sessions": {"s": {"messages": [
                    {"id": "m1", "role": "user", "content": "hi", "timestamp": 1},
                    {"id": "m2", "role": "assistant", "content": "hello", "timestamp": 2}
                ]}},
                "currentId": "s"
            }),
        );
        backend.set_fail_part_writes(true);

        let store = ChatStore::open(config(), Some(backend.clone()), cache(), "").await;
        assert!(store.is_sharded());
        assert_eq!(ids(&store.messages("s")), vec!["m1", "m2"]);
        store.append_message("s", user("m3", 3));
        store.flush().await;

        assert_eq!(backend.part_count(), 0);
        let doc = backend.kv_document(BASE_STORE_KEY).unwrap();
        let kept = doc["sessions"]["s"]["messages"].as_array().map(Vec::len);
        assert_eq!(kept, Some(3));

        backend.set_fail_part_writes(false);
        let again = ChatStore::open(config(), Some(backend.clone()), cache(), "").await;
        assert_eq!(ids(&again.messages("s")), vec!["m1", "m2", "m3"]);
        again.flush().await;
        assert!(backend.part_count() > 0);
        let doc = backend.kv_document(BASE_STORE_KEY).unwrap();
        assert!(doc["sessions"]["s"].get("messages").is_none_or(|m| m.as_array().is_some_and(Vec::is_empty)));
    }

    #[tokio::test]
    async fn archiving_hands_the_window_to_the_archive() {
        let backend = Arc::new(MemoryBackend::new());
        let store = sharded_store(backend.clone()).await;
        store.switch_session("s");
        store.append_message("s", user("a", 1));
        store.append_message("s", assistant("b", 2));
        store.flush().await;

        let first = store.archive_current_messages("s", "one", false, None).unwrap();
        assert!(store.messages("s").is_empty());
        // Nothing left to archive, even before the move has run.
        assert!(store.archive_current_messages("s", "two", false, None).is_none());
        store.flush().await;

        let archives = store.archives("s");
        assert_eq!(archives.len(), 1);
        assert_eq!(archives[0].id, first);
        assert_eq!(archives[0].message_count, 2);

        store.append_message("s", user("c", 3));
        store.flush().await;
        assert_eq!(store.archives("s")[0].message_count, 2);

        let restarted = sharded_store(backend).await;
        let window = restarted.ensure_recent_messages_loaded("s", None).await;
        assert_eq!(ids(&window), vec!["c"]);
    }

    #[tokio::test]
    async fn stale_older_page_is_dropped() {
        let backend = Arc::new(MemoryBackend::new());
        let seed = ChatStore::open(config(), Some(backend.clone()), cache(), "alice").await;
        seed.switch_session("s");
        for i in 0..5 {
            seed.append_message("s", user(&format!("m{i}"), i + 1));
        }
        seed.flush().await;

        let store = ChatStore::open(config(), Some(backend.clone()), cache(), "alice").await;
        assert!(store.has_older_messages("s", None));
        backend.set_read_delay(std::time::Duration::from_millis(50));
        let (older, switched) = tokio::join!(
            store.load_older_messages("s", None, 1),
            store.set_scope("bob"),
        );
        assert!(switched);
        assert!(older.is_empty());
        assert!(!store.has_session("s"));

        backend.set_read_delay(std::time::Duration::ZERO);
        assert!(store.set_scope("alice").await);
        assert_eq!(ids(&store.messages("s")), vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn older_pages_cover_every_part_once_for_any_page_size() {
        let backend = Arc::new(MemoryBackend::new());
        let seed = sharded_store(backend.clone()).await;
        seed.switch_session("s");
        for i in 0..8 {
            seed.append_message("s", user(&format!("m{i}"), i + 1));
        }
        // Empties the second part, which is dropped.
        assert!(seed.delete_message("s", "m2"));
        assert!(seed.delete_message("s", "m3"));
        seed.flush().await;

        let one_part_window = StoreConfig {
            parts: PartLimits {
                recent_parts: 1,
                ..config().parts
            },
            ..config()
        };
        let expected = vec!["m0", "m1", "m4", "m5", "m6", "m7"];
        for page in 1..=4 {
            let store =
                ChatStore::open(one_part_window.clone(), Some(backend.clone()), cache(), "").await;
            let mut seen = ids(&store.ensure_recent_messages_loaded("s", None).await);
            while store.has_older_messages("s", None) {
                let older = store.load_older_messages("s", None, page).await;
                assert!(!older.is_empty(), "page size {page} stalled");
                let mut merged = ids(&older);
                merged.extend(seen);
                seen = merged;
            }
            assert_eq!(seen, expected, "page size {page}");
            assert_eq!(ids(&store.messages("s")), expected, "page size {page}");
            assert!(store.load_older_messages("s", None, page).await.is_empty());
        }
    }
}
