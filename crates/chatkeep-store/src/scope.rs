//! Scope ids and staleness tickets.
//!
//! A store serves one scope (user profile, workspace) at a time. Every
//! async operation captures a [`ScopeTicket`] when it starts; switching
//! scope advances the shared generation, so results computed for the old
//! scope can be recognized and dropped before they are committed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{StoreError, StoreResult};

/// Key of the flat chat document.
pub const BASE_STORE_KEY: &str = "chat_store_v1";

/// Fast-cache marker set once unscoped data has been adopted by a scope.
pub const LEGACY_ADOPTED_KEY: &str = "chat_store_v1__scoped_migrated";

const MAX_SCOPE_CHARS: usize = 64;

/// Trim, replace anything outside `[a-zA-Z0-9_-]` with `_`, cap at 64 chars.
pub fn normalize_scope_id(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_SCOPE_CHARS)
        .collect()
}

/// `base__scope`, or `base` for the default (empty) scope.
pub fn make_scoped_key(base: &str, scope_id: &str) -> String {
    let scope = normalize_scope_id(scope_id);
    if scope.is_empty() {
        base.to_string()
    } else {
        format!("{base}__{scope}")
    }
}

/// Monotonic scope generation shared by a store and its tickets.
#[derive(Debug, Clone, Default)]
pub struct ScopeGeneration {
    counter: Arc<AtomicU64>,
}

impl ScopeGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate every outstanding ticket.
    pub fn advance(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn ticket(&self, scope_id: &str) -> ScopeTicket {
        ScopeTicket {
            generation: self.current(),
            scope_id: scope_id.to_string(),
            counter: Arc::clone(&self.counter),
        }
    }
}

/// Proof of the scope an operation started under.
#[derive(Debug, Clone)]
pub struct ScopeTicket {
    generation: u64,
    scope_id: String,
    counter: Arc<AtomicU64>,
}

impl ScopeTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn is_stale(&self) -> bool {
        self.counter.load(Ordering::SeqCst) != self.generation
    }

    /// `Err(StaleScope)` once the scope has moved on.
    pub fn check(&self) -> StoreResult<()> {
        if self.is_stale() {
            Err(StoreError::StaleScope(self.scope_id.clone()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_replaces_unsafe_chars() {
        assert_eq!(normalize_scope_id("  alice@home  "), "alice_home");
        assert_eq!(normalize_scope_id("ok_id-1"), "ok_id-1");
        assert_eq!(normalize_scope_id("   "), "");
        assert_eq!(normalize_scope_id("配置"), "__");
        assert_eq!(normalize_scope_id(&"x".repeat(80)).len(), 64);
    }

    #[test]
    fn scoped_key_keeps_base_for_default_scope() {
        assert_eq!(make_scoped_key(BASE_STORE_KEY, ""), "chat_store_v1");
        assert_eq!(make_scoped_key(BASE_STORE_KEY, "work"), "chat_store_v1__work");
        assert_eq!(make_scoped_key(BASE_STORE_KEY, "a b"), "chat_store_v1__a_b");
    }

    #[test]
    fn advancing_invalidates_old_tickets() {
        let generation = ScopeGeneration::new();
        let old = generation.ticket("a");
        assert!(!old.is_stale());
        assert!(old.check().is_ok());

        generation.advance();
        let fresh = generation.ticket("b");
        assert!(old.is_stale());
        assert!(matches!(old.check(), Err(StoreError::StaleScope(s)) if s == "a"));
        assert!(!fresh.is_stale());
    }
}
