//! Error types for the chatkeep-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].
//! Uses `thiserror` for ergonomic, zero-cost error definitions.
//!
//! Most of these never reach callers of [`crate::ChatStore`]: background
//! persistence is best-effort, so failures are logged at the PartStore /
//! index boundary and the facade reports misses as `None` / `false`.

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No disk backend is reachable (yet). The store keeps running in
    /// memory-only mode.
    #[error("disk backend unavailable")]
    BackendUnavailable,

    /// The disk backend rejected or failed a command.
    #[error("backend error: {0}")]
    Backend(String),

    /// The fast cache tier ran out of space.
    #[error("fast cache quota exceeded ({size} bytes > {quota} bytes)")]
    QuotaExceeded { size: usize, quota: u64 },

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration of the SQLite backend failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// The requested record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was started under a scope that is no longer active.
    #[error("stale scope: operation started under '{0}'")]
    StaleScope(String),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),

    /// Cache operation failed.
    #[error("cache error: {0}")]
    Cache(String),

    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether retrying later (once the backend shows up) could succeed.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable)
    }

    /// Whether this is a fast-tier quota failure.
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_display_includes_sizes() {
        let err = StoreError::QuotaExceeded {
            size: 2048,
            quota: 1024,
        };
        assert_eq!(
            err.to_string(),
            "fast cache quota exceeded (2048 bytes > 1024 bytes)"
        );
        assert!(err.is_quota());
        assert!(!err.is_unavailable());
    }

    #[test]
    fn not_found_display() {
        let err = StoreError::NotFound {
            entity: "part",
            id: "part_0003".into(),
        };
        assert_eq!(err.to_string(), "part not found: part_0003");
    }
}
