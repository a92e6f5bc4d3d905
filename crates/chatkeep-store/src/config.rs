//! Store configuration.
//!
//! Every knob has a default, so an empty or missing `chatkeep.toml` yields
//! a fully working store. Sections mirror the components they tune:
//!
//! ```toml
//! data_dir = "data"
//!
//! [parts]
//! message_limit = 160
//! char_limit = 320000
//! recent_parts = 2
//!
//! [persist]
//! fast_debounce_ms = 50
//! slow_debounce_ms = 2000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};

/// Top-level configuration for a [`crate::ChatStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding `chatkeep.db` for the SQLite backend.
    pub data_dir: PathBuf,
    pub parts: PartLimits,
    pub persist: PersistConfig,
    pub fast_cache: FastCacheConfig,
    pub sanitize: SanitizeLimits,
    pub session_defaults: SessionDefaults,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            parts: PartLimits::default(),
            persist: PersistConfig::default(),
            fast_cache: FastCacheConfig::default(),
            sanitize: SanitizeLimits::default(),
            session_defaults: SessionDefaults::default(),
        }
    }
}

impl StoreConfig {
    /// Read a TOML config file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml(&content)?;
        info!(path = %path.display(), "store config loaded");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> StoreResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| StoreError::Config(format!("failed to parse TOML config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the SQLite database inside `data_dir`.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("chatkeep.db")
    }

    fn validate(&self) -> StoreResult<()> {
        if self.parts.message_limit == 0 {
            return Err(StoreError::Config("parts.message_limit must be at least 1".into()));
        }
        if self.parts.char_limit == 0 {
            return Err(StoreError::Config("parts.char_limit must be at least 1".into()));
        }
        if self.parts.recent_parts == 0 {
            return Err(StoreError::Config("parts.recent_parts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Sharding limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartLimits {
    /// Max messages per part.
    pub message_limit: usize,
    /// Max characters per part, unless the part is empty.
    pub char_limit: usize,
    /// Parts materialized when a thread is opened.
    pub recent_parts: usize,
}

impl Default for PartLimits {
    fn default() -> Self {
        Self {
            message_limit: 160,
            char_limit: 320_000,
            recent_parts: 2,
        }
    }
}

/// Persistence cadence and hydration retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub fast_debounce_ms: u64,
    pub slow_debounce_ms: u64,
    pub hydrate_retries: u32,
    /// Linear backoff step; attempt `n` waits `n * hydrate_backoff_ms`.
    pub hydrate_backoff_ms: u64,
}

impl PersistConfig {
    pub fn fast_debounce(&self) -> Duration {
        Duration::from_millis(self.fast_debounce_ms)
    }

    pub fn slow_debounce(&self) -> Duration {
        Duration::from_millis(self.slow_debounce_ms)
    }

    pub fn hydrate_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.hydrate_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            fast_debounce_ms: 50,
            slow_debounce_ms: 2000,
            hydrate_retries: 3,
            hydrate_backoff_ms: 800,
        }
    }
}

/// Fast cache tier sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastCacheConfig {
    /// Total bytes of serialized snapshots the tier may hold.
    pub quota_bytes: u64,
}

impl Default for FastCacheConfig {
    fn default() -> Self {
        Self {
            quota_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Bounds applied when a session is written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizeLimits {
    pub max_string_chars: usize,
    pub max_raw_source_chars: usize,
    pub max_meta_string_chars: usize,
    pub max_draft_chars: usize,
    pub max_summary_chars: usize,
    pub max_compacted_text_chars: usize,
    pub max_compacted_raw_chars: usize,
    /// Inline `data:` urls longer than this are replaced.
    pub max_data_url_chars: usize,
    pub max_wallpaper_data_url_chars: usize,
    pub max_session_messages: usize,
    pub max_session_text_chars: usize,
    pub max_archive_messages: usize,
    pub max_archives: usize,
    pub max_summaries: usize,
    /// Tail kept by `set_last_raw_response`.
    pub max_last_raw_chars: usize,
    /// Rich assistant replies whose raw original is prefetched.
    pub raw_original_autoload: usize,
}

impl Default for SanitizeLimits {
    fn default() -> Self {
        Self {
            max_string_chars: 180_000,
            max_raw_source_chars: 600_000,
            max_meta_string_chars: 40_000,
            max_draft_chars: 20_000,
            max_summary_chars: 6_000,
            max_compacted_text_chars: 24_000,
            max_compacted_raw_chars: 120_000,
            max_data_url_chars: 4096,
            max_wallpaper_data_url_chars: 200_000,
            max_session_messages: 400,
            max_session_text_chars: 600_000,
            max_archive_messages: 400,
            max_archives: 6,
            max_summaries: 120,
            max_last_raw_chars: 220_000,
            raw_original_autoload: 5,
        }
    }
}

/// Settings given to freshly created sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionDefaults {
    pub bubble_color: String,
    pub text_color: String,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            bubble_color: "#c9c9c9".into(),
            text_color: "#1F2937".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = StoreConfig::from_toml("").unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.parts.message_limit, 160);
        assert_eq!(config.persist.slow_debounce(), Duration::from_millis(2000));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = StoreConfig::from_toml(
            r#"
            data_dir = "/tmp/chat"

            [parts]
            message_limit = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.parts.message_limit, 2);
        assert_eq!(config.parts.char_limit, 320_000);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/chat/chatkeep.db"));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = StoreConfig::from_toml("[parts]\nmessage_limit = 0").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn backoff_is_linear() {
        let persist = PersistConfig::default();
        assert_eq!(persist.hydrate_backoff(1), Duration::from_millis(800));
        assert_eq!(persist.hydrate_backoff(3), Duration::from_millis(2400));
    }
}
