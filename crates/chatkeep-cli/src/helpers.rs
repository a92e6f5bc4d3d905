//! Shared setup for CLI commands: tracing, config and store construction.

use std::sync::Arc;

use anyhow::{Context, Result};
use chatkeep_store::{ChatStore, DiskBackend, LocalCache, SqliteBackend, StoreConfig};
use chrono::{Local, TimeZone};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the global tracing subscriber. Logs go to stderr so command
/// output on stdout stays clean.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Load the config file and apply command-line overrides.
pub fn load_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = StoreConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

/// Open the SQLite backend and a hydrated store for the selected scope.
pub async fn open_store(cli: &Cli) -> Result<(ChatStore, Arc<SqliteBackend>)> {
    let config = load_config(cli)?;
    let backend = open_backend(&config).await?;
    let cache = Arc::new(LocalCache::new("chatkeep", config.fast_cache.quota_bytes));
    let disk: Arc<dyn DiskBackend> = backend.clone();
    let store = ChatStore::open(config, Some(disk), cache, &cli.scope).await;
    info!(scope = %store.scope_id(), sharded = store.is_sharded(), "store opened");
    Ok((store, backend))
}

pub async fn open_backend(config: &StoreConfig) -> Result<Arc<SqliteBackend>> {
    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("failed to create data directory {}", config.data_dir.display())
    })?;
    let path = config.database_path();
    let backend = SqliteBackend::open(path.clone())
        .await
        .with_context(|| format!("failed to open database {}", path.display()))?;
    Ok(Arc::new(backend))
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Epoch milliseconds as local `YYYY-MM-DD HH:MM`, or `-` when unset.
pub fn format_millis(millis: i64) -> String {
    if millis <= 0 {
        return "-".to_string();
    }
    Local
        .timestamp_millis_opt(millis)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// First line of `text`, cut to `max` chars.
pub fn preview(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max {
        return line.to_string();
    }
    let cut: String = line.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_cuts_long_lines() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("first\nsecond", 10), "first");
        assert_eq!(preview("abcdefghijkl", 5), "abcd…");
    }

    #[test]
    fn unset_time_prints_dash() {
        assert_eq!(format_millis(0), "-");
        assert_ne!(format_millis(1_700_000_000_000), "-");
    }
}
