//! Subcommand implementations.

use anyhow::{Context, Result, bail};
use chatkeep_store::{Message, Role};
use tracing::info;

use crate::cli::Cli;
use crate::helpers::{format_millis, load_config, open_backend, open_store, preview};

const PREVIEW_CHARS: usize = 60;

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

pub async fn cmd_sessions(cli: &Cli) -> Result<()> {
    let (store, _) = open_store(cli).await?;
    let sessions = store.list_sessions();
    if sessions.is_empty() {
        println!("No sessions in scope '{}'.", store.scope_id());
        return Ok(());
    }

    let current = store.current_id();
    println!("{:<2}{:<24} {:<17} {:>6}  LAST MESSAGE", "", "SESSION", "ACTIVE", "UNREAD");
    for sid in sessions {
        let marker = if sid == current { "*" } else { "" };
        let last = store.last_message(&sid);
        let (at, text) = last
            .map(|m| (m.timestamp, preview(&m.content, PREVIEW_CHARS)))
            .unwrap_or_default();
        println!(
            "{marker:<2}{sid:<24} {:<17} {:>6}  {text}",
            format_millis(at),
            store.unread_count(&sid),
        );
    }
    Ok(())
}

pub async fn cmd_delete(cli: &Cli, session: &str) -> Result<()> {
    let (store, _) = open_store(cli).await?;
    if !store.delete_session(session) {
        bail!("session '{session}' not found");
    }
    store.flush().await;
    println!("Deleted session '{session}'.");
    Ok(())
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

pub async fn cmd_show(cli: &Cli, session: &str, archive: Option<&str>, all: bool) -> Result<()> {
    let (store, _) = open_store(cli).await?;
    if !store.has_session(session) {
        bail!("session '{session}' not found");
    }

    let mut messages = store.ensure_recent_messages_loaded(session, archive).await;
    if all {
        while store.has_older_messages(session, archive) {
            let older = store.load_older_messages(session, archive, 1).await;
            if older.is_empty() {
                break;
            }
            let mut merged = older;
            merged.extend(messages);
            messages = merged;
        }
    } else if store.has_older_messages(session, archive) {
        println!("(older messages not shown, use --all)");
    }

    for msg in &messages {
        println!(
            "[{}] {:<9} {}",
            format_millis(msg.timestamp),
            msg.role.as_str(),
            msg.content
        );
    }
    println!("-- {} message(s)", messages.len());
    Ok(())
}

pub async fn cmd_append(cli: &Cli, session: &str, content: &str, role: &str) -> Result<()> {
    let role: Role = role.parse().context("invalid --role")?;
    let (store, _) = open_store(cli).await?;
    let appended = store
        .append_message(session, Message::new(role, content))
        .context("session id must not be blank")?;
    store.flush().await;
    println!("Appended {} to '{session}'.", appended.id);
    Ok(())
}

// ---------------------------------------------------------------------------
// Archives
// ---------------------------------------------------------------------------

pub async fn cmd_archive(cli: &Cli, session: &str, name: &str, new_chat: bool) -> Result<()> {
    let (store, _) = open_store(cli).await?;
    if !store.has_session(session) {
        bail!("session '{session}' not found");
    }
    let archived = if new_chat {
        store.start_new_chat(session, name, None)
    } else {
        store.archive_current_messages(session, name, false, None)
    };
    store.flush().await;

    match archived {
        Some(id) => println!("Archived '{session}' as {id}."),
        None => println!("Nothing to archive in '{session}'."),
    }
    if new_chat {
        println!("Started a new conversation.");
    }
    Ok(())
}

pub async fn cmd_archives(cli: &Cli, session: &str) -> Result<()> {
    let (store, _) = open_store(cli).await?;
    let archives = store.archives(session);
    if archives.is_empty() {
        println!("No archives for '{session}'.");
        return Ok(());
    }
    let live = store.current_archive_id(session);
    for archive in archives {
        let marker = if live.as_deref() == Some(archive.id.as_str()) { "*" } else { " " };
        println!(
            "{marker} {}  {:<40} {:>5} msgs  {}",
            archive.id,
            archive.name,
            archive.message_count,
            format_millis(archive.timestamp)
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

/// Hydrating the store runs the migration; flushing persists the stripped
/// flat document.
pub async fn cmd_migrate(cli: &Cli) -> Result<()> {
    let (store, backend) = open_store(cli).await?;
    if !store.is_sharded() {
        bail!("backend unavailable, nothing migrated");
    }
    store.flush().await;
    let stats = backend.stats().await.context("failed to read stats")?;
    info!(parts = stats.parts, "migration pass complete");
    println!(
        "Scope '{}' is sharded: {} session(s), {} part(s) on disk.",
        store.scope_id(),
        store.list_sessions().len(),
        stats.parts
    );
    Ok(())
}

pub async fn cmd_stats(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let backend = open_backend(&config).await?;
    let stats = backend.stats().await.context("failed to read stats")?;
    let scopes = backend.scopes().await.context("failed to list scopes")?;

    println!("Database:     {}", config.database_path().display());
    println!("Scopes:       {}", stats.scopes);
    for scope in scopes {
        let label = if scope.is_empty() { "(default)" } else { scope.as_str() };
        println!("  - {label}");
    }
    println!("Parts:        {} ({} bytes)", stats.parts, stats.part_bytes);
    println!("Documents:    {}", stats.kv_documents);
    println!("Raw replies:  {}", stats.raw_replies);
    Ok(())
}
