//! CLI entry point for chatkeep.
//!
//! This binary provides the `chatkeep` command with subcommands for
//! inspecting sessions, appending and archiving messages, and running
//! storage maintenance against a SQLite data directory.

mod cli;
mod commands;
mod helpers;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Commands};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    helpers::init_tracing("info");

    match &cli.command {
        Commands::Sessions => commands::cmd_sessions(&cli).await,
        Commands::Show {
            session,
            archive,
            all,
        } => commands::cmd_show(&cli, session, archive.as_deref(), *all).await,
        Commands::Append {
            session,
            content,
            role,
        } => commands::cmd_append(&cli, session, content, role).await,
        Commands::Archive {
            session,
            name,
            new_chat,
        } => commands::cmd_archive(&cli, session, name, *new_chat).await,
        Commands::Archives { session } => commands::cmd_archives(&cli, session).await,
        Commands::Delete { session } => commands::cmd_delete(&cli, session).await,
        Commands::Migrate => commands::cmd_migrate(&cli).await,
        Commands::Stats => commands::cmd_stats(&cli).await,
    }
}
