//! CLI argument definitions for chatkeep.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// chatkeep -- inspect and maintain chat history stores.
#[derive(Parser)]
#[command(
    name = "chatkeep",
    version,
    about = "chatkeep -- inspect and maintain chat history stores",
    long_about = "Operates on the SQLite data directory of a chat store: list sessions, \
                  read and append messages, archive conversations and run the legacy \
                  migration."
)]
pub struct Cli {
    /// Path to the TOML config file. A missing file means defaults.
    #[arg(long, short, env = "CHATKEEP_CONFIG", default_value = "chatkeep.toml", global = true)]
    pub config: PathBuf,

    /// Overrides `data_dir` from the config file.
    #[arg(long, env = "CHATKEEP_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Scope (account) whose data to operate on.
    #[arg(long, short, env = "CHATKEEP_SCOPE", default_value = "", global = true)]
    pub scope: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List sessions, most recently active first.
    Sessions,

    /// Print the messages of a session.
    Show {
        /// The session to display.
        session: String,

        /// Show an archive instead of the open thread.
        #[arg(long, short)]
        archive: Option<String>,

        /// Page through the whole thread instead of the recent window.
        #[arg(long)]
        all: bool,
    },

    /// Append a message to the open thread of a session.
    Append {
        /// Target session; created if missing.
        session: String,

        /// Message text.
        content: String,

        /// user, assistant or system.
        #[arg(long, short, default_value = "user")]
        role: String,
    },

    /// Archive the open conversation of a session.
    Archive {
        /// The session to archive.
        session: String,

        /// Archive name; a date suffix is added unless it has one.
        #[arg(long, short, default_value = "")]
        name: String,

        /// Start a fresh conversation afterwards.
        #[arg(long)]
        new_chat: bool,
    },

    /// List the archives of a session.
    Archives {
        /// The session whose archives to list.
        session: String,
    },

    /// Delete a session and all of its threads.
    Delete {
        /// The session to delete.
        session: String,
    },

    /// Move legacy sessions into the sharded layout.
    Migrate,

    /// Show storage statistics.
    Stats,
}
