//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// prdengine - chat-driven PRD session engine
#[derive(Parser)]
#[command(
    name = "pe",
    about = "PRD requirements-gathering session engine",
    version,
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Feed one chat message to a session and print the reply
    ///
    /// The message can be free text or any `/prd ...` command.
    Chat {
        /// Chat id the message belongs to
        #[arg(value_name = "CHAT_ID")]
        chat_id: i64,

        /// The message text
        message: Vec<String>,
    },

    /// Interactive loop: read messages from stdin for one chat
    Repl {
        /// Chat id the conversation belongs to
        #[arg(value_name = "CHAT_ID")]
        chat_id: i64,
    },

    /// List chats with an active PRD session
    Sessions,

    /// Show resolved storage paths
    Paths,
}

/// Path of the engine log file
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("prdengine")
        .join("logs")
        .join("prdengine.log")
}
