//! prdengine - chat-driven PRD session engine
//!
//! CLI entry point. The engine itself is chat-shaped: every interaction is a
//! message in, a reply out. The binary is a thin shell that feeds messages to
//! the engine and prints replies.

use std::fs;
use std::io::{BufRead, Write};

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::info;

use prdengine::cli::{Cli, Command, get_log_path};
use prdengine::commands::Engine;
use prdengine::config::Config;
use prdengine::oracle::{CodexCli, Oracle};
use prdengine::session::{STORE_FILE, SessionStore};

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir).context("Failed to create log directory")?;
    }

    let level = match cli_log_level.map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

fn build_oracle(config: &Config) -> Oracle {
    if config.oracle_command.trim().is_empty() {
        info!("No oracle command configured, running deterministically");
        return Oracle::disabled();
    }
    Oracle::from_cli(CodexCli::new(config.oracle_command.clone(), config.oracle_timeout()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(oracle = %config.oracle_command, "prdengine loaded config");

    match cli.command {
        Command::Chat { chat_id, message } => cmd_chat(&config, chat_id, &message.join(" ")).await,
        Command::Repl { chat_id } => cmd_repl(&config, chat_id).await,
        Command::Sessions => cmd_sessions(&config),
        Command::Paths => cmd_paths(&config),
    }
}

/// Feed one message and print the reply
async fn cmd_chat(config: &Config, chat_id: i64, message: &str) -> Result<()> {
    let engine = Engine::new(config, build_oracle(config))?;
    let reply = engine
        .handle_message(chat_id, message)
        .await
        .wrap_err("Failed to handle message")?;
    println!("{}", reply);
    Ok(())
}

/// Line-by-line loop over stdin for one chat
async fn cmd_repl(config: &Config, chat_id: i64) -> Result<()> {
    let engine = Engine::new(config, build_oracle(config))?;
    println!("{}", format!("PRD session chat {} - /prd start to begin, Ctrl+D to leave", chat_id).dimmed());

    let stdin = std::io::stdin();
    loop {
        print!("{} ", ">".cyan());
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match engine.handle_message(chat_id, line).await {
            Ok(reply) => println!("{}", reply),
            Err(e) => eprintln!("{} {}", "error:".red(), e),
        }
    }
    Ok(())
}

/// List chats with an active session
fn cmd_sessions(config: &Config) -> Result<()> {
    let store = SessionStore::open(&config.control_root);
    let mut ids = store.chat_ids().wrap_err("Failed to read session store")?;
    ids.sort();

    if ids.is_empty() {
        println!("No active PRD sessions.");
        return Ok(());
    }
    println!("Active PRD sessions:");
    for id in ids {
        if let Some(session) = store.load(id).wrap_err("Failed to read session store")? {
            println!(
                "  {}  {}  stage={}  stories={}",
                id,
                if session.product_name.is_empty() {
                    "(unnamed)"
                } else {
                    &session.product_name
                },
                session.stage,
                session.stories.len()
            );
        }
    }
    Ok(())
}

/// Show resolved storage paths
fn cmd_paths(config: &Config) -> Result<()> {
    println!("control root:      {}", config.control_root.display());
    println!("session store:     {}", config.control_root.join(STORE_FILE).display());
    println!("conversation logs: {}", config.conversation_log_dir.display());
    println!("issue queue:       {}", config.issue_queue_dir.display());
    println!("documents:         {}", config.documents_dir.display());
    println!("engine log:        {}", get_log_path().display());
    Ok(())
}
