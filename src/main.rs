mod cli;
mod server;
mod tools;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use persona::config::PersonaConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "persona", version, about = "Memory engine for a group chat bot")]
struct Cli {
    /// Config file (default: ~/.persona/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Transport {
    Stdio,
    Http,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server and the background scheduler
    Serve {
        /// Overrides server.transport
        #[arg(long, value_enum)]
        transport: Option<Transport>,
    },
    /// Run one decay pass now
    Decay,
    /// Merge duplicate nodes and drop dangling references
    Repair,
    /// Show memory statistics
    Stats {
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Keyword search without reinforcing anything
    Search {
        keyword: String,
        /// Conversation to search; omit for the shared graph
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PersonaConfig::load_from(path)?,
        None => PersonaConfig::load()?,
    };

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { transport } => {
            let transport = match transport {
                Some(t) => t,
                None if config.server.transport == "http" => Transport::Http,
                None => Transport::Stdio,
            };
            match transport {
                Transport::Stdio => server::serve_stdio(config).await?,
                Transport::Http => server::serve_http(config).await?,
            }
        }
        Command::Decay => cli::decay::decay(&config)?,
        Command::Repair => cli::decay::repair(&config)?,
        Command::Stats { conversation } => cli::stats::stats(&config, conversation.as_deref())?,
        Command::Search {
            keyword,
            conversation,
            limit,
        } => cli::search::search(&config, &keyword, conversation.as_deref(), limit)?,
    }

    Ok(())
}
