// ABOUTME: agentbox binary entry point
// ABOUTME: Loads .env, initializes tracing, and dispatches the serve and sandbox subcommands

use clap::{Parser, Subcommand};
use colored::*;
use std::process;

mod cli;

use agentbox_cli::{init_tracing, run_server, ServerConfig};
use cli::sandbox::SandboxCommands;

#[derive(Parser)]
#[command(name = "agentbox")]
#[command(about = "Agentbox - coding agents in sandboxes with resumable streams")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Bind address (overrides AGENTBOX_API_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Port (overrides AGENTBOX_API_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage sandboxes directly
    #[command(subcommand)]
    Sandbox(SandboxCommands),
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    if let Err(e) = handle_command(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve { host, port } => {
            let mut config = ServerConfig::from_env();
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            run_server(config).await
        }
        Commands::Sandbox(command) => command.execute().await,
    }
}
