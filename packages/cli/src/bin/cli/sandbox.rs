// ABOUTME: Operator commands for sandboxes: create, delete, exec, and checkpoint management
// ABOUTME: Talks to the provider selected by AGENTBOX_SANDBOX_PROVIDER directly, no server needed

use agentbox_sandbox::{provider_from_env, ExecOptions, ProviderKind, SandboxProvider};
use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use std::time::Duration;

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Provision a new sandbox
    Create,

    /// Delete a sandbox and everything in it
    Delete {
        /// Sandbox ID
        id: String,
    },

    /// Run a shell command inside a sandbox
    Exec {
        /// Sandbox ID
        id: String,

        /// Timeout in seconds (default: provider setting)
        #[arg(long)]
        timeout: Option<u64>,

        /// Command to run
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Snapshot the sandbox home directory
    Checkpoint {
        /// Sandbox ID
        id: String,

        /// Checkpoint name (default: random)
        #[arg(long)]
        name: Option<String>,
    },

    /// List checkpoints, newest first
    Checkpoints {
        /// Sandbox ID
        id: String,
    },

    /// Restore a checkpoint into the sandbox home directory
    Restore {
        /// Sandbox ID
        id: String,

        /// Checkpoint ID
        checkpoint: String,
    },
}

impl SandboxCommands {
    pub async fn execute(self) -> Result<()> {
        let provider = provider_from_env(ProviderKind::from_env()?)?;
        let result = self.run(provider.as_ref()).await;
        provider.cleanup().await;
        result
    }

    async fn run(self, provider: &dyn SandboxProvider) -> Result<()> {
        match self {
            SandboxCommands::Create => create_command(provider).await,
            SandboxCommands::Delete { id } => delete_command(provider, &id).await,
            SandboxCommands::Exec {
                id,
                timeout,
                command,
            } => exec_command(provider, &id, timeout, &command.join(" ")).await,
            SandboxCommands::Checkpoint { id, name } => {
                checkpoint_command(provider, &id, name).await
            }
            SandboxCommands::Checkpoints { id } => checkpoints_command(provider, &id).await,
            SandboxCommands::Restore { id, checkpoint } => {
                restore_command(provider, &id, &checkpoint).await
            }
        }
    }
}

async fn create_command(provider: &dyn SandboxProvider) -> Result<()> {
    let id = provider
        .create()
        .await
        .context("Failed to create sandbox")?;
    println!("{} {}", "Created sandbox:".green().bold(), id);
    Ok(())
}

async fn delete_command(provider: &dyn SandboxProvider, id: &str) -> Result<()> {
    provider.delete(id).await?;
    println!("{} {}", "Deleted sandbox:".green().bold(), id);
    Ok(())
}

async fn exec_command(
    provider: &dyn SandboxProvider,
    id: &str,
    timeout: Option<u64>,
    command: &str,
) -> Result<()> {
    let options = match timeout {
        Some(secs) => ExecOptions::with_timeout(Duration::from_secs(secs)),
        None => ExecOptions::default(),
    };
    let result = provider.execute(id, command, options).await?;

    print!("{}", result.stdout);
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
    if !result.success() {
        anyhow::bail!("Command exited with code {}", result.exit_code);
    }
    Ok(())
}

async fn checkpoint_command(
    provider: &dyn SandboxProvider,
    id: &str,
    name: Option<String>,
) -> Result<()> {
    let checkpoint_id = name.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let created = provider.create_checkpoint(id, &checkpoint_id).await?;
    println!("{} {}", "Created checkpoint:".green().bold(), created);
    Ok(())
}

async fn checkpoints_command(provider: &dyn SandboxProvider, id: &str) -> Result<()> {
    let checkpoints = provider.list_checkpoints(id).await?;

    if checkpoints.is_empty() {
        println!("{}", "No checkpoints found".yellow());
        println!(
            "{}",
            format!("Use 'agentbox sandbox checkpoint {}' to create one", id).dimmed()
        );
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Created"]);

    for checkpoint in &checkpoints {
        table.add_row(vec![
            checkpoint.id.clone(),
            checkpoint.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }

    println!("{}", table);
    println!("Total: {} checkpoints", checkpoints.len().to_string().cyan());
    Ok(())
}

async fn restore_command(provider: &dyn SandboxProvider, id: &str, checkpoint: &str) -> Result<()> {
    provider.restore_checkpoint(id, checkpoint).await?;
    println!(
        "{} {} into {}",
        "Restored checkpoint".green().bold(),
        checkpoint,
        id
    );
    Ok(())
}
