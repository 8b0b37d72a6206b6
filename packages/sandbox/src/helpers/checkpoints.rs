// ABOUTME: Checkpoint chaining, retention, and listing helpers
// ABOUTME: rsync command builders, exclude matching, and the per-sandbox checkpoint index

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{quote, validate_id, CHECKPOINT_DIR_NAME};
use crate::error::{Result, SandboxError};
use crate::providers::{ExecOptions, SandboxProvider};
use crate::types::CheckpointInfo;

/// Volatile paths left out of snapshots and untouched by restores
pub const RESTORE_EXCLUDE_PATTERNS: &[&str] = &[
    ".checkpoints",
    ".cache",
    "__pycache__",
    "*.pyc",
    "*.pyo",
    "*.log",
    ".DS_Store",
    "dist",
    "build",
    ".next",
    ".nuxt",
];

pub const INDEX_FILE_NAME: &str = "index.json";

pub fn checkpoint_base(home: &str) -> String {
    format!("{}/{}", home.trim_end_matches('/'), CHECKPOINT_DIR_NAME)
}

pub fn checkpoint_dir(home: &str, checkpoint_id: &str) -> String {
    format!("{}/{}", checkpoint_base(home), checkpoint_id)
}

/// Home-relative path of the index, suitable for provider file operations.
pub fn index_path() -> String {
    format!("{}/{}", CHECKPOINT_DIR_NAME, INDEX_FILE_NAME)
}

/// rsync-style basename match: `*.ext` matches by suffix, anything else by exact name.
pub fn is_excluded(file_name: &str) -> bool {
    RESTORE_EXCLUDE_PATTERNS.iter().any(|pattern| {
        match pattern.strip_prefix('*') {
            Some(suffix) => file_name.ends_with(suffix),
            None => file_name == *pattern,
        }
    })
}

fn exclude_args() -> Result<String> {
    RESTORE_EXCLUDE_PATTERNS
        .iter()
        .map(|pattern| Ok(format!("--exclude={}", quote(pattern)?)))
        .collect::<Result<Vec<_>>>()
        .map(|args| args.join(" "))
}

/// Incremental snapshot of `home` into `dest`, hard-linking unchanged files from `previous`.
pub fn snapshot_command(home: &str, dest: &str, previous: Option<&str>) -> Result<String> {
    let link_dest = match previous {
        Some(prev) => format!("--link-dest={} ", quote(prev)?),
        None => String::new(),
    };
    Ok(format!(
        "rsync -a --delete {}{} {}/ {}/",
        link_dest,
        exclude_args()?,
        quote(home.trim_end_matches('/'))?,
        quote(dest)?
    ))
}

/// Destructive mirror of `source` back onto `home`, including deletions.
pub fn restore_command(source: &str, home: &str) -> Result<String> {
    Ok(format!(
        "rsync -a --delete {} --stats {}/ {}/",
        exclude_args()?,
        quote(source)?,
        quote(home.trim_end_matches('/'))?
    ))
}

pub fn dir_exists_command(dir: &str) -> Result<String> {
    Ok(format!("[ -d {} ] && echo \"1\" || echo \"0\"", quote(dir)?))
}

/// Lists `<name>|<mtime seconds>` for every checkpoint directory.
pub fn stat_listing_command(base: &str) -> Result<String> {
    Ok(format!(
        "cd {} && for dir in */; do if [ -d \"$dir\" ]; then echo \"${{dir%/}}|$(stat -c %Y \"$dir\")\"; fi; done",
        quote(base)?
    ))
}

/// Parse the stat listing, newest first.
pub fn parse_stat_listing(stdout: &str) -> Vec<CheckpointInfo> {
    let mut checkpoints: Vec<CheckpointInfo> = stdout
        .lines()
        .filter_map(|line| {
            let (id, ts) = line.trim().split_once('|')?;
            let secs = ts.trim().parse::<i64>().ok()?;
            let created_at = Utc.timestamp_opt(secs, 0).single()?;
            Some(CheckpointInfo {
                id: id.to_string(),
                created_at,
            })
        })
        .collect();
    checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    checkpoints
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexEntry {
    id: String,
    created_at: DateTime<Utc>,
}

/// Creation-ordered record of a sandbox's checkpoints. Stored beside the
/// checkpoints so ties in directory timestamps never reorder the chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    entries: Vec<IndexEntry>,
}

impl CheckpointIndex {
    /// Seed an index from a listing (any order), oldest first.
    pub fn from_listing(mut listing: Vec<CheckpointInfo>) -> Self {
        listing.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Self {
            entries: listing
                .into_iter()
                .map(|c| IndexEntry {
                    id: c.id,
                    created_at: c.created_at,
                })
                .collect(),
        }
    }

    /// Append `id` as the newest checkpoint. Re-recording an id moves it to the end.
    pub fn record(&mut self, id: &str, created_at: DateTime<Utc>) {
        self.entries.retain(|e| e.id != id);
        self.entries.push(IndexEntry {
            id: id.to_string(),
            created_at,
        });
    }

    pub fn latest(&self) -> Option<&str> {
        self.entries.last().map(|e| e.id.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn newest_first(&self) -> Vec<CheckpointInfo> {
        self.entries
            .iter()
            .rev()
            .map(|e| CheckpointInfo {
                id: e.id.clone(),
                created_at: e.created_at,
            })
            .collect()
    }

    /// Drop everything beyond the `cap` newest entries, returning pruned ids oldest first.
    pub fn apply_retention(&mut self, cap: usize) -> Vec<String> {
        if self.entries.len() <= cap {
            return Vec::new();
        }
        let excess = self.entries.len() - cap;
        self.entries.drain(..excess).map(|e| e.id).collect()
    }
}

/// Load the index through the provider's file API. `Ok(None)` when it does not exist yet.
pub async fn load_index<P>(provider: &P, sandbox_id: &str) -> Result<Option<CheckpointIndex>>
where
    P: SandboxProvider + ?Sized,
{
    match provider.read_file(sandbox_id, &index_path()).await {
        Ok(file) => {
            let index = serde_json::from_str(&file.content).map_err(|e| {
                SandboxError::InvalidConfiguration(format!("Corrupt checkpoint index: {}", e))
            })?;
            Ok(Some(index))
        }
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

pub async fn save_index<P>(provider: &P, sandbox_id: &str, index: &CheckpointIndex) -> Result<()>
where
    P: SandboxProvider + ?Sized,
{
    let data = serde_json::to_vec_pretty(index)?;
    provider.write_file(sandbox_id, &index_path(), &data).await
}

// ==================== Provider Composition ====================

const CHECKPOINT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

async fn run_checked<P>(provider: &P, sandbox_id: &str, command: &str) -> Result<String>
where
    P: SandboxProvider + ?Sized,
{
    let result = provider
        .execute(sandbox_id, command, ExecOptions::with_timeout(CHECKPOINT_COMMAND_TIMEOUT))
        .await?;
    if !result.success() {
        return Err(SandboxError::CommandFailed {
            exit_code: result.exit_code,
            output: format!("{}{}", result.stdout, result.stderr).trim().to_string(),
        });
    }
    Ok(result.stdout)
}

/// Index from disk, or rebuilt from directory timestamps when missing
pub async fn current_index<P>(provider: &P, sandbox_id: &str, home: &str) -> Result<CheckpointIndex>
where
    P: SandboxProvider + ?Sized,
{
    if let Some(index) = load_index(provider, sandbox_id).await? {
        return Ok(index);
    }
    let base = checkpoint_base(home);
    let exists = run_checked(provider, sandbox_id, &dir_exists_command(&base)?).await?;
    if exists.trim() != "1" {
        return Ok(CheckpointIndex::default());
    }
    let listing = run_checked(provider, sandbox_id, &stat_listing_command(&base)?).await?;
    Ok(CheckpointIndex::from_listing(parse_stat_listing(&listing)))
}

/// rsync snapshot linked against the newest checkpoint, then retention pruning.
///
/// Pruning failures are logged; the new checkpoint stands regardless.
pub async fn create_with_rsync<P>(
    provider: &P,
    sandbox_id: &str,
    checkpoint_id: &str,
    home: &str,
    retention: usize,
) -> Result<String>
where
    P: SandboxProvider + ?Sized,
{
    validate_id("checkpoint", checkpoint_id)?;
    let mut index = current_index(provider, sandbox_id, home).await?;
    let previous = index
        .latest()
        .filter(|id| *id != checkpoint_id)
        .map(|id| checkpoint_dir(home, id));
    let dest = checkpoint_dir(home, checkpoint_id);

    run_checked(provider, sandbox_id, &format!("mkdir -p {}", quote(&dest)?)).await?;
    run_checked(
        provider,
        sandbox_id,
        &snapshot_command(home, &dest, previous.as_deref())?,
    )
    .await?;
    info!("Created checkpoint {} for sandbox {}", checkpoint_id, sandbox_id);

    index.record(checkpoint_id, Utc::now());
    for pruned in index.apply_retention(retention) {
        let command = format!("rm -rf {}", quote(&checkpoint_dir(home, &pruned))?);
        match run_checked(provider, sandbox_id, &command).await {
            Ok(_) => debug!("Pruned checkpoint {} from sandbox {}", pruned, sandbox_id),
            Err(e) => warn!("Failed to prune checkpoint {}: {}", pruned, e),
        }
    }
    save_index(provider, sandbox_id, &index).await?;

    Ok(checkpoint_id.to_string())
}

/// Mirror a checkpoint back over the home directory
pub async fn restore_with_rsync<P>(
    provider: &P,
    sandbox_id: &str,
    checkpoint_id: &str,
    home: &str,
) -> Result<()>
where
    P: SandboxProvider + ?Sized,
{
    validate_id("checkpoint", checkpoint_id)?;
    let source = checkpoint_dir(home, checkpoint_id);
    let exists = run_checked(provider, sandbox_id, &dir_exists_command(&source)?).await?;
    if exists.trim() != "1" {
        return Err(SandboxError::checkpoint_not_found(checkpoint_id));
    }
    run_checked(provider, sandbox_id, &restore_command(&source, home)?).await?;
    info!("Restored checkpoint {} into sandbox {}", checkpoint_id, sandbox_id);
    Ok(())
}
