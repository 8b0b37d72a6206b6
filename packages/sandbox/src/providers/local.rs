// ABOUTME: Host-directory provider for tests and single-machine development
// ABOUTME: One directory per sandbox, host processes for commands, portable-pty terminals, hard-link checkpoints

use async_trait::async_trait;
use chrono::Utc;
use portable_pty::{native_pty_system, Child as PtyChild, CommandBuilder, MasterPty};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ExecOptions, SandboxProvider};
use crate::config::LocalConfig;
use crate::error::{Result, SandboxError};
use crate::helpers::{self, checkpoints, files, ports, secrets, CHECKPOINT_DIR_NAME};
use crate::pty::PtyRegistry;
use crate::transport::local::{terminate_process_group, LocalExecChannel};
use crate::transport::{AgentOptions, AgentTransport, SandboxTransport, KILL_GRACE};
use crate::types::{
    CheckpointInfo, CommandResult, FileContent, FileMetadata, PreviewLink, PtyEvent, PtyHandle,
    PtySession, PtySize, SecretEntry,
};

/// How long captured output may trail the process exit before it is dropped
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

struct LocalPty {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn PtyChild + Send + Sync>,
}

impl LocalPty {
    /// Blocking: kills and reaps the shell
    fn shutdown(mut self) {
        if let Err(e) = self.child.kill() {
            debug!("PTY child kill failed: {}", e);
        }
        let _ = self.child.wait();
    }
}

fn pty_error(context: &str, e: impl std::fmt::Display) -> SandboxError {
    SandboxError::Io(io::Error::other(format!("{}: {}", context, e)))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SandboxError::Io(io::Error::other(e.to_string())))?
        .map_err(SandboxError::from)
}

pub struct LocalProvider {
    config: LocalConfig,
    ptys: Arc<PtyRegistry<LocalPty>>,
}

impl LocalProvider {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            config,
            ptys: Arc::new(PtyRegistry::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Host directory backing a sandbox (not checked for existence)
    pub fn sandbox_dir(&self, sandbox_id: &str) -> Result<PathBuf> {
        helpers::validate_id("sandbox", sandbox_id)?;
        Ok(self.config.root.join(sandbox_id))
    }

    async fn existing_dir(&self, sandbox_id: &str) -> Result<PathBuf> {
        let dir = self.sandbox_dir(sandbox_id)?;
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            _ => Err(SandboxError::sandbox_not_found(sandbox_id)),
        }
    }

    async fn shutdown_ptys(sessions: Vec<LocalPty>) {
        if sessions.is_empty() {
            return;
        }
        let _ = tokio::task::spawn_blocking(move || {
            for pty in sessions {
                pty.shutdown();
            }
        })
        .await;
    }
}

fn home_of(dir: &Path) -> String {
    dir.to_string_lossy().into_owned()
}

/// Map a sandbox path onto the host directory. `/home/user/...` is an alias for the sandbox root.
fn resolve(dir: &Path, path: &str) -> String {
    let path = match path.strip_prefix(helpers::SANDBOX_HOME) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => path,
    };
    helpers::normalize_path(path, &home_of(dir))
}

async fn run_captured(mut command: Command, timeout: Duration) -> Result<CommandResult> {
    let mut child = command.spawn()?;
    let missing = || SandboxError::Io(io::Error::other("command pipes unavailable"));
    let mut stdout = child.stdout.take().ok_or_else(missing)?;
    let mut stderr = child.stderr.take().ok_or_else(missing)?;

    let out_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    });
    let err_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            terminate_process_group(&mut child, KILL_GRACE).await;
            out_task.abort();
            err_task.abort();
            return Err(SandboxError::Timeout {
                seconds: timeout.as_secs(),
            });
        }
    };

    // Detached grandchildren can hold the pipes open past exit
    let stdout = tokio::time::timeout(OUTPUT_DRAIN_GRACE, out_task)
        .await
        .ok()
        .and_then(|joined| joined.ok())
        .unwrap_or_default();
    let stderr = tokio::time::timeout(OUTPUT_DRAIN_GRACE, err_task)
        .await
        .ok()
        .and_then(|joined| joined.ok())
        .unwrap_or_default();

    Ok(CommandResult {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: crate::transport::local::exit_code(status),
    })
}

// ==================== Tree Operations ====================

fn same_contents(a: &Path, b: &Path) -> bool {
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(ma), Ok(mb)) if ma.is_file() && mb.is_file() && ma.len() == mb.len() => {}
        _ => return false,
    }
    match (std::fs::read(a), std::fs::read(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

fn remove_any(path: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Copy `source` into a fresh `dest`, hard-linking files whose contents match `previous`.
fn snapshot_tree(source: &Path, dest: &Path, previous: Option<&Path>) -> io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        if checkpoints::is_excluded(&name.to_string_lossy()) {
            continue;
        }
        let src = entry.path();
        let target = dest.join(&name);
        let prev = previous.map(|p| p.join(&name));
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            snapshot_tree(&src, &target, prev.as_deref())?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(std::fs::read_link(&src)?, &target)?;
        } else if file_type.is_file() {
            match prev {
                Some(prev) if same_contents(&src, &prev) => std::fs::hard_link(&prev, &target)?,
                _ => {
                    std::fs::copy(&src, &target)?;
                }
            }
        }
    }
    Ok(())
}

/// Make `target` match `source`, deleting extras. Excluded names on either side are left alone.
fn mirror_tree(source: &Path, target: &Path) -> io::Result<()> {
    std::fs::create_dir_all(target)?;

    for entry in std::fs::read_dir(target)? {
        let entry = entry?;
        let name = entry.file_name();
        if checkpoints::is_excluded(&name.to_string_lossy()) {
            continue;
        }
        let keep = match std::fs::symlink_metadata(source.join(&name)) {
            Ok(src_meta) => {
                let dst_type = entry.file_type()?;
                src_meta.is_dir() == dst_type.is_dir()
                    && src_meta.file_type().is_symlink() == dst_type.is_symlink()
            }
            Err(_) => false,
        };
        if !keep {
            remove_any(&entry.path())?;
        }
    }

    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        if checkpoints::is_excluded(&name.to_string_lossy()) {
            continue;
        }
        let src = entry.path();
        let dst = target.join(&name);
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            mirror_tree(&src, &dst)?;
        } else if file_type.is_symlink() {
            if std::fs::symlink_metadata(&dst).is_ok() {
                remove_any(&dst)?;
            }
            std::os::unix::fs::symlink(std::fs::read_link(&src)?, &dst)?;
        } else if file_type.is_file() && !same_contents(&src, &dst) {
            // Never write through a link shared with the checkpoint
            if std::fs::symlink_metadata(&dst).is_ok() {
                remove_any(&dst)?;
            }
            std::fs::copy(&src, &dst)?;
        }
    }
    Ok(())
}

/// Plain recursive copy, including checkpoints
fn copy_tree(source: &Path, dest: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let src = entry.path();
        let dst = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&src, &dst)?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(std::fs::read_link(&src)?, &dst)?;
        } else if file_type.is_file() {
            std::fs::copy(&src, &dst)?;
        }
    }
    Ok(())
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(&self) -> Result<String> {
        let sandbox_id = helpers::new_sandbox_id();
        let dir = self.sandbox_dir(&sandbox_id)?;
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            SandboxError::Provisioning(format!(
                "Failed to create sandbox directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        info!("Created local sandbox {} at {}", sandbox_id, dir.display());
        Ok(sandbox_id)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<bool> {
        match self.existing_dir(sandbox_id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, sandbox_id: &str) -> Result<()> {
        let sessions = self
            .ptys
            .drain_sandbox(sandbox_id)
            .into_iter()
            .map(|(_, pty)| pty)
            .collect();
        Self::shutdown_ptys(sessions).await;

        let dir = self.sandbox_dir(sandbox_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => info!("Deleted local sandbox {}", sandbox_id),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Sandbox {} already gone", sandbox_id)
            }
            Err(e) => warn!("Failed to delete sandbox directory {}: {}", dir.display(), e),
        }
        Ok(())
    }

    async fn is_running(&self, sandbox_id: &str) -> Result<bool> {
        self.connect(sandbox_id).await
    }

    async fn clone_sandbox(&self, source_id: &str, checkpoint_id: Option<&str>) -> Result<String> {
        let source = self.existing_dir(source_id).await?;
        let new_id = helpers::new_sandbox_id();
        let dest = self.sandbox_dir(&new_id)?;
        info!("Cloning sandbox {} into {}", source_id, new_id);

        let copy_dest = dest.clone();
        let mut result = blocking(move || copy_tree(&source, &copy_dest)).await;
        if result.is_ok() {
            if let Some(checkpoint_id) = checkpoint_id {
                result = self.restore_checkpoint(&new_id, checkpoint_id).await;
            }
        }

        if let Err(e) = result {
            warn!("Clone of {} failed, removing partial sandbox {}", source_id, new_id);
            if let Err(cleanup) = tokio::fs::remove_dir_all(&dest).await {
                debug!("Failed to remove partial clone {}: {}", dest.display(), cleanup);
            }
            return Err(e);
        }
        Ok(new_id)
    }

    async fn execute(
        &self,
        sandbox_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandResult> {
        let dir = self.existing_dir(sandbox_id).await?;
        let timeout = options.timeout.unwrap_or(self.config.command_timeout);
        debug!("Executing in {}: {}", dir.display(), command);

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&dir)
            .env("HOME", &dir)
            .env("TERM", helpers::TERMINAL_TYPE)
            .envs(&options.env)
            .stdin(Stdio::null())
            .process_group(0);

        if options.background {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
            let mut child = cmd.spawn()?;
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            return Ok(CommandResult::background());
        }

        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        helpers::execute_with_timeout(timeout, run_captured(cmd, timeout)).await
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &[u8]) -> Result<()> {
        let dir = self.existing_dir(sandbox_id).await?;
        let target = PathBuf::from(resolve(&dir, path));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<FileContent> {
        let dir = self.existing_dir(sandbox_id).await?;
        let target = resolve(&dir, path);
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(files::encode_file_content(path, &bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SandboxError::NotFound {
                kind: "File",
                id: path.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_files(&self, sandbox_id: &str, path: Option<&str>) -> Result<Vec<FileMetadata>> {
        let dir = self.existing_dir(sandbox_id).await?;
        let home = home_of(&dir);
        let root = resolve(&dir, path.unwrap_or(""));
        let command = files::list_files_command(&root, files::LIST_EXCLUDED_PATHS)?;
        let result = self
            .execute(sandbox_id, &command, ExecOptions::default())
            .await?;
        Ok(files::parse_find_output(&result.stdout, &home))
    }

    async fn create_pty(&self, sandbox_id: &str, size: PtySize) -> Result<PtyHandle> {
        let dir = self.existing_dir(sandbox_id).await?;
        let pair = native_pty_system()
            .openpty(portable_pty::PtySize {
                rows: size.rows.max(1),
                cols: size.cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| pty_error("Failed to open PTY", e))?;

        let mut cmd = CommandBuilder::new("bash");
        cmd.cwd(&dir);
        cmd.env("HOME", &dir);
        cmd.env("TERM", helpers::TERMINAL_TYPE);
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| pty_error("Failed to spawn PTY shell", e))?;
        let pid = child.process_id();
        // Release slave so it closes when child exits
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| pty_error("Failed to clone PTY reader", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| pty_error("Failed to take PTY writer", e))?;

        let session_id = uuid::Uuid::new_v4().to_string();
        self.ptys.insert(
            sandbox_id,
            &session_id,
            LocalPty {
                master: pair.master,
                writer,
                child,
            },
        );

        let (output_tx, output_rx) = mpsc::channel(helpers::PTY_OUTPUT_QUEUE_SIZE);
        let registry = self.ptys.clone();
        let reader_sandbox = sandbox_id.to_string();
        let reader_session = session_id.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx
                            .blocking_send(PtyEvent::Output(buf[..n].to_vec()))
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            let _ = output_tx.blocking_send(PtyEvent::Exited);
            if let Some(pty) = registry.remove(&reader_sandbox, &reader_session) {
                pty.shutdown();
            }
        });

        info!("Opened PTY {} in sandbox {}", session_id, sandbox_id);
        Ok(PtyHandle {
            session: PtySession {
                id: session_id,
                sandbox_id: sandbox_id.to_string(),
                pid,
                rows: size.rows,
                cols: size.cols,
            },
            output: output_rx,
        })
    }

    async fn send_pty_input(&self, sandbox_id: &str, pty_id: &str, data: &[u8]) -> Result<()> {
        let written = self.ptys.with_session(sandbox_id, pty_id, |pty| {
            pty.writer.write_all(data)?;
            pty.writer.flush()
        });
        match written {
            Some(result) => Ok(result?),
            None => Err(SandboxError::pty_not_found(pty_id)),
        }
    }

    async fn resize_pty(&self, sandbox_id: &str, pty_id: &str, size: PtySize) -> Result<()> {
        let resized = self.ptys.with_session(sandbox_id, pty_id, |pty| {
            pty.master.resize(portable_pty::PtySize {
                rows: size.rows.max(1),
                cols: size.cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            })
        });
        match resized {
            Some(result) => result.map_err(|e| pty_error("Failed to resize PTY", e)),
            None => Err(SandboxError::pty_not_found(pty_id)),
        }
    }

    async fn kill_pty(&self, sandbox_id: &str, pty_id: &str) -> Result<()> {
        if let Some(pty) = self.ptys.remove(sandbox_id, pty_id) {
            Self::shutdown_ptys(vec![pty]).await;
            info!("Killed PTY {} in sandbox {}", pty_id, sandbox_id);
        }
        Ok(())
    }

    async fn create_checkpoint(&self, sandbox_id: &str, checkpoint_id: &str) -> Result<String> {
        helpers::validate_id("checkpoint", checkpoint_id)?;
        let dir = self.existing_dir(sandbox_id).await?;
        let base = dir.join(CHECKPOINT_DIR_NAME);
        let mut index = checkpoints::current_index(self, sandbox_id, &home_of(&dir)).await?;

        let previous = index
            .latest()
            .filter(|id| *id != checkpoint_id)
            .map(|id| base.join(id));
        let dest = base.join(checkpoint_id);
        blocking(move || {
            if std::fs::symlink_metadata(&dest).is_ok() {
                remove_any(&dest)?;
            }
            snapshot_tree(&dir, &dest, previous.as_deref())
        })
        .await?;
        info!("Created checkpoint {} for sandbox {}", checkpoint_id, sandbox_id);

        index.record(checkpoint_id, Utc::now());
        for pruned in index.apply_retention(self.config.max_checkpoints) {
            match tokio::fs::remove_dir_all(base.join(&pruned)).await {
                Ok(()) => debug!("Pruned checkpoint {} from sandbox {}", pruned, sandbox_id),
                Err(e) => warn!("Failed to prune checkpoint {}: {}", pruned, e),
            }
        }
        checkpoints::save_index(self, sandbox_id, &index).await?;

        Ok(checkpoint_id.to_string())
    }

    async fn restore_checkpoint(&self, sandbox_id: &str, checkpoint_id: &str) -> Result<()> {
        helpers::validate_id("checkpoint", checkpoint_id)?;
        let dir = self.existing_dir(sandbox_id).await?;
        let source = dir.join(CHECKPOINT_DIR_NAME).join(checkpoint_id);
        match tokio::fs::metadata(&source).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(SandboxError::checkpoint_not_found(checkpoint_id)),
        }

        blocking(move || mirror_tree(&source, &dir)).await?;
        info!("Restored checkpoint {} into sandbox {}", checkpoint_id, sandbox_id);
        Ok(())
    }

    async fn list_checkpoints(&self, sandbox_id: &str) -> Result<Vec<CheckpointInfo>> {
        let dir = self.existing_dir(sandbox_id).await?;
        let index = checkpoints::current_index(self, sandbox_id, &home_of(&dir)).await?;
        Ok(index.newest_first())
    }

    async fn get_preview_links(&self, sandbox_id: &str) -> Result<Vec<PreviewLink>> {
        let result = self
            .execute(
                sandbox_id,
                ports::LISTENING_PORTS_COMMAND,
                ExecOptions::with_timeout(Duration::from_secs(5)),
            )
            .await?;
        let listening = ports::parse_listening_ports(&result.stdout);
        let base = &self.config.preview_base_url;
        Ok(ports::build_preview_links(
            &listening,
            |port| ports::EXPOSABLE_PORTS.contains(&port),
            &[],
            |port| Some(format!("{}:{}", base, port)),
        ))
    }

    async fn get_ide_url(&self, sandbox_id: &str) -> Result<Option<String>> {
        self.existing_dir(sandbox_id).await?;
        Err(SandboxError::NotSupported {
            provider: self.name(),
            operation: "get_ide_url",
        })
    }

    async fn get_vnc_url(&self, sandbox_id: &str) -> Result<Option<String>> {
        self.existing_dir(sandbox_id).await?;
        Err(SandboxError::NotSupported {
            provider: self.name(),
            operation: "get_vnc_url",
        })
    }

    async fn get_secrets(&self, sandbox_id: &str) -> Result<Vec<SecretEntry>> {
        secrets::list_secrets(self, sandbox_id).await
    }

    async fn add_secret(&self, sandbox_id: &str, key: &str, value: &str) -> Result<()> {
        secrets::append_secret(self, sandbox_id, key, value).await
    }

    async fn delete_secret(&self, sandbox_id: &str, key: &str) -> Result<()> {
        secrets::remove_secret(self, sandbox_id, key).await
    }

    fn open_transport(
        &self,
        sandbox_id: &str,
        mut options: AgentOptions,
    ) -> Result<Box<dyn AgentTransport>> {
        let home = home_of(&self.sandbox_dir(sandbox_id)?);
        if options.cwd.is_none() {
            options.cwd = Some(home.clone());
        }
        options.env.entry("HOME".to_string()).or_insert(home);
        Ok(Box::new(SandboxTransport::new(LocalExecChannel::new(), options)))
    }

    async fn cleanup(&self) {
        let sessions: Vec<LocalPty> = self
            .ptys
            .drain_all()
            .into_iter()
            .map(|(_, _, pty)| pty)
            .collect();
        if !sessions.is_empty() {
            info!("Closing {} PTY sessions", sessions.len());
        }
        Self::shutdown_ptys(sessions).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn test_resolve_aliases_sandbox_home() {
        let dir = Path::new("/srv/sb/abc");
        assert_eq!(resolve(dir, "/home/user/src/a.rs"), "/srv/sb/abc/src/a.rs");
        assert_eq!(resolve(dir, "/home/user"), "/srv/sb/abc");
        assert_eq!(resolve(dir, "/home/username/x"), "/srv/sb/abc/home/username/x");
        assert_eq!(resolve(dir, "../../etc/passwd"), "/srv/sb/abc/etc/passwd");
    }

    #[test]
    fn test_snapshot_links_unchanged_files() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("home");
        std::fs::create_dir_all(home.join("src")).unwrap();
        std::fs::write(home.join("src/lib.rs"), "fn a() {}").unwrap();
        std::fs::write(home.join("notes.txt"), "v1").unwrap();
        std::fs::write(home.join("debug.log"), "noise").unwrap();

        let first = tmp.path().join("cp1");
        snapshot_tree(&home, &first, None).unwrap();
        assert!(!first.join("debug.log").exists());

        std::fs::write(home.join("notes.txt"), "v2").unwrap();
        let second = tmp.path().join("cp2");
        snapshot_tree(&home, &second, Some(&first)).unwrap();

        let ino = |p: &Path| std::fs::metadata(p).unwrap().ino();
        assert_eq!(ino(&first.join("src/lib.rs")), ino(&second.join("src/lib.rs")));
        assert_ne!(ino(&first.join("notes.txt")), ino(&second.join("notes.txt")));
        assert_eq!(std::fs::read_to_string(second.join("notes.txt")).unwrap(), "v2");
    }

    #[test]
    fn test_mirror_deletes_extras_and_keeps_excluded() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshot = tmp.path().join("snap");
        let home = tmp.path().join("home");
        std::fs::create_dir_all(&snapshot).unwrap();
        std::fs::write(snapshot.join("a.txt"), "original").unwrap();

        std::fs::create_dir_all(home.join("extra_dir")).unwrap();
        std::fs::create_dir_all(home.join(".checkpoints/cp")).unwrap();
        std::fs::write(home.join("a.txt"), "edited").unwrap();
        std::fs::write(home.join("b.txt"), "new").unwrap();
        std::fs::write(home.join("app.log"), "keep").unwrap();

        mirror_tree(&snapshot, &home).unwrap();

        assert_eq!(std::fs::read_to_string(home.join("a.txt")).unwrap(), "original");
        assert!(!home.join("b.txt").exists());
        assert!(!home.join("extra_dir").exists());
        assert!(home.join(".checkpoints/cp").exists());
        assert!(home.join("app.log").exists());

        // Restored file is a copy, not a link into the snapshot
        std::fs::write(home.join("a.txt"), "changed again").unwrap();
        assert_eq!(std::fs::read_to_string(snapshot.join("a.txt")).unwrap(), "original");
    }

    #[test]
    fn test_mirror_replaces_type_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshot = tmp.path().join("snap");
        let home = tmp.path().join("home");
        std::fs::create_dir_all(snapshot.join("thing")).unwrap();
        std::fs::write(snapshot.join("thing/inner.txt"), "x").unwrap();
        std::fs::create_dir_all(&home).unwrap();
        std::fs::write(home.join("thing"), "was a file").unwrap();

        mirror_tree(&snapshot, &home).unwrap();
        assert_eq!(std::fs::read_to_string(home.join("thing/inner.txt")).unwrap(), "x");
    }
}
