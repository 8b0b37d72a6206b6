// ABOUTME: Exec channel that runs the agent CLI as a host process
// ABOUTME: Used by the local-directory provider; signals the whole process group on release

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{ExecChannel, ExitProbe, LaunchSpec, OutputSink, ProcessState, KILL_GRACE};
use crate::error::{Result, SandboxError};

const READ_CHUNK: usize = 8192;

/// Exit code reported for signal deaths, shell style
pub fn exit_code(status: ExitStatus) -> i64 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code as i64,
        (None, Some(signal)) => 128 + signal as i64,
        (None, None) => -1,
    }
}

/// SIGTERM the child's process group, then SIGKILL after `grace`
pub async fn terminate_process_group(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };
    let group = Pid::from_raw(pid as i32);

    if let Err(e) = killpg(group, Signal::SIGTERM) {
        debug!("SIGTERM to process group {} failed: {}", pid, e);
        let _ = child.wait().await;
        return;
    }
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    if let Err(e) = killpg(group, Signal::SIGKILL) {
        debug!("SIGKILL to process group {} failed: {}", pid, e);
    }
    let _ = child.wait().await;
}

pub struct LocalExecChannel {
    child: Option<Arc<Mutex<Child>>>,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<()>>,
}

impl LocalExecChannel {
    pub fn new() -> Self {
        Self {
            child: None,
            stdin: None,
            reader: None,
        }
    }
}

impl Default for LocalExecChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecChannel for LocalExecChannel {
    async fn open(&mut self, launch: &LaunchSpec, mut sink: OutputSink) -> Result<Arc<dyn ExitProbe>> {
        let mut child = Command::new("bash")
            .arg("-c")
            .arg(&launch.command_line)
            .envs(&launch.env)
            .current_dir(&launch.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0)
            .spawn()
            .map_err(|e| SandboxError::CliConnection(format!("Failed to spawn agent CLI: {}", e)))?;
        info!("Started agent CLI process {:?}", child.id());

        let missing = || SandboxError::CliConnection("CLI process pipes unavailable".to_string());
        self.stdin = Some(child.stdin.take().ok_or_else(missing)?);
        let mut stdout = child.stdout.take().ok_or_else(missing)?;
        let mut stderr = child.stderr.take().ok_or_else(missing)?;

        self.reader = Some(tokio::spawn(async move {
            let mut out_buf = vec![0u8; READ_CHUNK];
            let mut err_buf = vec![0u8; READ_CHUNK];
            let mut out_open = true;
            let mut err_open = true;
            while out_open || err_open {
                tokio::select! {
                    read = stdout.read(&mut out_buf), if out_open => match read {
                        Ok(0) | Err(_) => out_open = false,
                        Ok(n) => {
                            if !sink.stdout(&out_buf[..n]).await {
                                break;
                            }
                        }
                    },
                    read = stderr.read(&mut err_buf), if err_open => match read {
                        Ok(0) | Err(_) => err_open = false,
                        Ok(n) => sink.stderr(&err_buf[..n]),
                    },
                }
            }
            sink.finish().await;
        }));

        let child = Arc::new(Mutex::new(child));
        self.child = Some(child.clone());
        Ok(Arc::new(LocalExitProbe { child }))
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SandboxError::CliConnection("CLI stdin is closed".to_string()))?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn send_eof(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        self.stdin = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        if let Some(child) = self.child.take() {
            let mut child = child.lock().await;
            if matches!(child.try_wait(), Ok(None)) {
                terminate_process_group(&mut child, KILL_GRACE).await;
            }
        }
        Ok(())
    }
}

struct LocalExitProbe {
    child: Arc<Mutex<Child>>,
}

#[async_trait]
impl ExitProbe for LocalExitProbe {
    async fn poll(&self) -> Result<ProcessState> {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => Ok(ProcessState::Exited(exit_code(status))),
            Ok(None) => Ok(ProcessState::Running),
            Err(e) => {
                debug!("CLI process wait failed: {}", e);
                Ok(ProcessState::Vanished)
            }
        }
    }
}
