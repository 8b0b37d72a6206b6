// ABOUTME: Exec channel that runs the agent CLI inside a Docker container
// ABOUTME: Demultiplexes the hijacked exec socket and monitors the process through exec inspection

use async_trait::async_trait;
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bollard::Docker;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::framing::FrameDecoder;
use super::hijack::{self, BoxedSocket, DockerEndpoint};
use super::{ExecChannel, ExitProbe, LaunchSpec, OutputSink, ProcessState, KILL_GRACE};
use crate::error::{Result, SandboxError};

const READ_CHUNK: usize = 8192;

/// End-of-transmission byte, sent when the socket cannot be half-closed
const EOT: u8 = 0x04;

/// Demultiplex exec output into `sink` until EOF. Corrupt or truncated framing ends the
/// stream with a decode error.
pub(crate) async fn pump_frames<R: AsyncRead + Unpin>(mut reader: R, mut sink: OutputSink) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Exec socket read ended: {}", e);
                break;
            }
        };
        let frames = match decoder.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => return sink.fail(e),
        };
        for frame in frames {
            if !sink.frame(frame).await {
                return;
            }
        }
    }
    match decoder.finish() {
        Ok(()) => sink.finish().await,
        Err(e) => sink.fail(e),
    }
}

pub struct DockerExecChannel {
    docker: Docker,
    endpoint: DockerEndpoint,
    container: String,
    exec_id: Option<String>,
    pid: Option<i64>,
    writer: Option<WriteHalf<BoxedSocket>>,
    reader: Option<JoinHandle<()>>,
}

impl DockerExecChannel {
    pub fn new(docker: Docker, endpoint: DockerEndpoint, container: impl Into<String>) -> Self {
        Self {
            docker,
            endpoint,
            container: container.into(),
            exec_id: None,
            pid: None,
            writer: None,
            reader: None,
        }
    }

    async fn is_running(&self) -> bool {
        let Some(exec_id) = &self.exec_id else {
            return false;
        };
        match self.docker.inspect_exec(exec_id).await {
            Ok(inspect) => inspect.running.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Signal the CLI's process group, falling back to the bare pid
    async fn signal(&self, pid: i64, signal: &str) {
        let command = format!(
            "kill -{sig} -{pid} 2>/dev/null || kill -{sig} {pid} 2>/dev/null || true",
            sig = signal,
            pid = pid
        );
        let options = CreateExecOptions {
            cmd: Some(vec!["bash".to_string(), "-c".to_string(), command]),
            user: Some("root".to_string()),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            ..Default::default()
        };
        let result = async {
            let exec = self.docker.create_exec(&self.container, options).await?;
            self.docker
                .start_exec(
                    &exec.id,
                    Some(StartExecOptions {
                        detach: true,
                        ..Default::default()
                    }),
                )
                .await?;
            Ok::<_, bollard::errors::Error>(())
        }
        .await;
        if let Err(e) = result {
            debug!("Failed to send SIG{} to CLI pid {}: {}", signal, pid, e);
        }
    }
}

#[async_trait]
impl ExecChannel for DockerExecChannel {
    async fn open(&mut self, launch: &LaunchSpec, mut sink: OutputSink) -> Result<Arc<dyn ExitProbe>> {
        let env: Vec<String> = launch
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let options = CreateExecOptions {
            cmd: Some(vec![
                "bash".to_string(),
                "-c".to_string(),
                launch.command_line.clone(),
            ]),
            env: Some(env),
            working_dir: Some(launch.cwd.clone()),
            user: Some(launch.user.clone()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = match self.docker.create_exec(&self.container, options).await {
            Ok(exec) => exec,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(SandboxError::sandbox_not_found(self.container.clone())),
            Err(e) => return Err(e.into()),
        };
        info!("Starting agent CLI exec {} in {}", exec.id, self.container);

        let hijacked = hijack::start_exec(&self.endpoint, &exec.id, false).await?;
        let reader = hijacked.reader;
        self.writer = Some(hijacked.writer);

        self.reader = Some(tokio::spawn(pump_frames(reader, sink)));

        match self.docker.inspect_exec(&exec.id).await {
            Ok(inspect) => self.pid = inspect.pid.filter(|pid| *pid > 0),
            Err(e) => debug!("Could not read CLI pid: {}", e),
        }
        self.exec_id = Some(exec.id.clone());

        Ok(Arc::new(DockerExitProbe {
            docker: self.docker.clone(),
            exec_id: exec.id,
        }))
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SandboxError::CliConnection("Exec socket is not open".to_string()))?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn send_eof(&mut self) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        if let Err(e) = writer.shutdown().await {
            debug!("Half-close unsupported ({}), sending EOT byte", e);
            writer.write_all(&[EOT]).await?;
            writer.flush().await?;
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }

        if let Some(pid) = self.pid.take() {
            if self.is_running().await {
                self.signal(pid, "TERM").await;
                tokio::time::sleep(KILL_GRACE).await;
                if self.is_running().await {
                    self.signal(pid, "KILL").await;
                }
            }
        }

        self.writer = None;
        Ok(())
    }
}

struct DockerExitProbe {
    docker: Docker,
    exec_id: String,
}

#[async_trait]
impl ExitProbe for DockerExitProbe {
    async fn poll(&self) -> Result<ProcessState> {
        match self.docker.inspect_exec(&self.exec_id).await {
            Ok(inspect) if inspect.running.unwrap_or(false) => Ok(ProcessState::Running),
            Ok(inspect) => Ok(ProcessState::Exited(inspect.exit_code.unwrap_or(0))),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ProcessState::Vanished),
            Err(e) => Err(e.into()),
        }
    }
}
