// ABOUTME: Bidirectional channel to one agent CLI process running inside a sandbox
// ABOUTME: Shared write, half-close, monitor, and close logic over backend-specific exec channels

pub mod docker;
pub mod framing;
pub mod hijack;
pub mod local;
pub mod options;
pub mod parser;

pub use options::{AgentDefinition, AgentOptions, SystemPrompt};

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SandboxError};
use framing::{Frame, StreamKind};
use parser::JsonStreamParser;

/// Raw stdout chunks buffered between the reader task and the consumer
pub const OUTPUT_QUEUE_SIZE: usize = 32;

/// Process liveness poll interval
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

/// Delay between SIGTERM and SIGKILL when tearing the CLI down
pub const KILL_GRACE: Duration = Duration::from_millis(500);

const STDERR_TAIL_BYTES: usize = 4096;

/// Parsed CLI messages. Ends after the `result` message, on channel close, or on the first error.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Start the CLI process and its output reader
    async fn connect(&mut self) -> Result<()>;

    /// Send raw text (normally one JSON line) to the CLI's stdin
    async fn write(&mut self, data: &str) -> Result<()>;

    /// Half-close stdin. Idempotent.
    async fn end_input(&mut self) -> Result<()>;

    /// Take the message stream. Only the first call after `connect` yields messages.
    fn read_messages(&mut self) -> MessageStream;

    /// Close input, stop monitoring, release the process, and end any pending reader
    async fn close(&mut self) -> Result<()>;

    fn is_ready(&self) -> bool;
}

/// Everything a backend needs to launch the CLI
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Passed to `bash -c`
    pub command_line: String,
    pub env: HashMap<String, String>,
    pub cwd: String,
    pub user: String,
}

impl LaunchSpec {
    pub fn from_options(options: &AgentOptions) -> Result<Self> {
        Ok(Self {
            command_line: format!("exec {}", options.command_line()?),
            env: options.process_env(),
            cwd: options.working_dir(),
            user: options.run_as(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(i64),
    /// The backend no longer knows about the process
    Vanished,
}

#[async_trait]
pub trait ExitProbe: Send + Sync {
    async fn poll(&self) -> Result<ProcessState>;
}

/// Backend half of a transport: starts the process and moves bytes.
#[async_trait]
pub trait ExecChannel: Send + Sync {
    /// Launch the process. Output must be delivered through `sink`; dropping it ends the stream.
    async fn open(&mut self, launch: &LaunchSpec, sink: OutputSink) -> Result<Arc<dyn ExitProbe>>;

    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Signal end of input to the process
    async fn send_eof(&mut self) -> Result<()>;

    /// Stop reader tasks, terminate the process, release sockets
    async fn release(&mut self) -> Result<()>;
}

// ==================== Output Sink ====================

/// Last few KB of stderr, attached to process errors
#[derive(Debug, Clone, Default)]
pub struct StderrTail(Arc<Mutex<String>>);

impl StderrTail {
    pub fn push(&self, text: &str) {
        let mut tail = self.0.lock().unwrap_or_else(|p| p.into_inner());
        tail.push_str(text);
        if tail.len() > STDERR_TAIL_BYTES {
            let mut cut = tail.len() - STDERR_TAIL_BYTES;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail.drain(..cut);
        }
    }

    pub fn snapshot(&self) -> String {
        self.0
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .trim()
            .to_string()
    }
}

/// Decodes UTF-8 across chunk boundaries; invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    pub fn flush(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Owns the only sender of the stdout queue. Dropping the sink ends the message stream.
pub struct OutputSink {
    stdout: mpsc::Sender<String>,
    stdout_decoder: Utf8Decoder,
    stderr_decoder: Utf8Decoder,
    stderr_forward: Option<mpsc::UnboundedSender<String>>,
    stderr_tail: StderrTail,
    fault: SharedExitError,
}

impl OutputSink {
    pub fn new(
        stdout: mpsc::Sender<String>,
        stderr_forward: Option<mpsc::UnboundedSender<String>>,
        stderr_tail: StderrTail,
        fault: SharedExitError,
    ) -> Self {
        Self {
            stdout,
            stdout_decoder: Utf8Decoder::default(),
            stderr_decoder: Utf8Decoder::default(),
            stderr_forward,
            stderr_tail,
            fault,
        }
    }

    /// Queue stdout bytes. Returns `false` once the consumer is gone.
    pub async fn stdout(&mut self, bytes: &[u8]) -> bool {
        let text = self.stdout_decoder.decode(bytes);
        if text.is_empty() {
            return true;
        }
        self.stdout.send(text).await.is_ok()
    }

    pub fn stderr(&mut self, bytes: &[u8]) {
        let text = self.stderr_decoder.decode(bytes);
        self.forward_stderr(text);
    }

    /// Route a demultiplexed frame to the matching stream
    pub async fn frame(&mut self, frame: Frame) -> bool {
        match frame.kind {
            StreamKind::Stdout => self.stdout(&frame.payload).await,
            StreamKind::Stderr => {
                self.stderr(&frame.payload);
                true
            }
            StreamKind::Stdin | StreamKind::Unknown(_) => {
                debug!("Ignoring exec frame of kind {:?}", frame.kind);
                true
            }
        }
    }

    /// End the stream with a fatal error; the consumer sees it once queued output is drained
    pub fn fail(self, err: SandboxError) {
        error!("Agent CLI output stream failed: {}", err);
        record_exit_error(&self.fault, err);
    }

    /// Flush partial UTF-8 sequences, then drop the sender
    pub async fn finish(mut self) {
        let rest = self.stdout_decoder.flush();
        if !rest.is_empty() {
            let _ = self.stdout.send(rest).await;
        }
        let rest = self.stderr_decoder.flush();
        self.forward_stderr(rest);
    }

    fn forward_stderr(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        self.stderr_tail.push(&text);
        match &self.stderr_forward {
            Some(tx) => {
                if tx.send(text).is_err() {
                    self.stderr_forward = None;
                }
            }
            None => debug!("CLI stderr: {}", text.trim_end()),
        }
    }
}

// ==================== Transport ====================

pub type SharedExitError = Arc<Mutex<Option<SandboxError>>>;

fn record_exit_error(slot: &SharedExitError, err: SandboxError) {
    let mut guard = slot.lock().unwrap_or_else(|p| p.into_inner());
    if guard.is_none() {
        *guard = Some(err);
    }
}

fn take_exit_error(slot: &SharedExitError) -> Option<SandboxError> {
    slot.lock().unwrap_or_else(|p| p.into_inner()).take()
}

fn state_error(state: ProcessState, tail: &StderrTail) -> Option<SandboxError> {
    match state {
        ProcessState::Exited(code) if code != 0 => Some(SandboxError::Process {
            exit_code: code,
            stderr: tail.snapshot(),
        }),
        ProcessState::Vanished => Some(SandboxError::CliConnection(
            "CLI process disappeared unexpectedly".to_string(),
        )),
        _ => None,
    }
}

/// Agent transport over any [`ExecChannel`]
pub struct SandboxTransport<C: ExecChannel> {
    channel: C,
    options: AgentOptions,
    ready: bool,
    input_closed: bool,
    closed: bool,
    receiver: Option<mpsc::Receiver<String>>,
    probe: Option<Arc<dyn ExitProbe>>,
    monitor: Option<JoinHandle<()>>,
    exit_error: SharedExitError,
    stream_fault: SharedExitError,
    stderr_tail: StderrTail,
    closed_tx: watch::Sender<bool>,
}

impl<C: ExecChannel> SandboxTransport<C> {
    pub fn new(channel: C, options: AgentOptions) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            channel,
            options,
            ready: false,
            input_closed: false,
            closed: false,
            receiver: None,
            probe: None,
            monitor: None,
            exit_error: Arc::new(Mutex::new(None)),
            stream_fault: Arc::new(Mutex::new(None)),
            stderr_tail: StderrTail::default(),
            closed_tx,
        }
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    async fn stop_monitor(&mut self) {
        if let Some(handle) = self.monitor.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl<C: ExecChannel + 'static> AgentTransport for SandboxTransport<C> {
    async fn connect(&mut self) -> Result<()> {
        if self.ready {
            return Ok(());
        }
        if self.closed {
            return Err(SandboxError::CliConnection(
                "Transport has been closed".to_string(),
            ));
        }

        let launch = LaunchSpec::from_options(&self.options)?;
        debug!("Launching agent CLI: {}", launch.command_line);

        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_SIZE);
        let sink = OutputSink::new(
            tx,
            self.options.stderr.clone(),
            self.stderr_tail.clone(),
            self.stream_fault.clone(),
        );
        let probe = self.channel.open(&launch, sink).await.map_err(|e| match e {
            SandboxError::CliConnection(_) | SandboxError::NotFound { .. } => e,
            other => SandboxError::CliConnection(format!("Failed to start agent CLI: {}", other)),
        })?;

        self.monitor = Some(tokio::spawn(monitor_process(
            probe.clone(),
            self.exit_error.clone(),
            self.stderr_tail.clone(),
        )));
        self.probe = Some(probe);
        self.receiver = Some(rx);
        self.ready = true;
        info!("Agent CLI connected");
        Ok(())
    }

    async fn write(&mut self, data: &str) -> Result<()> {
        if !self.ready || self.closed {
            return Err(SandboxError::CliConnection(
                "Transport is not ready for writing".to_string(),
            ));
        }
        if self.input_closed {
            return Err(SandboxError::CliConnection(
                "Cannot write after input has been closed".to_string(),
            ));
        }
        if let Some(err) = take_exit_error(&self.exit_error) {
            let message = format!("Cannot write to terminated process: {}", err);
            record_exit_error(&self.exit_error, err);
            return Err(SandboxError::CliConnection(message));
        }
        self.channel.send(data.as_bytes()).await
    }

    async fn end_input(&mut self) -> Result<()> {
        if self.input_closed || !self.ready {
            return Ok(());
        }
        self.input_closed = true;
        self.channel.send_eof().await
    }

    fn read_messages(&mut self) -> MessageStream {
        let Some(mut receiver) = self.receiver.take() else {
            return Box::pin(futures::stream::once(async {
                Err(SandboxError::CliConnection(
                    "Transport is not connected or messages were already taken".to_string(),
                ))
            }));
        };

        let mut closed_rx = self.closed_tx.subscribe();
        let probe = self.probe.clone();
        let exit_error = self.exit_error.clone();
        let stream_fault = self.stream_fault.clone();
        let tail = self.stderr_tail.clone();
        let mut parser = JsonStreamParser::new(self.options.max_buffer_size());

        Box::pin(async_stream::stream! {
            let mut by_result = false;
            let mut by_close = false;

            loop {
                if *closed_rx.borrow() {
                    by_close = true;
                    break;
                }
                let chunk = tokio::select! {
                    biased;
                    _ = closed_rx.changed() => {
                        by_close = true;
                        None
                    }
                    chunk = receiver.recv() => chunk,
                };
                let Some(chunk) = chunk else { break };

                match parser.push(&chunk) {
                    Ok(values) => {
                        for value in values {
                            yield Ok(value);
                        }
                        if parser.is_done() {
                            by_result = true;
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Agent CLI output could not be decoded: {}", e);
                        yield Err(e);
                        return;
                    }
                }
            }

            if by_result || by_close {
                return;
            }

            if let Some(err) = take_exit_error(&stream_fault) {
                yield Err(err);
                return;
            }

            match parser.finish() {
                Ok(Some(value)) => yield Ok(value),
                Ok(None) => {}
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }

            if let Some(err) = take_exit_error(&exit_error) {
                yield Err(err);
                return;
            }
            if let Some(probe) = probe {
                if let Some(err) = final_exit_check(probe.as_ref(), &tail).await {
                    yield Err(err);
                }
            }
        })
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        if let Err(e) = self.end_input().await {
            debug!("Ignoring end_input failure during close: {}", e);
        }
        self.stop_monitor().await;
        let released = self.channel.release().await;
        if let Err(e) = &released {
            warn!("Failed to release agent CLI process: {}", e);
        }

        let _ = self.closed_tx.send(true);
        self.receiver = None;
        self.ready = false;
        self.closed = true;
        info!("Agent CLI transport closed");
        released
    }

    fn is_ready(&self) -> bool {
        self.ready && !self.closed
    }
}

impl<C: ExecChannel> Drop for SandboxTransport<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.take() {
            handle.abort();
        }
        let _ = self.closed_tx.send(true);
    }
}

async fn monitor_process(probe: Arc<dyn ExitProbe>, exit_error: SharedExitError, tail: StderrTail) {
    let mut interval = tokio::time::interval(MONITOR_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match probe.poll().await {
            Ok(ProcessState::Running) => {}
            Ok(state) => {
                debug!("Agent CLI process state: {:?}", state);
                if let Some(err) = state_error(state, &tail) {
                    warn!("Agent CLI terminated abnormally: {}", err);
                    record_exit_error(&exit_error, err);
                }
                return;
            }
            Err(e) => warn!("Failed to poll agent CLI process: {}", e),
        }
    }
}

/// The output channel closed without a result; give the process a moment to report its exit.
async fn final_exit_check(probe: &dyn ExitProbe, tail: &StderrTail) -> Option<SandboxError> {
    for _ in 0..10 {
        match probe.poll().await {
            Ok(ProcessState::Running) => tokio::time::sleep(Duration::from_millis(50)).await,
            Ok(state) => return state_error(state, tail),
            Err(e) => {
                debug!("Final exit probe failed: {}", e);
                return None;
            }
        }
    }
    None
}
