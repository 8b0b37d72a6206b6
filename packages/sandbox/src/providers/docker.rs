// ABOUTME: Docker provider implementation for container-based sandboxes
// ABOUTME: Uses bollard to manage sandbox containers, exec sessions, file transfer, and PTYs

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
        LogOutput, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        UploadToContainerOptions,
    },
    exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults},
    image::{CommitContainerOptions, CreateImageOptions, RemoveImageOptions},
    models::{HostConfig, PortBinding},
    network::CreateNetworkOptions,
    Docker, API_DEFAULT_VERSION,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ExecOptions, SandboxProvider};
use crate::config::DockerConfig;
use crate::error::{Result, SandboxError};
use crate::helpers::{self, checkpoints, files, ports, secrets};
use crate::pty::PtyRegistry;
use crate::transport::docker::DockerExecChannel;
use crate::transport::hijack::{self, DockerEndpoint};
use crate::transport::{AgentOptions, AgentTransport, SandboxTransport};
use crate::types::{
    CheckpointInfo, CommandResult, FileContent, FileMetadata, PreviewLink, PtyEvent, PtyHandle,
    PtySession, PtySize, SecretEntry,
};

const CONTAINER_PREFIX: &str = "agentbox-sandbox-";
const LABEL_PREFIX: &str = "agentbox.sandbox";
const CLONE_REPOSITORY: &str = "agentbox-clone";

/// uid/gid of the sandbox user inside the image
const SANDBOX_UID: u64 = 1000;

/// Exit code of coreutils `timeout` when the budget elapses
const TIMEOUT_EXIT_CODE: i64 = 124;

const QUICK_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// `timeout` exits 124 when it fires, but the wrapped command may exit 124 on its own.
/// Only a run that lasted the whole budget counts as timed out.
fn timed_out(exit_code: i64, elapsed: Duration, budget: Duration) -> bool {
    exit_code == TIMEOUT_EXIT_CODE && elapsed >= budget
}

struct DockerPty {
    exec_id: String,
    input: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl DockerPty {
    fn shutdown(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

pub struct DockerProvider {
    client: Docker,
    config: DockerConfig,
    endpoint: DockerEndpoint,
    /// sandbox id -> (container port -> host port)
    port_mappings: Arc<RwLock<HashMap<String, HashMap<u16, u16>>>>,
    /// Cache of successfully pulled images to avoid redundant pulls
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    pull_timeout: Duration,
    ptys: Arc<PtyRegistry<DockerPty>>,
}

impl DockerProvider {
    /// Connect to the configured Docker endpoint (local socket by default)
    pub fn new(config: DockerConfig) -> Result<Self> {
        let endpoint = DockerEndpoint::parse(config.host.as_deref())?;
        let client = match &endpoint {
            DockerEndpoint::Unix(path) if config.host.is_some() => Docker::connect_with_unix(
                &path.to_string_lossy(),
                120,
                API_DEFAULT_VERSION,
            ),
            DockerEndpoint::Tcp(addr) => Docker::connect_with_http(addr, 120, API_DEFAULT_VERSION),
            DockerEndpoint::Unix(_) => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| SandboxError::Provisioning(format!("Failed to connect to Docker: {}", e)))?;

        Ok(Self::with_client(client, config, endpoint))
    }

    pub fn with_client(client: Docker, config: DockerConfig, endpoint: DockerEndpoint) -> Self {
        Self {
            client,
            config,
            endpoint,
            port_mappings: Arc::new(RwLock::new(HashMap::new())),
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout: Duration::from_secs(600),
            ptys: Arc::new(PtyRegistry::new()),
        }
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    /// True when the Docker daemon answers a ping
    pub async fn is_available(&self) -> bool {
        match self.client.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Docker not available: {}", e);
                false
            }
        }
    }

    pub fn container_name(sandbox_id: &str) -> String {
        format!("{}{}", CONTAINER_PREFIX, sandbox_id)
    }

    fn sandbox_ports(&self) -> Vec<u16> {
        let mut all = ports::EXPOSABLE_PORTS.to_vec();
        if !all.contains(&self.config.ide_port) {
            all.push(self.config.ide_port);
        }
        all
    }

    /// Reverse-proxy routing labels, one router per exposed port
    fn routing_labels(&self, sandbox_id: &str) -> HashMap<String, String> {
        let mut labels = HashMap::from([
            (format!("{}.managed", LABEL_PREFIX), "true".to_string()),
            (format!("{}.id", LABEL_PREFIX), sandbox_id.to_string()),
        ]);
        let Some(domain) = &self.config.sandbox_domain else {
            return labels;
        };

        labels.insert("traefik.enable".to_string(), "true".to_string());
        for port in self.sandbox_ports() {
            let router = format!("sandbox-{}-{}", sandbox_id, port);
            labels.insert(
                format!("traefik.http.routers.{}.rule", router),
                format!("Host(`{}.{}`)", router, domain),
            );
            labels.insert(
                format!("traefik.http.routers.{}.entrypoints", router),
                "https".to_string(),
            );
            labels.insert(format!("traefik.http.routers.{}.tls", router), "true".to_string());
            labels.insert(format!("traefik.http.routers.{}.service", router), router.clone());
            labels.insert(
                format!("traefik.http.services.{}.loadbalancer.server.port", router),
                port.to_string(),
            );
        }
        labels
    }

    fn container_config(&self, sandbox_id: &str, image: &str) -> Config<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in self.sandbox_ports() {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(String::new()),
                }]),
            );
        }

        let env = vec![
            format!("TERM={}", helpers::TERMINAL_TYPE),
            format!("HOME={}", self.config.user_home),
            "USER=user".to_string(),
            format!("OPENVSCODE_PORT={}", self.config.ide_port),
        ];

        Config {
            image: Some(image.to_string()),
            cmd: Some(vec!["/bin/bash".to_string()]),
            hostname: Some("sandbox".to_string()),
            user: Some("user".to_string()),
            working_dir: Some(self.config.user_home.clone()),
            open_stdin: Some(true),
            tty: Some(true),
            env: Some(env),
            labels: Some(self.routing_labels(sandbox_id)),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                privileged: Some(true),
                security_opt: Some(vec!["no-new-privileges=false".to_string()]),
                network_mode: Some(self.config.network.clone()),
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // ==================== Images & Networks ====================

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_cache.read().await.contains_key(image) {
            debug!("Image {} found in cache, skipping pull", image);
            if self.image_exists(image).await? {
                return Ok(());
            }
            self.image_cache.write().await.remove(image);
            info!("Image {} was deleted, removing from cache", image);
        } else if self.image_exists(image).await? {
            self.image_cache
                .write()
                .await
                .insert(image.to_string(), chrono::Utc::now());
            return Ok(());
        }

        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| {
                    SandboxError::Provisioning(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(status) = &info.status {
                    if status != &last_status {
                        debug!("Pull status: {}", status);
                        last_status = status.clone();
                    }
                }
                if let Some(error) = info.error {
                    return Err(SandboxError::Provisioning(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                self.image_cache
                    .write()
                    .await
                    .insert(image.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SandboxError::Provisioning(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn ensure_network(&self) -> Result<()> {
        let network = &self.config.network;
        if matches!(network.as_str(), "bridge" | "host" | "none") {
            return Ok(());
        }
        match self.client.inspect_network::<String>(network, None).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                info!("Creating sandbox network: {}", network);
                self.client
                    .create_network(CreateNetworkOptions {
                        name: network.clone(),
                        driver: "bridge".to_string(),
                        ..Default::default()
                    })
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ==================== Containers ====================

    async fn run_container(&self, sandbox_id: &str, image: &str) -> Result<()> {
        let name = Self::container_name(sandbox_id);
        info!("Creating sandbox container: {}", name);

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        self.client
            .create_container(Some(options), self.container_config(sandbox_id, image))
            .await?;
        self.client
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await?;
        self.refresh_port_mappings(sandbox_id).await?;
        Ok(())
    }

    /// Container state: `None` when it does not exist, otherwise whether it runs
    async fn container_state(&self, sandbox_id: &str) -> Result<Option<bool>> {
        let name = Self::container_name(sandbox_id);
        match self
            .client
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(Some(
                inspect.state.and_then(|s| s.running).unwrap_or(false),
            )),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn refresh_port_mappings(&self, sandbox_id: &str) -> Result<HashMap<u16, u16>> {
        let name = Self::container_name(sandbox_id);
        let inspect = self
            .client
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await?;

        let mut mappings = HashMap::new();
        let port_map = inspect.network_settings.and_then(|ns| ns.ports);
        for (container_port, bindings) in port_map.into_iter().flatten() {
            let host_port = bindings
                .as_ref()
                .and_then(|b| b.first())
                .and_then(|b| b.host_port.as_deref())
                .and_then(|p| p.parse::<u16>().ok());
            let internal = container_port
                .split('/')
                .next()
                .and_then(|p| p.parse::<u16>().ok());
            if let (Some(internal), Some(host_port)) = (internal, host_port) {
                mappings.insert(internal, host_port);
            }
        }

        self.port_mappings
            .write()
            .await
            .insert(sandbox_id.to_string(), mappings.clone());
        Ok(mappings)
    }

    async fn port_mappings_for(&self, sandbox_id: &str) -> Result<HashMap<u16, u16>> {
        if let Some(mappings) = self.port_mappings.read().await.get(sandbox_id) {
            return Ok(mappings.clone());
        }
        self.refresh_port_mappings(sandbox_id).await
    }

    /// Resolve a sandbox to its running container, starting it if parked
    async fn ensure_running(&self, sandbox_id: &str) -> Result<String> {
        let name = Self::container_name(sandbox_id);
        match self.container_state(sandbox_id).await? {
            None => Err(SandboxError::sandbox_not_found(sandbox_id)),
            Some(true) => Ok(name),
            Some(false) => {
                info!("Starting parked sandbox container: {}", name);
                self.client
                    .start_container(&name, None::<StartContainerOptions<String>>)
                    .await?;
                self.refresh_port_mappings(sandbox_id).await?;
                Ok(name)
            }
        }
    }

    async fn destroy_container(&self, name: &str) {
        if let Err(e) = self
            .client
            .stop_container(name, Some(StopContainerOptions { t: 5 }))
            .await
        {
            debug!("Stopping container {} failed: {}", name, e);
        }
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        if let Err(e) = self.client.remove_container(name, Some(options)).await {
            warn!("Failed to remove container {}: {}", name, e);
        }
    }

    async fn ensure_ide_server(&self, sandbox_id: &str) {
        let port = self.config.ide_port;
        let check = format!(
            "ss -tuln | grep -q ':{}' && echo 'running' || echo 'stopped'",
            port
        );
        let status = match self
            .execute(sandbox_id, &check, ExecOptions::with_timeout(QUICK_COMMAND_TIMEOUT))
            .await
        {
            Ok(result) => result.stdout,
            Err(e) => {
                warn!("Failed to check IDE server for sandbox {}: {}", sandbox_id, e);
                return;
            }
        };
        if !status.contains("stopped") {
            return;
        }

        let start = format!(
            "nohup openvscode-server --port={} --host=0.0.0.0 --without-connection-token > /dev/null 2>&1 &",
            port
        );
        if let Err(e) = self
            .execute(sandbox_id, &start, ExecOptions::background())
            .await
        {
            warn!("Failed to start IDE server for sandbox {}: {}", sandbox_id, e);
        }
    }

    // ==================== Exec ====================

    async fn run_exec(
        &self,
        container: &str,
        command: &str,
        options: &ExecOptions,
        timeout: Duration,
    ) -> Result<CommandResult> {
        let env: Vec<String> = options
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        if options.background {
            let exec = self
                .client
                .create_exec(
                    container,
                    CreateExecOptions {
                        cmd: Some(vec!["bash".to_string(), "-c".to_string(), command.to_string()]),
                        env: Some(env),
                        working_dir: Some(self.config.user_home.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            self.client
                .start_exec(
                    &exec.id,
                    Some(StartExecOptions {
                        detach: true,
                        ..Default::default()
                    }),
                )
                .await?;
            return Ok(CommandResult::background());
        }

        // In-container budget first so the process tree dies with it
        let budget = Duration::from_secs(timeout.as_secs().max(1));
        let wrapped = format!(
            "timeout -k 5 {} bash -c {}",
            budget.as_secs(),
            helpers::quote(command)?
        );
        let exec = self
            .client
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(vec!["bash".to_string(), "-c".to_string(), wrapped]),
                    env: Some(env),
                    working_dir: Some(self.config.user_home.clone()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let started = Instant::now();
        let collect = async {
            match self.client.start_exec(&exec.id, None).await? {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(msg) = output.next().await {
                        match msg? {
                            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                                stdout.extend_from_slice(&message)
                            }
                            LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                            LogOutput::StdIn { .. } => {}
                        }
                    }
                    Ok(())
                }
                StartExecResults::Detached => Err(SandboxError::CommandFailed {
                    exit_code: -1,
                    output: "Exec was detached unexpectedly".to_string(),
                }),
            }
        };
        match tokio::time::timeout(timeout + Duration::from_secs(1), collect).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SandboxError::Timeout {
                    seconds: timeout.as_secs(),
                })
            }
        }

        let exit_code = self
            .client
            .inspect_exec(&exec.id)
            .await?
            .exit_code
            .unwrap_or(0);
        if timed_out(exit_code, started.elapsed(), budget) {
            return Err(SandboxError::Timeout {
                seconds: timeout.as_secs(),
            });
        }

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn attach_pty(&self, sandbox_id: &str, container: &str, size: PtySize) -> Result<PtyHandle> {
        let exec = self
            .client
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/bash".to_string()]),
                    env: Some(vec![format!("TERM={}", helpers::TERMINAL_TYPE)]),
                    working_dir: Some(self.config.user_home.clone()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        let hijacked = hijack::start_exec(&self.endpoint, &exec.id, true).await?;
        let mut socket_reader = hijacked.reader;
        let mut socket_writer = hijacked.writer;

        let session_id = uuid::Uuid::new_v4().to_string();
        let (output_tx, output_rx) = mpsc::channel(helpers::PTY_OUTPUT_QUEUE_SIZE);
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let registry = self.ptys.clone();
        let reader_sandbox = sandbox_id.to_string();
        let reader_session = session_id.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match socket_reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.send(PtyEvent::Output(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("PTY reader error: {}", e);
                        break;
                    }
                }
            }
            let _ = output_tx.send(PtyEvent::Exited).await;
            if let Some(pty) = registry.remove(&reader_sandbox, &reader_session) {
                pty.writer.abort();
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                if let Err(e) = socket_writer.write_all(&data).await {
                    debug!("PTY input write failed: {}", e);
                    break;
                }
                let _ = socket_writer.flush().await;
            }
        });

        self.ptys.insert(
            sandbox_id,
            &session_id,
            DockerPty {
                exec_id: exec.id.clone(),
                input: input_tx,
                reader,
                writer,
            },
        );

        if size.rows > 0 && size.cols > 0 {
            self.resize_pty(sandbox_id, &session_id, size).await?;
        }

        Ok(PtyHandle {
            session: PtySession {
                id: session_id,
                sandbox_id: sandbox_id.to_string(),
                pid: None,
                rows: size.rows,
                cols: size.cols,
            },
            output: output_rx,
        })
    }
}

// Helper functions for tar operations
fn create_tar_archive(file_name: &str, content: &[u8]) -> std::io::Result<Vec<u8>> {
    use tar::{Builder, Header};

    let mut archive = Builder::new(Vec::new());
    let mut header = Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_uid(SANDBOX_UID);
    header.set_gid(SANDBOX_UID);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    archive.append_data(&mut header, file_name, content)?;
    archive.into_inner()
}

fn extract_first_file(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Archive::new(data);
    let mut content = Vec::new();
    if let Some(entry) = archive.entries()?.next() {
        entry?.read_to_end(&mut content)?;
    }
    Ok(content)
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self) -> Result<String> {
        let sandbox_id = helpers::new_sandbox_id();
        let provision = async {
            self.ensure_image(&self.config.image).await?;
            self.ensure_network().await?;
            self.run_container(&sandbox_id, &self.config.image).await
        };
        if let Err(e) = provision.await {
            self.destroy_container(&Self::container_name(&sandbox_id)).await;
            self.port_mappings.write().await.remove(&sandbox_id);
            return Err(match e {
                SandboxError::Provisioning(_) => e,
                other => SandboxError::Provisioning(format!(
                    "Failed to create Docker sandbox: {}",
                    other
                )),
            });
        }

        self.ensure_ide_server(&sandbox_id).await;
        info!("Created Docker sandbox {}", sandbox_id);
        Ok(sandbox_id)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<bool> {
        match self.ensure_running(sandbox_id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        }
        self.refresh_port_mappings(sandbox_id).await?;
        self.ensure_ide_server(sandbox_id).await;
        Ok(true)
    }

    async fn delete(&self, sandbox_id: &str) -> Result<()> {
        for (_, pty) in self.ptys.drain_sandbox(sandbox_id) {
            pty.shutdown();
        }
        self.port_mappings.write().await.remove(sandbox_id);

        match self.container_state(sandbox_id).await {
            Ok(Some(_)) => {
                self.destroy_container(&Self::container_name(sandbox_id))
                    .await;
                info!("Successfully deleted Docker sandbox {}", sandbox_id);
            }
            Ok(None) => debug!("Sandbox {} already gone", sandbox_id),
            Err(e) => warn!("Failed to inspect sandbox {} for deletion: {}", sandbox_id, e),
        }
        Ok(())
    }

    async fn is_running(&self, sandbox_id: &str) -> Result<bool> {
        Ok(self.container_state(sandbox_id).await?.unwrap_or(false))
    }

    async fn clone_sandbox(&self, source_id: &str, checkpoint_id: Option<&str>) -> Result<String> {
        let source = self.ensure_running(source_id).await?;
        let new_id = helpers::new_sandbox_id();
        let image = format!("{}:{}", CLONE_REPOSITORY, new_id);

        info!("Cloning sandbox {} into {}", source_id, new_id);
        self.client
            .commit_container(
                CommitContainerOptions {
                    container: source.clone(),
                    repo: CLONE_REPOSITORY.to_string(),
                    tag: new_id.clone(),
                    pause: true,
                    ..Default::default()
                },
                Config::<String>::default(),
            )
            .await?;

        let result = async {
            self.run_container(&new_id, &image).await?;
            if let Some(checkpoint_id) = checkpoint_id {
                self.restore_checkpoint(&new_id, checkpoint_id).await?;
            }
            Ok::<_, SandboxError>(())
        }
        .await;

        if result.is_err() {
            warn!("Clone of {} failed, removing partial sandbox {}", source_id, new_id);
            self.destroy_container(&Self::container_name(&new_id)).await;
            self.port_mappings.write().await.remove(&new_id);
        }

        let remove = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.client.remove_image(&image, Some(remove), None).await {
            debug!("Failed to remove clone image {}: {}", image, e);
        }

        result.map(|_| new_id)
    }

    async fn execute(
        &self,
        sandbox_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandResult> {
        let container = self.ensure_running(sandbox_id).await?;
        let timeout = options.timeout.unwrap_or(self.config.command_timeout);
        debug!("Executing in {}: {}", container, command);
        helpers::execute_with_timeout(
            timeout,
            self.run_exec(&container, command, &options, timeout),
        )
        .await
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &[u8]) -> Result<()> {
        let container = self.ensure_running(sandbox_id).await?;
        let normalized = helpers::normalize_path(path, &self.config.user_home);
        let (parent, file_name) = normalized
            .rsplit_once('/')
            .map(|(parent, name)| (if parent.is_empty() { "/" } else { parent }, name))
            .ok_or_else(|| SandboxError::InvalidConfiguration(format!("Invalid path: {}", path)))?;

        let mkdir = format!("mkdir -p {}", helpers::quote(parent)?);
        let result = self
            .execute(sandbox_id, &mkdir, ExecOptions::with_timeout(QUICK_COMMAND_TIMEOUT))
            .await?;
        if !result.success() {
            return Err(SandboxError::CommandFailed {
                exit_code: result.exit_code,
                output: result.stderr,
            });
        }

        let archive = create_tar_archive(file_name, content)?;
        let options = UploadToContainerOptions {
            path: parent.to_string(),
            ..Default::default()
        };
        self.client
            .upload_to_container(&container, Some(options), archive.into())
            .await?;
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<FileContent> {
        let container = self.ensure_running(sandbox_id).await?;
        let normalized = helpers::normalize_path(path, &self.config.user_home);

        let options = DownloadFromContainerOptions {
            path: normalized.clone(),
        };
        let mut stream = self.client.download_from_container(&container, Some(options));
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    return Err(SandboxError::NotFound {
                        kind: "File",
                        id: path.to_string(),
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }

        let content = extract_first_file(&data)?;
        Ok(files::encode_file_content(path, &content))
    }

    async fn list_files(&self, sandbox_id: &str, path: Option<&str>) -> Result<Vec<FileMetadata>> {
        let root = helpers::normalize_path(path.unwrap_or(""), &self.config.user_home);
        let command = files::list_files_command(&root, files::LIST_EXCLUDED_PATHS)?;
        let result = self
            .execute(sandbox_id, &command, ExecOptions::default())
            .await?;
        Ok(files::parse_find_output(&result.stdout, &self.config.user_home))
    }

    async fn create_pty(&self, sandbox_id: &str, size: PtySize) -> Result<PtyHandle> {
        let container = self.ensure_running(sandbox_id).await?;
        let handle = self.attach_pty(sandbox_id, &container, size).await?;
        info!(
            "Opened PTY {} in sandbox {} ({} sessions)",
            handle.session.id,
            sandbox_id,
            self.ptys.count(sandbox_id)
        );
        Ok(handle)
    }

    async fn send_pty_input(&self, sandbox_id: &str, pty_id: &str, data: &[u8]) -> Result<()> {
        let sent = self
            .ptys
            .with_session(sandbox_id, pty_id, |pty| pty.input.send(data.to_vec()).is_ok());
        match sent {
            Some(true) => Ok(()),
            _ => Err(SandboxError::pty_not_found(pty_id)),
        }
    }

    async fn resize_pty(&self, sandbox_id: &str, pty_id: &str, size: PtySize) -> Result<()> {
        let exec_id = self
            .ptys
            .with_session(sandbox_id, pty_id, |pty| pty.exec_id.clone())
            .ok_or_else(|| SandboxError::pty_not_found(pty_id))?;
        self.client
            .resize_exec(
                &exec_id,
                ResizeExecOptions {
                    height: size.rows.max(1),
                    width: size.cols.max(1),
                },
            )
            .await?;
        Ok(())
    }

    async fn kill_pty(&self, sandbox_id: &str, pty_id: &str) -> Result<()> {
        if let Some(pty) = self.ptys.remove(sandbox_id, pty_id) {
            pty.shutdown();
            info!("Killed PTY {} in sandbox {}", pty_id, sandbox_id);
        }
        Ok(())
    }

    async fn create_checkpoint(&self, sandbox_id: &str, checkpoint_id: &str) -> Result<String> {
        checkpoints::create_with_rsync(
            self,
            sandbox_id,
            checkpoint_id,
            &self.config.user_home,
            self.config.max_checkpoints,
        )
        .await
    }

    async fn restore_checkpoint(&self, sandbox_id: &str, checkpoint_id: &str) -> Result<()> {
        checkpoints::restore_with_rsync(self, sandbox_id, checkpoint_id, &self.config.user_home)
            .await
    }

    async fn list_checkpoints(&self, sandbox_id: &str) -> Result<Vec<CheckpointInfo>> {
        let index = checkpoints::current_index(self, sandbox_id, &self.config.user_home).await?;
        Ok(index.newest_first())
    }

    async fn get_preview_links(&self, sandbox_id: &str) -> Result<Vec<PreviewLink>> {
        let result = self
            .execute(
                sandbox_id,
                ports::LISTENING_PORTS_COMMAND,
                ExecOptions::with_timeout(QUICK_COMMAND_TIMEOUT),
            )
            .await?;
        let listening = ports::parse_listening_ports(&result.stdout);
        let port_map = self.port_mappings_for(sandbox_id).await?;

        Ok(ports::build_preview_links(
            &listening,
            |port| port_map.contains_key(&port),
            &[self.config.ide_port],
            |port| {
                ports::preview_url(
                    sandbox_id,
                    port,
                    self.config.sandbox_domain.as_deref(),
                    &self.config.preview_base_url,
                    &port_map,
                )
            },
        ))
    }

    async fn get_ide_url(&self, sandbox_id: &str) -> Result<Option<String>> {
        let port = self.config.ide_port;
        if let Some(domain) = &self.config.sandbox_domain {
            return Ok(Some(format!(
                "https://sandbox-{}-{}.{}/?folder={}",
                sandbox_id, port, domain, self.config.user_home
            )));
        }
        if !self.connect(sandbox_id).await? {
            return Err(SandboxError::sandbox_not_found(sandbox_id));
        }
        let port_map = self.port_mappings_for(sandbox_id).await?;
        Ok(port_map.get(&port).map(|host_port| {
            format!(
                "{}:{}/?folder={}",
                self.config.preview_base_url, host_port, self.config.user_home
            )
        }))
    }

    async fn get_vnc_url(&self, sandbox_id: &str) -> Result<Option<String>> {
        let port = ports::VNC_WEBSOCKET_PORT;
        if let Some(domain) = &self.config.sandbox_domain {
            return Ok(Some(format!("wss://sandbox-{}-{}.{}", sandbox_id, port, domain)));
        }
        let port_map = self.port_mappings_for(sandbox_id).await?;
        Ok(port_map.get(&port).map(|host_port| {
            format!(
                "{}:{}",
                ports::websocket_base(&self.config.preview_base_url),
                host_port
            )
        }))
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
        helpers::validate_id("sandbox", sandbox_id)?;
        if options.cwd.is_none() {
            options.cwd = Some(self.config.user_home.clone());
        }
        let channel = DockerExecChannel::new(
            self.client.clone(),
            self.endpoint.clone(),
            Self::container_name(sandbox_id),
        );
        Ok(Box::new(SandboxTransport::new(channel, options)))
    }

    async fn cleanup(&self) {
        let sessions = self.ptys.drain_all();
        if !sessions.is_empty() {
            info!("Closing {} PTY sessions", sessions.len());
        }
        for (_, _, pty) in sessions {
            pty.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn provider(domain: Option<&str>) -> DockerProvider {
        // HTTP clients connect lazily, so no daemon is needed for these tests
        let client = Docker::connect_with_http("tcp://127.0.0.1:1", 5, API_DEFAULT_VERSION).unwrap();
        let config = DockerConfig {
            sandbox_domain: domain.map(str::to_string),
            ..Default::default()
        };
        let endpoint = DockerEndpoint::Tcp("127.0.0.1:1".to_string());
        DockerProvider::with_client(client, config, endpoint)
    }

    #[test]
    fn test_exit_124_is_a_timeout_only_after_the_budget() {
        let budget = Duration::from_secs(2);
        assert!(timed_out(124, Duration::from_millis(2100), budget));
        assert!(!timed_out(124, Duration::from_millis(30), budget));
        assert!(!timed_out(1, Duration::from_secs(5), budget));
        assert!(!timed_out(0, Duration::from_secs(5), budget));
    }

    #[test]
    fn test_container_name() {
        assert_eq!(DockerProvider::container_name("abc"), "agentbox-sandbox-abc");
    }

    #[test]
    fn test_container_config_publishes_sandbox_ports() {
        let provider = provider(None);
        let config = provider.container_config("abc", "img:latest");

        assert_eq!(config.image.as_deref(), Some("img:latest"));
        assert_eq!(config.user.as_deref(), Some("user"));
        let exposed = config.exposed_ports.unwrap();
        assert!(exposed.contains_key("3000/tcp"));
        assert!(exposed.contains_key("8765/tcp"));
        let labels = config.labels.unwrap();
        assert_eq!(labels.get("agentbox.sandbox.id").map(String::as_str), Some("abc"));
        assert!(!labels.contains_key("traefik.enable"));
    }

    #[test]
    fn test_routing_labels_with_domain() {
        let provider = provider(Some("sandboxes.example.com"));
        let labels = provider.routing_labels("abc");
        assert_eq!(
            labels
                .get("traefik.http.routers.sandbox-abc-3000.rule")
                .map(String::as_str),
            Some("Host(`sandbox-abc-3000.sandboxes.example.com`)")
        );
        assert_eq!(
            labels
                .get("traefik.http.services.sandbox-abc-8765.loadbalancer.server.port")
                .map(String::as_str),
            Some("8765")
        );
    }

    #[test]
    fn test_tar_round_trip() {
        let archive = create_tar_archive("notes.txt", b"hello").unwrap();
        assert_eq!(extract_first_file(&archive).unwrap(), b"hello");
    }
}
