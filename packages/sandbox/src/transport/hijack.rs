// ABOUTME: Raw connection-upgrade for Docker exec sessions
// ABOUTME: Gives the caller the bare socket so it can frame output and half-close stdin itself

use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use crate::error::{Result, SandboxError};

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Where the Docker API listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl DockerEndpoint {
    /// Parse a `DOCKER_HOST`-style value; `None` means the default local socket
    pub fn parse(host: Option<&str>) -> Result<Self> {
        let Some(host) = host.map(str::trim).filter(|h| !h.is_empty()) else {
            return Ok(Self::Unix(PathBuf::from(DEFAULT_SOCKET)));
        };
        if let Some(path) = host.strip_prefix("unix://") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"))
        {
            return Ok(Self::Tcp(addr.trim_end_matches('/').to_string()));
        }
        Err(SandboxError::InvalidConfiguration(format!(
            "Unsupported Docker host for exec streaming: {}",
            host
        )))
    }
}

pub trait RawSocket: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> RawSocket for T {}

pub type BoxedSocket = Box<dyn RawSocket>;

/// Upgraded exec socket split into independent halves
pub struct HijackedExec {
    pub reader: ReadHalf<BoxedSocket>,
    pub writer: WriteHalf<BoxedSocket>,
}

async fn open_socket(endpoint: &DockerEndpoint) -> Result<BoxedSocket> {
    let socket: BoxedSocket = match endpoint {
        DockerEndpoint::Unix(path) => Box::new(UnixStream::connect(path).await.map_err(|e| {
            SandboxError::CliConnection(format!(
                "Cannot connect to Docker socket {}: {}",
                path.display(),
                e
            ))
        })?),
        DockerEndpoint::Tcp(addr) => Box::new(TcpStream::connect(addr).await.map_err(|e| {
            SandboxError::CliConnection(format!("Cannot connect to Docker at {}: {}", addr, e))
        })?),
    };
    Ok(socket)
}

pub fn start_request(exec_id: &str, tty: bool) -> String {
    let body = format!("{{\"Detach\":false,\"Tty\":{}}}", tty);
    format!(
        "POST /exec/{}/start HTTP/1.1\r\n\
         Host: docker\r\n\
         Content-Type: application/json\r\n\
         Connection: Upgrade\r\n\
         Upgrade: tcp\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        exec_id,
        body.len(),
        body
    )
}

/// Status code from an HTTP status line
pub fn parse_status_code(status_line: &str) -> Option<u16> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

async fn read_response_head(socket: &mut BoxedSocket) -> Result<String> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = socket.read(&mut byte).await?;
        if n == 0 {
            return Err(SandboxError::CliConnection(
                "Docker closed the connection during exec upgrade".to_string(),
            ));
        }
        head.push(byte[0]);
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(SandboxError::CliConnection(
                "Docker exec upgrade response too large".to_string(),
            ));
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Start `exec_id` attached and take over the connection.
///
/// The head is read byte by byte so no stream bytes are consumed past it.
pub async fn start_exec(endpoint: &DockerEndpoint, exec_id: &str, tty: bool) -> Result<HijackedExec> {
    let mut socket = open_socket(endpoint).await?;
    socket.write_all(start_request(exec_id, tty).as_bytes()).await?;
    socket.flush().await?;

    let head = read_response_head(&mut socket).await?;
    let status_line = head.lines().next().unwrap_or_default();
    match parse_status_code(status_line) {
        Some(101) | Some(200) => {
            debug!("Exec {} upgraded: {}", exec_id, status_line);
        }
        Some(404) => {
            return Err(SandboxError::NotFound {
                kind: "Exec session",
                id: exec_id.to_string(),
            })
        }
        _ => {
            let mut body = vec![0u8; 512];
            let read = socket.read(&mut body);
            let n = tokio::time::timeout(std::time::Duration::from_millis(200), read)
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or(0);
            return Err(SandboxError::CliConnection(format!(
                "Docker refused exec upgrade ({}): {}",
                status_line.trim(),
                String::from_utf8_lossy(&body[..n]).trim()
            )));
        }
    }

    let (reader, writer) = tokio::io::split(socket);
    Ok(HijackedExec { reader, writer })
}
