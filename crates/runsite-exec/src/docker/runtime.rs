//! Docker Engine access
//!
//! Control calls (inspect, exec create/inspect, detached start) go through
//! `bollard`. The attached exec output is read from a raw upgraded
//! connection on the Docker socket so the framed stream reaches
//! [`FrameDecoder`](super::demux::FrameDecoder) untouched. Both use the same
//! unix socket; a `DOCKER_HOST` naming anything else is refused.

use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::InspectContainerOptions;
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bytes::Bytes;
use futures_util::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, instrument};

use crate::error::ExecError;

/// Raw exec output as read from the connection
pub type RawStream = Pin<Box<dyn Stream<Item = Result<Bytes, ExecError>> + Send>>;

/// Default Docker socket
pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// Request timeout of the bollard client
#[cfg(unix)]
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// Largest HTTP response head accepted before the stream starts
const MAX_HEAD_LEN: usize = 16 * 1024;

/// How often exec inspection is retried while Docker still reports it running
const EXIT_POLL_ATTEMPTS: u32 = 20;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What the engine needs to know about a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Container state is running
    pub running: bool,
    /// Image/config working directory (may be empty)
    pub working_dir: String,
}

/// Parameters of an exec instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    /// argv
    pub cmd: Vec<String>,
    /// Working directory inside the container
    pub working_dir: Option<String>,
    /// Allocate a tty
    pub tty: bool,
    /// Attach stdout and stderr
    pub attach: bool,
}

/// Operations on a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Inspect a container by id, id prefix or name; `None` if it does not exist
    ///
    /// # Errors
    /// `ExecError::BackendUnavailable` when the runtime cannot be reached
    async fn inspect_container(&self, container: &str) -> Result<Option<ContainerInfo>, ExecError>;

    /// Create an exec instance; returns its id
    ///
    /// # Errors
    /// Returns runtime errors
    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String, ExecError>;

    /// Start an exec instance and attach to its output
    ///
    /// # Errors
    /// Returns runtime errors
    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<RawStream, ExecError>;

    /// Start an exec instance without attaching
    ///
    /// # Errors
    /// Returns runtime errors
    async fn start_exec_detached(&self, exec_id: &str) -> Result<(), ExecError>;

    /// Exit code of a finished exec instance
    ///
    /// # Errors
    /// Returns runtime errors
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, ExecError>;
}

fn docker_error(err: DockerError) -> ExecError {
    match err {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => ExecError::IoError(format!("docker returned {status_code}: {message}")),
        other => ExecError::BackendUnavailable(other.to_string()),
    }
}

/// Socket path for a `DOCKER_HOST` value
///
/// # Errors
/// `ExecError::Unsupported` for any host that is not a `unix://` socket
pub fn socket_path(docker_host: Option<&str>) -> Result<PathBuf, ExecError> {
    match docker_host.map(str::trim).filter(|host| !host.is_empty()) {
        None => Ok(PathBuf::from(DEFAULT_SOCKET)),
        Some(host) => host
            .strip_prefix("unix://")
            .map(PathBuf::from)
            .ok_or_else(|| {
                ExecError::Unsupported(format!(
                    "DOCKER_HOST={host}: exec output is read from a unix socket"
                ))
            }),
    }
}

/// Production runtime talking to the local Docker daemon
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    socket: PathBuf,
}

impl DockerRuntime {
    /// Connect to the socket named by `DOCKER_HOST`, or the default one
    ///
    /// # Errors
    /// `ExecError::Unsupported` for a non-unix `DOCKER_HOST`,
    /// `ExecError::BackendUnavailable` if the client cannot be set up
    pub fn connect() -> Result<Self, ExecError> {
        let host = std::env::var("DOCKER_HOST").ok();
        Self::connect_socket(socket_path(host.as_deref())?)
    }

    /// Connect to the daemon listening on `socket`
    ///
    /// # Errors
    /// `ExecError::BackendUnavailable` if the client cannot be set up
    #[cfg(unix)]
    pub fn connect_socket(socket: PathBuf) -> Result<Self, ExecError> {
        let docker = Docker::connect_with_unix(
            &socket.to_string_lossy(),
            CLIENT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| ExecError::BackendUnavailable(e.to_string()))?;
        Ok(Self { docker, socket })
    }

    /// Connect with the platform defaults; attached execs are unsupported here
    ///
    /// # Errors
    /// `ExecError::BackendUnavailable` if the client cannot be set up
    #[cfg(not(unix))]
    pub fn connect_socket(socket: PathBuf) -> Result<Self, ExecError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ExecError::BackendUnavailable(e.to_string()))?;
        Ok(Self { docker, socket })
    }

    #[cfg(unix)]
    async fn attach(&self, exec_id: &str, tty: bool) -> Result<RawStream, ExecError> {
        use tokio::io::AsyncWriteExt;
        use tokio::net::UnixStream;

        let mut conn = UnixStream::connect(&self.socket).await.map_err(|e| {
            ExecError::BackendUnavailable(format!("{}: {e}", self.socket.display()))
        })?;

        let body = serde_json::json!({ "Detach": false, "Tty": tty }).to_string();
        let request = format!(
            "POST /exec/{exec_id}/start HTTP/1.1\r\n\
             Host: docker\r\n\
             Content-Type: application/json\r\n\
             Connection: Upgrade\r\n\
             Upgrade: tcp\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {body}",
            body.len()
        );
        conn.write_all(request.as_bytes()).await?;

        let (status, leftover) = read_response_head(&mut conn).await?;
        if status != 101 && status != 200 {
            return Err(ExecError::IoError(format!(
                "exec start for {exec_id} returned HTTP {status}"
            )));
        }
        debug!(exec_id, status, "attached to exec output");

        Ok(raw_stream(conn, leftover))
    }

    #[cfg(not(unix))]
    async fn attach(&self, _exec_id: &str, _tty: bool) -> Result<RawStream, ExecError> {
        Err(ExecError::Unsupported(format!(
            "attaching to exec output needs a unix socket, not {}",
            self.socket.display()
        )))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect_container(&self, container: &str) -> Result<Option<ContainerInfo>, ExecError> {
        match self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => Ok(Some(ContainerInfo {
                running: response
                    .state
                    .and_then(|state| state.running)
                    .unwrap_or(false),
                working_dir: response
                    .config
                    .and_then(|config| config.working_dir)
                    .unwrap_or_default(),
            })),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(docker_error(e)),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String, ExecError> {
        let options = CreateExecOptions {
            cmd: Some(spec.cmd.clone()),
            attach_stdout: Some(spec.attach),
            attach_stderr: Some(spec.attach),
            attach_stdin: Some(false),
            tty: Some(spec.tty),
            working_dir: spec.working_dir.clone(),
            ..Default::default()
        };

        let created = self
            .docker
            .create_exec(container, options)
            .await
            .map_err(docker_error)?;
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<RawStream, ExecError> {
        self.attach(exec_id, tty).await
    }

    async fn start_exec_detached(&self, exec_id: &str) -> Result<(), ExecError> {
        self.docker
            .start_exec(
                exec_id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(docker_error)?;
        Ok(())
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, ExecError> {
        for _ in 0..EXIT_POLL_ATTEMPTS {
            let inspected = self
                .docker
                .inspect_exec(exec_id)
                .await
                .map_err(docker_error)?;
            if inspected.running != Some(true) {
                return Ok(inspected.exit_code);
            }
            // output closed before the daemon recorded the exit
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        Ok(None)
    }
}

/// Read an HTTP response head; returns the status and bytes read past it
pub(crate) async fn read_response_head<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(u16, Bytes), ExecError> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];

    let end = loop {
        if let Some(pos) = head.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if head.len() > MAX_HEAD_LEN {
            return Err(ExecError::IoError("oversized HTTP response head".to_string()));
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(ExecError::IoError(
                "connection closed before HTTP response head".to_string(),
            ));
        }
        head.extend_from_slice(&buf[..n]);
    };

    let status_line = String::from_utf8_lossy(&head[..end]);
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ExecError::IoError(format!("bad HTTP status line: {status_line:?}")))?;

    Ok((status, Bytes::copy_from_slice(&head[end..])))
}

/// Turn a connection into a stream of byte chunks, starting with `leftover`
pub(crate) fn raw_stream<R>(reader: R, leftover: Bytes) -> RawStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let first = (!leftover.is_empty()).then_some(leftover);
    Box::pin(futures_util::stream::unfold(
        (Some(reader), first),
        |(reader, first)| async move {
            let mut reader = reader?;
            if let Some(bytes) = first {
                return Some((Ok(bytes), (Some(reader), None)));
            }
            let mut buf = vec![0u8; 8192];
            match reader.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), (Some(reader), None)))
                }
                Err(e) => Some((Err(ExecError::from(e)), (None, None))),
            }
        },
    ))
}
