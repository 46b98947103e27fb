//! Command execution inside a running container
//!
//! Commands run as exec instances. The exit code is taken from exec
//! inspection, so no sentinel is needed here.

pub mod demux;
pub mod runtime;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::StreamExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use demux::{Frame, FrameDecoder};
pub use runtime::{ContainerInfo, ContainerRuntime, DockerRuntime, ExecSpec, RawStream};

use crate::error::ExecError;
use crate::options::ExecOptions;
use crate::result::{CommandResult, ProcessHandle, SpawnResult};
use crate::sentinel::shell_quote;
use crate::session::{ScriptRunner, SessionManager};
use crate::target::WorkingDir;
use crate::traits::Executor;
use demux::Collector;

/// Shell used when none is configured
pub const DEFAULT_SHELL: &str = "bash";

/// Base64 characters written per exec when copying files
const COPY_CHUNK: usize = 64 * 1024;

/// How often a spawned exec's pid file is looked for
const PID_POLL_ATTEMPTS: u32 = 20;
const PID_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn with_pipefail(cmd: &str, pipefail: bool) -> String {
    if pipefail {
        format!("set -o pipefail; {cmd}")
    } else {
        cmd.to_string()
    }
}

/// Resolve the exec working directory against the container's default
///
/// Unset or `.` means the default itself (`/` when the image sets none),
/// absolute paths are kept and relative ones joined onto the default.
/// Separators are normalized to `/` and `.`/`..` segments collapsed.
#[must_use]
pub fn resolve_working_dir(default: &str, cwd: &str) -> String {
    let default = default.replace('\\', "/");
    let cwd = cwd.replace('\\', "/");
    let base = if default.is_empty() { "/" } else { &default };

    let joined = if cwd.is_empty() || cwd == "." {
        base.to_string()
    } else if cwd.starts_with('/') {
        cwd
    } else {
        format!("{base}/{cwd}")
    };

    let mut parts: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Runtime handle bound to one container
#[derive(Debug)]
pub struct ContainerShell<R> {
    runtime: R,
    container: String,
    shell: String,
}

impl<R: ContainerRuntime> ContainerShell<R> {
    async fn info(&self) -> Result<ContainerInfo, ExecError> {
        self.runtime
            .inspect_container(&self.container)
            .await?
            .ok_or_else(|| {
                ExecError::BackendUnavailable(format!("container {} not found", self.container))
            })
    }

    /// Create and start an attached exec
    async fn attach(&self, spec: &ExecSpec) -> Result<(String, RawStream), ExecError> {
        let exec_id = self.runtime.create_exec(&self.container, spec).await?;
        let output = self.runtime.start_exec(&exec_id, spec.tty).await?;
        Ok((exec_id, output))
    }

    async fn exit_code(&self, exec_id: &str) -> Result<i32, ExecError> {
        let code = self.runtime.exec_exit_code(exec_id).await?.ok_or_else(|| {
            ExecError::ExitStatusUndetermined(format!("exec {exec_id} reported no exit code"))
        })?;
        i32::try_from(code)
            .map_err(|_| ExecError::ExitStatusUndetermined(format!("exit code {code} out of range")))
    }

    /// Run shell text without progress reporting
    async fn run_plain(&self, script: &str) -> Result<CommandResult, ExecError> {
        let spec = ExecSpec {
            cmd: vec![self.shell.clone(), "-c".to_string(), script.to_string()],
            working_dir: None,
            tty: false,
            attach: true,
        };
        let (exec_id, mut output) = self.attach(&spec).await?;

        let mut collector = Collector::new(false);
        while let Some(bytes) = output.next().await {
            collector.push(&bytes?);
        }
        collector.finish();

        let exit_code = self.exit_code(&exec_id).await?;
        Ok(collector.into_result(exit_code))
    }

    /// Run shell text that must succeed
    async fn run_checked(&self, script: &str, what: &str) -> Result<CommandResult, ExecError> {
        let result = self.run_plain(script).await?;
        if result.success() {
            Ok(result)
        } else {
            Err(ExecError::IoError(format!(
                "{what} failed with exit code {}: {}",
                result.exit_code,
                result.stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl<R: ContainerRuntime> ScriptRunner for ContainerShell<R> {
    async fn run_script(&self, script: &str) -> Result<CommandResult, ExecError> {
        self.run_plain(script).await
    }
}

/// Files used to learn the pid of an exec
struct PidCapture {
    script: String,
    pid_file: String,
}

impl PidCapture {
    fn new() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            script: format!("/tmp/runsite-{id}.sh"),
            pid_file: format!("/tmp/runsite-{id}.pid"),
        }
    }

    /// Shell text that writes the wrapper script
    fn install_script(&self, command: &str) -> String {
        let delimiter = format!("RUNSITE_{}", Uuid::new_v4().simple());
        format!(
            "cat > {script} <<'{delimiter}'\necho $$ > {pid}\n{command}\n{delimiter}\n",
            script = self.script,
            pid = self.pid_file,
        )
    }

    fn cleanup_script(&self) -> String {
        format!("rm -f {} {}", self.script, self.pid_file)
    }
}

/// Container command executor
///
/// Runs commands in an already running container through the runtime's exec API.
pub struct ContainerExecutor<R = DockerRuntime> {
    shell: Arc<ContainerShell<R>>,
    cwd: WorkingDir,
    sessions: SessionManager,
}

impl<R> std::fmt::Debug for ContainerExecutor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerExecutor")
            .field("container", &self.shell.container)
            .field("shell", &self.shell.shell)
            .field("cwd", &self.cwd.get())
            .finish_non_exhaustive()
    }
}

impl ContainerExecutor {
    /// Executor for `container` on the local Docker daemon
    ///
    /// # Errors
    /// `ExecError::BackendUnavailable` if the Docker client cannot be set up
    pub fn connect(container: impl Into<String>) -> Result<Self, ExecError> {
        Ok(Self::with_runtime(
            container,
            DockerRuntime::connect()?,
            DEFAULT_SHELL,
        ))
    }
}

impl<R: ContainerRuntime> ContainerExecutor<R> {
    /// Executor on top of any runtime
    pub fn with_runtime(
        container: impl Into<String>,
        runtime: R,
        shell: impl Into<String>,
    ) -> Self {
        Self {
            shell: Arc::new(ContainerShell {
                runtime,
                container: container.into(),
                shell: shell.into(),
            }),
            cwd: WorkingDir::new("."),
            sessions: SessionManager::new(),
        }
    }

    /// Container this executor targets
    #[must_use]
    pub fn container(&self) -> &str {
        &self.shell.container
    }

    async fn working_dir(&self) -> Result<String, ExecError> {
        let info = self.shell.info().await?;
        Ok(resolve_working_dir(&info.working_dir, &self.cwd.get()))
    }

    /// argv for `command`, going through a pid capture script when given
    async fn argv(
        &self,
        command: &str,
        capture: Option<&PidCapture>,
    ) -> Result<Vec<String>, ExecError> {
        match capture {
            Some(capture) => {
                self.shell
                    .run_checked(&capture.install_script(command), "pid capture setup")
                    .await?;
                Ok(vec![self.shell.shell.clone(), capture.script.clone()])
            }
            None => Ok(vec![
                self.shell.shell.clone(),
                "-c".to_string(),
                command.to_string(),
            ]),
        }
    }

    /// Poll for the pid of a detached exec
    async fn wait_for_pid(&self, capture: &PidCapture) -> Option<u32> {
        for _ in 0..PID_POLL_ATTEMPTS {
            if let Some(pid) = self.read_pid(capture).await {
                return Some(pid);
            }
            tokio::time::sleep(PID_POLL_INTERVAL).await;
        }
        None
    }

    async fn read_pid(&self, capture: &PidCapture) -> Option<u32> {
        match self.shell.run_plain(&format!("cat {}", capture.pid_file)).await {
            Ok(result) => result.stdout.trim().parse().ok(),
            Err(e) => {
                warn!(container = %self.shell.container, error = %e, "failed to read pid file");
                None
            }
        }
    }

    /// Read a file from the container
    ///
    /// # Errors
    /// `ExecError::IoError` if the file cannot be read
    pub async fn read_file(&self, path: &str) -> Result<String, ExecError> {
        let path = resolve_working_dir(&self.working_dir().await?, path);
        let result = self
            .shell
            .run_checked(&format!("cat {}", shell_quote(&path)), "read")
            .await?;
        Ok(result.stdout)
    }

    /// Write `content` to `/tmp/<name>` in the container; returns the path
    ///
    /// # Errors
    /// `ExecError::Config` for a name containing `/`, runtime errors otherwise
    pub async fn write_temp_file(&self, name: &str, content: &str) -> Result<String, ExecError> {
        if name.is_empty() || name.contains('/') {
            return Err(ExecError::Config(format!("invalid temp file name '{name}'")));
        }
        let path = format!("/tmp/{name}");
        self.write_bytes(&path, content.as_bytes()).await?;
        Ok(path)
    }

    /// Write bytes to `path` through base64 chunks
    async fn write_bytes(&self, path: &str, content: &[u8]) -> Result<(), ExecError> {
        let encoded = BASE64.encode(content);
        let staging = format!("/tmp/runsite-{}.b64", Uuid::new_v4().simple());

        self.shell
            .run_checked(&format!(": > {staging}"), "copy")
            .await?;
        // base64 output is ASCII, so byte offsets are char boundaries
        for start in (0..encoded.len()).step_by(COPY_CHUNK) {
            let chunk = &encoded[start..(start + COPY_CHUNK).min(encoded.len())];
            self.shell
                .run_checked(&format!("printf '%s' '{chunk}' >> {staging}"), "copy")
                .await?;
        }
        self.shell
            .run_checked(
                &format!(
                    "base64 -d {staging} > {dest}; status=$?; rm -f {staging}; exit $status",
                    dest = shell_quote(path)
                ),
                "copy",
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<R: ContainerRuntime> Executor for ContainerExecutor<R> {
    #[instrument(skip(self, options), fields(container = %self.shell.container))]
    async fn exec(&self, cmd: &str, options: &ExecOptions) -> Result<CommandResult, ExecError> {
        let start = Instant::now();
        let working_dir = self.working_dir().await?;
        debug!(command = %cmd, working_dir = %working_dir, "executing in container");

        let capture = options.get_pid.then(PidCapture::new);
        let argv = self
            .argv(&with_pipefail(cmd, options.pipefail), capture.as_ref())
            .await?;

        let spec = ExecSpec {
            cmd: argv,
            working_dir: Some(working_dir),
            tty: options.tty,
            attach: true,
        };
        let (exec_id, mut output) = self.shell.attach(&spec).await?;

        let mut collector = Collector::new(options.tty).trim_stdout();
        let mut pid = None;
        let mut pid_pending = capture.is_some();
        while let Some(bytes) = output.next().await {
            let bytes = bytes?;
            if pid_pending {
                if let Some(capture) = &capture {
                    pid = self.read_pid(capture).await;
                }
                pid_pending = false;
            }
            for chunk in collector.push(&bytes) {
                options.emit(chunk.with_pid(pid));
            }
        }
        for chunk in collector.finish() {
            options.emit(chunk.with_pid(pid));
        }

        if let Some(capture) = &capture {
            if pid_pending {
                pid = self.read_pid(capture).await;
            }
            if let Err(e) = self.shell.run_plain(&capture.cleanup_script()).await {
                warn!(error = %e, "failed to remove pid capture files");
            }
        }

        let exit_code = self.shell.exit_code(&exec_id).await?;
        let duration = start.elapsed();

        debug!(
            command = %cmd,
            status = exit_code,
            duration = ?duration,
            "container command completed"
        );

        Ok(collector
            .into_result(exit_code)
            .with_pid(pid)
            .with_duration(duration))
    }

    #[instrument(skip(self, options), fields(container = %self.shell.container))]
    async fn spawn(&self, cmd: &str, options: &ExecOptions) -> Result<SpawnResult, ExecError> {
        let capture = options.get_pid.then(PidCapture::new);
        let started = async {
            let spec = ExecSpec {
                cmd: self
                    .argv(&with_pipefail(cmd, options.pipefail), capture.as_ref())
                    .await?,
                working_dir: Some(self.working_dir().await?),
                tty: options.tty,
                attach: false,
            };
            let exec_id = self.shell.runtime.create_exec(&self.shell.container, &spec).await?;
            self.shell.runtime.start_exec_detached(&exec_id).await?;
            Ok::<_, ExecError>(exec_id)
        };

        match started.await {
            Ok(exec_id) => {
                let pid = match &capture {
                    Some(capture) => {
                        let pid = self.wait_for_pid(capture).await;
                        if let Err(e) = self.shell.run_plain(&capture.cleanup_script()).await {
                            warn!(error = %e, "failed to remove pid capture files");
                        }
                        pid
                    }
                    None => None,
                };
                debug!(command = %cmd, exec_id = %exec_id, ?pid, "spawned container process");
                let handle = pid.map_or(ProcessHandle::Opaque(exec_id), ProcessHandle::Pid);
                Ok(SpawnResult::started(
                    Some(handle),
                    CommandResult::default().with_pid(pid),
                ))
            }
            Err(e) => {
                warn!(command = %cmd, error = %e, "spawn failed");
                Ok(SpawnResult::failed(e.to_string()))
            }
        }
    }

    async fn exec_persistent(
        &self,
        cmd: &str,
        session_id: &str,
        idle_timeout: Option<Duration>,
    ) -> Result<CommandResult, ExecError> {
        self.sessions
            .exec(Arc::clone(&self.shell), cmd, session_id, idle_timeout)
            .await
    }

    async fn close_session(&self, session_id: &str) -> Result<(), ExecError> {
        self.sessions.close(self.shell.as_ref(), session_id).await
    }

    fn set_cwd(&self, cwd: &str) {
        self.cwd.set(cwd);
    }

    fn cwd(&self) -> String {
        self.cwd.get()
    }

    async fn ready(&self) -> bool {
        match self.shell.runtime.inspect_container(&self.shell.container).await {
            Ok(Some(info)) => info.running,
            Ok(None) => false,
            Err(e) => {
                debug!(container = %self.shell.container, error = %e, "runtime not reachable");
                false
            }
        }
    }

    #[instrument(skip(self), fields(container = %self.shell.container))]
    async fn copy_file(&self, src: &Path, dest: &str) -> Result<(), ExecError> {
        let content = tokio::fs::read(src).await?;
        let dest = resolve_working_dir(&self.working_dir().await?, dest);
        self.write_bytes(&dest, &content).await?;
        info!(bytes = content.len(), dest = %dest, "copied file into container");
        Ok(())
    }

    async fn tear_down(&self, handle: &ProcessHandle) -> Result<(), ExecError> {
        match handle {
            ProcessHandle::Pid(pid) => {
                info!(container = %self.shell.container, pid, "tearing down");
                let result = self.shell.run_plain(&format!("kill {pid}")).await?;
                if !result.success() {
                    warn!(pid, stderr = %result.stderr.trim(), "kill failed");
                }
            }
            ProcessHandle::Opaque(exec_id) => {
                warn!(exec_id = %exec_id, "exec instances cannot be stopped individually");
            }
        }
        Ok(())
    }

    fn executor_type(&self) -> &'static str {
        "docker"
    }
}
