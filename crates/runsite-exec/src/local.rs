//! Local command execution using `tokio::process`

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, instrument, warn};

use crate::error::ExecError;
use crate::options::{
    ChunkDecoder, ExecOptions, LineBreakHold, OutputChunk, OutputStream, trim_line_break,
};
use crate::result::{CommandResult, ProcessHandle, SpawnResult, TargetState};
use crate::session::{ScriptRunner, SessionManager};
use crate::target::WorkingDir;
use crate::traits::Executor;

/// Programs that are full scripting shells and can take multi-line input themselves
const SCRIPT_SHELLS: &[&str] = &[
    "powershell",
    "pwsh",
    "bash",
    "sh",
    "zsh",
    "wsl",
    "python",
    "python3",
    "node",
];

/// Whether a command must be fed line by line into an interactive `cmd.exe`
///
/// `cmd /C` cannot run multi-line scripts verbatim, so on Windows a command
/// containing a newline goes through an interactive interpreter unless it
/// starts by invoking a real scripting shell.
#[must_use]
pub fn needs_interactive_interpreter(cmd: &str, windows: bool) -> bool {
    windows && cmd.trim_end().contains('\n') && !invokes_script_shell(cmd)
}

fn invokes_script_shell(cmd: &str) -> bool {
    let Some(program) = cmd.split_whitespace().next() else {
        return false;
    };
    let program = program.trim_matches('"').to_lowercase();
    let name = program
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(program.as_str())
        .trim_end_matches(".exe");
    SCRIPT_SHELLS.contains(&name)
}

/// Drop the startup banner `cmd.exe` prints before reading input
#[must_use]
pub fn strip_banner(output: &str) -> String {
    let mut lines = output.split_inclusive('\n').peekable();
    lines.next();
    if lines
        .peek()
        .is_some_and(|l| l.trim_start().to_lowercase().starts_with("(c)"))
    {
        lines.next();
        if lines.peek().is_some_and(|l| l.trim().is_empty()) {
            lines.next();
        }
    }
    lines.collect()
}

/// Runs session scripts through the local `sh`
#[derive(Debug, Default)]
struct LocalShell;

#[async_trait]
impl ScriptRunner for LocalShell {
    async fn run_script(&self, script: &str) -> Result<CommandResult, ExecError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        Ok(CommandResult::new(
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
            output.status.code().unwrap_or(-1),
        ))
    }
}

/// Local command executor
///
/// Executes commands on the local machine using `tokio::process::Command`.
#[derive(Debug)]
pub struct LocalExecutor {
    cwd: WorkingDir,
    shell: Arc<LocalShell>,
    sessions: SessionManager,
}

impl LocalExecutor {
    /// Create a new local executor
    #[must_use]
    pub fn new() -> Self {
        Self::with_working_dir(".")
    }

    /// Create a local executor starting in `cwd`
    pub fn with_working_dir(cwd: impl Into<String>) -> Self {
        Self {
            cwd: WorkingDir::new(cwd),
            shell: Arc::new(LocalShell),
            sessions: SessionManager::new(),
        }
    }

    /// Build the shell invocation for a single command
    fn shell_command(&self, cmd: &str, pipefail: bool) -> Command {
        let mut command = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(cmd);
            c
        } else if pipefail {
            let mut c = Command::new("bash");
            c.arg("-c").arg(format!("set -o pipefail; {cmd}"));
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(cmd);
            c
        };
        command.current_dir(self.cwd.get());
        command
    }

    /// Resolve a path against the working directory
    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.cwd.get()).join(path)
        }
    }

    /// Blocking mode: wait for the process and collect both streams
    async fn execute(&self, cmd: &str, options: &ExecOptions) -> CommandResult {
        let start = Instant::now();

        let child = self
            .shell_command(cmd, options.pipefail)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                error!(command = %cmd, error = %e, "failed to spawn local process");
                return CommandResult::failure(e.to_string()).with_duration(start.elapsed());
            }
        };
        let pid = child.id();

        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(e) => return CommandResult::failure(e.to_string()).with_duration(start.elapsed()),
        };

        CommandResult::new(
            trim_line_break(&String::from_utf8_lossy(&output.stdout)),
            String::from_utf8_lossy(&output.stderr),
            output.status.code().unwrap_or(1),
        )
        .with_pid(options.get_pid.then_some(pid).flatten())
        .with_duration(start.elapsed())
    }

    /// Streaming mode: deliver chunks while the process runs
    async fn execute_streaming(&self, cmd: &str, options: &ExecOptions) -> CommandResult {
        let start = Instant::now();

        let child = self
            .shell_command(cmd, options.pipefail)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                error!(command = %cmd, error = %e, "failed to spawn local process");
                return CommandResult::failure(e.to_string()).with_duration(start.elapsed());
            }
        };
        let pid = options.get_pid.then(|| child.id()).flatten();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (stdout, stderr) = tokio::join!(
            pump(stdout, OutputStream::Stdout, options, pid),
            pump(stderr, OutputStream::Stderr, options, pid),
        );

        let exit_code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(1),
            Err(e) => return CommandResult::failure(e.to_string()).with_duration(start.elapsed()),
        };

        CommandResult::new(stdout, stderr, exit_code)
            .with_pid(pid)
            .with_duration(start.elapsed())
    }

    /// Feed a multi-line command into an interactive `cmd.exe`, one line at a time
    ///
    /// A failing line does not stop the following ones, as when typed by hand.
    async fn execute_interactive(&self, cmd: &str) -> CommandResult {
        let start = Instant::now();

        let child = Command::new("cmd.exe")
            .arg("/Q")
            .current_dir(self.cwd.get())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => return CommandResult::failure(e.to_string()).with_duration(start.elapsed()),
        };

        if let Some(mut stdin) = child.stdin.take() {
            for line in cmd.lines().chain(std::iter::once("exit %ERRORLEVEL%")) {
                if let Err(e) = stdin.write_all(format!("{line}\r\n").as_bytes()).await {
                    warn!(error = %e, "interpreter closed its input early");
                    break;
                }
            }
        }

        match child.wait_with_output().await {
            Ok(output) => CommandResult::new(
                trim_line_break(&strip_banner(&String::from_utf8_lossy(&output.stdout))),
                String::from_utf8_lossy(&output.stderr),
                output.status.code().unwrap_or(1),
            )
            .with_duration(start.elapsed()),
            Err(e) => CommandResult::failure(e.to_string()).with_duration(start.elapsed()),
        }
    }

    /// Start a long-running service and wait until its stdout contains `wait_for`
    ///
    /// The service keeps running after this returns; its remaining output is
    /// still delivered to the progress callback.
    ///
    /// # Errors
    /// Never fails for the command itself; spawn failures are reported in the result
    #[instrument(skip(self, options), level = "debug")]
    pub async fn setup(
        &self,
        cmd: &str,
        wait_for: &str,
        options: &ExecOptions,
    ) -> Result<SpawnResult, ExecError> {
        info!(command = %cmd, wait_for = %wait_for, "starting setup command");

        let child = self
            .shell_command(cmd, options.pipefail)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => return Ok(SpawnResult::failed(e.to_string())),
        };
        let handle = child.id().map(ProcessHandle::Pid);

        let Some(mut stdout) = child.stdout.take() else {
            return Ok(SpawnResult::failed("stdout was not captured"));
        };
        // stderr is drained alongside so a chatty command cannot block on a full pipe
        let stderr_task = {
            let stderr = child.stderr.take();
            let options = options.clone();
            tokio::spawn(async move { pump(stderr, OutputStream::Stderr, &options, None).await })
        };
        let mut decoder = ChunkDecoder::default();
        let mut seen = String::new();
        let mut buf = vec![0u8; 8192];

        loop {
            let n = stdout.read(&mut buf).await?;
            if n == 0 {
                // exited before the condition matched
                let stderr = stderr_task.await.unwrap_or_default();
                let exit_code = child.wait().await?.code().unwrap_or(1);
                seen.push_str(&decoder.finish());
                return Ok(SpawnResult::started(
                    handle,
                    CommandResult::new(seen, stderr, exit_code),
                ));
            }
            let text = decoder.push(&buf[..n]);
            if !text.is_empty() {
                options.emit(OutputChunk::stdout(text.as_str()));
            }
            seen.push_str(&text);
            if seen.contains(wait_for) {
                info!(wait_for = %wait_for, "resolved wait_for condition");
                break;
            }
        }

        let options = options.clone();
        tokio::spawn(async move {
            let (_, _) = tokio::join!(
                pump(Some(stdout), OutputStream::Stdout, &options, None),
                stderr_task,
            );
            if let Err(e) = child.wait().await {
                warn!(error = %e, "failed to reap setup process");
            }
        });

        Ok(SpawnResult::started(handle, CommandResult::new(seen, "", 0)))
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a pipe to the end, reporting each chunk
///
/// Stdout loses its final line break, as in blocking mode.
async fn pump<R: AsyncRead + Unpin>(
    reader: Option<R>,
    stream: OutputStream,
    options: &ExecOptions,
    pid: Option<u32>,
) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut decoder = ChunkDecoder::default();
    let mut hold = (stream == OutputStream::Stdout).then(LineBreakHold::default);
    let mut collected = String::new();
    let mut buf = vec![0u8; 8192];

    let mut deliver = |text: String| {
        if text.is_empty() {
            return;
        }
        let chunk = match stream {
            OutputStream::Stdout => OutputChunk::stdout(text.as_str()),
            OutputStream::Stderr => OutputChunk::stderr(text.as_str()),
        };
        options.emit(chunk.with_pid(pid));
        collected.push_str(&text);
    };

    loop {
        let text = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => decoder.push(&buf[..n]),
            Err(e) => {
                warn!(error = %e, ?stream, "failed to read process output");
                break;
            }
        };
        match &mut hold {
            Some(hold) => deliver(hold.push(&text)),
            None => deliver(text),
        }
    }
    let rest = decoder.finish();
    match &mut hold {
        Some(hold) => {
            deliver(hold.push(&rest));
            deliver(hold.finish());
        }
        None => deliver(rest),
    }

    collected
}

#[async_trait]
impl Executor for LocalExecutor {
    #[instrument(skip(self, options), level = "debug")]
    async fn exec(&self, cmd: &str, options: &ExecOptions) -> Result<CommandResult, ExecError> {
        debug!(command = %cmd, cwd = %self.cwd.get(), "executing local command");

        let result = if needs_interactive_interpreter(cmd, cfg!(windows)) {
            self.execute_interactive(cmd).await
        } else if options.on_progress.is_some() {
            self.execute_streaming(cmd, options).await
        } else {
            self.execute(cmd, options).await
        };

        debug!(
            command = %cmd,
            status = result.exit_code,
            duration = ?result.duration,
            "command completed"
        );

        Ok(result)
    }

    #[instrument(skip(self, _options), level = "debug")]
    async fn spawn(&self, cmd: &str, _options: &ExecOptions) -> Result<SpawnResult, ExecError> {
        let child = self
            .shell_command(cmd, false)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match child {
            Ok(child) => {
                let handle = child.id().map(ProcessHandle::Pid);
                debug!(command = %cmd, ?handle, "spawned local process");
                reap(child);
                Ok(SpawnResult::started(handle, CommandResult::default()))
            }
            Err(e) => Ok(SpawnResult::failed(e.to_string())),
        }
    }

    async fn exec_persistent(
        &self,
        cmd: &str,
        session_id: &str,
        idle_timeout: Option<Duration>,
    ) -> Result<CommandResult, ExecError> {
        if cfg!(windows) {
            return Err(ExecError::Unsupported(
                "persistent sessions need tmux".to_string(),
            ));
        }
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
        true
    }

    async fn state(&self) -> TargetState {
        TargetState::Ready
    }

    async fn copy_file(&self, src: &Path, dest: &str) -> Result<(), ExecError> {
        let dest = self.resolve(dest);
        debug!(src = %src.display(), dest = %dest.display(), "copying file");
        tokio::fs::copy(src, &dest).await?;
        Ok(())
    }

    async fn tear_down(&self, handle: &ProcessHandle) -> Result<(), ExecError> {
        let ProcessHandle::Pid(pid) = handle else {
            warn!(%handle, "cannot tear down a non-pid handle locally");
            return Ok(());
        };

        info!(pid, "tearing down");
        let mut command = if cfg!(windows) {
            let mut c = Command::new("taskkill");
            c.args(["/PID", &pid.to_string(), "/F"]);
            c
        } else {
            let mut c = Command::new("kill");
            c.arg(pid.to_string());
            c
        };
        let output = command
            .output()
            .await
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;
        if !output.status.success() {
            warn!(pid, stderr = %String::from_utf8_lossy(&output.stderr).trim(), "kill failed");
        }
        Ok(())
    }

    fn executor_type(&self) -> &'static str {
        "local"
    }
}

/// Wait for a detached child in the background so it does not linger as a zombie
fn reap(mut child: Child) {
    tokio::spawn(async move {
        if let Err(e) = child.wait().await {
            warn!(error = %e, "failed to reap spawned process");
        }
    });
}
