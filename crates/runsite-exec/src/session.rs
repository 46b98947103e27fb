//! Persistent sessions backed by tmux
//!
//! A persistent session keeps shell state (working directory, environment,
//! background jobs) between calls. It has no return channel of its own, so
//! each command redirects its output into two well-known files inside the
//! target, appends its exit status to the stdout file and signals a tmux
//! channel when done. The caller waits on that channel while checking that
//! the session is still alive, then reads the files back.
//!
//! The idle watchdog is a detached job on the target itself, so it outlives
//! the process that armed it. Its pid is kept in a file next to the session
//! output; every command kills it first and arms a fresh one when done.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::error::ExecError;
use crate::result::CommandResult;
use crate::sentinel::{SENTINEL, shell_quote, split_exit_code};

/// Captured stdout of the most recent session command
pub const STDOUT_FILE: &str = "/tmp/cmd.stdout";

/// Captured stderr of the most recent session command
pub const STDERR_FILE: &str = "/tmp/cmd.stderr";

/// Idle time after which a session is killed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Printed on stderr by the inject script when the session disappears
const SESSION_ENDED: &str = "runsite: session ended";

/// Session id used when the caller does not name one
#[must_use]
pub fn default_session_id() -> String {
    std::process::id().to_string()
}

/// Runs raw shell text inside a target, without sentinel wrapping
#[async_trait]
pub trait ScriptRunner: Send + Sync + 'static {
    /// Run `script` and return its output and exit status
    ///
    /// # Errors
    /// Returns transport errors
    async fn run_script(&self, script: &str) -> Result<CommandResult, ExecError>;
}

fn validate_id(id: &str) -> Result<(), ExecError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ExecError::Config(format!(
            "invalid session id '{id}': use letters, digits, '-' and '_'"
        )))
    }
}

fn channel_name(id: &str) -> String {
    format!("runsite-{id}")
}

fn watchdog_file(id: &str) -> String {
    format!("/tmp/runsite-{id}.watchdog")
}

/// Script that stops the idle watchdog of session `id`, if any
fn disarm_script(id: &str) -> String {
    let file = watchdog_file(id);
    format!("[ -f {file} ] && kill \"$(cat {file})\" 2>/dev/null; rm -f {file}")
}

/// Script that disarms the watchdog and creates the session unless it exists
#[must_use]
pub fn ensure_script(id: &str) -> String {
    format!(
        "{}\ntmux has-session -t {id} 2>/dev/null || tmux new-session -d -s {id}",
        disarm_script(id)
    )
}

/// Script that disarms the watchdog and kills the session
#[must_use]
pub fn kill_script(id: &str) -> String {
    format!("{}\ntmux kill-session -t {id}", disarm_script(id))
}

/// Script that starts a detached job killing session `id` after `timeout`
#[must_use]
pub fn watchdog_script(id: &str, timeout: Duration) -> String {
    let file = watchdog_file(id);
    let secs = timeout.as_secs().max(1);
    format!(
        "nohup sh -c 'sleep {secs}; rm -f {file}; tmux kill-session -t {id}' \
         >/dev/null 2>&1 </dev/null &\n\
         echo $! >{file}"
    )
}

/// Script that types `cmd` into the session, waits for it and prints its output
///
/// The wait ends early, with a marker on stderr, when the session goes away.
#[must_use]
pub fn inject_script(id: &str, cmd: &str) -> String {
    let channel = channel_name(id);
    let line = format!(
        "{{ {cmd}\n}} >{STDOUT_FILE} 2>{STDERR_FILE}; {SENTINEL} >>{STDOUT_FILE}; tmux wait-for -S {channel}"
    );
    format!(
        "tmux wait-for {channel} &\n\
         waiter=$!\n\
         tmux send-keys -t {id} -l {line} && tmux send-keys -t {id} Enter || {{ kill $waiter 2>/dev/null; exit 1; }}\n\
         while kill -0 $waiter 2>/dev/null; do\n\
         \x20 if ! tmux has-session -t {id} 2>/dev/null; then\n\
         \x20   kill $waiter 2>/dev/null\n\
         \x20   echo '{SESSION_ENDED}' >&2\n\
         \x20   exit 1\n\
         \x20 fi\n\
         \x20 sleep 0.1 2>/dev/null || sleep 1\n\
         done\n\
         cat {STDERR_FILE} >&2\n\
         cat {STDOUT_FILE}",
        line = shell_quote(&line)
    )
}

/// Serializes session commands of one target
///
/// All sessions of a target share the same output files, so commands are run
/// one at a time regardless of session id.
#[derive(Debug, Default)]
pub struct SessionManager {
    lock: tokio::sync::Mutex<()>,
}

impl SessionManager {
    /// Create an empty manager
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `cmd` in session `id`, creating it when absent
    ///
    /// With an `idle_timeout`, a watchdog is armed once the command is done.
    ///
    /// # Errors
    /// Returns `ExecError::Config` for an unusable id, `ExecError::SpawnError`
    /// when the session cannot be created, `ExecError::SessionEnded` when the
    /// session dies mid-command, transport errors, or
    /// `ExecError::ExitStatusUndetermined` when the status line is missing
    #[instrument(skip(self, runner, cmd), level = "debug")]
    pub async fn exec<R: ScriptRunner>(
        &self,
        runner: Arc<R>,
        cmd: &str,
        id: &str,
        idle_timeout: Option<Duration>,
    ) -> Result<CommandResult, ExecError> {
        validate_id(id)?;
        let _guard = self.lock.lock().await;
        let start = Instant::now();

        let created = runner.run_script(&ensure_script(id)).await?;
        if !created.success() {
            return Err(ExecError::SpawnError(format!(
                "could not create session {id}: {}",
                created.stderr.trim()
            )));
        }

        debug!(session = %id, command = %cmd, "sending command to session");
        let output = runner.run_script(&inject_script(id, cmd)).await?;
        if !output.success() && output.stderr.contains(SESSION_ENDED) {
            warn!(session = %id, "session ended while a command was running");
            return Err(ExecError::SessionEnded(id.to_string()));
        }
        let (stdout, exit_code) = split_exit_code(&output.stdout)?;

        if let Some(timeout) = idle_timeout {
            let armed = runner.run_script(&watchdog_script(id, timeout)).await?;
            if !armed.success() {
                warn!(session = %id, stderr = %armed.stderr.trim(), "could not arm idle watchdog");
            }
        }

        Ok(CommandResult::new(stdout, output.stderr, exit_code).with_duration(start.elapsed()))
    }

    /// Kill session `id` and its watchdog
    ///
    /// # Errors
    /// Returns `ExecError::Config` for an unusable id or transport errors
    pub async fn close<R: ScriptRunner>(&self, runner: &R, id: &str) -> Result<(), ExecError> {
        validate_id(id)?;
        let _guard = self.lock.lock().await;
        let result = runner.run_script(&kill_script(id)).await?;
        if !result.success() {
            warn!(session = %id, stderr = %result.stderr.trim(), "session was not running");
        }
        Ok(())
    }
}
