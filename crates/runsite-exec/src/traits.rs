//! Execution capability shared by every backend

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::options::{ExecOptions, ProgressCallback};
use crate::result::{CommandResult, ProcessHandle, SpawnResult, TargetState};

/// Runs commands on one execution target
///
/// Local, SSH and container engines implement the same contract so callers
/// never depend on backend-specific behavior.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a command and wait for it to exit
    ///
    /// # Errors
    /// Returns transport or connection errors (after retries, where applicable)
    async fn exec(&self, cmd: &str, options: &ExecOptions) -> Result<CommandResult, ExecError>;

    /// Run a command, delivering output chunks to `on_progress` as they arrive
    ///
    /// # Errors
    /// Same as [`Executor::exec`]
    async fn stream(
        &self,
        cmd: &str,
        on_progress: ProgressCallback,
        options: &ExecOptions,
    ) -> Result<CommandResult, ExecError> {
        let options = ExecOptions {
            on_progress: Some(on_progress),
            ..options.clone()
        };
        self.exec(cmd, &options).await
    }

    /// Start a command without waiting for it to finish
    ///
    /// # Errors
    /// Returns connection errors on backends that must connect first
    async fn spawn(&self, cmd: &str, options: &ExecOptions) -> Result<SpawnResult, ExecError>;

    /// Run a command inside the named persistent session
    ///
    /// The session is created on first use and torn down after
    /// `idle_timeout` without new commands.
    ///
    /// # Errors
    /// Returns transport errors or `ExecError::ExitStatusUndetermined`
    async fn exec_persistent(
        &self,
        cmd: &str,
        session_id: &str,
        idle_timeout: Option<Duration>,
    ) -> Result<CommandResult, ExecError>;

    /// Kill a persistent session
    ///
    /// # Errors
    /// Returns transport errors
    async fn close_session(&self, session_id: &str) -> Result<(), ExecError>;

    /// Set working directory for subsequent calls
    fn set_cwd(&self, cwd: &str);

    /// Current working directory
    fn cwd(&self) -> String;

    /// Whether commands can run right now; never errors
    async fn ready(&self) -> bool;

    /// Coarse state derived from [`Executor::ready`]
    async fn state(&self) -> TargetState {
        if self.ready().await {
            TargetState::Ready
        } else {
            TargetState::NotReady
        }
    }

    /// Copy a local file into the target
    ///
    /// # Errors
    /// Returns I/O or transport errors
    async fn copy_file(&self, src: &Path, dest: &str) -> Result<(), ExecError>;

    /// Best-effort termination of a spawned process
    ///
    /// # Errors
    /// Returns transport errors
    async fn tear_down(&self, handle: &ProcessHandle) -> Result<(), ExecError>;

    /// Get executor type name (for logging)
    fn executor_type(&self) -> &'static str;
}
