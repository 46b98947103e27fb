//! Result types for command execution

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result of a command execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// stdout output
    pub stdout: String,
    /// stderr output
    pub stderr: String,
    /// Exit status code (0 for success)
    pub exit_code: i32,
    /// Process id, when it was captured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Time taken to execute
    #[serde(default)]
    pub duration: Duration,
}

impl CommandResult {
    /// Result with output and exit code
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            ..Self::default()
        }
    }

    /// Zero-output failure carrying an error message in stderr
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(String::new(), message, 1)
    }

    /// Set duration
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set captured pid
    #[must_use]
    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combine stdout and stderr
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Identifier returned by `spawn`
///
/// Container execs have no OS pid visible to the caller, so their handle is
/// opaque and killing it is best effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessHandle {
    /// Real process id on the target
    Pid(u32),
    /// Backend identifier that is not a process id
    Opaque(String),
}

impl ProcessHandle {
    /// Process id, if this handle is one
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessHandle::Pid(pid) => Some(*pid),
            ProcessHandle::Opaque(_) => None,
        }
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessHandle::Pid(pid) => write!(f, "{pid}"),
            ProcessHandle::Opaque(id) => write!(f, "{id}"),
        }
    }
}

/// Outcome of a fire-and-forget spawn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnResult {
    /// Handle of the started process, when obtainable
    pub handle: Option<ProcessHandle>,
    /// Output observed before returning, or a zero-output failure
    pub result: CommandResult,
}

impl SpawnResult {
    /// Spawn that started
    #[must_use]
    pub fn started(handle: Option<ProcessHandle>, result: CommandResult) -> Self {
        Self { handle, result }
    }

    /// Spawn that could not start
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            handle: None,
            result: CommandResult::failure(message),
        }
    }
}

/// Coarse readiness of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    /// Commands can run
    Ready,
    /// Target missing, stopped or unreachable
    NotReady,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetState::Ready => write!(f, "ready"),
            TargetState::NotReady => write!(f, "not ready"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_shape() {
        let result = CommandResult::failure("no such file");

        assert!(!result.success());
        assert_eq!(result.exit_code, 1);
        assert!(result.stdout.is_empty());
        assert_eq!(result.stderr, "no such file");
    }

    #[test]
    fn test_combined_output() {
        assert_eq!(CommandResult::new("out", "", 0).combined_output(), "out");
        assert_eq!(
            CommandResult::new("out", "err", 0).combined_output(),
            "out\nerr"
        );
    }

    #[test]
    fn test_handle_pid() {
        assert_eq!(ProcessHandle::Pid(42).pid(), Some(42));
        assert_eq!(ProcessHandle::Opaque("abc".into()).pid(), None);
        assert_eq!(ProcessHandle::Opaque("abc".into()).to_string(), "abc");
    }
}
