//! Error types for runsite-exec

use thiserror::Error;

/// Error message fragments that mark a connection failure as transient
const TRANSIENT_MARKERS: &[&str] = &[
    "connection reset",
    "connection refused",
    "econnreset",
    "econnrefused",
    "timed out while waiting for handshake",
];

/// Errors that can occur while running a command on a target
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Failed to connect to the target (transient class, subject to retry)
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Credentials were rejected
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The server asked an interactive question during authentication
    #[error("unexpected interactive prompt when connecting: {0}")]
    UnexpectedPrompt(String),

    /// The exit-status sentinel was missing or not a number
    #[error("could not determine exit status: {0}")]
    ExitStatusUndetermined(String),

    /// The persistent session went away before the command finished
    #[error("session {0} ended before the command finished")]
    SessionEnded(String),

    /// Container runtime or target is unreachable
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    IoError(String),

    /// Operation not available on this backend or platform
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Malformed target or configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ExecError {
    /// Whether this is a connection failure expected to clear up shortly
    /// (reset, refused, handshake timeout)
    #[must_use]
    pub fn is_transient(&self) -> bool {
        let ExecError::ConnectionFailed(message) = self else {
            return false;
        };
        let message = message.to_lowercase();
        TRANSIENT_MARKERS.iter().any(|marker| message.contains(marker))
    }

    /// Check if error means "target is not there" rather than "command broke"
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ExecError::BackendUnavailable(_) | ExecError::ConnectionFailed(_)
        )
    }
}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        ExecError::IoError(err.to_string())
    }
}
