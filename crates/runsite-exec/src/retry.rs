//! Fixed-delay retry policy for SSH connection attempts

use std::time::Duration;

use crate::error::ExecError;

/// Delay between connection attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Attempts before a transient failure is surfaced
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

/// Decides whether a failed connection is retried and when
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed wait before reconnecting
    pub delay: Duration,
    /// Upper bound on connection attempts, including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RETRY_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Policy with custom delay and bound
    #[must_use]
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Record a failure and return the delay before the next attempt
    ///
    /// Returns `None` when the error must be surfaced: retries disabled, the
    /// error is fatal, or the attempt bound is reached.
    pub fn next_delay(
        &self,
        enabled: bool,
        attempt: &mut ConnectionAttempt,
        err: &ExecError,
    ) -> Option<Duration> {
        attempt.last_error = Some(err.clone());
        if !enabled || !err.is_transient() || attempt.number >= self.max_attempts {
            return None;
        }
        attempt.number += 1;
        Some(self.delay)
    }
}

/// Retry state of one call; never outlives it
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    /// 1-based number of the attempt in progress
    pub number: u32,
    /// Latest failure seen
    pub last_error: Option<ExecError>,
}

impl Default for ConnectionAttempt {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionAttempt {
    /// First attempt
    #[must_use]
    pub fn new() -> Self {
        Self {
            number: 1,
            last_error: None,
        }
    }

    /// Error to surface once no further attempt is made
    #[must_use]
    pub fn into_error(self) -> ExecError {
        match self.last_error {
            Some(ExecError::ConnectionFailed(message)) if self.number > 1 => {
                ExecError::ConnectionFailed(format!(
                    "{message} (gave up after {} attempts)",
                    self.number
                ))
            }
            Some(err) => err,
            None => ExecError::ConnectionFailed("no connection attempt was made".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refused() -> ExecError {
        ExecError::ConnectionFailed("Connection refused (os error 111)".to_string())
    }

    #[test]
    fn test_transient_classification() {
        assert!(refused().is_transient());
        assert!(ExecError::ConnectionFailed("I/O error: Connection reset by peer".to_string())
            .is_transient());
        assert!(ExecError::ConnectionFailed("Timed out while waiting for handshake".to_string())
            .is_transient());
        assert!(!ExecError::ConnectionFailed("No route to host".to_string()).is_transient());
        assert!(!ExecError::AuthenticationFailed("connection refused".to_string()).is_transient());
        assert!(!ExecError::UnexpectedPrompt("Password:".to_string()).is_transient());
    }

    #[test]
    fn test_retry_is_bounded() {
        let policy = RetryPolicy::new(Duration::from_millis(10), 3);
        let mut attempt = ConnectionAttempt::new();

        assert_eq!(
            policy.next_delay(true, &mut attempt, &refused()),
            Some(Duration::from_millis(10))
        );
        assert_eq!(attempt.number, 2);
        assert!(policy.next_delay(true, &mut attempt, &refused()).is_some());
        assert_eq!(attempt.number, 3);
        assert!(policy.next_delay(true, &mut attempt, &refused()).is_none());

        let err = attempt.into_error();
        assert!(
            matches!(&err, ExecError::ConnectionFailed(msg) if msg.ends_with("(gave up after 3 attempts)"))
        );
    }

    #[test]
    fn test_first_failure_surfaces_unchanged() {
        let policy = RetryPolicy::default();
        let mut attempt = ConnectionAttempt::new();
        let err = ExecError::UnexpectedPrompt("Password:".to_string());

        assert!(policy.next_delay(true, &mut attempt, &err).is_none());
        assert!(matches!(attempt.into_error(), ExecError::UnexpectedPrompt(_)));
    }

    #[test]
    fn test_retry_disabled() {
        let policy = RetryPolicy::default();
        let mut attempt = ConnectionAttempt::new();

        assert!(policy.next_delay(false, &mut attempt, &refused()).is_none());
        assert_eq!(attempt.number, 1);
    }

    #[test]
    fn test_fatal_not_retried() {
        let policy = RetryPolicy::default();
        let mut attempt = ConnectionAttempt::new();
        let err = ExecError::AuthenticationFailed("public key rejected".to_string());

        assert!(policy.next_delay(true, &mut attempt, &err).is_none());
    }
}
