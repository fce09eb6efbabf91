//! Semantic error kinds shared across the supervisor crates.

/// Errors surfaced by the command-execution pipeline.
///
/// Propagation policy (see spec §7):
/// - `InvalidArgument`/`InvalidState` propagate synchronously to the caller.
/// - `NotFound` is expressed as a sentinel string by `CommandQueue::get_result`
///   and never constructed as this variant in that path; it exists here for
///   collaborators (e.g. `cancel`) that do return it directly.
/// - `Timeout`, `Cancelled`, `ChildIoFailure`, `ChildExitedUnexpectedly` are
///   recorded on the command and returned through the result path.
/// - `LaunchFailure` fails `Session::start` and is returned as `Ok(false)`
///   at that boundary, but is kept as a typed variant for diagnostics.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SupervisorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("command '{0}' not found")]
    NotFound(String),

    #[error("command timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("command cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("child process I/O failure: {0}")]
    ChildIoFailure(String),

    #[error("child process exited unexpectedly (code {code:?})")]
    ChildExitedUnexpectedly { code: Option<i32> },

    #[error("failed to launch debugger process: {0}")]
    LaunchFailure(String),
}

impl SupervisorError {
    /// Render the literal user-visible phrase spec §7/§8 requires for the
    /// output text of a terminal, non-success command.
    pub fn user_visible_phrase(&self) -> String {
        match self {
            SupervisorError::Timeout { elapsed_ms } => {
                format!("command timed out after {elapsed_ms}ms")
            }
            SupervisorError::Cancelled { reason } => format!("command cancelled: {reason}"),
            SupervisorError::ChildExitedUnexpectedly { .. } => {
                "session terminated: debugger process exited unexpectedly".to_string()
            }
            SupervisorError::ChildIoFailure(message) => {
                format!("session terminated: {message}")
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_phrase_contains_timed_out_and_millis() {
        let err = SupervisorError::Timeout { elapsed_ms: 100 };
        let phrase = err.user_visible_phrase();
        assert!(phrase.contains("timed out"));
        assert!(phrase.contains("100"));
    }

    #[test]
    fn cancelled_phrase_contains_cancelled() {
        let err = SupervisorError::Cancelled {
            reason: "external".to_string(),
        };
        assert!(err.user_visible_phrase().contains("cancelled"));
    }

    #[test]
    fn unexpected_exit_phrase_contains_session_terminated() {
        let err = SupervisorError::ChildExitedUnexpectedly { code: Some(1) };
        assert!(
            err.user_visible_phrase()
                .contains("session terminated")
        );
    }

    #[test]
    fn display_invalid_argument() {
        let err = SupervisorError::InvalidArgument("empty command text".to_string());
        assert_eq!(err.to_string(), "invalid argument: empty command text");
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SupervisorError>();
    }
}
