//! Shared value types that cross crate boundaries (spec §3).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use ulid::Ulid;

/// Generate a globally-unique, lexicographically-sortable command id.
pub fn new_command_id() -> String {
    Ulid::new().to_string()
}

/// Lifecycle state of a [`crate::types::CommandResult`]'s owning command.
///
/// Transitions are monotonic except `Queued -> Cancelled`; `Completed`,
/// `Failed`, and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Queued,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Completed | CommandState::Failed | CommandState::Cancelled
        )
    }
}

/// Immutable, fully-resolved outcome of one command execution.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub output_text: String,
    pub is_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration: Duration,
    pub original_command: String,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    /// Cheap size estimate (byte length of `output_text`) consumed by the cache.
    pub approximate_size_bytes: usize,
}

impl CommandResult {
    pub fn success(
        output_text: String,
        original_command: String,
        queued_at: DateTime<Utc>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let approximate_size_bytes = output_text.len();
        Self {
            output_text,
            is_success: true,
            error_message: None,
            duration: to_duration(started_at, finished_at),
            original_command,
            queued_at,
            started_at: Some(started_at),
            finished_at,
            approximate_size_bytes,
        }
    }

    pub fn failure(
        output_text: String,
        error_message: String,
        original_command: String,
        queued_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let approximate_size_bytes = output_text.len();
        let duration = started_at
            .map(|s| to_duration(s, finished_at))
            .unwrap_or_default();
        Self {
            output_text,
            is_success: false,
            error_message: Some(error_message),
            duration,
            original_command,
            queued_at,
            started_at,
            finished_at,
            approximate_size_bytes,
        }
    }
}

fn to_duration(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Duration {
    (finished_at - started_at)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_result_has_no_error_message() {
        let now = Utc::now();
        let result = CommandResult::success("ok".into(), "version".into(), now, now, now);
        assert!(result.is_success);
        assert!(result.error_message.is_none());
        assert_eq!(result.approximate_size_bytes, 2);
    }

    #[test]
    fn failure_result_carries_error_message() {
        let now = Utc::now();
        let result = CommandResult::failure(
            "command timed out after 100ms".into(),
            "timeout".into(),
            "!very_long".into(),
            now,
            Some(now),
            now,
        );
        assert!(!result.is_success);
        assert_eq!(result.error_message.as_deref(), Some("timeout"));
    }

    #[test]
    fn terminal_states_are_recognized() {
        assert!(CommandState::Completed.is_terminal());
        assert!(CommandState::Failed.is_terminal());
        assert!(CommandState::Cancelled.is_terminal());
        assert!(!CommandState::Queued.is_terminal());
        assert!(!CommandState::Executing.is_terminal());
    }
}
