//! Completion observer contract (spec §6). Lives here, rather than in
//! `cdbx-session`, so `cdbx-queue`'s processor loop can invoke it directly
//! on every terminal transition instead of leaving it as a passthrough the
//! embedder has to call by hand.

use crate::types::CommandState;

pub trait NotificationSink: Send + Sync {
    fn on_command_completed(&self, command_id: &str, state: CommandState);
}

/// Default sink used when an embedder wires none: does nothing.
pub struct NullNotificationSink;

impl NotificationSink for NullNotificationSink {
    fn on_command_completed(&self, _command_id: &str, _state: CommandState) {}
}
