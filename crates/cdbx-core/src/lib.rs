//! Shared sentinels, configuration, error kinds, and result types consumed
//! by every other `cdbx-*` crate. Leaf crate: no process or async dependency.

pub mod config;
pub mod error;
pub mod notify;
pub mod sentinel;
pub mod types;

pub use config::{SessionConfig, SessionConfigBuilder};
pub use error::SupervisorError;
pub use notify::{NotificationSink, NullNotificationSink};
pub use sentinel::{BatchSentinels, Sentinels};
pub use types::{CommandResult, CommandState, new_command_id};
