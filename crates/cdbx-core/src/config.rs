//! Immutable, process-wide session configuration (spec §3, §6).

use std::path::PathBuf;
use std::time::Duration;

use crate::error::SupervisorError;

/// All durations are strictly positive; `symbol_server_retries` is `>= 0`
/// (enforced by the unsigned type). Constructed once via [`SessionConfigBuilder`]
/// and read-only thereafter.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub command_timeout: Duration,
    pub idle_timeout: Duration,
    pub startup_delay: Duration,
    pub output_read_timeout: Duration,
    pub symbol_server_retries: u32,
    pub executable_path_override: Option<PathBuf>,
    pub symbol_search_path: Option<String>,
    pub command_preprocessing_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(10),
            startup_delay: Duration::from_millis(500),
            output_read_timeout: Duration::from_secs(2),
            symbol_server_retries: 3,
            executable_path_override: None,
            symbol_search_path: None,
            command_preprocessing_enabled: false,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

/// Builder that validates duration/retry invariants before producing an
/// immutable [`SessionConfig`].
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    inner: SessionConfigOverrides,
}

#[derive(Debug, Clone, Default)]
struct SessionConfigOverrides {
    command_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    startup_delay: Option<Duration>,
    output_read_timeout: Option<Duration>,
    symbol_server_retries: Option<u32>,
    executable_path_override: Option<PathBuf>,
    symbol_search_path: Option<String>,
    command_preprocessing_enabled: Option<bool>,
}

macro_rules! duration_setter {
    ($name:ident) => {
        pub fn $name(mut self, value: Duration) -> Self {
            self.inner.$name = Some(value);
            self
        }
    };
}

impl SessionConfigBuilder {
    duration_setter!(command_timeout);
    duration_setter!(idle_timeout);
    duration_setter!(startup_delay);
    duration_setter!(output_read_timeout);

    pub fn symbol_server_retries(mut self, value: u32) -> Self {
        self.inner.symbol_server_retries = Some(value);
        self
    }

    pub fn executable_path_override(mut self, value: impl Into<PathBuf>) -> Self {
        self.inner.executable_path_override = Some(value.into());
        self
    }

    pub fn symbol_search_path(mut self, value: impl Into<String>) -> Self {
        self.inner.symbol_search_path = Some(value.into());
        self
    }

    pub fn command_preprocessing_enabled(mut self, value: bool) -> Self {
        self.inner.command_preprocessing_enabled = Some(value);
        self
    }

    /// Validate all duration fields are strictly positive and build the
    /// immutable config. Unset fields fall back to [`SessionConfig::default`].
    pub fn build(self) -> Result<SessionConfig, SupervisorError> {
        let defaults = SessionConfig::default();
        let config = SessionConfig {
            command_timeout: self.inner.command_timeout.unwrap_or(defaults.command_timeout),
            idle_timeout: self.inner.idle_timeout.unwrap_or(defaults.idle_timeout),
            startup_delay: self.inner.startup_delay.unwrap_or(defaults.startup_delay),
            output_read_timeout: self
                .inner
                .output_read_timeout
                .unwrap_or(defaults.output_read_timeout),
            symbol_server_retries: self
                .inner
                .symbol_server_retries
                .unwrap_or(defaults.symbol_server_retries),
            executable_path_override: self
                .inner
                .executable_path_override
                .or(defaults.executable_path_override),
            symbol_search_path: self.inner.symbol_search_path.or(defaults.symbol_search_path),
            command_preprocessing_enabled: self
                .inner
                .command_preprocessing_enabled
                .unwrap_or(defaults.command_preprocessing_enabled),
        };

        for (name, duration) in [
            ("command_timeout", config.command_timeout),
            ("idle_timeout", config.idle_timeout),
            ("startup_delay", config.startup_delay),
            ("output_read_timeout", config.output_read_timeout),
        ] {
            if duration.is_zero() {
                return Err(SupervisorError::InvalidArgument(format!(
                    "{name} must be strictly positive"
                )));
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_successfully() {
        let config = SessionConfig::builder().build().expect("valid defaults");
        assert_eq!(config.command_timeout, Duration::from_secs(30));
        assert_eq!(config.symbol_server_retries, 3);
    }

    #[test]
    fn zero_command_timeout_is_rejected() {
        let err = SessionConfig::builder()
            .command_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidArgument(_)));
    }

    #[test]
    fn zero_idle_timeout_is_rejected() {
        let err = SessionConfig::builder()
            .idle_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidArgument(_)));
    }

    #[test]
    fn overrides_are_applied() {
        let config = SessionConfig::builder()
            .command_timeout(Duration::from_millis(100))
            .symbol_server_retries(0)
            .symbol_search_path("srv*https://example.test")
            .build()
            .expect("valid");
        assert_eq!(config.command_timeout, Duration::from_millis(100));
        assert_eq!(config.symbol_server_retries, 0);
        assert_eq!(
            config.symbol_search_path.as_deref(),
            Some("srv*https://example.test")
        );
    }
}
