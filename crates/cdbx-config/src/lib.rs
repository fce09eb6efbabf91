//! Optional on-disk configuration layer.
//!
//! Loading a [`SessionConfigFile`] and applying it to a
//! [`cdbx_core::SessionConfigBuilder`] is opt-in — nothing in `cdbx-core`
//! or `cdbx-session` requires a config file to exist. Precedence is
//! explicit builder calls > file values > [`cdbx_core::SessionConfig`]'s
//! built-in defaults, which falls out of applying the file first and then
//! letting the caller's explicit overrides run after it (later builder
//! calls win).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cdbx_core::SessionConfigBuilder;
use serde::Deserialize;

/// Canonical XDG app name used to resolve the default config directory.
pub const APP_NAME: &str = "cdbx";

/// Serializable mirror of [`cdbx_core::SessionConfig`]. Every field is
/// optional so a file only needs to mention what it overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfigFile {
    pub command_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub startup_delay_ms: Option<u64>,
    pub output_read_timeout_secs: Option<u64>,
    pub symbol_server_retries: Option<u32>,
    pub executable_path_override: Option<String>,
    pub symbol_search_path: Option<String>,
    pub command_preprocessing_enabled: Option<bool>,
}

impl SessionConfigFile {
    /// Read and parse a config file at an explicit path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file at {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("parsing config file at {}", path.display()))
    }

    /// Read the config file at [`default_config_path`], if one exists.
    /// Returns `Ok(None)` rather than an error when no file is present —
    /// the absence of a config file is the common case, not a failure.
    pub fn load_default() -> Result<Option<Self>> {
        let Some(path) = default_config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from_path(&path).map(Some)
    }

    /// Fold the file's values into a builder. Call this before any
    /// explicit `.command_timeout(...)`-style overrides so those
    /// overrides win.
    pub fn apply_to(&self, mut builder: SessionConfigBuilder) -> SessionConfigBuilder {
        if let Some(secs) = self.command_timeout_secs {
            builder = builder.command_timeout(std::time::Duration::from_secs(secs));
        }
        if let Some(secs) = self.idle_timeout_secs {
            builder = builder.idle_timeout(std::time::Duration::from_secs(secs));
        }
        if let Some(ms) = self.startup_delay_ms {
            builder = builder.startup_delay(std::time::Duration::from_millis(ms));
        }
        if let Some(secs) = self.output_read_timeout_secs {
            builder = builder.output_read_timeout(std::time::Duration::from_secs(secs));
        }
        if let Some(retries) = self.symbol_server_retries {
            builder = builder.symbol_server_retries(retries);
        }
        if let Some(path) = &self.executable_path_override {
            builder = builder.executable_path_override(path);
        }
        if let Some(search_path) = &self.symbol_search_path {
            builder = builder.symbol_search_path(search_path);
        }
        if let Some(enabled) = self.command_preprocessing_enabled {
            builder = builder.command_preprocessing_enabled(enabled);
        }
        builder
    }
}

/// Config directory per XDG conventions (`~/.config/cdbx` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// `<config_dir>/config.toml`, or `None` if the platform has no home
/// directory to anchor one.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}
