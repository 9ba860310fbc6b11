//! Global configuration for cm
//!
//! Located at `~/.config/cm/config.toml` (or `$CM_CONFIG_DIR/config.toml`)

use crate::{ConfigError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Overrides the directory holding `config.toml`
pub const CONFIG_DIR_ENV: &str = "CM_CONFIG_DIR";

/// Overrides the directory holding the environment ledger
pub const STATE_DIR_ENV: &str = "CM_STATE_DIR";

/// Global cm configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub defaults: DefaultsConfig,
    pub providers: ProvidersConfig,
}

/// Default settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Default container provider ("docker" or "podman", empty to auto-detect)
    pub provider: String,
    /// Shell used by `cm env shell` when none is given
    pub shell: String,
    /// Grace period in seconds for stop and restart
    pub stop_timeout: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            shell: "/bin/sh".to_string(),
            stop_timeout: 10,
        }
    }
}

/// Provider-specific configurations
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    pub docker: DockerConfig,
    pub podman: PodmanConfig,
}

/// Docker-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Docker socket path
    pub socket: String,
    #[serde(flatten)]
    pub extra: HashMap<String, toml::Value>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
            extra: HashMap::new(),
        }
    }
}

#[cfg(windows)]
fn default_docker_socket() -> String {
    "//./pipe/docker_engine".to_string()
}

#[cfg(not(windows))]
fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

/// Podman-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PodmanConfig {
    /// Podman socket path
    pub socket: String,
    #[serde(flatten)]
    pub extra: HashMap<String, toml::Value>,
}

impl Default for PodmanConfig {
    fn default() -> Self {
        Self {
            socket: default_podman_socket(),
            extra: HashMap::new(),
        }
    }
}

#[cfg(target_os = "linux")]
fn default_podman_socket() -> String {
    std::env::var("XDG_RUNTIME_DIR")
        .map(|dir| format!("{}/podman/podman.sock", dir))
        .unwrap_or_else(|_| "/run/user/1000/podman/podman.sock".to_string())
}

#[cfg(target_os = "macos")]
fn default_podman_socket() -> String {
    dirs::home_dir()
        .map(|h| {
            format!(
                "{}/.local/share/containers/podman/machine/podman-machine-default/podman.sock",
                h.display()
            )
        })
        .unwrap_or_else(|| "/var/run/podman.sock".to_string())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn default_podman_socket() -> String {
    "//./pipe/podman-machine-default".to_string()
}

impl GlobalConfig {
    /// Load global configuration from the default path
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load global configuration from a specific path, falling back to
    /// defaults when the file does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        tracing::debug!(
            "Loaded config from {:?}: provider={:?}",
            path,
            config.defaults.provider
        );

        Ok(config)
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        let dir = resolve_dir(std::env::var_os(CONFIG_DIR_ENV), |dirs| {
            dirs.config_dir().to_path_buf()
        })
        .ok_or(ConfigError::NoConfigDir)?;
        Ok(dir.join("config.toml"))
    }

    /// Get the directory holding persisted environment state
    pub fn state_dir() -> Result<PathBuf> {
        resolve_dir(std::env::var_os(STATE_DIR_ENV), |dirs| {
            dirs.data_dir().to_path_buf()
        })
        .ok_or(ConfigError::NoDataDir)
    }
}

fn resolve_dir(
    override_dir: Option<OsString>,
    from_project: impl FnOnce(&ProjectDirs) -> PathBuf,
) -> Option<PathBuf> {
    match override_dir {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => ProjectDirs::from("", "", "cm").map(|dirs| from_project(&dirs)),
    }
}
