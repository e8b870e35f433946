//! Daemon paths and runtime configuration.
//!
//! Everything lives under the proctor data root (`$PROCTOR_HOME`, else
//! `~/.proctor`). A missing `daemon/daemon.toml` yields defaults.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

const HOME_ENV: &str = "PROCTOR_HOME";
const SOCKET_ENV: &str = "PROCTOR_DAEMON_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";

pub const DEFAULT_MAX_EVIDENCE_BYTES: u64 = 8 * 1024 * 1024;
pub const DEFAULT_MAX_DETAILS_LEN: usize = 1024;

pub fn proctor_home() -> Result<PathBuf, String> {
    if let Ok(value) = env::var(HOME_ENV) {
        if !value.trim().is_empty() {
            return Ok(PathBuf::from(value));
        }
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".proctor"))
}

pub fn daemon_socket_path() -> Result<PathBuf, String> {
    if let Ok(value) = env::var(SOCKET_ENV) {
        if !value.trim().is_empty() {
            return Ok(PathBuf::from(value));
        }
    }
    Ok(proctor_home()?.join(SOCKET_NAME))
}

pub fn daemon_db_path() -> Result<PathBuf, String> {
    Ok(proctor_home()?.join("daemon").join("state.db"))
}

pub fn default_config_path() -> Result<PathBuf, String> {
    Ok(proctor_home()?.join("daemon").join("daemon.toml"))
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Root for evidence payload files; `<proctor home>/evidence` when unset.
    pub evidence_dir: Option<PathBuf>,
    pub max_evidence_bytes: u64,
    pub max_details_len: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            evidence_dir: None,
            max_evidence_bytes: DEFAULT_MAX_EVIDENCE_BYTES,
            max_details_len: DEFAULT_MAX_DETAILS_LEN,
        }
    }
}

impl DaemonConfig {
    pub fn resolve_evidence_dir(&self) -> Result<PathBuf, String> {
        match &self.evidence_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(proctor_home()?.join("evidence")),
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<DaemonConfig, String> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read daemon config {}: {}",
            config_path.display(),
            err
        )
    })?;
    let config = toml::from_str::<DaemonConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse daemon config {}: {}",
            config_path.display(),
            err
        )
    })?;
    if config.max_evidence_bytes == 0 {
        return Err(format!(
            "Invalid daemon config {}: max_evidence_bytes must be positive",
            config_path.display()
        ));
    }
    Ok(config)
}
