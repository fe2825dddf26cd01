//! Global settings (`global.yaml`, A3): a project-independent document read
//! once per invocation. A missing file is all-defaults, not an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("malformed global settings at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_norway::Error,
    },
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_start_timeout_secs")]
    pub start_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_secs: u64,
    #[serde(default = "default_exec_setup_timeout_secs")]
    pub exec_setup_secs: u64,
}

fn default_start_timeout_secs() -> u64 {
    60
}
fn default_stop_timeout_secs() -> u64 {
    10
}
fn default_exec_setup_timeout_secs() -> u64 {
    30
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            start_secs: default_start_timeout_secs(),
            stop_secs: default_stop_timeout_secs(),
            exec_setup_secs: default_exec_setup_timeout_secs(),
        }
    }
}

impl TimeoutSettings {
    pub fn start(&self) -> Duration {
        Duration::from_secs(self.start_secs)
    }
    pub fn stop(&self) -> Duration {
        Duration::from_secs(self.stop_secs)
    }
    pub fn exec_setup(&self) -> Duration {
        Duration::from_secs(self.exec_setup_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    #[serde(default = "default_engine_preference")]
    pub container_engines: Vec<String>,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub catalog_override_dir: Option<PathBuf>,
}

fn default_engine_preference() -> Vec<String> {
    vec!["docker".to_string(), "podman".to_string()]
}

fn default_env_prefix() -> String {
    crate::paths::DEFAULT_ENV_PREFIX.to_string()
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            base_dir: None,
            container_engines: default_engine_preference(),
            timeouts: TimeoutSettings::default(),
            env_prefix: default_env_prefix(),
            log: LogSettings::default(),
            catalog_override_dir: None,
        }
    }
}

/// Load `global.yaml`; a missing file is equivalent to an empty document.
pub fn load(path: &Path) -> Result<GlobalSettings, SettingsError> {
    if !path.is_file() {
        return Ok(GlobalSettings::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_norway::from_str(&raw).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let settings = load(&dir.path().join("global.yaml")).unwrap();
        assert_eq!(settings.container_engines, vec!["docker", "podman"]);
        assert_eq!(settings.log.level, "info");
    }

    #[test]
    fn partial_document_falls_back_to_defaults_for_missing_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("global.yaml");
        std::fs::write(&path, "container_engines: [podman]\n").unwrap();
        let settings = load(&path).unwrap();
        assert_eq!(settings.container_engines, vec!["podman"]);
        assert_eq!(settings.timeouts.start_secs, 60);
    }
}
