//! Base directory, config directory, and environment-variable conventions.
//!
//! Every other component resolves its on-disk location through this module
//! rather than hard-coding paths, so the persisted-state layout stays in one
//! place.

use std::env;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the base directory.
pub const HOME_OVERRIDE_VAR: &str = "DEV_STACK_HOME";

/// Default prefix for configuration-overriding environment variables.
pub const DEFAULT_ENV_PREFIX: &str = "DEV_STACK_";

/// Resolved set of directories the tool reads and writes.
#[derive(Debug, Clone)]
pub struct Paths {
    /// `<base>/versions/<version>/<tool-binary>` lives under here.
    pub base_dir: PathBuf,
    /// `installed_versions.json`, `project_configs.json`, `global.yaml` live under here.
    pub config_dir: PathBuf,
}

impl Paths {
    /// Resolve paths from the environment, honoring [`HOME_OVERRIDE_VAR`].
    pub fn discover() -> Self {
        let base_dir = env::var_os(HOME_OVERRIDE_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(env::temp_dir)
                    .join("dev-stack")
            });
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| base_dir.clone())
            .join("dev-stack");
        Self {
            base_dir,
            config_dir,
        }
    }

    /// Build paths rooted at an arbitrary directory; used by tests so nothing
    /// touches the real home directory.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            base_dir: root.join("base"),
            config_dir: root.join("config"),
        }
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.base_dir.join("versions")
    }

    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.versions_dir().join(version)
    }

    pub fn current_link(&self) -> PathBuf {
        self.base_dir.join("current")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.config_dir.join("installed_versions.json")
    }

    pub fn project_index_file(&self) -> PathBuf {
        self.config_dir.join("project_configs.json")
    }

    pub fn global_settings_file(&self) -> PathBuf {
        self.config_dir.join("global.yaml")
    }
}

/// Read an environment-configured override for a dotted manifest key, e.g.
/// `overrides.network_name` becomes `DEV_STACK_OVERRIDES_NETWORK_NAME` under
/// the default prefix.
pub fn env_override(prefix: &str, dotted_key: &str) -> Option<String> {
    let var_name = format!(
        "{prefix}{}",
        dotted_key.to_uppercase().replace('.', "_").replace('-', "_")
    );
    env::var(var_name).ok()
}

/// Load a project-root `.env` file into the process environment, if present.
/// Never overrides a variable already set in the environment.
pub fn load_project_dotenv(project_root: &Path) {
    let candidate = project_root.join(".env");
    if candidate.is_file() {
        let _ = dotenvy::from_path(candidate);
    }
}
