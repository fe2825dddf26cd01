//! Project configuration loader (C9): parses the project manifest, applies
//! profiles and overrides, and exposes the merged, validated view.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::versionfile::MANIFEST_FILENAMES;

#[derive(Debug, thiserror::Error)]
pub enum ProjectConfigError {
    #[error("malformed manifest {path}: {source}")]
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

/// Tri-state: profile overrides may explicitly set, unset, or leave a scalar
/// to inherit from the enclosing scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    True,
    False,
    #[default]
    Unset,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceOverride {
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub enabled: TriState,
    #[serde(default)]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalOverrides {
    #[serde(default)]
    pub network_name: Option<String>,
    #[serde(default)]
    pub volume_prefix: Option<String>,
    #[serde(default)]
    pub restart_policy: Option<String>,
    #[serde(default = "default_true")]
    pub healthcheck: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub overrides: GlobalOverrides,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceOverride>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesSection {
    #[serde(default)]
    pub default: Vec<String>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub disabled: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectIdentity {
    pub name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_environment() -> String {
    "development".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub project: Option<ProjectIdentity>,
    #[serde(default)]
    pub services: ServicesSection,
    #[serde(default)]
    pub overrides: GlobalOverrides,
    #[serde(default)]
    pub service_overrides: BTreeMap<String, ServiceOverride>,
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
    #[serde(default)]
    pub networks: BTreeMap<String, serde_norway::Value>,
    #[serde(default)]
    pub volumes: BTreeMap<String, serde_norway::Value>,
}

#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub root: PathBuf,
    pub name: String,
    pub environment: String,
    pub effective_services: IndexSet<String>,
    pub global_overrides: GlobalOverrides,
    pub service_overrides: BTreeMap<String, ServiceOverride>,
    /// The profile resolved against when this config was loaded, recorded
    /// in the generated composition's `x-metadata` block.
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub violations: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Load and merge a project's manifest against `profile_name`.
#[tracing::instrument(skip(project_root))]
pub fn load(
    project_root: &Path,
    profile_name: Option<&str>,
) -> Result<(ProjectConfig, ValidationReport), ProjectConfigError> {
    let manifest = load_manifest(project_root)?;

    let profile = profile_name.and_then(|name| {
        manifest
            .profiles
            .get(name)
            .cloned()
            .or_else(|| Some(Profile::default()))
    });

    let global_overrides = merge_global_overrides(&manifest.overrides, profile.as_ref());
    let merged_service_overrides = merge_service_overrides(&manifest, profile.as_ref());

    let effective_services = compute_effective_service_set(&manifest, &merged_service_overrides);

    let name = manifest
        .project
        .as_ref()
        .map(|p| p.name.clone())
        .unwrap_or_else(|| default_project_name(project_root));
    let environment = manifest
        .project
        .as_ref()
        .map(|p| p.environment.clone())
        .unwrap_or_else(default_environment);

    let config = ProjectConfig {
        root: project_root.to_path_buf(),
        name,
        environment,
        effective_services,
        global_overrides,
        service_overrides: merged_service_overrides,
        profile: profile_name.map(str::to_string),
    };

    let report = validate(&config);
    Ok((config, report))
}

fn default_project_name(project_root: &Path) -> String {
    project_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string())
}

fn load_manifest(project_root: &Path) -> Result<Manifest, ProjectConfigError> {
    for filename in MANIFEST_FILENAMES {
        let path = project_root.join(filename);
        if !path.is_file() {
            continue;
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| ProjectConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let manifest: Manifest =
            serde_norway::from_str(&raw).map_err(|source| ProjectConfigError::Parse {
                path,
                source,
            })?;
        return Ok(manifest);
    }

    Ok(Manifest {
        project: Some(ProjectIdentity {
            name: default_project_name(project_root),
            environment: default_environment(),
        }),
        ..Manifest::default()
    })
}

fn merge_global_overrides(base: &GlobalOverrides, profile: Option<&Profile>) -> GlobalOverrides {
    let Some(profile) = profile else {
        return base.clone();
    };
    GlobalOverrides {
        network_name: profile
            .overrides
            .network_name
            .clone()
            .or_else(|| base.network_name.clone()),
        volume_prefix: profile
            .overrides
            .volume_prefix
            .clone()
            .or_else(|| base.volume_prefix.clone()),
        restart_policy: profile
            .overrides
            .restart_policy
            .clone()
            .or_else(|| base.restart_policy.clone()),
        healthcheck: profile.overrides.healthcheck && base.healthcheck,
    }
}

fn merge_service_overrides(
    manifest: &Manifest,
    profile: Option<&Profile>,
) -> BTreeMap<String, ServiceOverride> {
    let mut merged = manifest.service_overrides.clone();
    let Some(profile) = profile else {
        return merged;
    };
    for (service_id, profile_override) in &profile.services {
        let base = merged.remove(service_id).unwrap_or_default();
        merged.insert(service_id.clone(), merge_one(base, profile_override));
    }
    merged
}

/// Key-wise merge with the profile winning: maps merge by key, scalars take
/// the profile value if set, lists concatenate profile-first with
/// de-duplication.
fn merge_one(base: ServiceOverride, profile: &ServiceOverride) -> ServiceOverride {
    let mut environment = profile.environment.clone();
    for (k, v) in &base.environment {
        environment.entry(k.clone()).or_insert_with(|| v.clone());
    }

    let mut labels = profile.labels.clone();
    for (k, v) in &base.labels {
        labels.entry(k.clone()).or_insert_with(|| v.clone());
    }

    let mut custom = profile.custom.clone();
    for (k, v) in &base.custom {
        custom.entry(k.clone()).or_insert_with(|| v.clone());
    }

    ServiceOverride {
        environment,
        ports: concat_dedup(&profile.ports, &base.ports),
        volumes: concat_dedup(&profile.volumes, &base.volumes),
        labels,
        custom,
        command: profile.command.clone().or_else(|| base.command.clone()),
        entrypoint: profile
            .entrypoint
            .clone()
            .or_else(|| base.entrypoint.clone()),
        enabled: if profile.enabled == TriState::Unset {
            base.enabled
        } else {
            profile.enabled
        },
        profile: profile.profile.clone().or_else(|| base.profile.clone()),
    }
}

fn concat_dedup(first: &[String], second: &[String]) -> Vec<String> {
    let mut seen = IndexSet::new();
    for item in first.iter().chain(second.iter()) {
        seen.insert(item.clone());
    }
    seen.into_iter().collect()
}

fn compute_effective_service_set(
    manifest: &Manifest,
    overrides: &BTreeMap<String, ServiceOverride>,
) -> IndexSet<String> {
    let mut set: IndexSet<String> = IndexSet::new();
    for id in manifest.services.default.iter().chain(&manifest.services.required) {
        set.insert(id.clone());
    }

    set.retain(|id| {
        if manifest.services.disabled.contains(id) {
            return false;
        }
        match overrides.get(id).map(|o| o.enabled) {
            Some(TriState::False) => false,
            _ => true,
        }
    });

    set
}

fn validate(config: &ProjectConfig) -> ValidationReport {
    let mut violations = Vec::new();

    if config.name.is_empty()
        || !config
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        violations.push(format!("invalid project name '{}'", config.name));
    }

    for (service_id, ov) in &config.service_overrides {
        for key in ov.environment.keys() {
            if key.is_empty() || key.chars().any(char::is_whitespace) {
                violations.push(format!(
                    "service '{service_id}' has invalid environment key '{key}'"
                ));
            }
        }
        for port in &ov.ports {
            if !is_valid_port_string(port) {
                violations.push(format!(
                    "service '{service_id}' has invalid port string '{port}'"
                ));
            }
        }
    }

    ValidationReport { violations }
}

fn is_valid_port_string(raw: &str) -> bool {
    let port_spec = raw.rsplit(':').next().unwrap_or(raw);
    if let Some((lo, hi)) = port_spec.split_once('-') {
        return parse_port(lo).is_some() && parse_port(hi).is_some();
    }
    parse_port(port_spec).is_some()
}

fn parse_port(text: &str) -> Option<u16> {
    let n: u32 = text.parse().ok()?;
    if n == 0 || n > 65535 {
        None
    } else {
        Some(n as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn missing_manifest_synthesizes_default_using_directory_name() {
        let dir = tempdir().unwrap();
        let project_root = dir.path().join("my-project");
        fs::create_dir(&project_root).unwrap();
        let (config, report) = load(&project_root, None).unwrap();
        assert_eq!(config.name, "my-project");
        assert!(report.is_ok());
    }

    #[test]
    fn profile_override_wins_over_global_for_env_keys() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("dev-stack.yaml"),
            r#"
project:
  name: demo
services:
  default: [api]
service_overrides:
  api:
    environment:
      LOG_LEVEL: INFO
profiles:
  dev:
    services:
      api:
        environment:
          LOG_LEVEL: DEBUG
          DEBUG: "true"
"#,
        )
        .unwrap();

        let (config, _) = load(dir.path(), Some("dev")).unwrap();
        let api = config.service_overrides.get("api").unwrap();
        assert_eq!(api.environment.get("LOG_LEVEL").unwrap(), "DEBUG");
        assert_eq!(api.environment.get("DEBUG").unwrap(), "true");
    }

    #[test]
    fn disabled_service_is_excluded_from_effective_set() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("dev-stack.yaml"),
            r#"
project:
  name: demo
services:
  default: [api, cache]
  disabled: [cache]
"#,
        )
        .unwrap();
        let (config, _) = load(dir.path(), None).unwrap();
        assert!(config.effective_services.contains("api"));
        assert!(!config.effective_services.contains("cache"));
    }

    #[test]
    fn tri_state_enabled_false_excludes_service() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("dev-stack.yaml"),
            r#"
project:
  name: demo
services:
  default: [api]
service_overrides:
  api:
    enabled: false
"#,
        )
        .unwrap();
        let (config, _) = load(dir.path(), None).unwrap();
        assert!(!config.effective_services.contains("api"));
    }

    #[test]
    fn invalid_project_name_is_a_validation_violation() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("dev-stack.yaml"),
            "project:\n  name: \"bad name!\"\n",
        )
        .unwrap();
        let (_, report) = load(dir.path(), None).unwrap();
        assert!(!report.is_ok());
    }

    #[test]
    fn port_validation_accepts_ranges_and_rejects_out_of_bounds() {
        assert!(is_valid_port_string("5432"));
        assert!(is_valid_port_string("5432:5432"));
        assert!(is_valid_port_string("1-1024"));
        assert!(!is_valid_port_string("0"));
        assert!(!is_valid_port_string("65536"));
    }
}
