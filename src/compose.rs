//! Composition generator (C10): renders the merged service set into the
//! canonical composition artifact and an environment file.
//!
//! Pure and deterministic given identical inputs and an injected clock:
//! every map here is a [`Fragment`] (`BTreeMap`), which always serializes in
//! sorted key order, so stable output falls out of the type rather than an
//! explicit sort step at render time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::ServiceCatalog;
use crate::project::ProjectConfig;

/// A sorted-by-construction bag of YAML values, the unit the generator
/// merges and serializes at every level.
pub type Fragment = BTreeMap<String, serde_norway::Value>;

#[derive(Debug, thiserror::Error)]
pub enum CompositionError {
    #[error("service '{0}' referenced in composition is not in the catalog")]
    MissingService(String),
    #[error("io error writing composition artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize composition artifact: {0}")]
    Serialize(#[from] serde_norway::Error),
}

/// Supplies the generation timestamp; production uses [`SystemClock`], tests
/// inject a fixed value for byte-identical output comparison.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationMetadata {
    pub tool: String,
    pub generated_at: DateTime<Utc>,
    pub project_name: String,
    pub profile: Option<String>,
    pub services: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CompositionArtifact {
    pub services: Fragment,
    pub networks: Fragment,
    pub volumes: Fragment,
    pub metadata: GenerationMetadata,
}

impl CompositionArtifact {
    /// Canonical YAML with top-level keys `services`, `networks`, `volumes`,
    /// `x-metadata`.
    pub fn to_yaml(&self) -> Result<String, CompositionError> {
        let mut doc: BTreeMap<&str, serde_norway::Value> = BTreeMap::new();
        doc.insert(
            "services",
            serde_norway::to_value(&self.services)?,
        );
        doc.insert(
            "networks",
            serde_norway::to_value(&self.networks)?,
        );
        doc.insert(
            "volumes",
            serde_norway::to_value(&self.volumes)?,
        );
        doc.insert("x-metadata", serde_norway::to_value(&self.metadata)?);
        Ok(serde_norway::to_string(&doc)?)
    }
}

#[derive(Debug, Clone)]
pub struct EnvFile {
    /// service id -> ordered key=value lines for that block
    pub blocks: Vec<(String, Vec<(String, String)>)>,
    pub project_keys: Vec<(String, String)>,
}

impl EnvFile {
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.project_keys {
            out.push_str(&format!("{key}={value}\n"));
        }
        for (service_id, lines) in &self.blocks {
            out.push_str(&format!("# {service_id}\n"));
            for (key, value) in lines {
                out.push_str(&format!("{key}={value}\n"));
            }
        }
        out
    }
}

/// Generate the composition artifact and env file for `ordered_services`
/// (already resolved and ordered by C8), applying port rewrites from C13.
pub fn generate(
    project: &ProjectConfig,
    catalog: &ServiceCatalog,
    ordered_services: &[String],
    port_rewrites: &BTreeMap<String, BTreeMap<u16, u16>>,
    clock: &dyn Clock,
) -> Result<(CompositionArtifact, EnvFile), CompositionError> {
    let mut services: Fragment = Fragment::new();
    let mut volumes: Fragment = Fragment::new();
    let mut env_blocks = Vec::new();

    let network_name = project
        .global_overrides
        .network_name
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let volume_prefix = project.global_overrides.volume_prefix.clone();
    let restart_policy = project.global_overrides.restart_policy.clone();
    let strip_healthcheck = !project.global_overrides.healthcheck;

    for service_id in ordered_services {
        let def = catalog
            .get(service_id)
            .ok_or_else(|| CompositionError::MissingService(service_id.clone()))?;

        let mut fragment: Fragment = match &def.compose {
            serde_norway::Value::Mapping(m) => m
                .iter()
                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone())))
                .collect(),
            _ => Fragment::new(),
        };

        apply_service_override(&mut fragment, project, service_id);
        apply_port_rewrites(&mut fragment, port_rewrites.get(service_id));
        apply_volume_prefix(&mut fragment, volume_prefix.as_deref(), &mut volumes, service_id);

        if let Some(policy) = &restart_policy {
            fragment
                .entry("restart".to_string())
                .or_insert_with(|| serde_norway::Value::String(policy.clone()));
        }
        if strip_healthcheck {
            fragment.remove("healthcheck");
        }
        fragment.insert(
            "networks".to_string(),
            serde_norway::Value::Sequence(vec![serde_norway::Value::String(network_name.clone())]),
        );

        services.insert(service_id.clone(), serde_norway::to_value(&fragment)?);

        env_blocks.push((service_id.clone(), render_env_block(def, project, service_id)));
    }

    let mut networks: Fragment = Fragment::new();
    networks.insert(network_name, serde_norway::to_value(serde_norway::Mapping::new())?);

    let metadata = GenerationMetadata {
        tool: "dev-stack".to_string(),
        generated_at: clock.now(),
        project_name: project.name.clone(),
        profile: project.profile.clone(),
        services: ordered_services.to_vec(),
    };

    let artifact = CompositionArtifact {
        services,
        networks,
        volumes,
        metadata,
    };

    let env_file = EnvFile {
        blocks: env_blocks,
        project_keys: vec![
            ("PROJECT_NAME".to_string(), project.name.clone()),
            ("PROJECT_ENVIRONMENT".to_string(), project.environment.clone()),
            (
                "GENERATED_AT".to_string(),
                clock.now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            ),
        ],
    };

    Ok((artifact, env_file))
}

pub const COMPOSITION_FILENAME: &str = "docker-compose.generated.yaml";
pub const ENV_FILENAME: &str = ".env.generated";

/// Atomically writes the composition artifact and env file into `dir`
/// (typically `<project-root>/dev-stack`), returning the paths written.
/// Each file is staged at a sibling `.tmp` path and renamed into place, so a
/// reader never observes a partially-written document.
pub fn materialize(
    dir: &Path,
    artifact: &CompositionArtifact,
    env_file: &EnvFile,
) -> Result<(PathBuf, PathBuf), CompositionError> {
    std::fs::create_dir_all(dir)?;
    let compose_path = dir.join(COMPOSITION_FILENAME);
    let env_path = dir.join(ENV_FILENAME);
    write_atomic(&compose_path, artifact.to_yaml()?.as_bytes())?;
    write_atomic(&env_path, env_file.to_text().as_bytes())?;
    Ok((compose_path, env_path))
}

fn write_atomic(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    std::fs::write(&tmp_path, body)?;
    std::fs::rename(&tmp_path, path)
}

fn apply_service_override(fragment: &mut Fragment, project: &ProjectConfig, service_id: &str) {
    let Some(ov) = project.service_overrides.get(service_id) else {
        return;
    };

    if !ov.environment.is_empty() {
        let mut env_map = serde_norway::Mapping::new();
        for (k, v) in &ov.environment {
            env_map.insert(
                serde_norway::Value::String(k.clone()),
                serde_norway::Value::String(v.clone()),
            );
        }
        fragment.insert(
            "environment".to_string(),
            serde_norway::Value::Mapping(env_map),
        );
    }
    if !ov.ports.is_empty() {
        fragment.insert(
            "ports".to_string(),
            serde_norway::Value::Sequence(
                ov.ports
                    .iter()
                    .map(|p| serde_norway::Value::String(p.clone()))
                    .collect(),
            ),
        );
    }
    if !ov.volumes.is_empty() {
        fragment.insert(
            "volumes".to_string(),
            serde_norway::Value::Sequence(
                ov.volumes
                    .iter()
                    .map(|v| serde_norway::Value::String(v.clone()))
                    .collect(),
            ),
        );
    }
    if let Some(command) = &ov.command {
        fragment.insert(
            "command".to_string(),
            serde_norway::Value::String(command.clone()),
        );
    }
}

fn apply_port_rewrites(fragment: &mut Fragment, rewrites: Option<&BTreeMap<u16, u16>>) {
    let Some(rewrites) = rewrites else { return };
    let Some(serde_norway::Value::Sequence(ports)) = fragment.get("ports").cloned() else {
        return;
    };
    let rewritten: Vec<serde_norway::Value> = ports
        .into_iter()
        .map(|p| match p.as_str() {
            Some(raw) => {
                for (old, new) in rewrites {
                    let old_prefix = format!("{old}:");
                    if raw == old.to_string() {
                        return serde_norway::Value::String(new.to_string());
                    }
                    if let Some(rest) = raw.strip_prefix(&old_prefix) {
                        return serde_norway::Value::String(format!("{new}:{rest}"));
                    }
                }
                p
            }
            None => p,
        })
        .collect();
    fragment.insert("ports".to_string(), serde_norway::Value::Sequence(rewritten));
}

fn apply_volume_prefix(
    fragment: &mut Fragment,
    prefix: Option<&str>,
    volumes: &mut Fragment,
    _service_id: &str,
) {
    let Some(prefix) = prefix else { return };
    let Some(serde_norway::Value::Sequence(service_volumes)) = fragment.get("volumes").cloned()
    else {
        return;
    };
    let rewritten: Vec<serde_norway::Value> = service_volumes
        .into_iter()
        .map(|v| match v.as_str() {
            Some(raw) if !raw.starts_with('/') && !raw.starts_with('.') => {
                if let Some((name, rest)) = raw.split_once(':') {
                    let prefixed = format!("{prefix}-{name}");
                    volumes
                        .entry(prefixed.clone())
                        .or_insert_with(|| serde_norway::Value::Null);
                    serde_norway::Value::String(format!("{prefixed}:{rest}"))
                } else {
                    v
                }
            }
            _ => v,
        })
        .collect();
    fragment.insert("volumes".to_string(), serde_norway::Value::Sequence(rewritten));
}

fn render_env_block(
    def: &crate::catalog::ServiceDefinition,
    project: &ProjectConfig,
    service_id: &str,
) -> Vec<(String, String)> {
    let overrides = project.service_overrides.get(service_id);
    def.environment_keys
        .iter()
        .map(|key| {
            let value = overrides
                .and_then(|ov| ov.environment.get(key))
                .cloned()
                .unwrap_or_default();
            (key.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::project::{GlobalOverrides, ProjectConfig};
    use indexmap::IndexSet;
    use std::path::PathBuf;

    fn sample_project() -> ProjectConfig {
        ProjectConfig {
            root: PathBuf::from("/tmp/project"),
            name: "demo".to_string(),
            environment: "development".to_string(),
            effective_services: IndexSet::from(["redis".to_string()]),
            global_overrides: GlobalOverrides::default(),
            service_overrides: BTreeMap::new(),
            profile: None,
        }
    }

    #[test]
    fn generation_is_byte_identical_across_runs_with_fixed_clock() {
        let catalog = catalog::load(None).unwrap();
        let project = sample_project();
        let clock = FixedClock(DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().into());
        let ordered = vec!["redis".to_string()];

        let (a1, e1) = generate(&project, &catalog, &ordered, &BTreeMap::new(), &clock).unwrap();
        let (a2, e2) = generate(&project, &catalog, &ordered, &BTreeMap::new(), &clock).unwrap();

        assert_eq!(a1.to_yaml().unwrap(), a2.to_yaml().unwrap());
        assert_eq!(e1.to_text(), e2.to_text());
    }

    #[test]
    fn port_rewrite_applies_to_host_side_only() {
        let catalog = catalog::load(None).unwrap();
        let project = sample_project();
        let clock = FixedClock(Utc::now());
        let mut rewrites = BTreeMap::new();
        let mut inner = BTreeMap::new();
        inner.insert(6379u16, 6380u16);
        rewrites.insert("redis".to_string(), inner);

        let (artifact, _) = generate(
            &project,
            &catalog,
            &["redis".to_string()],
            &rewrites,
            &clock,
        )
        .unwrap();
        let yaml = artifact.to_yaml().unwrap();
        assert!(yaml.contains("6380:6379") || yaml.contains("\"6380\""));
    }

    #[test]
    fn env_file_includes_project_wide_keys() {
        let catalog = catalog::load(None).unwrap();
        let project = sample_project();
        let clock = FixedClock(Utc::now());
        let (_, env) = generate(
            &project,
            &catalog,
            &["redis".to_string()],
            &BTreeMap::new(),
            &clock,
        )
        .unwrap();
        let text = env.to_text();
        assert!(text.contains("PROJECT_NAME=demo"));
        assert!(text.contains("PROJECT_ENVIRONMENT=development"));
        assert!(text.contains("GENERATED_AT="));
    }

    #[test]
    fn active_profile_is_recorded_in_generated_metadata() {
        let catalog = catalog::load(None).unwrap();
        let mut project = sample_project();
        project.profile = Some("test".to_string());
        let clock = FixedClock(Utc::now());
        let (artifact, _) = generate(
            &project,
            &catalog,
            &["redis".to_string()],
            &BTreeMap::new(),
            &clock,
        )
        .unwrap();
        assert_eq!(artifact.metadata.profile.as_deref(), Some("test"));
        assert!(artifact.to_yaml().unwrap().contains("profile: test"));
    }

    #[test]
    fn materialize_writes_both_files_atomically_into_the_target_directory() {
        let catalog = catalog::load(None).unwrap();
        let project = sample_project();
        let clock = FixedClock(Utc::now());
        let (artifact, env_file) = generate(
            &project,
            &catalog,
            &["redis".to_string()],
            &BTreeMap::new(),
            &clock,
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("dev-stack");
        let (compose_path, env_path) = materialize(&target, &artifact, &env_file).unwrap();

        assert_eq!(compose_path, target.join(COMPOSITION_FILENAME));
        assert_eq!(env_path, target.join(ENV_FILENAME));
        assert_eq!(std::fs::read_to_string(&compose_path).unwrap(), artifact.to_yaml().unwrap());
        assert_eq!(std::fs::read_to_string(&env_path).unwrap(), env_file.to_text());
        assert!(!target.join(format!("{COMPOSITION_FILENAME}.tmp")).exists());
    }
}
