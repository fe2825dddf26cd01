//! Service catalog (C7): loads service definitions from a category-organized
//! embedded tree, overlaid by an on-disk override tree.

use std::collections::BTreeMap;
use std::path::Path;

use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};

#[derive(RustEmbed)]
#[folder = "assets/catalog/"]
struct EmbeddedCatalog;

/// The fixed, closed set of recognized categories.
pub const CATEGORIES: &[&str] = &["database", "cache", "messaging", "observability", "cloud"];

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("duplicate service identifier '{0}' across categories")]
    Duplicate(String),
    #[error("io error scanning catalog directory {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackupSpec {
    #[serde(default)]
    pub extract: Option<Vec<String>>,
    #[serde(default)]
    pub restore: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub id: String,
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub soft_requires: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub environment_keys: Vec<String>,
    #[serde(default)]
    pub backup: BackupSpec,
    pub compose: serde_norway::Value,
}

/// Immutable once loaded; indexed by identifier and by category.
#[derive(Debug, Clone)]
pub struct ServiceCatalog {
    by_id: BTreeMap<String, ServiceDefinition>,
    by_category: BTreeMap<String, Vec<String>>,
}

impl ServiceCatalog {
    pub fn get(&self, id: &str) -> Option<&ServiceDefinition> {
        self.by_id.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.by_id.keys().map(String::as_str)
    }

    pub fn by_category(&self, category: &str) -> &[String] {
        self.by_category
            .get(category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Find every service that declares `token` (a service identifier or a
    /// `provides` token).
    pub fn providers_of<'a>(&'a self, token: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.by_id.values().filter_map(move |def| {
            (def.id == token || def.provides.iter().any(|p| p == token)).then_some(def.id.as_str())
        })
    }
}

/// Load the catalog: embedded baseline, overlaid by an on-disk override tree
/// if `override_dir` exists. On-disk entries with the same identifier fully
/// replace the embedded one (no field-level merge).
#[tracing::instrument(skip(override_dir))]
pub fn load(override_dir: Option<&Path>) -> Result<ServiceCatalog, CatalogError> {
    let mut defs: BTreeMap<String, ServiceDefinition> = BTreeMap::new();

    for file in EmbeddedCatalog::iter() {
        if let Some(def) = parse_embedded_entry(&file) {
            insert_unique(&mut defs, def)?;
        }
    }

    if let Some(dir) = override_dir {
        if dir.is_dir() {
            load_on_disk_overrides(dir, &mut defs)?;
        }
    }

    let mut by_category: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for def in defs.values() {
        by_category
            .entry(def.category.clone())
            .or_default()
            .push(def.id.clone());
    }
    for ids in by_category.values_mut() {
        ids.sort();
    }

    Ok(ServiceCatalog {
        by_id: defs,
        by_category,
    })
}

fn parse_embedded_entry(relative_path: &str) -> Option<ServiceDefinition> {
    let mut parts = relative_path.splitn(2, '/');
    let category = parts.next()?;
    let rest = parts.next()?;
    if !CATEGORIES.contains(&category) || !rest.ends_with(".yaml") {
        return None;
    }
    let contents = EmbeddedCatalog::get(relative_path)?;
    let text = std::str::from_utf8(contents.data.as_ref()).ok()?;
    match serde_norway::from_str::<ServiceDefinition>(text) {
        Ok(def) => Some(def),
        Err(e) => {
            tracing::warn!(path = relative_path, error = %e, "skipping unparseable embedded service definition");
            None
        }
    }
}

fn load_on_disk_overrides(
    dir: &Path,
    defs: &mut BTreeMap<String, ServiceDefinition>,
) -> Result<(), CatalogError> {
    for category in CATEGORIES {
        let category_dir = dir.join(category);
        if !category_dir.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&category_dir).map_err(|source| CatalogError::Io {
            path: category_dir.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| CatalogError::Io {
                path: category_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let contents = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable override");
                    continue;
                }
            };
            match serde_norway::from_str::<ServiceDefinition>(&contents) {
                Ok(def) => {
                    // Full replacement: remove any embedded entry with this id first.
                    defs.remove(&def.id);
                    defs.insert(def.id.clone(), def);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unparseable override service definition");
                }
            }
        }
    }

    // Legacy flat layout fallback: <root>/<service>/docker-compose.yml,
    // only consulted when no category layout entries were found at all.
    if defs.is_empty() {
        load_legacy_flat_layout(dir, defs)?;
    }
    Ok(())
}

fn load_legacy_flat_layout(
    dir: &Path,
    defs: &mut BTreeMap<String, ServiceDefinition>,
) -> Result<(), CatalogError> {
    for entry in std::fs::read_dir(dir).map_err(|source| CatalogError::Io {
        path: dir.to_path_buf(),
        source,
    })? {
        let entry = entry.map_err(|source| CatalogError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let compose_file = path.join("docker-compose.yml");
        if !compose_file.is_file() {
            continue;
        }
        let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Ok(raw) = std::fs::read_to_string(&compose_file) else {
            continue;
        };
        let Ok(compose) = serde_norway::from_str(&raw) else {
            continue;
        };
        defs.insert(
            id.to_string(),
            ServiceDefinition {
                id: id.to_string(),
                category: "legacy".to_string(),
                description: String::new(),
                requires: Vec::new(),
                soft_requires: Vec::new(),
                conflicts: Vec::new(),
                provides: Vec::new(),
                environment_keys: Vec::new(),
                backup: BackupSpec::default(),
                compose,
            },
        );
    }
    Ok(())
}

fn insert_unique(
    defs: &mut BTreeMap<String, ServiceDefinition>,
    def: ServiceDefinition,
) -> Result<(), CatalogError> {
    if defs.contains_key(&def.id) {
        return Err(CatalogError::Duplicate(def.id));
    }
    defs.insert(def.id.clone(), def);
    Ok(())
}
