//! Installed-version registry (C4): the on-disk record of every locally
//! installed binary and which one is active.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::{Version, VersionConstraint};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("version {0} is not installed")]
    NotInstalled(Version),
    #[error("io error on registry file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not acquire registry lock at {0}")]
    Locked(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledVersion {
    pub version: Version,
    pub path: PathBuf,
    pub installed_at: DateTime<Utc>,
    pub source: String,
    pub active: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    versions: Vec<InstalledVersion>,
}

/// A JSON-persisted registry with a single writer at a time, enforced by a
/// sibling `.lock` file.
pub struct Registry {
    path: PathBuf,
}

struct WriteLock {
    lock_path: PathBuf,
}

impl WriteLock {
    fn acquire(registry_path: &Path) -> Result<Self, RegistryError> {
        let lock_path = registry_path.with_extension("json.lock");
        let mut attempts = 0;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => return Ok(Self { lock_path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    attempts += 1;
                    if attempts > 50 {
                        return Err(RegistryError::Locked(lock_path));
                    }
                    std::thread::sleep(std::time::Duration::from_millis(20));
                }
                Err(source) => {
                    return Err(RegistryError::Io {
                        path: lock_path,
                        source,
                    })
                }
            }
        }
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the document, treating a torn (unparseable) file as empty rather
    /// than failing.
    fn read_document(&self) -> RegistryDocument {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return RegistryDocument::default();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    fn write_document(&self, doc: &RegistryDocument) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| RegistryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(doc).expect("registry document is serializable");
        fs::write(&tmp_path, body).map_err(|source| RegistryError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|source| RegistryError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    /// List installed versions, pruning any entry whose binary path has
    /// vanished (rewriting the document if pruning occurred).
    pub fn list(&self) -> Result<Vec<InstalledVersion>, RegistryError> {
        let mut doc = self.read_document();
        let before = doc.versions.len();
        doc.versions.retain(|v| v.path.exists());
        if doc.versions.len() != before {
            let _lock = WriteLock::acquire(&self.path)?;
            self.write_document(&doc)?;
        }
        Ok(doc.versions)
    }

    pub fn active(&self) -> Result<Option<InstalledVersion>, RegistryError> {
        Ok(self.list()?.into_iter().find(|v| v.active))
    }

    pub fn set_active(&self, version: &Version) -> Result<(), RegistryError> {
        let _lock = WriteLock::acquire(&self.path)?;
        let mut doc = self.read_document();
        if !doc.versions.iter().any(|v| &v.version == version) {
            return Err(RegistryError::NotInstalled(version.clone()));
        }
        for entry in &mut doc.versions {
            entry.active = &entry.version == version;
        }
        self.write_document(&doc)
    }

    pub fn register(
        &self,
        version: Version,
        path: PathBuf,
        source: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let _lock = WriteLock::acquire(&self.path)?;
        let mut doc = self.read_document();
        if doc.versions.iter().any(|v| v.version == version) {
            return Ok(());
        }
        doc.versions.push(InstalledVersion {
            version,
            path,
            installed_at: now(),
            source: source.into(),
            active: false,
        });
        self.write_document(&doc)
    }

    pub fn unregister(&self, version: &Version) -> Result<(), RegistryError> {
        let _lock = WriteLock::acquire(&self.path)?;
        let mut doc = self.read_document();
        let before = doc.versions.len();
        doc.versions.retain(|v| &v.version != version);
        if doc.versions.len() == before {
            return Err(RegistryError::NotInstalled(version.clone()));
        }
        self.write_document(&doc)
    }

    /// Return the highest-version entry satisfying `constraint`.
    pub fn resolve(
        &self,
        constraint: &VersionConstraint,
    ) -> Result<Option<InstalledVersion>, RegistryError> {
        let mut candidates: Vec<InstalledVersion> = self
            .list()?
            .into_iter()
            .filter(|v| constraint.satisfies(&v.version))
            .collect();
        candidates.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(candidates.pop())
    }
}

fn now() -> DateTime<Utc> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
