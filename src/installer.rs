//! Version installer (C5): download, verify, extract, and register a new
//! binary; remove one.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::paths::Paths;
use crate::registry::{Registry, RegistryError};
use crate::release::{Platform, ReleaseCatalog, ReleaseError};
use crate::version::Version;

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error(transparent)]
    Release(#[from] ReleaseError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("checksum mismatch for {version}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        version: Version,
        expected: String,
        actual: String,
    },
    #[error("failed to extract archive for {version}: {reason}")]
    Extract { version: Version, reason: String },
    #[error("{0} is the active version and cannot be removed")]
    CannotRemoveActive(Version),
    #[error("{0} is not installed")]
    NotInstalled(Version),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no platform could be determined for this host")]
    UnknownHostPlatform,
}

pub struct Installer<'a> {
    catalog: &'a dyn ReleaseCatalog,
    registry: Registry,
    paths: &'a Paths,
    tool_binary_name: &'a str,
}

impl<'a> Installer<'a> {
    pub fn new(
        catalog: &'a dyn ReleaseCatalog,
        paths: &'a Paths,
        tool_binary_name: &'a str,
    ) -> Self {
        Self {
            catalog,
            registry: Registry::new(paths.registry_file()),
            paths,
            tool_binary_name,
        }
    }

    /// Idempotent: if already registered, returns without network I/O.
    #[tracing::instrument(skip(self))]
    pub async fn install(&self, version: &Version) -> Result<(), InstallError> {
        if self
            .registry
            .list()?
            .iter()
            .any(|v| &v.version == version)
        {
            tracing::debug!(%version, "already installed, skipping install pipeline");
            return Ok(());
        }

        let platform = Platform::host().ok_or(InstallError::UnknownHostPlatform)?;
        let entry = self.catalog.locate_artifact(version, platform).await?;
        let artifact = entry
            .artifact_for(platform)
            .ok_or(ReleaseError::NoArtifact {
                version: version.clone(),
                platform,
            })?;

        let bytes = self.catalog.fetch(&artifact.url).await?;

        if let Some(expected) = &artifact.checksum {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            let actual = hex::encode(hasher.finalize());
            if &actual != expected {
                return Err(InstallError::ChecksumMismatch {
                    version: version.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let dest_dir = self.paths.version_dir(&version.to_string());
        fs::create_dir_all(&dest_dir).map_err(|source| InstallError::Io {
            path: dest_dir.clone(),
            source,
        })?;

        extract_archive(&bytes, &artifact.url, &dest_dir, version)?;

        let binary_path = locate_binary(&dest_dir, self.tool_binary_name)
            .ok_or_else(|| InstallError::Extract {
                version: version.clone(),
                reason: "no binary found in extracted archive".to_string(),
            })?;
        mark_executable(&binary_path).map_err(|source| InstallError::Io {
            path: binary_path.clone(),
            source,
        })?;

        self.registry
            .register(version.clone(), binary_path, "release-catalog")?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub fn uninstall(&self, version: &Version) -> Result<(), InstallError> {
        if let Some(active) = self.registry.active()? {
            if &active.version == version {
                return Err(InstallError::CannotRemoveActive(version.clone()));
            }
        }
        let dir = self.paths.version_dir(&version.to_string());
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|source| InstallError::Io { path: dir, source })?;
        }
        self.registry
            .unregister(version)
            .map_err(|_| InstallError::NotInstalled(version.clone()))
    }

    /// Verifies an installed version's binary still exists and is executable.
    pub fn verify(&self, version: &Version) -> Result<bool, InstallError> {
        let installed = self
            .registry
            .list()?
            .into_iter()
            .find(|v| &v.version == version)
            .ok_or_else(|| InstallError::NotInstalled(version.clone()))?;
        Ok(installed.path.is_file())
    }

    /// Retains the active version plus the `keep_count - 1` most recently
    /// installed non-active versions, removing the rest.
    #[tracing::instrument(skip(self))]
    pub fn cleanup(&self, keep_count: usize) -> Result<Vec<Version>, InstallError> {
        let mut installed = self.registry.list()?;
        installed.sort_by(|a, b| b.installed_at.cmp(&a.installed_at));

        let keep_count = keep_count.max(1);
        let mut kept = 0usize;
        let mut removed = Vec::new();
        for entry in installed {
            let keep = entry.active || kept < keep_count;
            if keep {
                if !entry.active {
                    kept += 1;
                }
                continue;
            }
            self.uninstall(&entry.version)?;
            removed.push(entry.version);
        }
        Ok(removed)
    }

    /// Deletes on-disk version directories not present in the registry.
    #[tracing::instrument(skip(self))]
    pub fn garbage_collect(&self) -> Result<Vec<String>, InstallError> {
        let registered: std::collections::HashSet<String> = self
            .registry
            .list()?
            .into_iter()
            .map(|v| v.version.to_string())
            .collect();

        let versions_dir = self.paths.versions_dir();
        if !versions_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        for entry in fs::read_dir(&versions_dir).map_err(|source| InstallError::Io {
            path: versions_dir.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| InstallError::Io {
                path: versions_dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !registered.contains(&name) {
                fs::remove_dir_all(entry.path()).map_err(|source| InstallError::Io {
                    path: entry.path(),
                    source,
                })?;
                removed.push(name);
            }
        }
        Ok(removed)
    }
}

fn extract_archive(
    bytes: &[u8],
    source_url: &str,
    dest_dir: &Path,
    version: &Version,
) -> Result<(), InstallError> {
    if source_url.ends_with(".zip") {
        let reader = std::io::Cursor::new(bytes);
        let mut archive = zip::ZipArchive::new(reader).map_err(|e| InstallError::Extract {
            version: version.clone(),
            reason: e.to_string(),
        })?;
        archive.extract(dest_dir).map_err(|e| InstallError::Extract {
            version: version.clone(),
            reason: e.to_string(),
        })?;
    } else {
        let decoder = flate2::read::GzDecoder::new(bytes);
        let mut archive = tar::Archive::new(decoder);
        archive.unpack(dest_dir).map_err(|e| InstallError::Extract {
            version: version.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

fn locate_binary(dir: &Path, tool_binary_name: &str) -> Option<PathBuf> {
    for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        if entry.file_type().is_file() {
            let name = entry.file_name().to_string_lossy();
            if name == tool_binary_name || name == format!("{tool_binary_name}.exe") {
                return Some(entry.path().to_path_buf());
            }
        }
    }
    None
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[allow(dead_code)]
fn read_all(mut r: impl Read) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.read_to_end(&mut buf)?;
    Ok(buf)
}
