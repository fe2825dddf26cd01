//! Release catalog client (C3): enumerates available versions and fetches
//! release artifacts from a remote index.

use std::fmt;

use serde::Deserialize;

use crate::version::Version;

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("network error contacting release catalog: {0}")]
    Network(#[from] reqwest::Error),
    #[error("release catalog returned {status} for {url}")]
    Release { status: u16, url: String },
    #[error("no artifact for {version} on platform {platform}")]
    NoArtifact { version: Version, platform: Platform },
}

/// Normalized operating-system tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    MacOs,
    Windows,
}

/// Normalized architecture tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Platform {
    /// Normalize raw `std::env::consts`-style tags (`linux`/`macos`/`darwin`/
    /// `windows`, `x86_64`/`amd64`/`aarch64`/`arm64`) into the catalog's
    /// naming convention.
    pub fn normalize(raw_os: &str, raw_arch: &str) -> Option<Self> {
        let os = match raw_os {
            "linux" => Os::Linux,
            "macos" | "darwin" => Os::MacOs,
            "windows" => Os::Windows,
            _ => return None,
        };
        let arch = match raw_arch {
            "x86_64" | "amd64" => Arch::X86_64,
            "aarch64" | "arm64" => Arch::Aarch64,
            _ => return None,
        };
        Some(Self { os, arch })
    }

    pub fn host() -> Option<Self> {
        Self::normalize(std::env::consts::OS, std::env::consts::ARCH)
    }

    fn os_tag(&self) -> &'static str {
        match self.os {
            Os::Linux => "linux",
            Os::MacOs => "macos",
            Os::Windows => "windows",
        }
    }

    fn arch_tag(&self) -> &'static str {
        match self.arch {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }

    fn ext(&self) -> &'static str {
        match self.os {
            Os::Windows => "zip",
            _ => "tar.gz",
        }
    }

    /// `<tool>-<version>-<os>-<arch>.<ext>`.
    pub fn artifact_filename(&self, tool: &str, version: &Version) -> String {
        format!(
            "{tool}-{version}-{}-{}.{}",
            self.os_tag(),
            self.arch_tag(),
            self.ext()
        )
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os_tag(), self.arch_tag())
    }
}

/// A platform-qualified artifact descriptor.
#[derive(Debug, Clone)]
pub struct ArtifactDescriptor {
    pub platform: Platform,
    pub url: String,
    pub checksum: Option<String>,
}

/// A Version plus its platform-qualified artifacts. Produced only by C3,
/// never persisted.
#[derive(Debug, Clone)]
pub struct ReleaseEntry {
    pub version: Version,
    pub artifacts: Vec<ArtifactDescriptor>,
}

impl ReleaseEntry {
    pub fn artifact_for(&self, platform: Platform) -> Option<&ArtifactDescriptor> {
        self.artifacts.iter().find(|a| a.platform == platform)
    }
}

#[async_trait::async_trait]
pub trait ReleaseCatalog: Send + Sync {
    async fn list_versions(&self) -> Result<Vec<Version>, ReleaseError>;
    async fn locate_artifact(
        &self,
        version: &Version,
        platform: Platform,
    ) -> Result<ReleaseEntry, ReleaseError>;
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ReleaseError>;
    async fn fetch_checksum(
        &self,
        version: &Version,
    ) -> Result<Option<std::collections::BTreeMap<String, String>>, ReleaseError>;
}

#[derive(Deserialize)]
struct IndexEntry {
    version: String,
}

#[derive(Deserialize)]
struct ChecksumDoc {
    checksums: std::collections::BTreeMap<String, String>,
}

/// Reference implementation backed by a plain HTTP index: `<base>/index.json`
/// lists versions, `<base>/<tool>-<version>-<os>-<arch>.<ext>` is the
/// artifact, `<base>/<tool>-<version>.sha256.json` is the optional checksum
/// map.
pub struct HttpReleaseCatalog {
    client: reqwest::Client,
    base_url: String,
    tool: String,
}

impl HttpReleaseCatalog {
    pub fn new(base_url: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            tool: tool.into(),
        }
    }

    fn artifact_url(&self, platform: Platform, version: &Version) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            platform.artifact_filename(&self.tool, version)
        )
    }

    fn checksum_url(&self, version: &Version) -> String {
        format!(
            "{}/{}-{}.sha256.json",
            self.base_url.trim_end_matches('/'),
            self.tool,
            version
        )
    }
}

#[async_trait::async_trait]
impl ReleaseCatalog for HttpReleaseCatalog {
    #[tracing::instrument(skip(self))]
    async fn list_versions(&self) -> Result<Vec<Version>, ReleaseError> {
        let url = format!("{}/index.json", self.base_url.trim_end_matches('/'));
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ReleaseError::Release {
                status: response.status().as_u16(),
                url,
            });
        }
        let entries: Vec<IndexEntry> = response.json().await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| Version::parse(&e.version).ok())
            .collect())
    }

    #[tracing::instrument(skip(self))]
    async fn locate_artifact(
        &self,
        version: &Version,
        platform: Platform,
    ) -> Result<ReleaseEntry, ReleaseError> {
        let url = self.artifact_url(platform, version);
        let checksum = self
            .fetch_checksum(version)
            .await?
            .and_then(|map| map.get(&platform.artifact_filename(&self.tool, version)).cloned());
        Ok(ReleaseEntry {
            version: version.clone(),
            artifacts: vec![ArtifactDescriptor {
                platform,
                url,
                checksum,
            }],
        })
    }

    #[tracing::instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ReleaseError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ReleaseError::Release {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_checksum(
        &self,
        version: &Version,
    ) -> Result<Option<std::collections::BTreeMap<String, String>>, ReleaseError> {
        let url = self.checksum_url(version);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ReleaseError::Release {
                status: response.status().as_u16(),
                url,
            });
        }
        let doc: ChecksumDoc = response.json().await?;
        Ok(Some(doc.checksums))
    }
}
