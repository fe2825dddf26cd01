//! Version file locator (C2): walks upward from a working directory looking
//! for a version pin, stopping at a repository root.

use std::fs;
use std::path::{Path, PathBuf};

use crate::version::{VersionConstraint, VersionError};

const TOOL_NAME: &str = "dev-stack";
const REPO_MARKER: &str = ".git";

#[derive(Debug, thiserror::Error)]
pub enum VersionFileError {
    #[error("malformed version file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: VersionError,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Declared format of a located version file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionFileFormat {
    PlainText,
    Structured,
    ManifestEmbedded,
}

/// A located, parsed version pin. Produced on demand; never cached across
/// invocations.
#[derive(Debug, Clone)]
pub struct VersionFile {
    pub path: PathBuf,
    pub raw: String,
    pub constraint: VersionConstraint,
    pub format: VersionFileFormat,
}

/// Filenames accepted as project manifests, for the embedded-key probe. C9
/// reuses this same list and order when loading the full manifest.
pub const MANIFEST_FILENAMES: &[&str] = &[
    "dev-stack-config.yaml",
    "dev-stack.yaml",
    "dev-stack.yml",
    ".dev-stack.yaml",
    ".dev-stack.yml",
];

/// Walk upward from `start_dir`, returning the first version pin found, or
/// the universal constraint if none is found before the filesystem root or a
/// `.git` directory.
pub fn detect(start_dir: &Path) -> Result<VersionConstraint, VersionFileError> {
    Ok(detect_file(start_dir)?
        .map(|f| f.constraint)
        .unwrap_or_else(VersionConstraint::universal))
}

/// Like [`detect`] but returns the full located file (path, raw text,
/// format) rather than only the constraint.
pub fn detect_file(start_dir: &Path) -> Result<Option<VersionFile>, VersionFileError> {
    let mut dir = start_dir.to_path_buf();
    loop {
        if let Some(found) = probe_dir(&dir)? {
            return Ok(Some(found));
        }
        if dir.join(REPO_MARKER).is_dir() {
            return Ok(None);
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => return Ok(None),
        }
    }
}

fn probe_dir(dir: &Path) -> Result<Option<VersionFile>, VersionFileError> {
    let plain = dir.join(format!(".{TOOL_NAME}-version"));
    if plain.is_file() {
        let raw = read_to_string(&plain)?;
        let constraint = parse_plain(&raw, &plain)?;
        return Ok(Some(VersionFile {
            path: plain,
            raw,
            constraint,
            format: VersionFileFormat::PlainText,
        }));
    }

    let structured = dir.join(format!(".{TOOL_NAME}-version.yaml"));
    if structured.is_file() {
        let raw = read_to_string(&structured)?;
        let constraint = parse_structured(&raw, &structured)?;
        return Ok(Some(VersionFile {
            path: structured,
            raw,
            constraint,
            format: VersionFileFormat::Structured,
        }));
    }

    for name in MANIFEST_FILENAMES {
        let manifest = dir.join(name);
        if !manifest.is_file() {
            continue;
        }
        let raw = read_to_string(&manifest)?;
        if let Some(constraint) = parse_manifest_embedded(&raw, &manifest)? {
            return Ok(Some(VersionFile {
                path: manifest,
                raw,
                constraint,
                format: VersionFileFormat::ManifestEmbedded,
            }));
        }
    }

    Ok(None)
}

fn read_to_string(path: &Path) -> Result<String, VersionFileError> {
    fs::read_to_string(path).map_err(|source| VersionFileError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_plain(raw: &str, path: &Path) -> Result<VersionConstraint, VersionFileError> {
    VersionConstraint::parse(raw.trim()).map_err(|source| VersionFileError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_structured(raw: &str, path: &Path) -> Result<VersionConstraint, VersionFileError> {
    #[derive(serde::Deserialize)]
    struct Doc {
        #[serde(alias = "required_version")]
        version: String,
    }
    let doc: Doc = serde_norway::from_str(raw).map_err(|_| VersionFileError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed yaml"),
    })?;
    VersionConstraint::parse(doc.version.trim()).map_err(|source| VersionFileError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_manifest_embedded(
    raw: &str,
    path: &Path,
) -> Result<Option<VersionConstraint>, VersionFileError> {
    let value: serde_norway::Value = match serde_norway::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let Some(tool_value) = value.get(TOOL_NAME) else {
        return Ok(None);
    };
    let Some(text) = tool_value.as_str() else {
        return Ok(None);
    };
    let constraint = VersionConstraint::parse(text.trim()).map_err(|source| {
        VersionFileError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })?;
    Ok(Some(constraint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn returns_universal_when_nothing_found() {
        let dir = tempdir().unwrap();
        let constraint = detect(dir.path()).unwrap();
        assert!(constraint.is_universal());
    }

    #[test]
    fn finds_plain_text_file_in_start_dir() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".dev-stack-version"), "1.4.2\n").unwrap();
        let constraint = detect(dir.path()).unwrap();
        assert_eq!(constraint.original_text(), "1.4.2");
    }

    #[test]
    fn inner_most_directory_wins() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".dev-stack-version"), "1.0.0").unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        fs::write(nested.join(".dev-stack-version"), "2.0.0").unwrap();
        let constraint = detect(&nested).unwrap();
        assert_eq!(constraint.original_text(), "2.0.0");
    }

    #[test]
    fn ascent_stops_at_git_marker() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".dev-stack-version"), "1.0.0").unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        let constraint = detect(&nested).unwrap();
        // .git lives in the same directory as the pin, so this still finds it
        // on the way up; verify the repo-root directory itself is inspected.
        assert_eq!(constraint.original_text(), "1.0.0");
    }

    #[test]
    fn ascent_stops_before_crossing_repo_root_without_pin() {
        let outer = tempdir().unwrap();
        fs::write(outer.path().join(".dev-stack-version"), "9.9.9").unwrap();
        let repo = outer.path().join("repo");
        fs::create_dir(&repo).unwrap();
        fs::create_dir(repo.join(".git")).unwrap();
        let nested = repo.join("nested");
        fs::create_dir(&nested).unwrap();
        let constraint = detect(&nested).unwrap();
        assert!(constraint.is_universal());
    }

    #[test]
    fn structured_yaml_file_is_parsed() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".dev-stack-version.yaml"), "version: \"^1.2.0\"\n").unwrap();
        let constraint = detect(dir.path()).unwrap();
        assert_eq!(constraint.original_text(), "^1.2.0");
    }

    #[test]
    fn structured_yaml_file_accepts_required_version_key() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(".dev-stack-version.yaml"),
            "required_version: \">=2.0.0\"\n",
        )
        .unwrap();
        let constraint = detect(dir.path()).unwrap();
        assert_eq!(constraint.original_text(), ">=2.0.0");
    }

    #[test]
    fn manifest_embedded_key_is_used_as_fallback() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("dev-stack.yaml"),
            "name: demo\ndev-stack: \">=1.0.0\"\n",
        )
        .unwrap();
        let constraint = detect(dir.path()).unwrap();
        assert_eq!(constraint.original_text(), ">=1.0.0");
    }
}
