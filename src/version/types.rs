//! Version and constraint parsing, backed by the `semver` crate.
//!
//! `semver::Version`'s `Ord` implementation already gives us exactly the
//! ordering the data model calls for (pre-release precedes release of the
//! same triple, build metadata ignored), so `Version` here is a thin newtype
//! that adds the file-loading leniency (`v`-prefix stripping) and a
//! `thiserror` error type instead of reimplementing comparison.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("invalid version '{text}': {source}")]
    Parse {
        text: String,
        #[source]
        source: semver::Error,
    },
    #[error("invalid version constraint '{text}': {source}")]
    Constraint {
        text: String,
        #[source]
        source: semver::Error,
    },
}

/// A parsed `major.minor.patch[-pre][+build]` version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(semver::Version);

impl Version {
    /// Parse pure numeric form; a leading `v` is rejected.
    pub fn parse(text: &str) -> Result<Self, VersionError> {
        semver::Version::parse(text)
            .map(Version)
            .map_err(|source| VersionError::Parse {
                text: text.to_string(),
                source,
            })
    }

    /// Parse as used by the file-loading path: a single leading `v`/`V` is
    /// stripped before delegating to [`Version::parse`].
    pub fn parse_lenient(text: &str) -> Result<Self, VersionError> {
        let stripped = text.strip_prefix(['v', 'V']).unwrap_or(text);
        Self::parse(stripped)
    }

    pub fn major(&self) -> u64 {
        self.0.major
    }

    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    pub fn patch(&self) -> u64 {
        self.0.patch
    }

    pub fn has_pre(&self) -> bool {
        !self.0.pre.is_empty()
    }

    pub fn inner(&self) -> &semver::Version {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

/// A predicate over [`Version`] carrying the original textual form.
///
/// Comma-joined terms combine by logical AND. A bare numeric term with no
/// explicit operator (e.g. `1.2.3`) means exact equality here, matching how
/// pin files are used in practice; this differs from raw `semver::VersionReq`,
/// whose bare terms default to caret ranges, so construction always goes
/// through [`VersionConstraint::parse`] rather than `semver::VersionReq`
/// directly.
#[derive(Debug, Clone)]
pub struct VersionConstraint {
    original: String,
    req: semver::VersionReq,
}

impl VersionConstraint {
    /// The universal constraint, matching every version. Its canonical text
    /// is `*`.
    pub fn universal() -> Self {
        Self {
            original: "*".to_string(),
            req: semver::VersionReq::STAR,
        }
    }

    pub fn is_universal(&self) -> bool {
        self.original.trim().is_empty() || self.original.trim() == "*"
    }

    pub fn original_text(&self) -> &str {
        &self.original
    }

    pub fn parse(text: &str) -> Result<Self, VersionError> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Ok(Self::universal());
        }

        let rewritten: Vec<String> = trimmed
            .split(',')
            .map(str::trim)
            .map(rewrite_bare_term_as_exact)
            .collect();
        let joined = rewritten.join(", ");

        let req =
            semver::VersionReq::parse(&joined).map_err(|source| VersionError::Constraint {
                text: text.to_string(),
                source,
            })?;

        Ok(Self {
            original: text.to_string(),
            req,
        })
    }

    /// Pure, deterministic membership test.
    pub fn satisfies(&self, version: &Version) -> bool {
        self.req.matches(version.inner())
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

const OPERATOR_PREFIXES: &[&str] = &[">=", "<=", "^", "~", "=", ">", "<"];

fn rewrite_bare_term_as_exact(term: &str) -> String {
    if OPERATOR_PREFIXES.iter().any(|op| term.starts_with(op)) {
        term.to_string()
    } else if term == "*" {
        term.to_string()
    } else {
        format!("={term}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display() {
        let v = Version::parse("1.4.2").unwrap();
        assert_eq!(Version::parse(&v.to_string()).unwrap(), v);
    }

    #[test]
    fn rejects_leading_v_on_direct_parse() {
        assert!(Version::parse("v1.0.0").is_err());
        assert!(Version::parse_lenient("v1.0.0").is_ok());
    }

    #[test]
    fn pre_release_precedes_release_of_same_triple() {
        let pre = Version::parse("1.0.0-rc.1").unwrap();
        let rel = Version::parse("1.0.0").unwrap();
        assert!(pre < rel);
    }

    #[test]
    fn build_metadata_ignored_in_ordering() {
        let a = Version::parse("1.0.0+build.1").unwrap();
        let b = Version::parse("1.0.0+build.2").unwrap();
        assert_eq!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn empty_and_star_are_universal() {
        assert!(VersionConstraint::parse("").unwrap().is_universal());
        assert!(VersionConstraint::parse("*").unwrap().is_universal());
        let v = Version::parse("9.9.9").unwrap();
        assert!(VersionConstraint::parse("*").unwrap().satisfies(&v));
    }

    #[test]
    fn caret_constraint_boundaries() {
        let c = VersionConstraint::parse("^0.2.3").unwrap();
        assert!(c.satisfies(&Version::parse("0.2.4").unwrap()));
        assert!(c.satisfies(&Version::parse("0.2.9").unwrap()));
        assert!(!c.satisfies(&Version::parse("0.3.0").unwrap()));

        let c = VersionConstraint::parse("^1.2.3").unwrap();
        assert!(c.satisfies(&Version::parse("1.9.0").unwrap()));
        assert!(!c.satisfies(&Version::parse("2.0.0").unwrap()));
    }

    #[test]
    fn tilde_constraint_boundaries() {
        let c = VersionConstraint::parse("~0.2.3").unwrap();
        assert!(c.satisfies(&Version::parse("0.2.4").unwrap()));
        assert!(!c.satisfies(&Version::parse("0.3.0").unwrap()));
    }

    #[test]
    fn bare_version_means_exact() {
        let c = VersionConstraint::parse("1.2.3").unwrap();
        assert!(c.satisfies(&Version::parse("1.2.3").unwrap()));
        assert!(!c.satisfies(&Version::parse("1.2.4").unwrap()));
    }

    #[test]
    fn comma_joined_terms_are_conjunctive() {
        let c = VersionConstraint::parse(">=1.0.0,<2.0.0").unwrap();
        assert!(c.satisfies(&Version::parse("1.5.0").unwrap()));
        assert!(!c.satisfies(&Version::parse("2.0.0").unwrap()));
    }

    #[test]
    fn satisfies_is_pure() {
        let c = VersionConstraint::parse(">=1.0.0").unwrap();
        let v = Version::parse("1.2.0").unwrap();
        assert_eq!(c.satisfies(&v), c.satisfies(&v));
    }

    proptest::proptest! {
        #[test]
        fn parse_format_round_trips(major in 0u64..1000, minor in 0u64..1000, patch in 0u64..1000) {
            let text = format!("{major}.{minor}.{patch}");
            let v = Version::parse(&text).unwrap();
            prop_assert_eq!(Version::parse(&v.to_string()).unwrap(), v);
        }

        #[test]
        fn ordering_is_transitive(
            a in (0u64..5, 0u64..5, 0u64..5),
            b in (0u64..5, 0u64..5, 0u64..5),
            c in (0u64..5, 0u64..5, 0u64..5),
        ) {
            let va = Version::parse(&format!("{}.{}.{}", a.0, a.1, a.2)).unwrap();
            let vb = Version::parse(&format!("{}.{}.{}", b.0, b.1, b.2)).unwrap();
            let vc = Version::parse(&format!("{}.{}.{}", c.0, c.1, c.2)).unwrap();
            if va <= vb && vb <= vc {
                prop_assert!(va <= vc);
            }
        }

        #[test]
        fn satisfies_depends_only_on_constraint_and_version(
            major in 0u64..10, minor in 0u64..10, patch in 0u64..10,
        ) {
            let v = Version::parse(&format!("{major}.{minor}.{patch}")).unwrap();
            let c = VersionConstraint::parse(">=1.0.0").unwrap();
            let first = c.satisfies(&v);
            let second = c.satisfies(&v);
            prop_assert_eq!(first, second);
        }
    }
}
