//! Semantic version model (C1): parsing, ordering, and constraint satisfaction.

pub mod types;

pub use types::{Version, VersionConstraint, VersionError};
