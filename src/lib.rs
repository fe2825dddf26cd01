//! Version-managed CLI that provisions and drives local development stacks
//! of containerized services.
//!
//! Two subsystems carry the weight: a per-project version manager with
//! transparent self-dispatch (`version`, `versionfile`, `release`,
//! `registry`, `installer`, `dispatch`), and a service orchestration core
//! (`catalog`, `resolver`, `project`, `compose`, `ports`, `engine`,
//! `lifecycle`) that drives an external container runtime.

pub mod catalog;
pub mod compose;
pub mod dispatch;
pub mod engine;
pub mod installer;
pub mod lifecycle;
pub mod logging;
pub mod paths;
pub mod ports;
pub mod project;
pub mod registry;
pub mod release;
pub mod resolver;
pub mod settings;
pub mod version;
pub mod versionfile;
