//! Dispatch decision engine (C6): decides whether the current invocation
//! should re-exec into a different installed binary before any command
//! handling begins.
//!
//! Never fails outright: any error in constraint detection or registry
//! lookup degrades to "do not dispatch" so that version management itself
//! never becomes unusable.

use std::path::{Path, PathBuf};

use crate::registry::Registry;
use crate::versionfile;

/// First-argument values that manage versions themselves; dispatch must
/// never intercept them, or installing/switching versions would recurse.
const VERSION_MANAGEMENT_COMMANDS: &[&str] = &[
    "versions",
    "version",
    "list",
    "install",
    "uninstall",
    "use",
    "available",
    "detect",
    "set",
    "cleanup",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchDecision {
    /// Continue handling the invocation in this process.
    Stay,
    /// Re-execute into the binary at this path.
    Dispatch(PathBuf),
}

/// Decide whether to dispatch. `current_binary` is the path of the binary
/// currently running (e.g. `std::env::current_exe()`).
#[tracing::instrument(skip(registry), fields(arg0 = args.first().map(String::as_str)))]
pub fn should_dispatch(
    args: &[String],
    cwd: &Path,
    registry: &Registry,
    current_binary: &Path,
) -> DispatchDecision {
    if let Some(first) = args.first() {
        if VERSION_MANAGEMENT_COMMANDS.contains(&first.as_str()) {
            tracing::debug!("skipping dispatch: version-management command");
            return DispatchDecision::Stay;
        }
    }

    let constraint = match versionfile::detect(cwd) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(error = %e, "dispatch degraded: version file detection failed");
            return DispatchDecision::Stay;
        }
    };

    if constraint.is_universal() {
        tracing::debug!("skipping dispatch: universal constraint");
        return DispatchDecision::Stay;
    }

    let resolved = match registry.resolve(&constraint) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "dispatch degraded: registry resolve failed");
            return DispatchDecision::Stay;
        }
    };

    let Some(resolved) = resolved else {
        tracing::debug!(%constraint, "no installed version satisfies constraint");
        return DispatchDecision::Stay;
    };

    if paths_equivalent(&resolved.path, current_binary) {
        tracing::debug!("resolved version is the currently running binary");
        return DispatchDecision::Stay;
    }

    DispatchDecision::Dispatch(resolved.path)
}

fn paths_equivalent(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Re-execute into `target`, replacing the current process image on unix.
/// Never returns on success.
#[cfg(unix)]
pub fn reexec(target: &Path, args: &[String]) -> std::io::Error {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(target.as_os_str().as_bytes()) else {
        return std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains NUL");
    };
    let mut c_args: Vec<CString> = vec![c_path.clone()];
    for arg in args {
        match CString::new(arg.as_bytes()) {
            Ok(c) => c_args.push(c),
            Err(_) => {
                return std::io::Error::new(std::io::ErrorKind::InvalidInput, "arg contains NUL")
            }
        }
    }
    nix::unistd::execv(&c_path, &c_args)
        .err()
        .map(|e| std::io::Error::from_raw_os_error(e as i32))
        .unwrap_or_else(|| std::io::Error::other("execv returned unexpectedly"))
}

/// Proxy fallback for platforms without in-place process replacement: spawn
/// a child, forward stdio, forward SIGINT/SIGTERM once, and propagate the
/// exit code.
pub async fn reexec_via_child_proxy(
    target: &Path,
    args: &[String],
) -> std::io::Result<std::process::ExitStatus> {
    let mut child = tokio::process::Command::new(target)
        .args(args)
        .spawn()?;

    #[cfg(unix)]
    {
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            status = child.wait() => return status,
            _ = sigint.recv() => {
                if let Some(pid) = child.id() {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::Signal::SIGINT,
                    );
                }
            }
            _ = sigterm.recv() => {
                if let Some(pid) = child.id() {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::Signal::SIGTERM,
                    );
                }
            }
        }
    }

    child.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;
    use std::fs;
    use tempfile::tempdir;

    fn registry_with(dir: &Path, version: &str, path: &Path) -> Registry {
        let registry = Registry::new(dir.join("installed_versions.json"));
        registry
            .register(Version::parse(version).unwrap(), path.to_path_buf(), "test")
            .unwrap();
        registry
    }

    #[test]
    fn version_management_commands_never_dispatch() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path().join("installed_versions.json"));
        let decision = should_dispatch(
            &["versions".to_string(), "install".to_string()],
            dir.path(),
            &registry,
            Path::new("/usr/bin/dev-stack"),
        );
        assert_eq!(decision, DispatchDecision::Stay);
    }

    #[test]
    fn universal_constraint_never_dispatches() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path().join("installed_versions.json"));
        let decision = should_dispatch(
            &["up".to_string()],
            dir.path(),
            &registry,
            Path::new("/usr/bin/dev-stack"),
        );
        assert_eq!(decision, DispatchDecision::Stay);
    }

    #[test]
    fn unresolvable_constraint_stays() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".dev-stack-version"), "^9.0.0").unwrap();
        let registry = Registry::new(dir.path().join("installed_versions.json"));
        let decision = should_dispatch(
            &["up".to_string()],
            dir.path(),
            &registry,
            Path::new("/usr/bin/dev-stack"),
        );
        assert_eq!(decision, DispatchDecision::Stay);
    }

    #[test]
    fn dispatches_to_resolved_binary_when_different_from_current() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".dev-stack-version"), "1.2.3").unwrap();
        let other_binary = dir.path().join("other-binary");
        fs::write(&other_binary, b"x").unwrap();
        let registry = registry_with(dir.path(), "1.2.3", &other_binary);
        let decision = should_dispatch(
            &["up".to_string()],
            dir.path(),
            &registry,
            Path::new("/usr/bin/dev-stack"),
        );
        assert_eq!(decision, DispatchDecision::Dispatch(other_binary));
    }

    #[test]
    fn does_not_dispatch_to_itself() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".dev-stack-version"), "1.2.3").unwrap();
        let current = dir.path().join("current-binary");
        fs::write(&current, b"x").unwrap();
        let registry = registry_with(dir.path(), "1.2.3", &current);
        let decision = should_dispatch(&["up".to_string()], dir.path(), &registry, &current);
        assert_eq!(decision, DispatchDecision::Stay);
    }
}
