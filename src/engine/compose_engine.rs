//! Reference `ContainerEngine` implementation: drives `docker compose` or
//! `podman compose` as a subprocess per operation.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{
    CleanupOpts, CleanupSummary, ContainerEngine, EngineError, ExecOpts, ExecResult, Health,
    LogStream, LogsOpts, RunState, ScaleMap, ServiceStatus, StartOpts, StatSnapshotStream,
    StatsOpts, StopOpts,
};

/// Engine binary discovered once per invocation via `which`, in the
/// preference order configured in `global.yaml`.
pub struct ComposeEngine {
    binary: PathBuf,
    compose_file: PathBuf,
}

impl ComposeEngine {
    /// Probe `preference_order` (e.g. `["docker", "podman"]`) for a working
    /// compose binary. `docker` resolves to `docker compose`; anything else
    /// is tried as `<binary> compose`.
    pub fn discover(
        preference_order: &[String],
        compose_file: PathBuf,
    ) -> Result<Self, EngineError> {
        for candidate in preference_order {
            if which::which(candidate).is_ok() {
                return Ok(Self {
                    binary: PathBuf::from(candidate),
                    compose_file,
                });
            }
        }
        Err(EngineError::EngineUnavailable)
    }

    fn command(&self, project: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("compose")
            .arg("-f")
            .arg(&self.compose_file)
            .arg("-p")
            .arg(project);
        cmd
    }
}

#[derive(Deserialize)]
struct ComposePsEntry {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Health", default)]
    health: String,
    #[serde(rename = "Publishers", default)]
    publishers: Vec<ComposePublisher>,
}

#[derive(Deserialize)]
struct ComposePublisher {
    #[serde(rename = "PublishedPort", default)]
    published_port: u32,
    #[serde(rename = "TargetPort", default)]
    target_port: u32,
}

fn map_state(raw: &str) -> RunState {
    match raw {
        "running" => RunState::Running,
        "exited" => RunState::Exited,
        "restarting" | "starting" => RunState::Starting,
        "removing" | "stopping" => RunState::Stopping,
        "paused" | "dead" | "created" => RunState::Stopped,
        _ => RunState::Unknown,
    }
}

fn map_health(raw: &str) -> Health {
    match raw {
        "healthy" => Health::Healthy,
        "unhealthy" => Health::Unhealthy,
        "starting" => Health::Starting,
        _ => Health::None,
    }
}

#[async_trait]
impl ContainerEngine for ComposeEngine {
    #[tracing::instrument(skip(self, opts))]
    async fn start(
        &self,
        project: &str,
        services: &[String],
        opts: &StartOpts,
    ) -> Result<(), EngineError> {
        let mut cmd = self.command(project);
        cmd.arg("up");
        if opts.detach {
            cmd.arg("-d");
        }
        if opts.build {
            cmd.arg("--build");
        }
        if opts.force_recreate {
            cmd.arg("--force-recreate");
        }
        if opts.no_deps {
            cmd.arg("--no-deps");
        }
        cmd.args(services);

        let output = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|_| EngineError::EngineUnavailable)?;

        if !output.status.success() {
            let reason = String::from_utf8_lossy(&output.stderr).to_string();
            let service_id = services.first().cloned().unwrap_or_default();
            return Err(EngineError::StartFailed { service_id, reason });
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, opts))]
    async fn stop(
        &self,
        project: &str,
        services: &[String],
        opts: &StopOpts,
    ) -> Result<(), EngineError> {
        let mut cmd = self.command(project);
        cmd.arg("stop");
        if let Some(timeout) = opts.timeout {
            cmd.arg("-t").arg(timeout.as_secs().to_string());
        }
        cmd.args(services);

        let output = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|_| EngineError::EngineUnavailable)?;

        if !output.status.success() {
            let reason = String::from_utf8_lossy(&output.stderr).to_string();
            let service_id = services.first().cloned().unwrap_or_default();
            return Err(EngineError::StopFailed { service_id, reason });
        }

        if opts.remove_volumes {
            let mut down_cmd = self.command(project);
            down_cmd.arg("down").arg("-v");
            let _ = down_cmd.stdout(Stdio::null()).stderr(Stdio::null()).status().await;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn status(
        &self,
        project: &str,
        services: &[String],
    ) -> Result<Vec<ServiceStatus>, EngineError> {
        let mut cmd = self.command(project);
        cmd.arg("ps").arg("--format").arg("json").args(services);

        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|_| EngineError::EngineUnavailable)?;
        if !output.status.success() {
            return Err(EngineError::EngineUnavailable);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let entries: Vec<ComposePsEntry> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();

        let now = chrono::Utc::now();
        Ok(entries
            .into_iter()
            .map(|e| ServiceStatus {
                id: e.service,
                state: map_state(&e.state),
                health: map_health(&e.health),
                ports: e
                    .publishers
                    .iter()
                    .map(|p| format!("{}:{}", p.published_port, p.target_port))
                    .collect(),
                created_at: now,
                updated_at: now,
                cpu_percent: None,
                memory_used_bytes: None,
                memory_limit_bytes: None,
                uptime: None,
            })
            .collect())
    }

    #[tracing::instrument(skip(self, opts))]
    async fn logs(
        &self,
        project: &str,
        services: &[String],
        opts: &LogsOpts,
    ) -> Result<LogStream, EngineError> {
        let mut cmd = self.command(project);
        cmd.arg("logs");
        if opts.follow {
            cmd.arg("-f");
        }
        if opts.timestamps {
            cmd.arg("-t");
        }
        if let Some(tail) = opts.tail {
            cmd.arg("--tail").arg(tail.to_string());
        }
        if let Some(since) = &opts.since {
            cmd.arg("--since").arg(since);
        }
        cmd.args(services);

        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|_| EngineError::EngineUnavailable)?;
        let stdout = child.stdout.take().ok_or(EngineError::EngineUnavailable)?;
        let reader = BufReader::new(stdout).lines();

        let stream = stream::unfold((reader, child), |(mut reader, child)| async move {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    let (service_id, text) = split_compose_log_line(&line);
                    Some(((service_id, text), (reader, child)))
                }
                _ => None,
            }
        });
        Ok(Box::pin(stream))
    }

    #[tracing::instrument(skip(self, opts))]
    async fn exec(
        &self,
        project: &str,
        service: &str,
        cmd_args: &[String],
        opts: &ExecOpts,
    ) -> Result<ExecResult, EngineError> {
        let mut cmd = self.command(project);
        cmd.arg("exec");
        if !opts.interactive {
            cmd.arg("-T");
        }
        if let Some(user) = &opts.user {
            cmd.arg("--user").arg(user);
        }
        if let Some(workdir) = &opts.workdir {
            cmd.arg("--workdir").arg(workdir);
        }
        for (k, v) in &opts.env {
            cmd.arg("-e").arg(format!("{k}={v}"));
        }
        cmd.arg(service);
        cmd.args(cmd_args);

        cmd.stdout(Stdio::piped());
        cmd.stdin(if opts.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn().map_err(|e| EngineError::ExecFailed {
            service_id: service.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(bytes) = &opts.stdin {
            let mut stdin = child.stdin.take().ok_or_else(|| EngineError::ExecFailed {
                service_id: service.to_string(),
                reason: "failed to open stdin pipe".to_string(),
            })?;
            stdin
                .write_all(bytes)
                .await
                .map_err(|e| EngineError::ExecFailed {
                    service_id: service.to_string(),
                    reason: e.to_string(),
                })?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| EngineError::ExecFailed {
                service_id: service.to_string(),
                reason: e.to_string(),
            })?;
        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
        })
    }

    #[tracing::instrument(skip(self, _opts))]
    async fn stats(
        &self,
        project: &str,
        services: &[String],
        _opts: &StatsOpts,
    ) -> Result<StatSnapshotStream, EngineError> {
        let statuses = self.status(project, services).await?;
        Ok(Box::pin(stream::once(async move { statuses })))
    }

    #[tracing::instrument(skip(self))]
    async fn scale(&self, project: &str, targets: &ScaleMap) -> Result<(), EngineError> {
        let mut cmd = self.command(project);
        cmd.arg("up").arg("-d");
        for (service, count) in targets {
            cmd.arg("--scale").arg(format!("{service}={count}"));
        }
        let output = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|_| EngineError::EngineUnavailable)?;
        if !output.status.success() {
            let reason = String::from_utf8_lossy(&output.stderr).to_string();
            let service_id = targets.keys().next().cloned().unwrap_or_default();
            return Err(EngineError::ScaleFailed { service_id, reason });
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, opts))]
    async fn cleanup(
        &self,
        project: &str,
        opts: &CleanupOpts,
    ) -> Result<CleanupSummary, EngineError> {
        if opts.dry_run {
            return Ok(CleanupSummary::default());
        }
        let mut cmd = self.command(project);
        cmd.arg("down");
        if opts.volumes {
            cmd.arg("-v");
        }
        if opts.images {
            cmd.arg("--rmi").arg("all");
        }
        let output = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|_| EngineError::EngineUnavailable)?;
        if !output.status.success() {
            let reason = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(EngineError::CleanupFailed(reason));
        }
        Ok(CleanupSummary::default())
    }
}

fn split_compose_log_line(line: &str) -> (String, String) {
    match line.split_once('|') {
        Some((service, rest)) => (service.trim().to_string(), rest.trim().to_string()),
        None => (String::new(), line.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_compose_state_strings() {
        assert_eq!(map_state("running"), RunState::Running);
        assert_eq!(map_state("exited"), RunState::Exited);
        assert_eq!(map_state("mystery"), RunState::Unknown);
    }

    #[test]
    fn splits_service_prefixed_log_lines() {
        let (service, text) = split_compose_log_line("redis-1  | ready to accept connections");
        assert_eq!(service, "redis-1");
        assert_eq!(text, "ready to accept connections");
    }

    #[test]
    fn discover_fails_when_no_candidate_binary_exists() {
        let result = ComposeEngine::discover(
            &["definitely-not-a-real-binary-xyz".to_string()],
            PathBuf::from("docker-compose.yaml"),
        );
        assert!(matches!(result, Err(EngineError::EngineUnavailable)));
    }
}
