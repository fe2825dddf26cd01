//! Container engine interface (C11): a capability facade over an external
//! container runtime.

pub mod compose_engine;
#[cfg(test)]
pub mod fake;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("container engine is unavailable")]
    EngineUnavailable,
    #[error("start failed for '{service_id}': {reason}")]
    StartFailed { service_id: String, reason: String },
    #[error("stop failed for '{service_id}': {reason}")]
    StopFailed { service_id: String, reason: String },
    #[error("no such service '{0}'")]
    NoSuchService(String),
    #[error("service '{0}' is not running")]
    NotRunning(String),
    #[error("exec failed for '{service_id}': {reason}")]
    ExecFailed { service_id: String, reason: String },
    #[error("scale failed for '{service_id}': {reason}")]
    ScaleFailed { service_id: String, reason: String },
    #[error("cleanup failed: {0}")]
    CleanupFailed(String),
}

#[derive(Debug, Clone, Default)]
pub struct StartOpts {
    pub build: bool,
    pub force_recreate: bool,
    pub no_deps: bool,
    pub detach: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct StopOpts {
    pub timeout: Option<Duration>,
    pub remove_volumes: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LogsOpts {
    pub follow: bool,
    pub tail: Option<usize>,
    pub since: Option<String>,
    pub timestamps: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub tty: bool,
    pub interactive: bool,
    /// Bytes piped to the executed command's stdin, e.g. a restore source
    /// file streamed into a `psql`/`mysql` client.
    pub stdin: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct StatsOpts {
    pub streaming: bool,
    pub interval: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOpts {
    pub volumes: bool,
    pub images: bool,
    pub networks: bool,
    pub prune: bool,
    pub dry_run: bool,
}

pub type ScaleMap = BTreeMap<String, u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped,
    Starting,
    Stopping,
    Exited,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
    Starting,
    None,
}

#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub id: String,
    pub state: RunState,
    pub health: Health,
    pub ports: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub cpu_percent: Option<f64>,
    pub memory_used_bytes: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub uptime: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupSummary {
    pub removed_containers: Vec<String>,
    pub removed_volumes: Vec<String>,
    pub removed_networks: Vec<String>,
    pub removed_images: Vec<String>,
}

pub struct ExecResult {
    pub exit_code: i32,
    /// Captured stdout, e.g. a backup command's dumped bytes.
    pub stdout: Vec<u8>,
}

/// A lazily-produced sequence that the caller can cancel; dropping the
/// stream releases underlying resources.
pub type LogStream = BoxStream<'static, (String, String)>;
pub type StatSnapshotStream = BoxStream<'static, Vec<ServiceStatus>>;

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn start(
        &self,
        project: &str,
        services: &[String],
        opts: &StartOpts,
    ) -> Result<(), EngineError>;

    async fn stop(
        &self,
        project: &str,
        services: &[String],
        opts: &StopOpts,
    ) -> Result<(), EngineError>;

    async fn status(
        &self,
        project: &str,
        services: &[String],
    ) -> Result<Vec<ServiceStatus>, EngineError>;

    async fn logs(
        &self,
        project: &str,
        services: &[String],
        opts: &LogsOpts,
    ) -> Result<LogStream, EngineError>;

    async fn exec(
        &self,
        project: &str,
        service: &str,
        cmd: &[String],
        opts: &ExecOpts,
    ) -> Result<ExecResult, EngineError>;

    async fn stats(
        &self,
        project: &str,
        services: &[String],
        opts: &StatsOpts,
    ) -> Result<StatSnapshotStream, EngineError>;

    async fn scale(&self, project: &str, targets: &ScaleMap) -> Result<(), EngineError>;

    async fn cleanup(
        &self,
        project: &str,
        opts: &CleanupOpts,
    ) -> Result<CleanupSummary, EngineError>;
}
