//! In-memory `ContainerEngine` used to test C12 without a real container
//! runtime.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use super::{
    CleanupOpts, CleanupSummary, ContainerEngine, EngineError, ExecOpts, ExecResult, Health,
    LogStream, LogsOpts, RunState, ScaleMap, ServiceStatus, StartOpts, StatSnapshotStream,
    StatsOpts, StopOpts,
};

#[derive(Default)]
pub struct FakeEngine {
    running: Mutex<BTreeMap<String, u32>>,
    pub fail_start_for: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, service_id: &str) -> bool {
        self.running.lock().unwrap().contains_key(service_id)
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn start(
        &self,
        _project: &str,
        services: &[String],
        _opts: &StartOpts,
    ) -> Result<(), EngineError> {
        let fail_list = self.fail_start_for.lock().unwrap().clone();
        for service in services {
            if fail_list.contains(service) {
                return Err(EngineError::StartFailed {
                    service_id: service.clone(),
                    reason: "simulated failure".to_string(),
                });
            }
        }
        let mut running = self.running.lock().unwrap();
        for service in services {
            *running.entry(service.clone()).or_insert(1) = 1;
        }
        Ok(())
    }

    async fn stop(
        &self,
        _project: &str,
        services: &[String],
        _opts: &StopOpts,
    ) -> Result<(), EngineError> {
        let mut running = self.running.lock().unwrap();
        for service in services {
            running.remove(service);
        }
        Ok(())
    }

    async fn status(
        &self,
        _project: &str,
        services: &[String],
    ) -> Result<Vec<ServiceStatus>, EngineError> {
        let running = self.running.lock().unwrap();
        let now = chrono::Utc::now();
        Ok(services
            .iter()
            .map(|id| ServiceStatus {
                id: id.clone(),
                state: if running.contains_key(id) {
                    RunState::Running
                } else {
                    RunState::Stopped
                },
                health: Health::None,
                ports: Vec::new(),
                created_at: now,
                updated_at: now,
                cpu_percent: None,
                memory_used_bytes: None,
                memory_limit_bytes: None,
                uptime: None,
            })
            .collect())
    }

    async fn logs(
        &self,
        _project: &str,
        _services: &[String],
        _opts: &LogsOpts,
    ) -> Result<LogStream, EngineError> {
        Ok(Box::pin(stream::empty()))
    }

    async fn exec(
        &self,
        _project: &str,
        service: &str,
        _cmd: &[String],
        opts: &ExecOpts,
    ) -> Result<ExecResult, EngineError> {
        if !self.is_running(service) {
            return Err(EngineError::NotRunning(service.to_string()));
        }
        // Echoes any piped stdin back as stdout, standing in for a real
        // dump/restore client so round-trip tests can assert on the bytes.
        Ok(ExecResult {
            exit_code: 0,
            stdout: opts.stdin.clone().unwrap_or_default(),
        })
    }

    async fn stats(
        &self,
        project: &str,
        services: &[String],
        _opts: &StatsOpts,
    ) -> Result<StatSnapshotStream, EngineError> {
        let snapshot = self.status(project, services).await?;
        Ok(Box::pin(stream::once(async move { snapshot })))
    }

    async fn scale(&self, _project: &str, targets: &ScaleMap) -> Result<(), EngineError> {
        let mut running = self.running.lock().unwrap();
        for (service, count) in targets {
            if *count == 0 {
                running.remove(service);
            } else {
                running.insert(service.clone(), *count);
            }
        }
        Ok(())
    }

    async fn cleanup(
        &self,
        _project: &str,
        opts: &CleanupOpts,
    ) -> Result<CleanupSummary, EngineError> {
        if opts.dry_run {
            return Ok(CleanupSummary::default());
        }
        let removed: Vec<String> = self.running.lock().unwrap().keys().cloned().collect();
        self.running.lock().unwrap().clear();
        Ok(CleanupSummary {
            removed_containers: removed,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_then_stop_returns_to_absent_state() {
        let engine = FakeEngine::new();
        let services = vec!["redis".to_string()];
        engine.start("demo", &services, &StartOpts::default()).await.unwrap();
        assert!(engine.is_running("redis"));
        engine.stop("demo", &services, &StopOpts::default()).await.unwrap();
        assert!(!engine.is_running("redis"));
    }

    #[tokio::test]
    async fn scale_is_idempotent() {
        let engine = FakeEngine::new();
        let mut targets = ScaleMap::new();
        targets.insert("redis".to_string(), 3);
        engine.scale("demo", &targets).await.unwrap();
        engine.scale("demo", &targets).await.unwrap();
        let status = engine.status("demo", &["redis".to_string()]).await.unwrap();
        assert_eq!(status[0].state, RunState::Running);
    }
}
