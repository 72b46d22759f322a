//! 应用状态

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::config::backend::BackendConfigs;
use crate::config::env::OrchestratorConfig;
use crate::domain::telemetry::DeploymentEvent;
use crate::error::DeployResult;
use crate::infra::command::CommandExecutor;
use crate::infra::persistence::{JsonlSink, RecordSink};
use crate::services::backend::{registry, ContainerBackend, DeploymentBackend, ProcessBackend};
use crate::services::coordinator::Coordinator;
use crate::services::probe::{EnvironmentDetector, EnvironmentProbe};
use crate::services::telemetry::{DeploymentTelemetry, FnSubscriber};

use super::history::HistoryStore;

/// 应用状态（HTTP handlers 共享）
pub struct AppState {
    /// API 密钥（用于验证请求）
    pub api_key: String,
    /// 启动时的配置快照；运行时修改以协调器为准
    pub config: Arc<OrchestratorConfig>,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,
    pub coordinator: Coordinator,
    pub probe: Arc<dyn EnvironmentDetector>,
    pub telemetry: DeploymentTelemetry,
    pub history: Arc<HistoryStore>,
}

impl AppState {
    /// 由已构建的协调器创建
    pub fn new(
        config: Arc<OrchestratorConfig>,
        coordinator: Coordinator,
        probe: Arc<dyn EnvironmentDetector>,
    ) -> Self {
        Self {
            api_key: config.api_key.clone(),
            config,
            started_at: Utc::now(),
            telemetry: coordinator.telemetry().clone(),
            history: coordinator.history().clone(),
            coordinator,
            probe,
        }
    }

    /// 组装完整的运行时：持久化 → 遥测 → 探测器 → 后端 → 协调器
    pub async fn build(
        config: OrchestratorConfig,
        backend_configs: BackendConfigs,
        executor: Arc<dyn CommandExecutor>,
    ) -> DeployResult<Self> {
        let sink: Option<Arc<dyn RecordSink>> = match config.data_dir {
            Some(ref dir) => match JsonlSink::in_dir(dir).await {
                Ok(sink) => {
                    info!(path = %sink.path().display(), "Telemetry persistence enabled");
                    Some(Arc::new(sink))
                }
                Err(e) => {
                    warn!(
                        data_dir = %dir.display(),
                        error = %e,
                        "Telemetry persistence unavailable, falling back to memory only"
                    );
                    None
                }
            },
            None => {
                info!("No data directory configured, telemetry kept in memory only");
                None
            }
        };

        let telemetry = DeploymentTelemetry::new(config.telemetry.clone(), sink.clone());
        telemetry.add_subscriber(Arc::new(FnSubscriber::new("log", |event: &DeploymentEvent| {
            error!(
                session_id = %event.session_id,
                level = ?event.level,
                event_type = ?event.event_type,
                "Deployment alert: {}",
                event.message
            );
            Ok(())
        })));
        let history = Arc::new(HistoryStore::new(sink));

        let probe: Arc<dyn EnvironmentDetector> =
            Arc::new(EnvironmentProbe::new(executor.clone(), config.probe.clone()));
        let backends = registry(vec![
            Arc::new(ContainerBackend::with_detector(
                executor.clone(),
                probe.clone(),
                config.auto_install,
            )) as Arc<dyn DeploymentBackend>,
            Arc::new(ProcessBackend::with_detector(
                executor,
                probe.clone(),
                config.auto_install,
            )) as Arc<dyn DeploymentBackend>,
        ]);

        info!(
            strategy = %config.strategy,
            port = config.port,
            auto_recovery = config.auto_recovery,
            auto_install = config.auto_install,
            configured_backends = ?backend_configs.kinds(),
            "Loaded configuration"
        );

        let config = Arc::new(config);
        let coordinator = Coordinator::new(
            (*config).clone(),
            backends,
            probe.clone(),
            telemetry,
            history,
            backend_configs,
        );
        Ok(Self::new(config, coordinator, probe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deploy::CoordinatorStatus;
    use crate::testing::FakeExecutor;

    #[tokio::test]
    async fn test_build_with_data_dir_enables_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..OrchestratorConfig::default()
        };

        let state = AppState::build(config, BackendConfigs::default(), Arc::new(FakeExecutor::new()))
            .await
            .unwrap();

        assert!(state.telemetry.has_sink());
        assert_eq!(state.api_key, "change-me-in-production");
        assert_eq!(state.history.len().await, 0);
    }

    #[tokio::test]
    async fn test_build_without_data_dir_is_memory_only() {
        let state = AppState::build(
            OrchestratorConfig::default(),
            BackendConfigs::default(),
            Arc::new(FakeExecutor::new()),
        )
        .await
        .unwrap();

        assert!(!state.telemetry.has_sink());
    }

    #[tokio::test]
    async fn test_unusable_data_dir_degrades_to_memory_only() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, "").unwrap();
        let config = OrchestratorConfig {
            data_dir: Some(file.join("telemetry")),
            ..OrchestratorConfig::default()
        };

        let state = AppState::build(config, BackendConfigs::default(), Arc::new(FakeExecutor::new()))
            .await
            .unwrap();

        assert!(!state.telemetry.has_sink());
        assert_eq!(state.coordinator.status().await, CoordinatorStatus::Idle);
    }
}
