//! Deploy Orchestrator - 自托管部署编排器
//!
//! 在容器与原生进程两种后端之间评分选择，部署失败时按计划回退，
//! 部署后持续健康检查并自动恢复。

pub mod error;
pub mod middleware;
pub mod infra;
pub mod domain;
pub mod config;
pub mod state;
pub mod api;
pub mod services;

#[cfg(test)]
mod testing;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::backend::BackendConfigs;
use crate::config::env::constants::VERSION;
use crate::config::env::OrchestratorConfig;
use crate::domain::deploy::DeploymentStrategy;
use crate::infra::command::CommandRunner;
use crate::state::AppState;

/// 命令行覆盖项
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub port_override: Option<u16>,
    pub strategy_override: Option<DeploymentStrategy>,
    /// 启动后立即按当前配置部署一次
    pub deploy_on_start: bool,
    /// 为 false 时不启动 HTTP 服务，仅做部署与监控
    pub serve: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port_override: None,
            strategy_override: None,
            deploy_on_start: false,
            serve: true,
        }
    }
}

/// 初始化日志（RUST_LOG 优先，默认 info）
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// 加载配置、组装运行时并运行到收到 Ctrl-C
pub async fn run_agent(runtime: RuntimeConfig) -> anyhow::Result<()> {
    let mut config = OrchestratorConfig::from_env().context("invalid orchestrator configuration")?;
    if let Some(port) = runtime.port_override {
        config.port = port;
    }
    if let Some(strategy) = runtime.strategy_override {
        config = config.with_strategy(strategy);
    }
    if config.api_key == OrchestratorConfig::default().api_key {
        warn!("Using default API key, set DEPLOY_AGENT_API_KEY in production");
    }

    let backend_configs = BackendConfigs::from_env().context("invalid backend configuration")?;
    if backend_configs.is_empty() {
        warn!("No backend configured, deployments will fail until one is provided per request");
    }

    let port = config.port;
    let state = Arc::new(
        AppState::build(config, backend_configs, Arc::new(CommandRunner::new()))
            .await
            .context("failed to initialize orchestrator")?,
    );

    info!(version = VERSION, port, "Starting deploy orchestrator");

    let flusher_cancel = CancellationToken::new();
    let flusher = state.telemetry.start_flusher(flusher_cancel.clone());
    state.coordinator.start_health_loop().await;

    if runtime.deploy_on_start {
        let coordinator = state.coordinator.clone();
        tokio::spawn(async move {
            match coordinator.deploy(None, None).await {
                Ok(outcome) if outcome.success => {
                    info!(backend = ?outcome.backend, "Initial deployment succeeded")
                }
                Ok(outcome) => warn!(message = %outcome.message, "Initial deployment failed"),
                Err(e) => error!(error = %e, "Initial deployment rejected"),
            }
        });
    }

    if runtime.serve {
        let app = api::router(state.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        info!(%addr, "HTTP API listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server error")?;
    } else {
        info!("HTTP API disabled, press Ctrl-C to stop");
        shutdown_signal().await;
    }

    info!("Shutting down");
    match state.coordinator.stop_deployment(false).await {
        Ok(outcome) => info!(message = %outcome.message, "Deployment stopped"),
        Err(e) => warn!(error = %e, "Failed to stop deployment on shutdown"),
    }
    state.coordinator.shutdown().await;
    flusher_cancel.cancel();
    if let Err(e) = flusher.await {
        warn!(error = %e, "Telemetry flusher task failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }
}
