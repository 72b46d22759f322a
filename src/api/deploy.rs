//! 部署管理 API
//!
//! 包含 /deploy, /stop, /restart, /config/*, /history 端点

use axum::{
    extract::{Query, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::backend::BackendConfigs;
use crate::config::env::{OrchestratorConfig, ScoreWeights};
use crate::domain::deploy::{DeploymentOutcome, DeploymentStrategy, HistoryAction, HistoryEntry};
use crate::error::ApiResult;
use crate::middleware::RequireApiKey;
use crate::services::coordinator::StopOutcome;
use crate::state::AppState;

/// 部署请求；省略的字段使用当前配置
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeployRequest {
    pub strategy: Option<DeploymentStrategy>,
    /// 覆盖对应后端的部署配置
    pub backends: Option<BackendConfigs>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StopRequest {
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RestartRequest {
    pub force_rebuild: bool,
}

#[derive(Debug, Deserialize)]
pub struct StrategyRequest {
    pub strategy: DeploymentStrategy,
}

#[derive(Debug, Deserialize)]
pub struct AutoRecoveryRequest {
    pub enabled: bool,
}

/// 生效配置（不含密钥）
#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub strategy: DeploymentStrategy,
    pub auto_recovery: bool,
    pub max_attempts_per_backend: u32,
    pub max_fallback_attempts: u32,
    pub retry_delay_secs: u64,
    pub health_check_interval_secs: u64,
    pub viability_floor: f64,
    pub weights: ScoreWeights,
}

impl From<&OrchestratorConfig> for ConfigResponse {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            strategy: config.strategy,
            auto_recovery: config.auto_recovery,
            max_attempts_per_backend: config.max_attempts_per_backend,
            max_fallback_attempts: config.max_fallback_attempts,
            retry_delay_secs: config.retry_delay.as_secs(),
            health_check_interval_secs: config.health_check_interval.as_secs(),
            viability_floor: config.viability_floor,
            weights: config.weights.clone(),
        }
    }
}

/// 历史查询参数
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// 返回数量限制，默认 20
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub action: Option<HistoryAction>,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub entries: Vec<HistoryEntry>,
    pub total: usize,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deploy", post(deploy))
        .route("/stop", post(stop))
        .route("/restart", post(restart))
        .route("/config", get(current_config))
        .route("/config/strategy", put(set_strategy))
        .route("/config/auto-recovery", put(set_auto_recovery))
        .route("/history", get(history))
}

/// POST /deploy
///
/// 同步执行部署；执行失败时返回 `success: false` 的结构化结果，并发冲突返回 409
pub async fn deploy(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeployRequest>,
) -> ApiResult<Json<DeploymentOutcome>> {
    info!(strategy = ?request.strategy, "Deploy requested");
    let outcome = state
        .coordinator
        .deploy(request.strategy, request.backends)
        .await?;
    Ok(Json(outcome))
}

/// POST /stop
pub async fn stop(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<StopRequest>,
) -> ApiResult<Json<StopOutcome>> {
    info!(force = request.force, "Stop requested");
    Ok(Json(state.coordinator.stop_deployment(request.force).await?))
}

/// POST /restart
pub async fn restart(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<RestartRequest>,
) -> ApiResult<Json<DeploymentOutcome>> {
    info!(force_rebuild = request.force_rebuild, "Restart requested");
    Ok(Json(
        state
            .coordinator
            .restart_deployment(request.force_rebuild)
            .await?,
    ))
}

/// GET /config
pub async fn current_config(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    Json(ConfigResponse::from(state.coordinator.config().await.as_ref()))
}

/// PUT /config/strategy
pub async fn set_strategy(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<StrategyRequest>,
) -> Json<ConfigResponse> {
    let config = state.coordinator.set_strategy(request.strategy).await;
    Json(ConfigResponse::from(config.as_ref()))
}

/// PUT /config/auto-recovery
pub async fn set_auto_recovery(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<AutoRecoveryRequest>,
) -> Json<ConfigResponse> {
    let config = state.coordinator.set_auto_recovery(request.enabled).await;
    Json(ConfigResponse::from(config.as_ref()))
}

/// GET /history?limit=20&action=deploy
pub async fn history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryResponse> {
    let entries = state.history.list(query.limit, query.action).await;
    Json(HistoryResponse {
        total: state.history.len().await,
        entries,
    })
}
