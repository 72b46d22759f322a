//! 健康检查与环境信息 API
//!
//! 包含 /health, /status, /environment, /system/profile, /recommendations 端点

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::domain::backend::{BackendCheckResult, BackendKind};
use crate::domain::system::SystemProfile;
use crate::error::ApiResult;
use crate::services::coordinator::{DeploymentStatus, HealthReport, Recommendations};
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub uptime_secs: i64,
    pub deployment: HealthReport,
}

#[derive(Debug, Default, Deserialize)]
pub struct EnvironmentQuery {
    /// 忽略缓存重新探测
    #[serde(default)]
    pub refresh: bool,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(deployment_status))
        .route("/environment", get(environment))
        .route("/system/profile", get(system_profile))
        .route("/recommendations", get(recommendations))
}

/// GET /health
///
/// 服务本身存活即返回 ok，部署健康状况在 `deployment` 字段中
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let now = chrono::Utc::now();
    Json(HealthResponse {
        status: "ok",
        service: "deploy-orchestrator",
        version: VERSION,
        timestamp: now.to_rfc3339(),
        uptime_secs: (now - state.started_at).num_seconds(),
        deployment: state.coordinator.health_check().await,
    })
}

/// GET /status
pub async fn deployment_status(State(state): State<Arc<AppState>>) -> Json<DeploymentStatus> {
    Json(state.coordinator.get_deployment_status().await)
}

/// GET /environment?refresh=true
pub async fn environment(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EnvironmentQuery>,
) -> Json<BTreeMap<BackendKind, BackendCheckResult>> {
    Json(state.probe.detect_all(query.refresh).await)
}

/// GET /system/profile
pub async fn system_profile(State(state): State<Arc<AppState>>) -> ApiResult<Json<SystemProfile>> {
    Ok(Json(state.probe.system_profile().await?))
}

/// GET /recommendations
pub async fn recommendations(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Recommendations>> {
    Ok(Json(
        state.coordinator.get_deployment_recommendations().await?,
    ))
}
