//! 部署遥测 API
//!
//! 会话、事件、指标、摘要查询，以及事件的 SSE 实时流

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::telemetry::{
    DeploymentEvent, PerformanceMetric, SessionInfo, SessionSummary,
};
use crate::error::{ApiError, ApiResult};
use crate::infra::persistence::{Record, RecordFilter};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// 只推送该会话的事件
    pub session_id: Option<String>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/telemetry/sessions", get(list_sessions))
        .route("/telemetry/sessions/:id", get(get_session))
        .route("/telemetry/sessions/:id/events", get(session_events))
        .route("/telemetry/sessions/:id/metrics", get(session_metrics))
        .route("/telemetry/sessions/:id/summary", get(session_summary))
        .route("/telemetry/records", get(persisted_records))
        .route("/telemetry/stream", get(stream_events))
}

/// GET /telemetry/sessions
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    Json(state.telemetry.sessions().await)
}

/// GET /telemetry/sessions/:id
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionInfo>> {
    state
        .telemetry
        .session(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Session '{}'", id)))
}

/// GET /telemetry/sessions/:id/events
pub async fn session_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<DeploymentEvent>>> {
    ensure_session(&state, &id).await?;
    Ok(Json(state.telemetry.get_events(&id).await))
}

/// GET /telemetry/sessions/:id/metrics
pub async fn session_metrics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<PerformanceMetric>>> {
    ensure_session(&state, &id).await?;
    Ok(Json(state.telemetry.get_metrics(&id).await))
}

/// GET /telemetry/sessions/:id/summary
///
/// 会话未结束时没有摘要，同样返回 404
pub async fn session_summary(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionSummary>> {
    state
        .telemetry
        .get_summary(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Summary for session '{}'", id)))
}

/// GET /telemetry/records?record_type=event&session_id=...&limit=100
pub async fn persisted_records(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<RecordFilter>,
) -> ApiResult<Json<Vec<Record>>> {
    Ok(Json(state.telemetry.query_persisted(&filter).await?))
}

/// 实时事件流（SSE）
///
/// GET /telemetry/stream?session_id=...
/// 无需认证
pub async fn stream_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.telemetry.subscribe();
    let filter = query.session_id;
    debug!(session_id = ?filter, "Telemetry stream subscriber connected");

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !wants(filter.as_deref(), &event) {
                        continue;
                    }
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().event("deployment").data(json));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "Telemetry stream subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}

fn wants(filter: Option<&str>, event: &DeploymentEvent) -> bool {
    filter.map_or(true, |id| event.session_id == id)
}

async fn ensure_session(state: &AppState, id: &str) -> ApiResult<()> {
    match state.telemetry.session(id).await {
        Some(_) => Ok(()),
        None => Err(ApiError::not_found(format!("Session '{}'", id))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::telemetry::{EventLevel, EventType};
    use crate::testing::test_app_state;

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let (state, _, _) = test_app_state();

        let err = session_events(State(state.clone()), Path("missing".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        let err = session_summary(State(state), Path("missing".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_deploy_session_is_queryable() {
        let (state, _, _) = test_app_state();
        let outcome = state.coordinator.deploy(None, None).await.unwrap();

        let Json(sessions) = list_sessions(State(state.clone())).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, outcome.session_id);
        assert!(sessions[0].ended);

        let Json(events) = session_events(State(state.clone()), Path(outcome.session_id.clone()))
            .await
            .unwrap();
        assert_eq!(events[0].event_type, EventType::SessionStarted);
        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));

        let Json(summary) = session_summary(State(state.clone()), Path(outcome.session_id.clone()))
            .await
            .unwrap();
        assert_eq!(summary.steps_failed, 0);
        assert!(summary.steps_completed >= 1);

        let Json(metrics) = session_metrics(State(state), Path(outcome.session_id))
            .await
            .unwrap();
        assert!(!metrics.is_empty());
    }

    #[tokio::test]
    async fn test_records_empty_without_sink() {
        let (state, _, _) = test_app_state();
        let Json(records) = persisted_records(State(state), Query(RecordFilter::default()))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_stream_session_filter() {
        let event = DeploymentEvent::new(
            "s-1",
            EventType::HealthCheck,
            EventLevel::Info,
            "ok",
            serde_json::Value::Null,
        );
        assert!(wants(None, &event));
        assert!(wants(Some("s-1"), &event));
        assert!(!wants(Some("s-2"), &event));
    }
}
