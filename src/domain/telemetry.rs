//! 遥测领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 事件类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStarted,
    SessionEnded,
    EnvironmentAnalyzed,
    PlanCreated,
    StepStarted,
    StepCompleted,
    StepFailed,
    BackendAttempt,
    FallbackTriggered,
    HealthCheck,
    Recovery,
    ThresholdExceeded,
    StateChanged,
    Custom,
}

/// 事件级别
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl EventLevel {
    /// 是否触发告警订阅
    pub fn is_alert(&self) -> bool {
        matches!(self, EventLevel::Error | EventLevel::Critical)
    }
}

/// 部署事件（只追加）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub id: String,
    pub session_id: String,
    /// 会话内序号，从 0 开始
    pub sequence: u64,
    pub event_type: EventType,
    pub level: EventLevel,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl DeploymentEvent {
    pub fn new(
        session_id: &str,
        event_type: EventType,
        level: EventLevel,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            sequence: 0,
            event_type,
            level,
            message: message.into(),
            details,
            timestamp: Utc::now(),
        }
    }
}

/// 性能指标
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub session_id: String,
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

/// 指标阈值
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricThreshold {
    pub warning: f64,
    pub critical: f64,
}

impl MetricThreshold {
    pub fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }

    /// 超过阈值时返回对应级别
    pub fn evaluate(&self, value: f64) -> Option<EventLevel> {
        if value > self.critical {
            Some(EventLevel::Critical)
        } else if value > self.warning {
            Some(EventLevel::Warning)
        } else {
            None
        }
    }
}

/// 会话摘要（在 end_session 时计算一次并缓存）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub total_events: usize,
    pub total_metrics: usize,
    pub steps_started: usize,
    pub steps_completed: usize,
    pub steps_failed: usize,
    /// 已完成步骤 / 已开始步骤
    pub step_completion_ratio: f64,
    pub error_count: usize,
    pub warning_count: usize,
    /// 成功步骤 / (成功 + 失败)
    pub success_rate: f64,
}

/// 会话概览（查询接口）
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended: bool,
    pub event_count: usize,
    pub metric_count: usize,
}
