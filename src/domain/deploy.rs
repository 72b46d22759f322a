//! 部署相关领域模型

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::backend::{BackendFailure, BackendKind, BackendResult, FailureKind};
use crate::error::DeployError;

/// 阶段状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// 部署阶段信息（后端返回的耗时明细）
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeployStage {
    /// 阶段标识 (e.g., "ensure_runtime", "compose_up")
    pub name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub status: StageStatus,
    pub message: Option<String>,
}

impl DeployStage {
    /// 创建并立即开始的阶段
    pub fn begin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            started_at: Some(Utc::now()),
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Running,
            message: None,
        }
    }

    /// 完成阶段
    pub fn finish(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    /// 跳过阶段
    pub fn skipped(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: Some(0),
            status: StageStatus::Skipped,
            message: Some(reason.into()),
        }
    }
}

/// 部署策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStrategy {
    ContainerPreferred,
    ProcessPreferred,
    ContainerOnly,
    ProcessOnly,
    AutoDetect,
    Manual,
}

impl DeploymentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStrategy::ContainerPreferred => "container-preferred",
            DeploymentStrategy::ProcessPreferred => "process-preferred",
            DeploymentStrategy::ContainerOnly => "container-only",
            DeploymentStrategy::ProcessOnly => "process-only",
            DeploymentStrategy::AutoDetect => "auto-detect",
            DeploymentStrategy::Manual => "manual",
        }
    }

    /// 策略是否允许使用该后端
    pub fn allows(&self, kind: BackendKind) -> bool {
        match self {
            DeploymentStrategy::ContainerOnly => kind == BackendKind::Container,
            DeploymentStrategy::ProcessOnly => kind == BackendKind::Process,
            _ => true,
        }
    }

    /// 策略对后端的偏好分（0-100）
    pub fn preference(&self, kind: BackendKind) -> f64 {
        match (self, kind) {
            (DeploymentStrategy::ContainerPreferred, BackendKind::Container)
            | (DeploymentStrategy::ProcessPreferred, BackendKind::Process)
            | (DeploymentStrategy::ContainerOnly, BackendKind::Container)
            | (DeploymentStrategy::ProcessOnly, BackendKind::Process) => 100.0,
            (DeploymentStrategy::ContainerPreferred, _)
            | (DeploymentStrategy::ProcessPreferred, _) => 30.0,
            (DeploymentStrategy::ContainerOnly, _) | (DeploymentStrategy::ProcessOnly, _) => 0.0,
            (DeploymentStrategy::AutoDetect, _) | (DeploymentStrategy::Manual, _) => 50.0,
        }
    }
}

impl fmt::Display for DeploymentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStrategy {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "container-preferred" | "docker-preferred" => Ok(Self::ContainerPreferred),
            "process-preferred" | "native-preferred" => Ok(Self::ProcessPreferred),
            "container-only" | "docker-only" => Ok(Self::ContainerOnly),
            "process-only" | "native-only" => Ok(Self::ProcessOnly),
            "auto-detect" | "auto" => Ok(Self::AutoDetect),
            "manual" => Ok(Self::Manual),
            other => Err(DeployError::Config(format!("unknown strategy '{}'", other))),
        }
    }
}

/// 评分明细（各项均为加权前的 0-100 分值，平台调整为直接加减分）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub availability: f64,
    pub health: f64,
    pub resources: f64,
    pub history: f64,
    pub preference: f64,
    pub platform_adjustment: f64,
}

/// 单个后端的评分
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendScore {
    pub kind: BackendKind,
    pub score: f64,
    /// 是否高于最低可用线
    pub viable: bool,
    pub breakdown: ScoreBreakdown,
}

/// 部署计划（执行开始后不可变）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub strategy: DeploymentStrategy,
    pub primary: BackendKind,
    pub fallbacks: Vec<BackendKind>,
    /// 所有候选后端的评分（按排序结果）
    pub scores: Vec<BackendScore>,
    /// 0.0-1.0
    pub confidence: f64,
    pub risk_factors: Vec<String>,
    pub estimated_duration_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl DeploymentPlan {
    /// 主后端 + 备选后端，按执行顺序
    pub fn ordered_backends(&self) -> Vec<BackendKind> {
        std::iter::once(self.primary)
            .chain(self.fallbacks.iter().copied())
            .collect()
    }

    pub fn score_of(&self, kind: BackendKind) -> Option<f64> {
        self.scores.iter().find(|s| s.kind == kind).map(|s| s.score)
    }
}

/// 部署模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    Primary,
    Fallback,
}

/// 单次后端尝试记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub backend: BackendKind,
    pub attempt: u32,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub error: Option<BackendFailure>,
}

/// 后端错误条目（汇总到最终失败结果中）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendErrorEntry {
    pub backend: Option<BackendKind>,
    pub attempt: u32,
    pub kind: FailureKind,
    pub message: String,
}

/// 单次 deploy() 的运行记录，由协调器独占
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentExecution {
    pub id: String,
    pub session_id: String,
    pub plan: DeploymentPlan,
    pub current_backend: Option<BackendKind>,
    pub attempts: BTreeMap<BackendKind, u32>,
    pub results: BTreeMap<BackendKind, BackendResult>,
    pub attempt_log: Vec<AttemptRecord>,
    pub started_at: DateTime<Utc>,
    pub errors: Vec<BackendErrorEntry>,
    pub success: bool,
}

impl DeploymentExecution {
    pub fn new(id: String, session_id: String, plan: DeploymentPlan) -> Self {
        Self {
            id,
            session_id,
            plan,
            current_backend: None,
            attempts: BTreeMap::new(),
            results: BTreeMap::new(),
            attempt_log: Vec::new(),
            started_at: Utc::now(),
            errors: Vec::new(),
            success: false,
        }
    }

    /// 记录一次后端尝试
    pub fn record_attempt(&mut self, result: BackendResult, started_at: DateTime<Utc>) {
        let backend = result.backend;
        let attempt = {
            let counter = self.attempts.entry(backend).or_insert(0);
            *counter += 1;
            *counter
        };
        let duration_ms = (Utc::now() - started_at).num_milliseconds();

        if let Some(ref failure) = result.error {
            self.errors.push(BackendErrorEntry {
                backend: Some(backend),
                attempt,
                kind: failure.kind,
                message: failure.message.clone(),
            });
        }
        self.attempt_log.push(AttemptRecord {
            backend,
            attempt,
            success: result.success,
            started_at,
            duration_ms,
            error: result.error.clone(),
        });
        if result.success {
            self.success = true;
            self.current_backend = Some(backend);
        }
        self.results.insert(backend, result);
    }

    pub fn attempts_for(&self, kind: BackendKind) -> u32 {
        self.attempts.get(&kind).copied().unwrap_or(0)
    }

    pub fn mode(&self) -> Option<DeploymentMode> {
        self.current_backend.map(|b| {
            if b == self.plan.primary {
                DeploymentMode::Primary
            } else {
                DeploymentMode::Fallback
            }
        })
    }
}

/// deploy()/restart() 的结构化结果
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentOutcome {
    pub success: bool,
    pub execution_id: String,
    pub session_id: String,
    pub strategy: DeploymentStrategy,
    pub backend: Option<BackendKind>,
    pub deployment_mode: Option<DeploymentMode>,
    pub plan: Option<DeploymentPlan>,
    pub attempts: Vec<AttemptRecord>,
    /// 所有后端的完整错误列表
    pub errors: Vec<BackendErrorEntry>,
    pub result: Option<BackendResult>,
    pub duration_ms: i64,
    pub message: String,
}

impl DeploymentOutcome {
    pub fn from_execution(
        execution: &DeploymentExecution,
        strategy: DeploymentStrategy,
        message: impl Into<String>,
    ) -> Self {
        let result = execution
            .current_backend
            .and_then(|b| execution.results.get(&b).cloned());
        Self {
            success: execution.success,
            execution_id: execution.id.clone(),
            session_id: execution.session_id.clone(),
            strategy,
            backend: execution.current_backend,
            deployment_mode: execution.mode(),
            plan: Some(execution.plan.clone()),
            attempts: execution.attempt_log.clone(),
            errors: execution.errors.clone(),
            result,
            duration_ms: (Utc::now() - execution.started_at).num_milliseconds(),
            message: message.into(),
        }
    }

    /// 无法生成计划时的失败结果
    pub fn planning_failed(
        execution_id: String,
        session_id: String,
        strategy: DeploymentStrategy,
        error: &DeployError,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            success: false,
            execution_id,
            session_id,
            strategy,
            backend: None,
            deployment_mode: None,
            plan: None,
            attempts: Vec::new(),
            errors: vec![BackendErrorEntry {
                backend: None,
                attempt: 0,
                kind: BackendFailure::from(error).kind,
                message: error.to_string(),
            }],
            result: None,
            duration_ms: (Utc::now() - started_at).num_milliseconds(),
            message: error.to_string(),
        }
    }
}

/// 协调器状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorStatus {
    Idle,
    Analyzing,
    Deploying,
    Running,
    Degrading,
    Failed,
    Stopping,
}

impl CoordinatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorStatus::Idle => "idle",
            CoordinatorStatus::Analyzing => "analyzing",
            CoordinatorStatus::Deploying => "deploying",
            CoordinatorStatus::Running => "running",
            CoordinatorStatus::Degrading => "degrading",
            CoordinatorStatus::Failed => "failed",
            CoordinatorStatus::Stopping => "stopping",
        }
    }

    /// 状态迁移表
    pub fn can_transition_to(&self, next: CoordinatorStatus) -> bool {
        use CoordinatorStatus::*;
        matches!(
            (self, next),
            (Idle, Analyzing)
                | (Failed, Analyzing)
                | (Analyzing, Deploying)
                | (Analyzing, Failed)
                | (Deploying, Running)
                | (Deploying, Failed)
                | (Running, Degrading)
                | (Degrading, Running)
                | (Degrading, Failed)
                | (Running, Deploying)
                | (Degrading, Deploying)
                | (Failed, Deploying)
                | (Analyzing, Stopping)
                | (Deploying, Stopping)
                | (Running, Stopping)
                | (Degrading, Stopping)
                | (Failed, Stopping)
                | (Stopping, Idle)
                | (Stopping, Failed)
        )
    }

    /// 是否存在活动部署
    pub fn has_active_deployment(&self) -> bool {
        matches!(self, CoordinatorStatus::Running | CoordinatorStatus::Degrading)
    }
}

impl fmt::Display for CoordinatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 历史记录动作
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Deploy,
    Stop,
    Restart,
    Recovery,
}

/// 部署历史条目
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub action: HistoryAction,
    pub session_id: Option<String>,
    pub strategy: Option<DeploymentStrategy>,
    pub backend: Option<BackendKind>,
    pub deployment_mode: Option<DeploymentMode>,
    pub success: bool,
    pub final_status: CoordinatorStatus,
    pub message: String,
    #[serde(default)]
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backend::BackendStatus;

    #[test]
    fn test_deploy_stage_lifecycle() {
        let mut stage = DeployStage::begin("compose_up");
        assert_eq!(stage.status, StageStatus::Running);

        stage.finish(true, Some("Done".to_string()));
        assert_eq!(stage.status, StageStatus::Success);
        assert!(stage.finished_at.is_some());
        assert!(stage.duration_ms.is_some());
    }

    #[test]
    fn test_strategy_parse_and_allows() {
        assert_eq!(
            "auto_detect".parse::<DeploymentStrategy>().unwrap(),
            DeploymentStrategy::AutoDetect
        );
        assert!(DeploymentStrategy::ContainerOnly.allows(BackendKind::Container));
        assert!(!DeploymentStrategy::ContainerOnly.allows(BackendKind::Process));
        assert!("yolo".parse::<DeploymentStrategy>().is_err());
    }

    #[test]
    fn test_transition_table() {
        use CoordinatorStatus::*;
        assert!(Idle.can_transition_to(Analyzing));
        assert!(Running.can_transition_to(Degrading));
        assert!(Degrading.can_transition_to(Running));
        assert!(!Running.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Running));
        assert!(!Idle.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Idle));
    }

    #[test]
    fn test_execution_records_attempts_and_mode() {
        let plan = DeploymentPlan {
            strategy: DeploymentStrategy::AutoDetect,
            primary: BackendKind::Container,
            fallbacks: vec![BackendKind::Process],
            scores: Vec::new(),
            confidence: 0.8,
            risk_factors: Vec::new(),
            estimated_duration_secs: 60,
            created_at: Utc::now(),
        };
        let mut exec = DeploymentExecution::new("e".into(), "s".into(), plan);

        let failure = BackendFailure::new(FailureKind::Configuration, "bad");
        exec.record_attempt(
            BackendResult::failed(BackendKind::Container, Vec::new(), failure),
            Utc::now(),
        );
        exec.record_attempt(
            BackendResult::succeeded(BackendKind::Process, Vec::new()),
            Utc::now(),
        );

        assert!(exec.success);
        assert_eq!(exec.attempts_for(BackendKind::Container), 1);
        assert_eq!(exec.attempts_for(BackendKind::Process), 1);
        assert_eq!(exec.mode(), Some(DeploymentMode::Fallback));
        assert_eq!(exec.errors.len(), 1);
        assert_eq!(
            exec.results[&BackendKind::Process].status,
            BackendStatus::Running
        );
    }
}
