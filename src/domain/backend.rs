//! 部署后端相关领域模型

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::container::UnitInfo;
use crate::domain::deploy::DeployStage;
use crate::error::{DeployError, DeploymentErrorKind};

/// 后端类型
///
/// 声明顺序即优先级顺序（同分时的确定性排序依据）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Container,
    Process,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Container, BackendKind::Process];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Container => "container",
            BackendKind::Process => "process",
        }
    }

    /// 声明优先级，数值越小越靠前
    pub fn priority(&self) -> u8 {
        match self {
            BackendKind::Container => 0,
            BackendKind::Process => 1,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "container" | "docker" | "compose" => Ok(BackendKind::Container),
            "process" | "python" | "native" => Ok(BackendKind::Process),
            other => Err(DeployError::Config(format!("unknown backend '{}'", other))),
        }
    }
}

/// 环境检测状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Available,
    NotFound,
    Outdated,
    Corrupted,
    PermissionDenied,
    Unknown,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Available => "available",
            CheckStatus::NotFound => "not_found",
            CheckStatus::Outdated => "outdated",
            CheckStatus::Corrupted => "corrupted",
            CheckStatus::PermissionDenied => "permission_denied",
            CheckStatus::Unknown => "unknown",
        }
    }
}

/// 后端环境检测结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendCheckResult {
    pub kind: BackendKind,
    pub status: CheckStatus,
    pub version: Option<String>,
    pub path: Option<PathBuf>,
    /// 0-100
    pub health_score: u8,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl BackendCheckResult {
    /// 根据原始得分构造结果
    ///
    /// 得分被裁剪到 [0, 100]；只有得分不低于 `available_floor` 才会是 Available，
    /// 位于 `[outdated_floor, available_floor)` 为 Outdated，否则使用 `unusable` 状态。
    pub fn scored(
        kind: BackendKind,
        raw_score: i32,
        available_floor: u8,
        outdated_floor: u8,
        unusable: CheckStatus,
    ) -> Self {
        let health_score = raw_score.clamp(0, 100) as u8;
        let status = if health_score >= available_floor {
            CheckStatus::Available
        } else if health_score >= outdated_floor {
            CheckStatus::Outdated
        } else if unusable == CheckStatus::Available || unusable == CheckStatus::Outdated {
            CheckStatus::Unknown
        } else {
            unusable
        };

        Self {
            kind,
            status,
            version: None,
            path: None,
            health_score,
            issues: Vec::new(),
            recommendations: Vec::new(),
            checked_at: Utc::now(),
        }
    }

    /// 不可用结果（得分 0）
    pub fn unavailable(kind: BackendKind, status: CheckStatus, issue: impl Into<String>) -> Self {
        let mut result = Self::scored(kind, 0, 100, 100, status);
        result.issues.push(issue.into());
        result
    }

    /// 运行时可直接使用（可用或版本偏旧）
    pub fn is_usable(&self) -> bool {
        matches!(self.status, CheckStatus::Available | CheckStatus::Outdated)
    }
}

/// 后端运行状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    NotDeployed,
    Deploying,
    Running,
    Degraded,
    Failed,
    Stopped,
}

impl BackendStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, BackendStatus::Running | BackendStatus::Degraded)
    }
}

/// 后端失败类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 临时性错误，可重试
    Transient,
    /// 配置/校验错误，立即放弃该后端
    Configuration,
    /// 就绪超时
    Startup,
    /// 运行时/依赖安装失败
    Install,
    /// 被取消
    Cancelled,
}

/// 后端失败描述
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl BackendFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, FailureKind::Transient | FailureKind::Startup)
    }
}

impl From<&DeployError> for BackendFailure {
    fn from(err: &DeployError) -> Self {
        let kind = match err {
            DeployError::Deployment { kind, .. } => match kind {
                DeploymentErrorKind::Transient | DeploymentErrorKind::Degraded => {
                    FailureKind::Transient
                }
                DeploymentErrorKind::Validation => FailureKind::Configuration,
                DeploymentErrorKind::RuntimeUnavailable => FailureKind::Install,
            },
            DeployError::ServiceStartup { .. } => FailureKind::Startup,
            DeployError::DependencyInstall { .. } | DeployError::Environment { .. } => {
                FailureKind::Install
            }
            DeployError::Config(_) => FailureKind::Configuration,
            DeployError::Cancelled => FailureKind::Cancelled,
            other if other.is_retryable() => FailureKind::Transient,
            DeployError::Command(crate::infra::command::CommandError::Cancelled) => {
                FailureKind::Cancelled
            }
            _ => FailureKind::Transient,
        };
        let failure = BackendFailure::new(kind, err.to_string());
        match err.details() {
            Some(details) => failure.with_details(details),
            None => failure,
        }
    }
}

/// 后端持有的资源句柄
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHandles {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
    /// 已解析的依赖包列表
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
}

/// 后端部署结果
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendResult {
    pub backend: BackendKind,
    pub success: bool,
    pub status: BackendStatus,
    /// 各阶段耗时
    pub stages: Vec<DeployStage>,
    pub total_duration_ms: i64,
    pub resources: ResourceHandles,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<UnitInfo>,
    pub warnings: Vec<String>,
    pub error: Option<BackendFailure>,
}

impl BackendResult {
    pub fn succeeded(backend: BackendKind, stages: Vec<DeployStage>) -> Self {
        let total_duration_ms = stages.iter().filter_map(|s| s.duration_ms).sum();
        Self {
            backend,
            success: true,
            status: BackendStatus::Running,
            stages,
            total_duration_ms,
            resources: ResourceHandles::default(),
            units: Vec::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn failed(backend: BackendKind, stages: Vec<DeployStage>, failure: BackendFailure) -> Self {
        let total_duration_ms = stages.iter().filter_map(|s| s.duration_ms).sum();
        Self {
            backend,
            success: false,
            status: BackendStatus::Failed,
            stages,
            total_duration_ms,
            resources: ResourceHandles::default(),
            units: Vec::new(),
            warnings: Vec::new(),
            error: Some(failure),
        }
    }

    pub fn with_status(mut self, status: BackendStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn is_retryable(&self) -> bool {
        !self.success && self.error.as_ref().map_or(true, BackendFailure::is_retryable)
    }
}

/// 后端健康检查结果
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendHealth {
    pub backend: BackendKind,
    pub healthy: bool,
    pub status: BackendStatus,
    pub checked_at: DateTime<Utc>,
    pub latency_ms: i64,
    pub units_total: usize,
    pub units_healthy: usize,
    pub details: Vec<String>,
}

impl BackendHealth {
    pub fn new(backend: BackendKind, healthy: bool, status: BackendStatus) -> Self {
        Self {
            backend,
            healthy,
            status,
            checked_at: Utc::now(),
            latency_ms: 0,
            units_total: 0,
            units_healthy: 0,
            details: Vec::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }
}

/// 后端状态报告
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendStatusReport {
    pub backend: BackendKind,
    pub status: BackendStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<UnitInfo>,
    pub resources: ResourceHandles,
}
