//! 统一错误处理
//!
//! - `DeployError`: 编排核心的错误分类（环境 / 部署 / 服务启动 / 依赖安装）
//! - `ApiError`: HTTP 层错误，实现 `IntoResponse`

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::domain::backend::BackendKind;
use crate::infra::command::CommandError;
use crate::infra::persistence::PersistenceError;

/// 错误类别（对外暴露的稳定标识）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Environment,
    Deployment,
    ServiceStartup,
    DependencyInstall,
    Configuration,
    Busy,
    Cancelled,
    Command,
    Persistence,
}

/// 部署失败子类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentErrorKind {
    /// 临时性错误，可重试
    Transient,
    /// 配置/校验错误，不重试
    Validation,
    /// 运行时不可用
    RuntimeUnavailable,
    /// 部分单元不健康
    Degraded,
}

/// 编排核心错误
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("environment error: {message}")]
    Environment {
        message: String,
        details: Option<String>,
    },

    #[error("deployment error on {backend} ({kind:?}): {message}")]
    Deployment {
        backend: BackendKind,
        kind: DeploymentErrorKind,
        message: String,
        details: Option<String>,
    },

    #[error("service '{service}' not ready after {timeout_secs}s")]
    ServiceStartup {
        service: String,
        timeout_secs: u64,
        details: Option<String>,
    },

    #[error("failed to install {name} via {method}: {reason}")]
    DependencyInstall {
        name: String,
        method: String,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation already in progress: {0}")]
    Busy(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl DeployError {
    pub fn environment(message: impl Into<String>) -> Self {
        Self::Environment {
            message: message.into(),
            details: None,
        }
    }

    pub fn deployment(
        backend: BackendKind,
        kind: DeploymentErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Deployment {
            backend,
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn install(
        name: impl Into<String>,
        method: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::DependencyInstall {
            name: name.into(),
            method: method.into(),
            reason: reason.into(),
        }
    }

    /// 附加详情（仅对带 details 字段的变体生效）
    pub fn with_details(mut self, extra: impl Into<String>) -> Self {
        match &mut self {
            Self::Environment { details, .. }
            | Self::Deployment { details, .. }
            | Self::ServiceStartup { details, .. } => *details = Some(extra.into()),
            _ => {}
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Environment { .. } => ErrorKind::Environment,
            Self::Deployment { .. } => ErrorKind::Deployment,
            Self::ServiceStartup { .. } => ErrorKind::ServiceStartup,
            Self::DependencyInstall { .. } => ErrorKind::DependencyInstall,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Command(_) => ErrorKind::Command,
            Self::Persistence(_) => ErrorKind::Persistence,
        }
    }

    pub fn details(&self) -> Option<&str> {
        match self {
            Self::Environment { details, .. }
            | Self::Deployment { details, .. }
            | Self::ServiceStartup { details, .. } => details.as_deref(),
            _ => None,
        }
    }

    /// 是否为可重试的临时错误
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Deployment { kind, .. } => *kind == DeploymentErrorKind::Transient,
            Self::ServiceStartup { .. } => true,
            Self::Command(e) => matches!(e, CommandError::Timeout | CommandError::WaitFailed(_)),
            _ => false,
        }
    }
}

pub type DeployResult<T> = Result<T, DeployError>;

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失）
    Unauthorized,
    /// 404 - 资源未找到
    NotFound(String),
    /// 400 - 请求无效
    BadRequest(String),
    /// 409 - 冲突（如：部署已在进行）
    Conflict(String),
    /// 500 - 内部错误
    Internal(String),
    /// 503 - 服务不可用
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        match err.kind() {
            ErrorKind::Busy => ApiError::Conflict(err.to_string()),
            ErrorKind::Configuration => ApiError::BadRequest(err.to_string()),
            ErrorKind::Environment => ApiError::ServiceUnavailable(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid or missing API key".to_string(),
            ),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("{} not found", resource),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
        };

        let body = ErrorResponse::new(error_type, message);
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::Conflict(m) => write!(f, "Conflict: {}", m),
            ApiError::Internal(m) => write!(f, "Internal error: {}", m),
            ApiError::ServiceUnavailable(m) => write!(f, "Service unavailable: {}", m),
        }
    }
}

impl std::error::Error for ApiError {}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;
