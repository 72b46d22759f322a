//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod backend;
pub mod container;
pub mod deploy;
pub mod system;
pub mod telemetry;

// Re-exports for convenience
pub use backend::{
    BackendCheckResult, BackendFailure, BackendHealth, BackendKind, BackendResult, BackendStatus,
    BackendStatusReport, CheckStatus, FailureKind, ResourceHandles,
};
pub use container::UnitInfo;
pub use deploy::{
    CoordinatorStatus, DeployStage, DeploymentExecution, DeploymentMode, DeploymentOutcome,
    DeploymentPlan, DeploymentStrategy, HistoryAction, HistoryEntry, StageStatus,
};
pub use system::{OsFamily, PackageManager, SystemProfile};
pub use telemetry::{DeploymentEvent, EventLevel, EventType, PerformanceMetric, SessionSummary};
