//! 部署后端
//!
//! 协调器只通过 `DeploymentBackend` 访问后端，按 `BackendKind` 索引，不按字符串分派。

pub mod container;
pub mod process;

pub use container::ContainerBackend;
pub use process::ProcessBackend;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::backend::BackendConfig;
use crate::domain::backend::{
    BackendFailure, BackendHealth, BackendKind, BackendResult, BackendStatusReport, FailureKind,
};
use crate::domain::deploy::DeployStage;
use crate::error::DeployResult;

/// 部署后端能力接口
///
/// `deploy` / `restart` 的失败通过 `BackendResult` 返回，不以 `Err` 传播，
/// 以便协调器继续尝试备选后端。
#[async_trait]
pub trait DeploymentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn deploy(&self, config: &BackendConfig, cancel: &CancellationToken) -> BackendResult;

    /// 停止并释放资源；`force` 跳过优雅退出
    async fn stop(&self, force: bool) -> DeployResult<()>;

    /// 使用上次部署的配置重启
    async fn restart(&self, force_rebuild: bool, cancel: &CancellationToken) -> BackendResult;

    async fn status(&self) -> BackendStatusReport;

    async fn health(&self) -> BackendHealth;
}

/// 按类型索引的后端集合
pub type BackendRegistry = BTreeMap<BackendKind, Arc<dyn DeploymentBackend>>;

/// 从后端列表构建集合（同类型后注册者覆盖）
pub fn registry(backends: Vec<Arc<dyn DeploymentBackend>>) -> BackendRegistry {
    backends.into_iter().map(|b| (b.kind(), b)).collect()
}

/// 记录阶段耗时并在失败时生成结果
pub(crate) struct StageTracker {
    backend: BackendKind,
    stages: Vec<DeployStage>,
}

impl StageTracker {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            stages: Vec::new(),
        }
    }

    pub fn begin(&mut self, name: &str) {
        self.stages.push(DeployStage::begin(name));
    }

    pub fn finish(&mut self, success: bool, message: Option<String>) {
        if let Some(stage) = self.stages.last_mut() {
            stage.finish(success, message);
        }
    }

    pub fn skip(&mut self, name: &str, reason: &str) {
        self.stages.push(DeployStage::skipped(name, reason));
    }

    /// 以失败结束当前阶段并构造失败结果
    pub fn fail(mut self, failure: BackendFailure) -> BackendResult {
        self.finish(false, Some(failure.message.clone()));
        BackendResult::failed(self.backend, self.stages, failure)
    }

    pub fn cancelled(self) -> BackendResult {
        self.fail(BackendFailure::new(FailureKind::Cancelled, "deployment cancelled"))
    }

    pub fn into_stages(self) -> Vec<DeployStage> {
        self.stages
    }
}
