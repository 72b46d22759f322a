//! 测试替身：脚本化命令执行器、固定结果探测器、脚本化后端

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::backend::{
    BackendConfig, BackendConfigs, ContainerBackendConfig, ProcessBackendConfig,
};
use crate::config::env::OrchestratorConfig;
use crate::domain::backend::{
    BackendCheckResult, BackendFailure, BackendHealth, BackendKind, BackendResult, BackendStatus,
    BackendStatusReport, CheckStatus, FailureKind, ResourceHandles,
};
use crate::domain::system::{OsFamily, PackageManager, SystemProfile};
use crate::error::{DeployError, DeployResult};
use crate::infra::command::{CommandError, CommandExecutor, CommandOutput, CommandSpec};
use crate::services::backend::{registry, DeploymentBackend};
use crate::services::coordinator::Coordinator;
use crate::services::probe::{EnvironmentDetector, InstallResult};
use crate::services::telemetry::DeploymentTelemetry;
use crate::state::{AppState, HistoryStore};

/// 脚本化命令执行器
///
/// 按命令行子串匹配响应，后注册的规则优先；未匹配的命令返回 127。
#[derive(Default)]
pub struct FakeExecutor {
    rules: Mutex<Vec<(String, CommandOutput)>>,
    queued: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    programs: Mutex<HashMap<String, PathBuf>>,
    calls: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(self, name: &str) -> Self {
        self.programs
            .lock()
            .unwrap()
            .insert(name.to_string(), PathBuf::from(format!("/usr/bin/{}", name)));
        self
    }

    pub fn respond(self, pattern: &str, output: CommandOutput) -> Self {
        self.rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), output));
        self
    }

    /// 一次性响应，优先于常规规则，按注册顺序消费
    pub fn respond_once(self, pattern: &str, output: CommandOutput) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(pattern.to_string())
            .or_default()
            .push_back(output);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        let line = spec.display();
        self.calls.lock().unwrap().push(line.clone());
        if cancel.is_cancelled() {
            return Err(CommandError::Cancelled);
        }

        {
            let mut queued = self.queued.lock().unwrap();
            let mut keys: Vec<&String> = queued
                .keys()
                .filter(|k| line.contains(k.as_str()) && !queued[*k].is_empty())
                .collect();
            keys.sort_by_key(|k| std::cmp::Reverse(k.len()));
            if let Some(key) = keys.first().map(|k| (*k).clone()) {
                if let Some(output) = queued.get_mut(&key).and_then(VecDeque::pop_front) {
                    return Ok(output);
                }
            }
        }

        let rules = self.rules.lock().unwrap();
        Ok(rules
            .iter()
            .rev()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput::failed(127, format!("not scripted: {}", line))))
    }

    async fn which(&self, program: &str) -> Option<PathBuf> {
        self.calls.lock().unwrap().push(format!("which {}", program));
        self.programs.lock().unwrap().get(program).cloned()
    }
}

/// 标准测试用系统画像
pub fn linux_profile() -> SystemProfile {
    SystemProfile {
        hostname: "test-host".into(),
        os_family: OsFamily::Linux,
        os_version: "12".into(),
        arch: "x86_64".into(),
        cpu_cores: 4,
        total_memory_gb: 16.0,
        available_memory_gb: 8.0,
        available_disk_gb: 100.0,
        is_admin: true,
        package_managers: vec![PackageManager::AptGet],
        collected_at: Utc::now(),
    }
}

/// 固定结果的环境探测器
pub struct FakeDetector {
    pub profile: SystemProfile,
    results: Mutex<BTreeMap<BackendKind, BackendCheckResult>>,
    pub detect_calls: AtomicUsize,
}

impl FakeDetector {
    pub fn new(results: Vec<BackendCheckResult>) -> Self {
        Self {
            profile: linux_profile(),
            results: Mutex::new(results.into_iter().map(|r| (r.kind, r)).collect()),
            detect_calls: AtomicUsize::new(0),
        }
    }

    /// 两个后端都可用
    pub fn all_available(score: i32) -> Self {
        Self::new(
            BackendKind::ALL
                .into_iter()
                .map(|k| check(k, score))
                .collect(),
        )
    }
}

/// 构造探测结果
pub fn check(kind: BackendKind, score: i32) -> BackendCheckResult {
    let mut result = BackendCheckResult::scored(kind, score, 70, 40, CheckStatus::NotFound);
    result.version = Some("1.0.0".into());
    result
}

#[async_trait]
impl EnvironmentDetector for FakeDetector {
    async fn system_profile(&self) -> DeployResult<SystemProfile> {
        Ok(self.profile.clone())
    }

    async fn detect_all(&self, _force_refresh: bool) -> BTreeMap<BackendKind, BackendCheckResult> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        self.results.lock().unwrap().clone()
    }

    async fn detect_one(&self, kind: BackendKind) -> BackendCheckResult {
        self.results
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| BackendCheckResult::unavailable(kind, CheckStatus::NotFound, "missing"))
    }

    async fn auto_install(&self, kind: BackendKind, _force: bool) -> DeployResult<InstallResult> {
        Err(DeployError::install(kind.as_str(), "none", "installation disabled in tests"))
    }

    async fn invalidate(&self) {}
}

/// 脚本化后端的行为
#[derive(Clone, Debug)]
pub enum Script {
    Succeed,
    Fail(FailureKind),
}

/// 脚本化部署后端
pub struct FakeBackend {
    kind: BackendKind,
    deploy_script: Mutex<VecDeque<Script>>,
    default_deploy: Script,
    restart_script: Mutex<VecDeque<Script>>,
    health_script: Mutex<VecDeque<bool>>,
    healthy_default: Mutex<bool>,
    status: Mutex<BackendStatus>,
    pub deploy_calls: AtomicUsize,
    pub restart_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub health_calls: AtomicUsize,
    /// deploy 前等待的取消信号（用于测试并发）
    pub block_until_cancelled: Mutex<bool>,
}

impl FakeBackend {
    pub fn new(kind: BackendKind) -> Arc<Self> {
        Self::build(kind, Script::Succeed)
    }

    pub fn failing(kind: BackendKind, failure: FailureKind) -> Arc<Self> {
        Self::build(kind, Script::Fail(failure))
    }

    fn build(kind: BackendKind, default_deploy: Script) -> Arc<Self> {
        Arc::new(Self {
            kind,
            deploy_script: Mutex::new(VecDeque::new()),
            default_deploy,
            restart_script: Mutex::new(VecDeque::new()),
            health_script: Mutex::new(VecDeque::new()),
            healthy_default: Mutex::new(true),
            status: Mutex::new(BackendStatus::NotDeployed),
            deploy_calls: AtomicUsize::new(0),
            restart_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            health_calls: AtomicUsize::new(0),
            block_until_cancelled: Mutex::new(false),
        })
    }

    pub fn script_deploys(&self, scripts: Vec<Script>) {
        self.deploy_script.lock().unwrap().extend(scripts);
    }

    pub fn script_restarts(&self, scripts: Vec<Script>) {
        self.restart_script.lock().unwrap().extend(scripts);
    }

    pub fn script_health(&self, results: Vec<bool>) {
        self.health_script.lock().unwrap().extend(results);
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy_default.lock().unwrap() = healthy;
    }

    pub fn block_deploys(&self) {
        *self.block_until_cancelled.lock().unwrap() = true;
    }

    pub fn deploys(&self) -> usize {
        self.deploy_calls.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.restart_calls.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    fn outcome(&self, script: Script) -> BackendResult {
        match script {
            Script::Succeed => {
                *self.status.lock().unwrap() = BackendStatus::Running;
                let mut result = BackendResult::succeeded(self.kind, Vec::new());
                result.resources = ResourceHandles {
                    endpoints: vec![format!("fake://{}", self.kind)],
                    ..Default::default()
                };
                result
            }
            Script::Fail(kind) => {
                *self.status.lock().unwrap() = BackendStatus::Failed;
                BackendResult::failed(
                    self.kind,
                    Vec::new(),
                    BackendFailure::new(kind, format!("{} scripted failure", self.kind)),
                )
            }
        }
    }
}

#[async_trait]
impl DeploymentBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn deploy(&self, _config: &BackendConfig, cancel: &CancellationToken) -> BackendResult {
        self.deploy_calls.fetch_add(1, Ordering::SeqCst);
        let block = *self.block_until_cancelled.lock().unwrap();
        if block {
            cancel.cancelled().await;
            *self.status.lock().unwrap() = BackendStatus::Failed;
            return BackendResult::failed(
                self.kind,
                Vec::new(),
                BackendFailure::new(FailureKind::Cancelled, "cancelled"),
            );
        }
        let script = self
            .deploy_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_deploy.clone());
        self.outcome(script)
    }

    async fn stop(&self, _force: bool) -> DeployResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        *self.status.lock().unwrap() = BackendStatus::Stopped;
        Ok(())
    }

    async fn restart(&self, _force_rebuild: bool, _cancel: &CancellationToken) -> BackendResult {
        self.restart_calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .restart_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Succeed);
        if matches!(script, Script::Succeed) {
            *self.healthy_default.lock().unwrap() = true;
        }
        self.outcome(script)
    }

    async fn status(&self) -> BackendStatusReport {
        BackendStatusReport {
            backend: self.kind,
            status: *self.status.lock().unwrap(),
            started_at: None,
            restart_count: self.restarts() as u32,
            last_error: None,
            units: Vec::new(),
            resources: ResourceHandles::default(),
        }
    }

    async fn health(&self) -> BackendHealth {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        let healthy = self
            .health_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| *self.healthy_default.lock().unwrap());
        let status = if healthy {
            BackendStatus::Running
        } else {
            BackendStatus::Degraded
        };
        BackendHealth::new(self.kind, healthy, status)
    }
}

/// 测试用 API 密钥
pub const TEST_API_KEY: &str = "test-key";

/// 两个后端都已配置的部署配置
pub fn both_backend_configs() -> BackendConfigs {
    BackendConfigs {
        container: Some(ContainerBackendConfig::new("/srv/app/docker-compose.yml")),
        process: Some(ProcessBackendConfig::new(
            "/srv/app",
            vec!["python".to_string(), "app.py".to_string()],
        )),
    }
}

/// 基于脚本化后端的应用状态（HTTP handler 测试用）
pub fn test_app_state() -> (Arc<AppState>, Arc<FakeBackend>, Arc<FakeBackend>) {
    let config = OrchestratorConfig {
        api_key: TEST_API_KEY.to_string(),
        retry_delay: std::time::Duration::ZERO,
        ..OrchestratorConfig::default()
    };
    let container = FakeBackend::new(BackendKind::Container);
    let process = FakeBackend::new(BackendKind::Process);
    let detector: Arc<dyn EnvironmentDetector> = Arc::new(FakeDetector::all_available(90));

    let coordinator = Coordinator::new(
        config.clone(),
        registry(vec![
            container.clone() as Arc<dyn DeploymentBackend>,
            process.clone() as Arc<dyn DeploymentBackend>,
        ]),
        detector.clone(),
        DeploymentTelemetry::in_memory(config.telemetry.clone()),
        Arc::new(HistoryStore::new(None)),
        both_backend_configs(),
    );
    let state = AppState::new(Arc::new(config), coordinator, detector);
    (Arc::new(state), container, process)
}
