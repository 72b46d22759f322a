//! Process deployment backend
//!
//! Provisions an isolated interpreter environment, installs dependencies,
//! launches a single long-running process and supervises it with bounded
//! restarts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::backend::{BackendConfig, LivenessProbe, ProcessBackendConfig};
use crate::domain::backend::{
    BackendFailure, BackendHealth, BackendKind, BackendResult, BackendStatus, BackendStatusReport,
    FailureKind, ResourceHandles,
};
use crate::error::{DeployError, DeployResult};
use crate::infra::command::{CommandExecutor, CommandOutput, CommandSpec};
use crate::services::probe::EnvironmentDetector;

use super::{DeploymentBackend, StageTracker};

const KIND: BackendKind = BackendKind::Process;
const READY_POLL: Duration = Duration::from_millis(250);
const LOG_TAIL_LINES: usize = 20;

/// 启动进程所需的解析结果（重启时复用）
#[derive(Clone, Debug)]
struct Launch {
    venv_python: PathBuf,
    env: BTreeMap<String, String>,
}

enum Readiness {
    Ready,
    Exited(String),
    TimedOut,
    Cancelled,
}

struct ProcessState {
    config: RwLock<Option<ProcessBackendConfig>>,
    launch: RwLock<Option<Launch>>,
    child: Mutex<Option<Child>>,
    pid: RwLock<Option<u32>>,
    status: RwLock<BackendStatus>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    spawned_at: RwLock<Option<Instant>>,
    last_error: RwLock<Option<String>>,
    restart_count: AtomicU32,
    packages: RwLock<Vec<String>>,
    supervisor: Mutex<Option<CancellationToken>>,
}

struct Inner {
    executor: Arc<dyn CommandExecutor>,
    detector: Option<Arc<dyn EnvironmentDetector>>,
    auto_install: bool,
    http: reqwest::Client,
    state: ProcessState,
}

/// Supervised single-process backend
#[derive(Clone)]
pub struct ProcessBackend {
    inner: Arc<Inner>,
}

impl ProcessBackend {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self::build(executor, None, false)
    }

    pub fn with_detector(
        executor: Arc<dyn CommandExecutor>,
        detector: Arc<dyn EnvironmentDetector>,
        auto_install: bool,
    ) -> Self {
        Self::build(executor, Some(detector), auto_install)
    }

    fn build(
        executor: Arc<dyn CommandExecutor>,
        detector: Option<Arc<dyn EnvironmentDetector>>,
        auto_install: bool,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            inner: Arc::new(Inner {
                executor,
                detector,
                auto_install,
                http,
                state: ProcessState {
                    config: RwLock::new(None),
                    launch: RwLock::new(None),
                    child: Mutex::new(None),
                    pid: RwLock::new(None),
                    status: RwLock::new(BackendStatus::NotDeployed),
                    started_at: RwLock::new(None),
                    spawned_at: RwLock::new(None),
                    last_error: RwLock::new(None),
                    restart_count: AtomicU32::new(0),
                    packages: RwLock::new(Vec::new()),
                    supervisor: Mutex::new(None),
                },
            }),
        }
    }

    async fn run(&self, spec: CommandSpec, cancel: &CancellationToken) -> DeployResult<CommandOutput> {
        debug!(backend = %KIND, command = %spec.display(), "Running process command");
        Ok(self.inner.executor.run(&spec, cancel).await?)
    }

    async fn ensure_interpreter(&self, config: &ProcessBackendConfig) -> Result<Option<String>, BackendFailure> {
        match self.inner.detector {
            Some(ref detector) => {
                let check = detector.detect_one(KIND).await;
                if check.is_usable() {
                    return Ok(check.version);
                }
                if !self.inner.auto_install {
                    return Err(BackendFailure::new(
                        FailureKind::Install,
                        format!("interpreter unavailable ({})", check.status.as_str()),
                    )
                    .with_details(check.issues.join("; ")));
                }
                info!(backend = %KIND, "Interpreter missing, installing");
                detector
                    .auto_install(KIND, false)
                    .await
                    .map(|r| r.version)
                    .map_err(|e| BackendFailure::from(&e))
            }
            None => match self.inner.executor.which(&config.python).await {
                Some(_) => Ok(None),
                None => Err(BackendFailure::new(
                    FailureKind::Install,
                    format!("{} not found in PATH", config.python),
                )),
            },
        }
    }

    async fn validate(config: &ProcessBackendConfig) -> Result<(), BackendFailure> {
        config.validate().map_err(|e| BackendFailure::from(&e))?;
        if tokio::fs::metadata(&config.work_dir).await.is_err() {
            return Err(BackendFailure::new(
                FailureKind::Configuration,
                format!("work dir not found: {}", config.work_dir.display()),
            ));
        }
        if let Some(req) = requirements_path(config) {
            if tokio::fs::metadata(&req).await.is_err() {
                return Err(BackendFailure::new(
                    FailureKind::Configuration,
                    format!("requirements file not found: {}", req.display()),
                ));
            }
        }
        Ok(())
    }

    /// 创建或复用隔离运行环境；返回 (环境内解释器, 是否复用)
    async fn prepare_runtime(
        &self,
        config: &ProcessBackendConfig,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, bool), BackendFailure> {
        let runtime_dir = config.runtime_dir();
        let venv_python = venv_python(&runtime_dir);

        if tokio::fs::metadata(&venv_python).await.is_ok() {
            let probe = CommandSpec::new(venv_python.to_string_lossy(), ["--version"])
                .timeout(Duration::from_secs(15));
            match self.run(probe, cancel).await {
                Ok(out) if out.success() => return Ok((venv_python, true)),
                _ => {
                    warn!(
                        backend = %KIND,
                        runtime_dir = %runtime_dir.display(),
                        "Runtime environment is corrupted, recreating"
                    );
                    if let Err(e) = tokio::fs::remove_dir_all(&runtime_dir).await {
                        warn!(backend = %KIND, error = %e, "Failed to remove runtime environment");
                    }
                }
            }
        }

        let create = CommandSpec::new(config.python.clone(), ["-m", "venv"])
            .arg(runtime_dir.to_string_lossy())
            .current_dir(&config.work_dir)
            .timeout(Duration::from_secs(config.install_timeout_secs));
        let output = self
            .run(create, cancel)
            .await
            .map_err(|e| BackendFailure::from(&e))?;
        if !output.success() {
            return Err(BackendFailure::new(
                FailureKind::Install,
                "failed to create runtime environment",
            )
            .with_details(output.error_summary()));
        }
        Ok((venv_python, false))
    }

    /// 安装依赖并返回解析后的包列表
    async fn install_dependencies(
        &self,
        config: &ProcessBackendConfig,
        venv_python: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, BackendFailure> {
        let pip = |args: &[&str]| {
            let spec = CommandSpec::new(venv_python.to_string_lossy(), ["-m", "pip"])
                .current_dir(&config.work_dir)
                .timeout(Duration::from_secs(config.install_timeout_secs));
            args.iter().fold(spec, |spec, a| spec.arg(*a))
        };

        let mut installs = Vec::new();
        if let Some(req) = requirements_path(config) {
            let req = req.to_string_lossy().to_string();
            installs.push(pip(&["install", "-r", &req]));
        }
        if !config.packages.is_empty() {
            let packages: Vec<&str> = config.packages.iter().map(String::as_str).collect();
            installs.push(packages.iter().fold(pip(&["install"]), |spec, p| spec.arg(*p)));
        }

        for spec in installs {
            let line = spec.display();
            let output = self
                .run(spec, cancel)
                .await
                .map_err(|e| BackendFailure::from(&e))?;
            if !output.success() {
                return Err(BackendFailure::new(FailureKind::Install, "dependency install failed")
                    .with_details(format!("{}: {}", line, output.error_summary())));
            }
        }

        let freeze = pip(&["freeze"]);
        let packages = match self.run(freeze, cancel).await {
            Ok(out) if out.success() => out
                .stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        Ok(packages)
    }

    async fn spawn(&self, config: &ProcessBackendConfig, launch: &Launch) -> DeployResult<u32> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| DeployError::Config("process command is empty".to_string()))?;
        let program = if is_interpreter(program, config) {
            launch.venv_python.to_string_lossy().to_string()
        } else {
            program.clone()
        };

        let log_path = config.log_file();
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DeployError::environment(format!("cannot create log dir: {}", e)))?;
        }
        let stdout = open_log(&log_path).await?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| DeployError::environment(format!("cannot open log file: {}", e)))?;

        let mut cmd = Command::new(&program);
        cmd.args(args)
            .current_dir(&config.work_dir)
            .envs(&launch.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        cmd.process_group(0);

        info!(
            backend = %KIND,
            program = %program,
            log_file = %log_path.display(),
            "Launching process"
        );
        let child = cmd.spawn().map_err(|e| {
            DeployError::ServiceStartup {
                service: program.clone(),
                timeout_secs: 0,
                details: Some(format!("spawn failed: {}", e)),
            }
        })?;
        let pid = child.id().unwrap_or_default();

        if let Err(e) = tokio::fs::write(config.pid_file(), pid.to_string()).await {
            warn!(backend = %KIND, error = %e, "Failed to write pid file");
        }

        let state = &self.inner.state;
        *state.child.lock().await = Some(child);
        *state.pid.write().await = Some(pid);
        *state.spawned_at.write().await = Some(Instant::now());
        *state.started_at.write().await = Some(Utc::now());
        Ok(pid)
    }

    /// 子进程退出时回收并返回退出状态
    async fn reap(&self) -> Option<String> {
        let mut guard = self.inner.state.child.lock().await;
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                *guard = None;
                Some(status.to_string())
            }
            Ok(None) => None,
            Err(e) => Some(format!("failed to query process: {}", e)),
        }
    }

    async fn is_live(&self, config: &ProcessBackendConfig) -> bool {
        match &config.liveness {
            LivenessProbe::Http { url } => self
                .inner
                .http
                .get(url)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false),
            LivenessProbe::Tcp { host, port } => {
                matches!(
                    timeout(Duration::from_secs(3), TcpStream::connect((host.as_str(), *port))).await,
                    Ok(Ok(_))
                )
            }
            LivenessProbe::LogPattern { pattern } => tokio::fs::read_to_string(config.log_file())
                .await
                .map(|text| text.contains(pattern.as_str()))
                .unwrap_or(false),
            LivenessProbe::Uptime { secs } => self
                .inner
                .state
                .spawned_at
                .read()
                .await
                .is_some_and(|t| t.elapsed() >= Duration::from_secs(*secs)),
        }
    }

    async fn wait_ready(&self, config: &ProcessBackendConfig, cancel: &CancellationToken) -> Readiness {
        let deadline = Instant::now() + Duration::from_secs(config.startup_timeout_secs);
        loop {
            if let Some(status) = self.reap().await {
                return Readiness::Exited(status);
            }
            if self.is_live(config).await {
                return Readiness::Ready;
            }
            if Instant::now() >= deadline {
                return Readiness::TimedOut;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Readiness::Cancelled,
                _ = sleep(READY_POLL) => {}
            }
        }
    }

    /// 启动进程并等待就绪
    async fn launch(
        &self,
        config: &ProcessBackendConfig,
        launch: &Launch,
        cancel: &CancellationToken,
    ) -> Result<u32, BackendFailure> {
        let pid = self
            .spawn(config, launch)
            .await
            .map_err(|e| BackendFailure::from(&e))?;

        match self.wait_ready(config, cancel).await {
            Readiness::Ready => Ok(pid),
            Readiness::Exited(status) => Err(BackendFailure::new(
                FailureKind::Startup,
                format!("process exited during startup ({})", status),
            )
            .with_details(log_tail(&config.log_file()).await)),
            Readiness::TimedOut => {
                self.terminate(true, config.stop_timeout_secs).await;
                Err(BackendFailure::new(
                    FailureKind::Startup,
                    format!("process not live after {}s", config.startup_timeout_secs),
                )
                .with_details(log_tail(&config.log_file()).await))
            }
            Readiness::Cancelled => {
                self.terminate(true, config.stop_timeout_secs).await;
                Err(BackendFailure::new(FailureKind::Cancelled, "deployment cancelled"))
            }
        }
    }

    async fn deploy_process(
        &self,
        config: &ProcessBackendConfig,
        cancel: &CancellationToken,
    ) -> BackendResult {
        let mut stages = StageTracker::new(KIND);
        info!(backend = %KIND, work_dir = %config.work_dir.display(), "Starting process deployment");
        *self.inner.state.status.write().await = BackendStatus::Deploying;

        stages.begin("ensure_interpreter");
        match self.ensure_interpreter(config).await {
            Ok(version) => stages.finish(true, version),
            Err(failure) => return self.record_failure(stages.fail(failure)).await,
        }

        stages.begin("validate");
        if let Err(failure) = Self::validate(config).await {
            return self.record_failure(stages.fail(failure)).await;
        }
        stages.finish(true, None);

        if self.inner.state.child.lock().await.is_some() {
            stages.begin("stop_previous");
            self.stop_supervision().await;
            self.terminate(false, config.stop_timeout_secs).await;
            stages.finish(true, None);
        }

        stages.begin("prepare_runtime");
        let venv_python = match self.prepare_runtime(config, cancel).await {
            Ok((path, reused)) => {
                let note = if reused { "reused" } else { "created" };
                stages.finish(true, Some(note.to_string()));
                path
            }
            Err(failure) => return self.record_failure(stages.fail(failure)).await,
        };

        if cancel.is_cancelled() {
            return self.record_failure(stages.cancelled()).await;
        }

        let packages = if config.requirements_file.is_some() || !config.packages.is_empty() {
            stages.begin("install_dependencies");
            match self.install_dependencies(config, &venv_python, cancel).await {
                Ok(packages) => {
                    stages.finish(true, Some(format!("{} packages", packages.len())));
                    packages
                }
                Err(failure) => return self.record_failure(stages.fail(failure)).await,
            }
        } else {
            stages.skip("install_dependencies", "no dependencies declared");
            Vec::new()
        };

        let mut env = runtime_env(&venv_python);
        if config.embedded_services {
            stages.begin("embedded_services");
            match embedded_env(config).await {
                Ok(embedded) => {
                    env.extend(embedded);
                    stages.finish(true, None);
                }
                Err(e) => return self.record_failure(stages.fail(BackendFailure::from(&e))).await,
            }
        } else {
            stages.skip("embedded_services", "disabled");
        }
        env.extend(config.env.clone());
        let launch = Launch { venv_python, env };

        stages.begin("launch");
        let pid = match self.launch(config, &launch, cancel).await {
            Ok(pid) => {
                stages.finish(true, Some(format!("pid {}", pid)));
                pid
            }
            Err(failure) => return self.record_failure(stages.fail(failure)).await,
        };

        let mut result = BackendResult::succeeded(KIND, stages.into_stages());
        result.resources = ResourceHandles {
            pid: Some(pid),
            runtime_dir: Some(config.runtime_dir()),
            log_file: Some(config.log_file()),
            endpoints: endpoints(config),
            packages: packages.clone(),
            ..Default::default()
        };

        {
            let state = &self.inner.state;
            *state.config.write().await = Some(config.clone());
            *state.launch.write().await = Some(launch);
            *state.packages.write().await = packages;
            *state.status.write().await = BackendStatus::Running;
            *state.last_error.write().await = None;
        }
        self.start_supervision(config).await;

        info!(backend = %KIND, pid, duration_ms = result.total_duration_ms, "Process deployment succeeded");
        result
    }

    async fn record_failure(&self, result: BackendResult) -> BackendResult {
        let message = result.error.as_ref().map(|e| e.message.clone());
        warn!(backend = %KIND, error = ?message, "Process deployment failed");
        *self.inner.state.status.write().await = result.status;
        *self.inner.state.last_error.write().await = message;
        result
    }

    /// 终止子进程：先 TERM，超时后 kill；`force` 直接 kill
    async fn terminate(&self, force: bool, stop_timeout_secs: u64) {
        let Some(mut child) = self.inner.state.child.lock().await.take() else {
            return;
        };
        *self.inner.state.pid.write().await = None;

        if !force && self.send_term(child.id()).await {
            match timeout(Duration::from_secs(stop_timeout_secs), child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(backend = %KIND, %status, "Process exited after TERM");
                    return;
                }
                _ => warn!(backend = %KIND, "Process ignored TERM, killing"),
            }
        }

        if let Err(e) = child.kill().await {
            debug!(backend = %KIND, error = %e, "Kill failed (process may have exited)");
        }
    }

    #[cfg(unix)]
    async fn send_term(&self, pid: Option<u32>) -> bool {
        let Some(pid) = pid else {
            return false;
        };
        let spec = CommandSpec::new("kill", ["-TERM".to_string(), pid.to_string()])
            .timeout(Duration::from_secs(5));
        matches!(self.run(spec, &CancellationToken::new()).await, Ok(out) if out.success())
    }

    #[cfg(not(unix))]
    async fn send_term(&self, _pid: Option<u32>) -> bool {
        false
    }

    async fn start_supervision(&self, config: &ProcessBackendConfig) {
        let token = CancellationToken::new();
        if let Some(old) = self.inner.state.supervisor.lock().await.replace(token.clone()) {
            old.cancel();
        }

        let this = self.clone();
        let interval = Duration::from_secs(config.health_interval_secs.max(1));
        let mut policy = RestartPolicy::new(config.max_restarts, config.restart_backoff_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {}
                }
                if this.supervise_tick(&mut policy, &token).await == Supervision::GaveUp {
                    break;
                }
            }
            debug!(backend = %KIND, "Process supervision stopped");
        });
    }

    /// 一轮监督：进程意外退出时按策略重启，直到重启成功或次数用尽
    async fn supervise_tick(&self, policy: &mut RestartPolicy, cancel: &CancellationToken) -> Supervision {
        let Some(exit) = self.reap().await else {
            return Supervision::Alive;
        };
        warn!(backend = %KIND, exit = %exit, "Process exited unexpectedly");
        *self.inner.state.last_error.write().await = Some(format!("process exited: {}", exit));

        let config = self.inner.state.config.read().await.clone();
        let launch = self.inner.state.launch.read().await.clone();
        let (Some(config), Some(launch)) = (config, launch) else {
            *self.inner.state.status.write().await = BackendStatus::Failed;
            return Supervision::GaveUp;
        };

        // 重启失败时子进程已被回收，必须在本轮内继续重试
        loop {
            let Some(delay) = policy.next_delay() else {
                warn!(backend = %KIND, max_restarts = policy.max_restarts, "Restart limit reached, marking failed");
                *self.inner.state.status.write().await = BackendStatus::Failed;
                return Supervision::GaveUp;
            };

            *self.inner.state.status.write().await = BackendStatus::Degraded;
            tokio::select! {
                _ = cancel.cancelled() => return Supervision::Alive,
                _ = sleep(delay) => {}
            }

            self.inner.state.restart_count.fetch_add(1, Ordering::Relaxed);
            match self.launch(&config, &launch, cancel).await {
                Ok(pid) => {
                    info!(backend = %KIND, pid, attempt = policy.failures, "Process restarted");
                    *self.inner.state.status.write().await = BackendStatus::Running;
                    return Supervision::Restarted;
                }
                Err(failure) if failure.kind == FailureKind::Cancelled => return Supervision::Alive,
                Err(failure) => {
                    warn!(
                        backend = %KIND,
                        attempt = policy.failures,
                        error = %failure.message,
                        "Process restart failed"
                    );
                    *self.inner.state.last_error.write().await = Some(failure.message);
                }
            }
        }
    }

    async fn stop_supervision(&self) {
        if let Some(token) = self.inner.state.supervisor.lock().await.take() {
            token.cancel();
        }
    }
}

#[derive(Debug, PartialEq)]
enum Supervision {
    Alive,
    Restarted,
    GaveUp,
}

/// 线性退避的重启策略：第 n 次重启前等待 n * backoff
#[derive(Debug)]
struct RestartPolicy {
    max_restarts: u32,
    backoff_secs: u64,
    failures: u32,
}

impl RestartPolicy {
    fn new(max_restarts: u32, backoff_secs: u64) -> Self {
        Self {
            max_restarts,
            backoff_secs,
            failures: 0,
        }
    }

    fn next_delay(&mut self) -> Option<Duration> {
        if self.failures >= self.max_restarts {
            return None;
        }
        self.failures += 1;
        Some(Duration::from_secs(self.backoff_secs * u64::from(self.failures)))
    }
}

#[async_trait]
impl DeploymentBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn deploy(&self, config: &BackendConfig, cancel: &CancellationToken) -> BackendResult {
        match config {
            BackendConfig::Process(config) => self.deploy_process(config, cancel).await,
            other => BackendResult::failed(
                KIND,
                Vec::new(),
                BackendFailure::new(
                    FailureKind::Configuration,
                    format!("expected process config, got {}", other.kind()),
                ),
            ),
        }
    }

    async fn stop(&self, force: bool) -> DeployResult<()> {
        self.stop_supervision().await;
        let Some(config) = self.inner.state.config.read().await.clone() else {
            return Ok(());
        };

        info!(backend = %KIND, force, "Stopping process");
        self.terminate(force, config.stop_timeout_secs).await;

        if let Err(e) = tokio::fs::remove_file(config.pid_file()).await {
            debug!(backend = %KIND, error = %e, "Pid file not removed");
        }
        let state = &self.inner.state;
        *state.status.write().await = BackendStatus::Stopped;
        *state.started_at.write().await = None;
        *state.spawned_at.write().await = None;
        Ok(())
    }

    async fn restart(&self, force_rebuild: bool, cancel: &CancellationToken) -> BackendResult {
        let Some(config) = self.inner.state.config.read().await.clone() else {
            return BackendResult::failed(
                KIND,
                Vec::new(),
                BackendFailure::new(FailureKind::Configuration, "no previous process deployment"),
            );
        };
        self.inner.state.restart_count.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.stop(false).await {
            warn!(backend = %KIND, error = %e, "Stop before restart failed");
        }
        if force_rebuild {
            if let Err(e) = tokio::fs::remove_dir_all(config.runtime_dir()).await {
                debug!(backend = %KIND, error = %e, "Runtime environment not removed");
            }
        }
        self.deploy_process(&config, cancel).await
    }

    async fn status(&self) -> BackendStatusReport {
        let state = &self.inner.state;
        let config = state.config.read().await.clone();
        BackendStatusReport {
            backend: KIND,
            status: *state.status.read().await,
            started_at: *state.started_at.read().await,
            restart_count: state.restart_count.load(Ordering::Relaxed),
            last_error: state.last_error.read().await.clone(),
            units: Vec::new(),
            resources: ResourceHandles {
                pid: *state.pid.read().await,
                runtime_dir: config.as_ref().map(ProcessBackendConfig::runtime_dir),
                log_file: config.as_ref().map(ProcessBackendConfig::log_file),
                endpoints: config.as_ref().map(endpoints).unwrap_or_default(),
                packages: state.packages.read().await.clone(),
                ..Default::default()
            },
        }
    }

    async fn health(&self) -> BackendHealth {
        let Some(config) = self.inner.state.config.read().await.clone() else {
            return BackendHealth::new(KIND, false, BackendStatus::NotDeployed)
                .with_detail("no active deployment");
        };

        let started = Instant::now();
        let alive = self.inner.state.child.lock().await.as_mut().is_some_and(|c| matches!(c.try_wait(), Ok(None)));
        let mut health = if !alive {
            BackendHealth::new(KIND, false, BackendStatus::Failed).with_detail("process not running")
        } else if self.is_live(&config).await {
            BackendHealth::new(KIND, true, BackendStatus::Running)
        } else {
            BackendHealth::new(KIND, false, BackendStatus::Degraded).with_detail("liveness check failed")
        };
        health.latency_ms = started.elapsed().as_millis() as i64;
        health.units_total = 1;
        health.units_healthy = usize::from(health.healthy);
        health
    }
}

fn requirements_path(config: &ProcessBackendConfig) -> Option<PathBuf> {
    config.requirements_file.as_ref().map(|req| {
        if req.is_relative() {
            config.work_dir.join(req)
        } else {
            req.clone()
        }
    })
}

fn venv_python(runtime_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        runtime_dir.join("Scripts").join("python.exe")
    } else {
        runtime_dir.join("bin").join("python")
    }
}

fn is_interpreter(program: &str, config: &ProcessBackendConfig) -> bool {
    program == config.python || program == "python" || program == "python3"
}

/// 隔离环境的基础环境变量
fn runtime_env(venv_python: &Path) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let Some(bin_dir) = venv_python.parent() else {
        return env;
    };
    if let Some(root) = bin_dir.parent() {
        env.insert("VIRTUAL_ENV".to_string(), root.to_string_lossy().to_string());
    }
    let current = std::env::var_os("PATH").unwrap_or_default();
    let paths = std::iter::once(bin_dir.to_path_buf()).chain(std::env::split_paths(&current));
    if let Ok(joined) = std::env::join_paths(paths) {
        env.insert("PATH".to_string(), joined.to_string_lossy().to_string());
    }
    env
}

/// 内嵌替代服务：本地 SQLite 与内存缓存/消息队列
async fn embedded_env(config: &ProcessBackendConfig) -> DeployResult<BTreeMap<String, String>> {
    let data_dir = config.data_dir();
    tokio::fs::create_dir_all(&data_dir)
        .await
        .map_err(|e| DeployError::environment(format!("cannot create data dir {}: {}", data_dir.display(), e)))?;

    let db = data_dir.join("app.db");
    Ok(BTreeMap::from([
        ("DATABASE_URL".to_string(), format!("sqlite:///{}", db.display())),
        ("CACHE_URL".to_string(), "locmem://".to_string()),
        ("REDIS_URL".to_string(), "memory://".to_string()),
        ("CELERY_BROKER_URL".to_string(), "memory://".to_string()),
        ("DATA_DIR".to_string(), data_dir.to_string_lossy().to_string()),
    ]))
}

fn endpoints(config: &ProcessBackendConfig) -> Vec<String> {
    match &config.liveness {
        LivenessProbe::Http { url } => vec![url.clone()],
        LivenessProbe::Tcp { host, port } => vec![format!("tcp://{}:{}", host, port)],
        _ => Vec::new(),
    }
}

async fn open_log(path: &Path) -> DeployResult<std::fs::File> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| DeployError::environment(format!("cannot open log file {}: {}", path.display(), e)))?;
    Ok(file.into_std().await)
}

async fn log_tail(path: &Path) -> String {
    let text = tokio::fs::read_to_string(path).await.unwrap_or_default();
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(LOG_TAIL_LINES)..].join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::FakeExecutor;

    fn python_host() -> FakeExecutor {
        FakeExecutor::new()
            .with_program("python3")
            .respond("-m venv", CommandOutput::ok(""))
            .respond("pip install", CommandOutput::ok(""))
            .respond("pip freeze", CommandOutput::ok("flask==3.0.0\n# comment\nitsdangerous==2.1.2\n"))
    }

    fn config(dir: &Path, command: &[&str]) -> ProcessBackendConfig {
        let mut config =
            ProcessBackendConfig::new(dir, command.iter().map(|s| s.to_string()).collect());
        config.python = "python3".into();
        config.liveness = LivenessProbe::Uptime { secs: 0 };
        config.startup_timeout_secs = 5;
        config.health_interval_secs = 3600;
        config.stop_timeout_secs = 1;
        config
    }

    async fn deploy(backend: &ProcessBackend, config: ProcessBackendConfig) -> BackendResult {
        backend
            .deploy(&BackendConfig::Process(config), &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_deploy_installs_and_launches() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), &["sleep", "30"]);
        cfg.packages = vec!["flask".into()];
        let executor = Arc::new(python_host());
        let backend = ProcessBackend::new(executor.clone());

        let result = deploy(&backend, cfg.clone()).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.resources.packages, vec!["flask==3.0.0", "itsdangerous==2.1.2"]);
        let pid = result.resources.pid.unwrap();
        let written = std::fs::read_to_string(cfg.pid_file()).unwrap();
        assert_eq!(written, pid.to_string());
        assert_eq!(executor.calls_matching("pip install flask"), 1);
        assert!(backend.health().await.healthy);

        backend.stop(true).await.unwrap();
        assert_eq!(backend.status().await.status, BackendStatus::Stopped);
        assert!(!cfg.pid_file().exists());
    }

    #[tokio::test]
    async fn test_valid_runtime_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &["sleep", "30"]);
        let py = venv_python(&cfg.runtime_dir());
        std::fs::create_dir_all(py.parent().unwrap()).unwrap();
        std::fs::write(&py, "").unwrap();
        let executor = Arc::new(python_host().respond("--version", CommandOutput::ok("Python 3.11.4")));
        let backend = ProcessBackend::new(executor.clone());

        let result = deploy(&backend, cfg).await;

        assert!(result.success);
        assert_eq!(executor.calls_matching("-m venv"), 0);
        let stage = result.stages.iter().find(|s| s.name == "prepare_runtime").unwrap();
        assert_eq!(stage.message.as_deref(), Some("reused"));
        backend.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_runtime_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &["sleep", "30"]);
        let py = venv_python(&cfg.runtime_dir());
        std::fs::create_dir_all(py.parent().unwrap()).unwrap();
        std::fs::write(&py, "").unwrap();
        let executor =
            Arc::new(python_host().respond("--version", CommandOutput::failed(1, "bad interpreter")));
        let backend = ProcessBackend::new(executor.clone());

        let result = deploy(&backend, cfg.clone()).await;

        assert!(result.success);
        assert_eq!(executor.calls_matching("-m venv"), 1);
        assert!(!cfg.runtime_dir().exists());
        backend.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_early_exit_is_startup_failure_with_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), &["sh", "-c", "echo boom; exit 3"]);
        cfg.liveness = LivenessProbe::Uptime { secs: 3 };
        let backend = ProcessBackend::new(Arc::new(python_host()));

        let result = deploy(&backend, cfg).await;

        let failure = result.error.unwrap();
        assert_eq!(failure.kind, FailureKind::Startup);
        assert!(failure.details.unwrap().contains("boom"));
        assert_eq!(backend.status().await.status, BackendStatus::Failed);
    }

    #[tokio::test]
    async fn test_embedded_services_env_and_user_override() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(
            dir.path(),
            &["sh", "-c", "echo db=$DATABASE_URL; echo broker=$CELERY_BROKER_URL; echo cache=$CACHE_URL; sleep 30"],
        );
        cfg.embedded_services = true;
        cfg.env.insert("CACHE_URL".into(), "redis://custom-cache".into());
        cfg.liveness = LivenessProbe::LogPattern {
            pattern: "cache=".into(),
        };
        let backend = ProcessBackend::new(Arc::new(python_host()));

        let result = deploy(&backend, cfg.clone()).await;
        assert!(result.success, "{:?}", result.error);

        let log = std::fs::read_to_string(cfg.log_file()).unwrap();
        assert!(log.contains("db=sqlite:///"));
        assert!(log.contains("broker=memory://"));
        assert!(log.contains("cache=redis://custom-cache"));
        assert!(cfg.data_dir().is_dir());
        backend.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_install_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::new(Arc::new(FakeExecutor::new()));
        let result = deploy(&backend, config(dir.path(), &["sleep", "1"])).await;
        assert_eq!(result.error.unwrap().kind, FailureKind::Install);
    }

    #[tokio::test]
    async fn test_missing_requirements_is_configuration_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), &["sleep", "1"]);
        cfg.requirements_file = Some("requirements.txt".into());
        let executor = Arc::new(python_host());
        let backend = ProcessBackend::new(executor.clone());

        let result = deploy(&backend, cfg).await;

        assert_eq!(result.error.unwrap().kind, FailureKind::Configuration);
        assert_eq!(executor.calls_matching("-m venv"), 0);
    }

    #[test]
    fn test_restart_policy_linear_backoff() {
        let mut policy = RestartPolicy::new(3, 5);
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(5)));
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(15)));
        assert_eq!(policy.next_delay(), None);
    }

    #[tokio::test]
    async fn test_supervision_restarts_then_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), &["sh", "-c", "sleep 0.2"]);
        cfg.max_restarts = 1;
        cfg.restart_backoff_secs = 0;
        let backend = ProcessBackend::new(Arc::new(python_host()));
        assert!(deploy(&backend, cfg).await.success);

        let cancel = CancellationToken::new();
        let mut policy = RestartPolicy::new(1, 0);

        sleep(Duration::from_millis(600)).await;
        assert_eq!(backend.supervise_tick(&mut policy, &cancel).await, Supervision::Restarted);
        assert_eq!(backend.status().await.restart_count, 1);

        sleep(Duration::from_millis(600)).await;
        assert_eq!(backend.supervise_tick(&mut policy, &cancel).await, Supervision::GaveUp);
        assert_eq!(backend.status().await.status, BackendStatus::Failed);
    }

    #[tokio::test]
    async fn test_supervision_keeps_retrying_failed_relaunches_until_failed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("started-once");
        let script = format!(
            "if [ -f {m} ]; then exit 1; fi; touch {m}; sleep 1.5",
            m = marker.display()
        );
        let mut cfg = config(dir.path(), &["sh", "-c", &script]);
        cfg.liveness = LivenessProbe::Uptime { secs: 1 };
        let backend = ProcessBackend::new(Arc::new(python_host()));
        assert!(deploy(&backend, cfg).await.success);

        let cancel = CancellationToken::new();
        let mut policy = RestartPolicy::new(3, 0);

        sleep(Duration::from_millis(1200)).await;
        assert_eq!(backend.supervise_tick(&mut policy, &cancel).await, Supervision::GaveUp);

        let status = backend.status().await;
        assert_eq!(status.status, BackendStatus::Failed);
        assert_eq!(status.restart_count, 3);
        assert_eq!(policy.next_delay(), None);
    }

    #[tokio::test]
    async fn test_graceful_stop_falls_back_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(python_host().respond("kill -TERM", CommandOutput::failed(1, "denied")));
        let backend = ProcessBackend::new(executor.clone());
        assert!(deploy(&backend, config(dir.path(), &["sleep", "30"])).await.success);

        backend.stop(false).await.unwrap();

        assert_eq!(executor.calls_matching("kill -TERM"), 1);
        assert_eq!(backend.status().await.resources.pid, None);
    }

    #[tokio::test]
    async fn test_stop_before_deploy_is_noop() {
        let backend = ProcessBackend::new(Arc::new(FakeExecutor::new()));
        backend.stop(false).await.unwrap();
        assert_eq!(backend.status().await.status, BackendStatus::NotDeployed);
    }
}
