//! Container (compose stack) deployment backend
//!
//! Deploys a multi-unit stack through `docker compose` / `docker-compose`,
//! waits for every unit to be running and healthy, and supervises it with a
//! background health loop that performs one bounded auto-restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::backend::{BackendConfig, ContainerBackendConfig, SmokeCheck};
use crate::domain::backend::{
    BackendFailure, BackendHealth, BackendKind, BackendResult, BackendStatus, BackendStatusReport,
    FailureKind, ResourceHandles,
};
use crate::domain::container::{parse_compose_ps, parse_stats_line, UnitInfo};
use crate::error::{DeployError, DeploymentErrorKind, DeployResult};
use crate::infra::command::{CommandError, CommandExecutor, CommandOutput, CommandSpec};
use crate::services::probe::EnvironmentDetector;

use super::{DeploymentBackend, StageTracker};

const KIND: BackendKind = BackendKind::Container;

/// Compose invocation (`docker-compose` or `docker compose`)
#[derive(Clone, Debug, PartialEq)]
struct ComposeCommand {
    program: String,
    base_args: Vec<String>,
}

/// Result of waiting for the stack to become healthy
enum Readiness {
    Ready(Vec<UnitInfo>),
    Partial { units: Vec<UnitInfo>, healthy: usize },
    Cancelled,
}

struct ContainerState {
    config: RwLock<Option<ContainerBackendConfig>>,
    compose: RwLock<Option<ComposeCommand>>,
    status: RwLock<BackendStatus>,
    units: RwLock<Vec<UnitInfo>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    restart_count: AtomicU32,
    supervisor: Mutex<Option<CancellationToken>>,
}

struct Inner {
    executor: Arc<dyn CommandExecutor>,
    detector: Option<Arc<dyn EnvironmentDetector>>,
    auto_install: bool,
    http: reqwest::Client,
    state: ContainerState,
}

/// Compose-based deployment backend
#[derive(Clone)]
pub struct ContainerBackend {
    inner: Arc<Inner>,
}

impl ContainerBackend {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self::build(executor, None, false)
    }

    /// 通过环境探测器校验运行时，`auto_install` 时缺失则自动安装
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
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            inner: Arc::new(Inner {
                executor,
                detector,
                auto_install,
                http,
                state: ContainerState {
                    config: RwLock::new(None),
                    compose: RwLock::new(None),
                    status: RwLock::new(BackendStatus::NotDeployed),
                    units: RwLock::new(Vec::new()),
                    started_at: RwLock::new(None),
                    last_error: RwLock::new(None),
                    restart_count: AtomicU32::new(0),
                    supervisor: Mutex::new(None),
                },
            }),
        }
    }

    async fn run(&self, spec: CommandSpec, cancel: &CancellationToken) -> DeployResult<CommandOutput> {
        debug!(backend = %KIND, command = %spec.display(), "Running container command");
        Ok(self.inner.executor.run(&spec, cancel).await?)
    }

    /// Detect which compose command to use
    async fn compose_command(&self) -> ComposeCommand {
        if let Some(cmd) = self.inner.state.compose.read().await.clone() {
            return cmd;
        }
        let cmd = if self.inner.executor.which("docker-compose").await.is_some() {
            ComposeCommand {
                program: "docker-compose".to_string(),
                base_args: Vec::new(),
            }
        } else {
            ComposeCommand {
                program: "docker".to_string(),
                base_args: vec!["compose".to_string()],
            }
        };
        *self.inner.state.compose.write().await = Some(cmd.clone());
        cmd
    }

    async fn compose_spec(
        &self,
        config: &ContainerBackendConfig,
        args: &[&str],
        timeout_secs: u64,
    ) -> CommandSpec {
        let compose = self.compose_command().await;
        let mut spec = CommandSpec::new(compose.program, compose.base_args)
            .arg("-f")
            .arg(config.resolved_compose_file().to_string_lossy().to_string());
        if let Some(ref project) = config.project_name {
            spec = spec.arg("-p").arg(project.clone());
        }
        if let Some(ref env_file) = config.env_file {
            spec = spec
                .arg("--env-file")
                .arg(env_file.to_string_lossy().to_string());
        }
        for arg in args {
            spec = spec.arg(*arg);
        }
        if let Some(dir) = config.effective_work_dir() {
            spec = spec.current_dir(dir);
        }
        spec.timeout(Duration::from_secs(timeout_secs))
    }

    fn with_services<'a>(config: &'a ContainerBackendConfig, mut args: Vec<&'a str>) -> Vec<String> {
        args.extend(config.services.iter().map(String::as_str));
        args.into_iter().map(str::to_string).collect()
    }

    async fn compose(
        &self,
        config: &ContainerBackendConfig,
        args: Vec<String>,
        timeout_secs: u64,
        cancel: &CancellationToken,
    ) -> DeployResult<CommandOutput> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let spec = self.compose_spec(config, &args, timeout_secs).await;
        self.run(spec, cancel).await
    }

    /// Make sure the container runtime is usable, installing it when allowed
    async fn ensure_runtime(&self) -> Result<Option<String>, BackendFailure> {
        match self.inner.detector {
            Some(ref detector) => {
                let check = detector.detect_one(KIND).await;
                if check.is_usable() {
                    return Ok(check.version);
                }
                if !self.inner.auto_install {
                    return Err(BackendFailure::new(
                        FailureKind::Install,
                        format!("container runtime unavailable ({})", check.status.as_str()),
                    )
                    .with_details(check.issues.join("; ")));
                }
                info!(backend = %KIND, "Container runtime missing, installing");
                detector
                    .auto_install(KIND, false)
                    .await
                    .map(|r| r.version)
                    .map_err(|e| BackendFailure::from(&e))
            }
            None => match self.inner.executor.which("docker").await {
                Some(_) => Ok(None),
                None => Err(BackendFailure::new(
                    FailureKind::Install,
                    "docker not found in PATH",
                )),
            },
        }
    }

    async fn validate(
        &self,
        config: &ContainerBackendConfig,
        cancel: &CancellationToken,
    ) -> Result<(), BackendFailure> {
        config.validate().map_err(|e| BackendFailure::from(&e))?;

        let path = config.resolved_compose_file();
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(BackendFailure::new(
                FailureKind::Configuration,
                format!("compose file not found: {}", path.display()),
            ));
        }

        let output = self
            .compose(config, vec!["config".into(), "-q".into()], 30, cancel)
            .await
            .map_err(|e| BackendFailure::from(&e))?;
        if !output.success() {
            return Err(BackendFailure::new(
                FailureKind::Configuration,
                "compose file failed validation",
            )
            .with_details(output.error_summary()));
        }
        Ok(())
    }

    /// Current unit list from `compose ps`
    async fn list_units(
        &self,
        config: &ContainerBackendConfig,
        cancel: &CancellationToken,
    ) -> DeployResult<Vec<UnitInfo>> {
        let output = self
            .compose(
                config,
                vec!["ps".into(), "-a".into(), "--format".into(), "json".into()],
                30,
                cancel,
            )
            .await?;
        if !output.success() {
            return Err(DeployError::deployment(
                KIND,
                DeploymentErrorKind::Transient,
                format!("compose ps failed: {}", output.error_summary()),
            ));
        }
        let mut units = parse_compose_ps(&output.stdout).map_err(|e| {
            DeployError::deployment(
                KIND,
                DeploymentErrorKind::Transient,
                format!("unreadable compose ps output: {}", e),
            )
        })?;
        if !config.services.is_empty() {
            units.retain(|u| config.services.contains(&u.service));
        }
        Ok(units)
    }

    /// Poll until every unit is running and healthy, or the startup timeout elapses
    async fn wait_for_units(
        &self,
        config: &ContainerBackendConfig,
        cancel: &CancellationToken,
    ) -> Readiness {
        let deadline = Instant::now() + Duration::from_secs(config.startup_timeout_secs);
        let poll = Duration::from_secs(config.poll_interval_secs.max(1));
        let mut last = Vec::new();

        loop {
            match self.list_units(config, cancel).await {
                Ok(units) => {
                    let healthy = units.iter().filter(|u| u.is_healthy()).count();
                    if !units.is_empty() && healthy == units.len() {
                        return Readiness::Ready(units);
                    }
                    debug!(backend = %KIND, healthy, total = units.len(), "Waiting for units");
                    last = units;
                }
                Err(DeployError::Command(CommandError::Cancelled)) => {
                    return Readiness::Cancelled;
                }
                Err(e) => warn!(backend = %KIND, error = %e, "Failed to list units"),
            }

            if Instant::now() >= deadline {
                let healthy = last.iter().filter(|u| u.is_healthy()).count();
                return Readiness::Partial {
                    units: last,
                    healthy,
                };
            }

            tokio::select! {
                _ = cancel.cancelled() => return Readiness::Cancelled,
                _ = sleep(poll) => {}
            }
        }
    }

    /// Fill in restart counts and resource usage (best-effort)
    async fn enrich_units(&self, units: &mut [UnitInfo], cancel: &CancellationToken) {
        if units.is_empty() {
            return;
        }
        let names: Vec<String> = units.iter().map(|u| u.name.clone()).collect();

        let inspect = CommandSpec::new(
            "docker",
            ["inspect", "--format", "{{.Name}}|{{.RestartCount}}"],
        )
        .timeout(Duration::from_secs(30));
        let inspect = names.iter().fold(inspect, |spec, n| spec.arg(n.clone()));
        if let Ok(output) = self.run(inspect, cancel).await {
            let counts: HashMap<String, u32> = output
                .stdout
                .lines()
                .filter_map(|line| {
                    let (name, count) = line.split_once('|')?;
                    Some((name.trim().trim_start_matches('/').to_string(), count.trim().parse().ok()?))
                })
                .collect();
            for unit in units.iter_mut() {
                if let Some(count) = counts.get(&unit.name) {
                    unit.restart_count = *count;
                }
            }
        }

        let stats = CommandSpec::new(
            "docker",
            [
                "stats",
                "--no-stream",
                "--format",
                "{{.Name}}|{{.CPUPerc}}|{{.MemUsage}}|{{.MemPerc}}",
            ],
        )
        .timeout(Duration::from_secs(30));
        let stats = names.iter().fold(stats, |spec, n| spec.arg(n.clone()));
        if let Ok(output) = self.run(stats, cancel).await {
            for stat in output.stdout.lines().filter_map(parse_stats_line) {
                if let Some(unit) = units.iter_mut().find(|u| u.name == stat.name) {
                    unit.cpu_percent = stat.cpu_percent;
                    unit.memory_usage = Some(stat.memory_usage);
                    unit.memory_percent = stat.memory_percent;
                }
            }
        }
    }

    async fn smoke_check(&self, check: &SmokeCheck) -> Result<(), String> {
        let resp = self
            .inner
            .http
            .get(&check.url)
            .timeout(Duration::from_secs(check.timeout_secs))
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;
        let status = resp.status();
        let ok = match check.expected_status {
            Some(code) => status.as_u16() == code,
            None => status.is_success(),
        };
        if ok {
            Ok(())
        } else {
            Err(format!("unexpected status {}", status))
        }
    }

    /// Run smoke checks; returns required failures and warnings
    async fn run_smoke_checks(&self, checks: &[SmokeCheck]) -> (Vec<String>, Vec<String>) {
        let mut failures = Vec::new();
        let mut warnings = Vec::new();
        for check in checks {
            match self.smoke_check(check).await {
                Ok(()) => debug!(backend = %KIND, check = %check.name, "Smoke check passed"),
                Err(e) if check.required => failures.push(format!("{}: {}", check.name, e)),
                Err(e) => warnings.push(format!("smoke check {} failed: {}", check.name, e)),
            }
        }
        (failures, warnings)
    }

    async fn deploy_container(
        &self,
        config: &ContainerBackendConfig,
        cancel: &CancellationToken,
    ) -> BackendResult {
        let mut stages = StageTracker::new(KIND);
        let mut warnings = Vec::new();

        info!(
            backend = %KIND,
            compose_file = %config.resolved_compose_file().display(),
            "Starting container deployment"
        );
        *self.inner.state.status.write().await = BackendStatus::Deploying;

        // Stage 1: runtime
        stages.begin("ensure_runtime");
        match self.ensure_runtime().await {
            Ok(version) => stages.finish(true, version),
            Err(failure) => return self.record_failure(stages.fail(failure)).await,
        }

        // Stage 2: validate
        stages.begin("validate");
        if let Err(failure) = self.validate(config, cancel).await {
            return self.record_failure(stages.fail(failure)).await;
        }
        stages.finish(true, None);

        if cancel.is_cancelled() {
            return self.record_failure(stages.cancelled()).await;
        }

        // Stage 3: stop any prior stack
        stages.begin("stop_previous");
        match self
            .compose(
                config,
                vec!["down".into(), "--remove-orphans".into()],
                config.stop_timeout_secs + 30,
                cancel,
            )
            .await
        {
            Ok(out) if out.success() => stages.finish(true, None),
            Ok(out) => {
                warnings.push(format!("compose down failed: {}", out.error_summary()));
                stages.finish(false, Some("continuing".to_string()));
            }
            Err(e) => {
                warnings.push(format!("compose down failed: {}", e));
                stages.finish(false, Some("continuing".to_string()));
            }
        }

        // Stage 4: pull (failures are warnings)
        if config.pull_images {
            stages.begin("pull_images");
            let args = Self::with_services(config, vec!["pull", "--ignore-pull-failures"]);
            match self.compose(config, args, 900, cancel).await {
                Ok(out) if out.success() => stages.finish(true, None),
                Ok(out) => {
                    warn!(backend = %KIND, "Image pull failed, continuing with local images");
                    warnings.push(format!("image pull failed: {}", out.error_summary()));
                    stages.finish(false, Some("continuing with local images".to_string()));
                }
                Err(e) => {
                    warnings.push(format!("image pull failed: {}", e));
                    stages.finish(false, Some("continuing with local images".to_string()));
                }
            }
        } else {
            stages.skip("pull_images", "disabled");
        }

        if cancel.is_cancelled() {
            return self.record_failure(stages.cancelled()).await;
        }

        // Stage 5: build
        if config.force_rebuild {
            stages.begin("build");
            let args = Self::with_services(config, vec!["build", "--pull"]);
            match self.compose(config, args, 1800, cancel).await {
                Ok(out) if out.success() => stages.finish(true, None),
                Ok(out) => {
                    let failure = BackendFailure::new(FailureKind::Transient, "image build failed")
                        .with_details(out.error_summary());
                    return self.record_failure(stages.fail(failure)).await;
                }
                Err(e) => return self.record_failure(stages.fail(BackendFailure::from(&e))).await,
            }
        } else {
            stages.skip("build", "not forced, stale images are rebuilt by compose up");
        }

        // Stage 6: start
        // 未强制重建时交给 compose 增量构建，带 build 段的服务不会沿用过期镜像
        stages.begin("compose_up");
        let mut up = vec!["up", "-d", "--remove-orphans"];
        if !config.force_rebuild {
            up.push("--build");
        }
        let args = Self::with_services(config, up);
        match self.compose(config, args, 600, cancel).await {
            Ok(out) if out.success() => stages.finish(true, None),
            Ok(out) => {
                let failure = BackendFailure::new(FailureKind::Transient, "compose up failed")
                    .with_details(out.error_summary());
                return self.record_failure(stages.fail(failure)).await;
            }
            Err(e) => return self.record_failure(stages.fail(BackendFailure::from(&e))).await,
        }

        // Stage 7: wait for healthy units
        stages.begin("wait_healthy");
        let mut units = match self.wait_for_units(config, cancel).await {
            Readiness::Ready(units) => {
                stages.finish(true, Some(format!("{} units healthy", units.len())));
                units
            }
            Readiness::Cancelled => return self.record_failure(stages.cancelled()).await,
            Readiness::Partial { mut units, healthy } => {
                let total = units.len();
                self.enrich_units(&mut units, cancel).await;
                let unhealthy: Vec<String> = units
                    .iter()
                    .filter(|u| !u.is_healthy())
                    .map(|u| format!("{} ({})", u.name, u.health.as_deref().unwrap_or(&u.state)))
                    .collect();
                let failure = BackendFailure::new(
                    FailureKind::Startup,
                    format!(
                        "{}/{} units healthy after {}s",
                        healthy, total, config.startup_timeout_secs
                    ),
                )
                .with_details(unhealthy.join(", "));
                let status = if healthy > 0 {
                    BackendStatus::Degraded
                } else {
                    BackendStatus::Failed
                };
                *self.inner.state.units.write().await = units.clone();
                let mut result = stages.fail(failure).with_status(status).with_warnings(warnings);
                result.units = units;
                return self.record_failure(result).await;
            }
        };

        // Stage 8: unit details
        stages.begin("collect_units");
        self.enrich_units(&mut units, cancel).await;
        stages.finish(true, None);

        // Stage 9: smoke checks
        if config.smoke_checks.is_empty() {
            stages.skip("smoke_checks", "none configured");
        } else {
            stages.begin("smoke_checks");
            let (failures, smoke_warnings) = self.run_smoke_checks(&config.smoke_checks).await;
            warnings.extend(smoke_warnings);
            if !failures.is_empty() {
                let failure =
                    BackendFailure::new(FailureKind::Transient, "required smoke checks failed")
                        .with_details(failures.join("; "));
                *self.inner.state.units.write().await = units.clone();
                let mut result = stages
                    .fail(failure)
                    .with_status(BackendStatus::Degraded)
                    .with_warnings(warnings);
                result.units = units;
                return self.record_failure(result).await;
            }
            stages.finish(true, None);
        }

        let mut result = BackendResult::succeeded(KIND, stages.into_stages()).with_warnings(warnings);
        result.resources = ResourceHandles {
            containers: units.iter().map(|u| u.name.clone()).collect(),
            runtime_dir: config.effective_work_dir(),
            endpoints: config.smoke_checks.iter().map(|c| c.url.clone()).collect(),
            ..Default::default()
        };
        result.units = units.clone();

        {
            let state = &self.inner.state;
            *state.config.write().await = Some(config.clone());
            *state.units.write().await = units;
            *state.status.write().await = BackendStatus::Running;
            *state.started_at.write().await = Some(Utc::now());
            *state.last_error.write().await = None;
        }
        self.start_supervision(config).await;

        info!(
            backend = %KIND,
            units = result.units.len(),
            duration_ms = result.total_duration_ms,
            "Container deployment succeeded"
        );
        result
    }

    async fn record_failure(&self, result: BackendResult) -> BackendResult {
        let message = result.error.as_ref().map(|e| e.message.clone());
        warn!(backend = %KIND, error = ?message, status = ?result.status, "Container deployment failed");
        *self.inner.state.status.write().await = result.status;
        *self.inner.state.last_error.write().await = message;
        result
    }

    async fn start_supervision(&self, config: &ContainerBackendConfig) {
        let token = CancellationToken::new();
        if let Some(old) = self.inner.state.supervisor.lock().await.replace(token.clone()) {
            old.cancel();
        }

        let this = self.clone();
        let interval = Duration::from_secs(config.health_interval_secs.max(1));
        let threshold = config.unhealthy_threshold.max(1);
        let max_restarts = config.max_auto_restarts;
        tokio::spawn(async move {
            let mut watch = HealthWatch::new(threshold, max_restarts);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {}
                }
                this.supervise_tick(&mut watch, &token).await;
            }
            debug!(backend = %KIND, "Container supervision stopped");
        });
    }

    /// One supervision round: poll health and apply the restart policy
    async fn supervise_tick(&self, watch: &mut HealthWatch, cancel: &CancellationToken) {
        let health = self.health().await;
        match watch.observe(health.healthy) {
            WatchAction::None => {}
            WatchAction::Restart => {
                warn!(backend = %KIND, "Stack unhealthy, performing automatic restart");
                let config = self.inner.state.config.read().await.clone();
                if let Some(config) = config {
                    let restarted = match self
                        .compose(&config, Self::with_services(&config, vec!["restart"]), 300, cancel)
                        .await
                    {
                        Ok(out) => out.success(),
                        Err(_) => false,
                    };
                    self.inner.state.restart_count.fetch_add(1, Ordering::Relaxed);
                    if !restarted {
                        *self.inner.state.status.write().await = BackendStatus::Degraded;
                    }
                }
            }
            WatchAction::GiveUp => {
                warn!(backend = %KIND, "Automatic restarts exhausted, stack stays degraded");
                *self.inner.state.status.write().await = BackendStatus::Degraded;
            }
        }
    }

    async fn stop_supervision(&self) {
        if let Some(token) = self.inner.state.supervisor.lock().await.take() {
            token.cancel();
        }
    }
}

/// Decision of the local health loop
#[derive(Debug, PartialEq)]
enum WatchAction {
    None,
    Restart,
    GiveUp,
}

/// Counts consecutive unhealthy polls; allows a bounded number of restarts
struct HealthWatch {
    threshold: u32,
    max_restarts: u32,
    consecutive: u32,
    restarts: u32,
}

impl HealthWatch {
    fn new(threshold: u32, max_restarts: u32) -> Self {
        Self {
            threshold,
            max_restarts,
            consecutive: 0,
            restarts: 0,
        }
    }

    fn observe(&mut self, healthy: bool) -> WatchAction {
        if healthy {
            self.consecutive = 0;
            return WatchAction::None;
        }
        self.consecutive += 1;
        if self.consecutive < self.threshold {
            return WatchAction::None;
        }
        self.consecutive = 0;
        if self.restarts < self.max_restarts {
            self.restarts += 1;
            WatchAction::Restart
        } else {
            WatchAction::GiveUp
        }
    }
}

#[async_trait]
impl DeploymentBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn deploy(&self, config: &BackendConfig, cancel: &CancellationToken) -> BackendResult {
        match config {
            BackendConfig::Container(config) => self.deploy_container(config, cancel).await,
            other => BackendResult::failed(
                KIND,
                Vec::new(),
                BackendFailure::new(
                    FailureKind::Configuration,
                    format!("expected container config, got {}", other.kind()),
                ),
            ),
        }
    }

    async fn stop(&self, force: bool) -> DeployResult<()> {
        self.stop_supervision().await;

        let Some(config) = self.inner.state.config.read().await.clone() else {
            return Ok(());
        };
        info!(backend = %KIND, force, "Stopping container stack");

        let cancel = CancellationToken::new();
        let graceful = if force {
            false
        } else {
            let timeout = config.stop_timeout_secs.to_string();
            match self
                .compose(
                    &config,
                    vec!["stop".into(), "-t".into(), timeout],
                    config.stop_timeout_secs + 30,
                    &cancel,
                )
                .await
            {
                Ok(out) => out.success(),
                Err(e) => {
                    warn!(backend = %KIND, error = %e, "Graceful stop failed");
                    false
                }
            }
        };
        if !graceful {
            if let Err(e) = self.compose(&config, vec!["kill".into()], 60, &cancel).await {
                warn!(backend = %KIND, error = %e, "compose kill failed");
            }
        }

        let output = self
            .compose(&config, vec!["down".into(), "--remove-orphans".into()], 120, &cancel)
            .await?;
        if !output.success() {
            *self.inner.state.status.write().await = BackendStatus::Failed;
            return Err(DeployError::deployment(
                KIND,
                DeploymentErrorKind::Transient,
                format!("compose down failed: {}", output.error_summary()),
            ));
        }

        let state = &self.inner.state;
        *state.status.write().await = BackendStatus::Stopped;
        state.units.write().await.clear();
        *state.started_at.write().await = None;
        Ok(())
    }

    async fn restart(&self, force_rebuild: bool, cancel: &CancellationToken) -> BackendResult {
        let Some(mut config) = self.inner.state.config.read().await.clone() else {
            return BackendResult::failed(
                KIND,
                Vec::new(),
                BackendFailure::new(FailureKind::Configuration, "no previous container deployment"),
            );
        };
        self.inner.state.restart_count.fetch_add(1, Ordering::Relaxed);

        if force_rebuild {
            config.force_rebuild = true;
            return self.deploy_container(&config, cancel).await;
        }

        self.stop_supervision().await;
        let mut stages = StageTracker::new(KIND);
        stages.begin("compose_restart");
        match self
            .compose(&config, Self::with_services(&config, vec!["restart"]), 300, cancel)
            .await
        {
            Ok(out) if out.success() => stages.finish(true, None),
            Ok(out) => {
                let failure = BackendFailure::new(FailureKind::Transient, "compose restart failed")
                    .with_details(out.error_summary());
                return self.record_failure(stages.fail(failure)).await;
            }
            Err(e) => return self.record_failure(stages.fail(BackendFailure::from(&e))).await,
        }

        stages.begin("wait_healthy");
        match self.wait_for_units(&config, cancel).await {
            Readiness::Ready(units) => {
                stages.finish(true, None);
                *self.inner.state.units.write().await = units.clone();
                *self.inner.state.status.write().await = BackendStatus::Running;
                self.start_supervision(&config).await;
                let mut result = BackendResult::succeeded(KIND, stages.into_stages());
                result.resources.containers = units.iter().map(|u| u.name.clone()).collect();
                result.units = units;
                result
            }
            Readiness::Cancelled => self.record_failure(stages.cancelled()).await,
            Readiness::Partial { units, healthy } => {
                let failure = BackendFailure::new(
                    FailureKind::Startup,
                    format!("{}/{} units healthy after restart", healthy, units.len()),
                );
                let mut result = stages.fail(failure).with_status(BackendStatus::Degraded);
                result.units = units;
                self.record_failure(result).await
            }
        }
    }

    async fn status(&self) -> BackendStatusReport {
        let state = &self.inner.state;
        let units = state.units.read().await.clone();
        BackendStatusReport {
            backend: KIND,
            status: *state.status.read().await,
            started_at: *state.started_at.read().await,
            restart_count: state.restart_count.load(Ordering::Relaxed),
            last_error: state.last_error.read().await.clone(),
            resources: ResourceHandles {
                containers: units.iter().map(|u| u.name.clone()).collect(),
                runtime_dir: state
                    .config
                    .read()
                    .await
                    .as_ref()
                    .and_then(|c| c.effective_work_dir()),
                ..Default::default()
            },
            units,
        }
    }

    async fn health(&self) -> BackendHealth {
        let Some(config) = self.inner.state.config.read().await.clone() else {
            return BackendHealth::new(KIND, false, BackendStatus::NotDeployed)
                .with_detail("no active deployment");
        };

        let started = Instant::now();
        let units = match self.list_units(&config, &CancellationToken::new()).await {
            Ok(units) => units,
            Err(e) => {
                let mut health = BackendHealth::new(KIND, false, BackendStatus::Degraded)
                    .with_detail(e.to_string());
                health.latency_ms = started.elapsed().as_millis() as i64;
                return health;
            }
        };

        let total = units.len();
        let healthy_units = units.iter().filter(|u| u.is_healthy()).count();
        let healthy = total > 0 && healthy_units == total;
        let status = if healthy {
            BackendStatus::Running
        } else if healthy_units == 0 && units.iter().all(UnitInfo::is_dead) {
            BackendStatus::Failed
        } else {
            BackendStatus::Degraded
        };

        let mut health = BackendHealth::new(KIND, healthy, status);
        health.latency_ms = started.elapsed().as_millis() as i64;
        health.units_total = total;
        health.units_healthy = healthy_units;
        for unit in units.iter().filter(|u| !u.is_healthy()) {
            health.details.push(format!(
                "{}: {} {}",
                unit.name,
                unit.state,
                unit.health.as_deref().unwrap_or("")
            ).trim_end().to_string());
        }

        *self.inner.state.units.write().await = units;
        health
    }
}
