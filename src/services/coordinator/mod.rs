//! 部署协调器
//!
//! 评分选择后端 → 按计划执行（重试 + 备选）→ 周期健康检查 → 自动恢复。
//! 同一时刻只允许一个前台操作（deploy / stop / restart / 恢复），
//! 并发的 deploy 直接返回 Busy；stop / restart 会先取消进行中的操作再等待。

pub mod scoring;
pub mod state;

pub use scoring::{BackendRecommendation, BackendStats, Recommendations};
pub use state::CoordinatorState;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::backend::BackendConfigs;
use crate::config::env::{metric_names, OrchestratorConfig};
use crate::domain::backend::{BackendHealth, BackendKind, BackendStatusReport, FailureKind};
use crate::domain::deploy::{
    BackendErrorEntry, CoordinatorStatus, DeploymentExecution, DeploymentMode, DeploymentOutcome,
    DeploymentPlan, DeploymentStrategy, HistoryAction, HistoryEntry,
};
use crate::domain::telemetry::{EventLevel, EventType};
use crate::error::{DeployError, DeployResult};
use crate::services::backend::{BackendRegistry, DeploymentBackend};
use crate::services::probe::EnvironmentDetector;
use crate::services::telemetry::DeploymentTelemetry;
use crate::state::history::HistoryStore;

use scoring::{build_plan, recommendations, ScoringInput};

/// stop / restart 等待进行中操作退出的额外宽限
const LOCK_GRACE: Duration = Duration::from_secs(5);

/// stop 的结果
#[derive(Clone, Debug, Serialize)]
pub struct StopOutcome {
    pub success: bool,
    pub backend: Option<BackendKind>,
    pub status: CoordinatorStatus,
    pub message: String,
}

/// 部署状态快照
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentStatus {
    pub status: CoordinatorStatus,
    pub strategy: DeploymentStrategy,
    pub auto_recovery: bool,
    pub current_backend: Option<BackendKind>,
    pub deployment_mode: Option<DeploymentMode>,
    pub session_id: Option<String>,
    pub consecutive_failures: u32,
    pub restart_attempts: u32,
    pub last_error: Option<String>,
    pub last_transition_at: DateTime<Utc>,
    pub plan: Option<DeploymentPlan>,
    pub backend: Option<BackendStatusReport>,
    pub backend_stats: BTreeMap<BackendKind, BackendStats>,
}

/// 协调器健康检查结果
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    /// 处于 Running 且后端健康
    pub healthy: bool,
    pub status: CoordinatorStatus,
    pub backend: Option<BackendHealth>,
    pub consecutive_failures: u32,
    pub checked_at: DateTime<Utc>,
}

struct Inner {
    config: RwLock<Arc<OrchestratorConfig>>,
    backends: BackendRegistry,
    detector: Arc<dyn EnvironmentDetector>,
    telemetry: DeploymentTelemetry,
    history: Arc<HistoryStore>,
    state: RwLock<CoordinatorState>,
    /// 最近一次使用的后端配置（restart / 恢复时复用）
    configs: RwLock<BackendConfigs>,
    op_lock: Mutex<()>,
    op_cancel: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

/// 部署协调器
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        config: OrchestratorConfig,
        backends: BackendRegistry,
        detector: Arc<dyn EnvironmentDetector>,
        telemetry: DeploymentTelemetry,
        history: Arc<HistoryStore>,
        configs: BackendConfigs,
    ) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(Arc::new(config)),
                backends,
                detector,
                telemetry,
                history,
                state: RwLock::new(CoordinatorState::default()),
                configs: RwLock::new(configs),
                op_lock: Mutex::new(()),
                op_cancel: Mutex::new(shutdown.child_token()),
                shutdown,
                health_task: Mutex::new(None),
            }),
        }
    }

    /// 当前生效的配置快照
    pub async fn config(&self) -> Arc<OrchestratorConfig> {
        self.inner.config.read().await.clone()
    }

    pub async fn status(&self) -> CoordinatorStatus {
        self.inner.state.read().await.status
    }

    pub async fn state(&self) -> CoordinatorState {
        self.inner.state.read().await.clone()
    }

    pub async fn backend_configs(&self) -> BackendConfigs {
        self.inner.configs.read().await.clone()
    }

    pub fn telemetry(&self) -> &DeploymentTelemetry {
        &self.inner.telemetry
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.inner.history
    }

    // ========== 前台操作 ==========

    /// 分析环境、生成计划并按计划部署
    ///
    /// 执行失败以 `success == false` 的结果返回；只有并发冲突返回 `Err`。
    pub async fn deploy(
        &self,
        strategy: Option<DeploymentStrategy>,
        configs: Option<BackendConfigs>,
    ) -> DeployResult<DeploymentOutcome> {
        let _guard = self.inner.op_lock.try_lock().map_err(|_| {
            DeployError::Busy("another deployment operation is in progress".to_string())
        })?;

        let status = self.status().await;
        if status.has_active_deployment() {
            return Err(DeployError::Busy(format!(
                "deployment is {}; stop or restart it first",
                status
            )));
        }

        let configs = {
            let mut active = self.inner.configs.write().await;
            if let Some(ref overrides) = configs {
                *active = active.merged_with(overrides);
            }
            active.clone()
        };
        let config = self.config().await;
        let strategy = strategy.unwrap_or(config.strategy);
        let cancel = self.begin_operation().await;

        Ok(self
            .execute(&config, strategy, &configs, &cancel, HistoryAction::Deploy)
            .await)
    }

    /// 停止当前部署；Idle 时直接返回成功
    pub async fn stop_deployment(&self, force: bool) -> DeployResult<StopOutcome> {
        let config = self.config().await;
        let _guard = self.acquire_exclusive(&config).await?;
        let started_at = Utc::now();

        let (status, current) = {
            let state = self.inner.state.read().await;
            (state.status, state.current_backend)
        };
        if status == CoordinatorStatus::Idle {
            debug!("Stop requested while idle");
            return Ok(StopOutcome {
                success: true,
                backend: None,
                status,
                message: "no active deployment".to_string(),
            });
        }

        self.transition(CoordinatorStatus::Stopping).await;
        let mut errors = Vec::new();
        for (kind, backend) in &self.inner.backends {
            let owns_resources =
                Some(*kind) == current || backend.status().await.status.is_active();
            if !owns_resources {
                continue;
            }
            info!(backend = %kind, force, "Stopping backend");
            if let Err(e) = backend.stop(force).await {
                error!(backend = %kind, error = %e, "Failed to stop backend");
                errors.push(format!("{}: {}", kind, e));
            }
        }

        let success = errors.is_empty();
        let message = if success {
            "deployment stopped".to_string()
        } else {
            format!("stop failed: {}", errors.join("; "))
        };
        {
            let mut state = self.inner.state.write().await;
            if success {
                state.clear_deployment();
            } else {
                state.last_error = Some(message.clone());
            }
        }
        self.transition(if success {
            CoordinatorStatus::Idle
        } else {
            CoordinatorStatus::Failed
        })
        .await;

        let final_status = self.status().await;
        self.inner
            .history
            .record(HistoryEntry {
                backend: current,
                errors,
                ..simple_entry(HistoryAction::Stop, success, final_status, &message, started_at)
            })
            .await;

        Ok(StopOutcome {
            success,
            backend: current,
            status: final_status,
            message,
        })
    }

    /// 在当前后端上重启；上次部署整体失败时按上次配置重新部署
    pub async fn restart_deployment(&self, force_rebuild: bool) -> DeployResult<DeploymentOutcome> {
        let config = self.config().await;
        let _guard = self.acquire_exclusive(&config).await?;

        let (status, current, plan, strategy) = {
            let state = self.inner.state.read().await;
            (
                state.status,
                state.current_backend,
                state.plan.clone(),
                state.strategy.unwrap_or(config.strategy),
            )
        };
        if status == CoordinatorStatus::Idle {
            return Err(DeployError::Config("no deployment to restart".to_string()));
        }
        let cancel = self.begin_operation().await;

        let (Some(kind), Some(plan)) = (current, plan) else {
            info!("No active backend, redeploying with last configuration");
            let configs = self.backend_configs().await;
            return Ok(self
                .execute(&config, strategy, &configs, &cancel, HistoryAction::Restart)
                .await);
        };
        let backend = self.backend(kind)?;

        let started_at = Utc::now();
        let session_id = Uuid::new_v4().to_string();
        self.inner
            .telemetry
            .start_session(
                &session_id,
                json!({ "action": "restart", "backend": kind, "force_rebuild": force_rebuild }),
            )
            .await;
        self.inner.state.write().await.session_id = Some(session_id.clone());
        self.transition(CoordinatorStatus::Deploying).await;

        info!(backend = %kind, force_rebuild, "Restarting deployment");
        let mut execution =
            DeploymentExecution::new(Uuid::new_v4().to_string(), session_id.clone(), plan);
        let attempt_started = Utc::now();
        let result = backend.restart(force_rebuild, &cancel).await;
        let success = result.success;
        let failure = result.error.clone();
        execution.record_attempt(result, attempt_started);

        let message = {
            let mut state = self.inner.state.write().await;
            state.record_result(kind, success);
            if success {
                state.activate(kind);
                format!("restarted on {}", kind)
            } else {
                let reason = failure.map_or_else(|| "unknown failure".to_string(), |f| f.message);
                let message = format!("restart on {} failed: {}", kind, reason);
                state.last_error = Some(message.clone());
                message
            }
        };
        self.transition(if success {
            CoordinatorStatus::Running
        } else {
            CoordinatorStatus::Failed
        })
        .await;

        let level = if success { EventLevel::Info } else { EventLevel::Error };
        self.inner
            .telemetry
            .log_event(&session_id, EventType::Custom, level, &message, json!({ "backend": kind }))
            .await;
        self.inner.telemetry.end_session(&session_id).await;

        let outcome = DeploymentOutcome::from_execution(&execution, strategy, message);
        let final_status = self.status().await;
        self.inner
            .history
            .record(outcome_entry(HistoryAction::Restart, &outcome, final_status, started_at))
            .await;
        Ok(outcome)
    }

    // ========== 查询与配置 ==========

    pub async fn get_deployment_status(&self) -> DeploymentStatus {
        let config = self.config().await;
        let state = self.state().await;
        let backend = match state.current_backend.and_then(|k| self.inner.backends.get(&k)) {
            Some(backend) => Some(backend.status().await),
            None => None,
        };
        let deployment_mode = match (state.current_backend, state.plan.as_ref()) {
            (Some(kind), Some(plan)) if kind == plan.primary => Some(DeploymentMode::Primary),
            (Some(_), Some(_)) => Some(DeploymentMode::Fallback),
            _ => None,
        };

        DeploymentStatus {
            status: state.status,
            strategy: config.strategy,
            auto_recovery: config.auto_recovery,
            current_backend: state.current_backend,
            deployment_mode,
            session_id: state.session_id,
            consecutive_failures: state.consecutive_failures,
            restart_attempts: state.restart_attempts,
            last_error: state.last_error,
            last_transition_at: state.last_transition_at,
            plan: state.plan,
            backend,
            backend_stats: state.backend_stats,
        }
    }

    /// 基于当前环境的部署建议
    pub async fn get_deployment_recommendations(&self) -> DeployResult<Recommendations> {
        let config = self.config().await;
        let profile = self.inner.detector.system_profile().await?;
        let checks = self.inner.detector.detect_all(false).await;
        let stats = self.inner.state.read().await.backend_stats.clone();
        let configured = self.configured_kinds(&self.backend_configs().await);

        let input = ScoringInput {
            config: &config,
            strategy: config.strategy,
            profile: &profile,
            checks: &checks,
            stats: &stats,
        };
        Ok(recommendations(&input, &configured))
    }

    /// 立即检查当前部署的健康状态（不触发恢复）
    pub async fn health_check(&self) -> HealthReport {
        let (status, current, failures) = {
            let state = self.inner.state.read().await;
            (state.status, state.current_backend, state.consecutive_failures)
        };
        let backend = match current.and_then(|k| self.inner.backends.get(&k)) {
            Some(backend) => Some(backend.health().await),
            None => None,
        };
        HealthReport {
            healthy: status == CoordinatorStatus::Running
                && backend.as_ref().is_some_and(|h| h.healthy),
            status,
            backend,
            consecutive_failures: failures,
            checked_at: Utc::now(),
        }
    }

    /// 替换部署策略，返回新的配置快照
    pub async fn set_strategy(&self, strategy: DeploymentStrategy) -> Arc<OrchestratorConfig> {
        let mut slot = self.inner.config.write().await;
        let next = Arc::new(slot.with_strategy(strategy));
        *slot = next.clone();
        info!(strategy = %strategy, "Deployment strategy updated");
        next
    }

    /// 切换自动恢复，返回新的配置快照
    pub async fn set_auto_recovery(&self, enabled: bool) -> Arc<OrchestratorConfig> {
        let mut slot = self.inner.config.write().await;
        let next = Arc::new(slot.with_auto_recovery(enabled));
        *slot = next.clone();
        info!(enabled, "Auto-recovery updated");
        next
    }

    // ========== 健康检查循环 ==========

    /// 启动后台健康检查循环（重复调用无效）
    pub async fn start_health_loop(&self) {
        let mut slot = self.inner.health_task.lock().await;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let coordinator = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let period = self.config().await.health_check_interval;
        *slot = Some(tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "Health loop started");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        coordinator.run_health_cycle().await;
                    }
                }
            }
            info!("Health loop stopped");
        }));
    }

    /// 执行一轮健康检查与恢复
    ///
    /// 前台操作进行中或没有活动部署时跳过，返回 `None`。
    pub async fn run_health_cycle(&self) -> Option<CoordinatorStatus> {
        let Ok(_guard) = self.inner.op_lock.try_lock() else {
            debug!("Foreground operation in progress, skipping health check");
            return None;
        };

        let (status, current, session_id) = {
            let state = self.inner.state.read().await;
            (state.status, state.current_backend, state.session_id.clone())
        };
        if !status.has_active_deployment() {
            return None;
        }
        let kind = current?;
        let backend = self.inner.backends.get(&kind).cloned()?;
        let config = self.config().await;

        let health = backend.health().await;
        if let Some(ref sid) = session_id {
            self.inner
                .telemetry
                .record_metric(sid, metric_names::HEALTH_LATENCY, health.latency_ms as f64, "ms")
                .await;
        }

        if health.healthy {
            {
                let mut state = self.inner.state.write().await;
                if state.consecutive_failures > 0 {
                    info!(backend = %kind, "Deployment healthy again");
                }
                state.reset_failures();
            }
            if status == CoordinatorStatus::Degrading {
                self.transition(CoordinatorStatus::Running).await;
            }
            return Some(self.status().await);
        }

        let failures = {
            let mut state = self.inner.state.write().await;
            state.consecutive_failures += 1;
            if !health.details.is_empty() {
                state.last_error = Some(health.details.join("; "));
            }
            state.consecutive_failures
        };
        warn!(backend = %kind, failures, threshold = config.failure_threshold, "Health check failed");
        if let Some(ref sid) = session_id {
            self.inner
                .telemetry
                .log_event(
                    sid,
                    EventType::HealthCheck,
                    EventLevel::Warning,
                    format!("{} unhealthy ({} consecutive)", kind, failures),
                    json!({ "backend": kind, "failures": failures, "details": health.details }),
                )
                .await;
        }
        if status == CoordinatorStatus::Running {
            self.transition(CoordinatorStatus::Degrading).await;
        }

        if config.auto_recovery {
            let cancel = self.begin_operation().await;
            self.recover(&config, kind, failures, &cancel).await;
        } else if failures >= config.failure_threshold {
            error!(backend = %kind, failures, "Deployment failed, auto-recovery disabled");
            let started_at = Utc::now();
            let message = format!(
                "{} unhealthy for {} consecutive checks; auto-recovery disabled",
                kind, failures
            );
            self.inner.state.write().await.last_error = Some(message.clone());
            self.transition(CoordinatorStatus::Failed).await;
            self.log_recovery(EventLevel::Critical, &message, kind).await;
            self.inner
                .history
                .record(HistoryEntry {
                    backend: Some(kind),
                    ..simple_entry(
                        HistoryAction::Recovery,
                        false,
                        CoordinatorStatus::Failed,
                        &message,
                        started_at,
                    )
                })
                .await;
        }

        Some(self.status().await)
    }

    /// 停止后台循环并取消进行中的操作
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.health_task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Health loop task ended abnormally");
            }
        }
    }

    // ========== 内部实现 ==========

    /// 分析 → 计划 → 逐个后端尝试
    async fn execute(
        &self,
        config: &OrchestratorConfig,
        strategy: DeploymentStrategy,
        configs: &BackendConfigs,
        cancel: &CancellationToken,
        action: HistoryAction,
    ) -> DeploymentOutcome {
        let telemetry = &self.inner.telemetry;
        let execution_id = Uuid::new_v4().to_string();
        let session_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();

        telemetry
            .start_session(
                &session_id,
                json!({ "strategy": strategy, "orchestrator": config, "backends": configs }),
            )
            .await;
        {
            let mut state = self.inner.state.write().await;
            state.session_id = Some(session_id.clone());
            state.strategy = Some(strategy);
        }
        info!(%execution_id, %session_id, strategy = %strategy, "Starting deployment");
        self.transition(CoordinatorStatus::Analyzing).await;

        let plan = match self.analyze(config, strategy, configs, &session_id).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "Deployment planning failed");
                {
                    let mut state = self.inner.state.write().await;
                    state.last_error = Some(e.to_string());
                    state.plan = None;
                    state.current_backend = None;
                }
                self.transition(CoordinatorStatus::Failed).await;
                telemetry
                    .log_event(
                        &session_id,
                        EventType::PlanCreated,
                        EventLevel::Error,
                        format!("planning failed: {}", e),
                        json!({ "details": e.details() }),
                    )
                    .await;
                telemetry.end_session(&session_id).await;

                let outcome = DeploymentOutcome::planning_failed(
                    execution_id,
                    session_id,
                    strategy,
                    &e,
                    started_at,
                );
                let final_status = self.status().await;
                self.inner
                    .history
                    .record(outcome_entry(action, &outcome, final_status, started_at))
                    .await;
                return outcome;
            }
        };

        {
            let mut state = self.inner.state.write().await;
            state.plan = Some(plan.clone());
            state.current_backend = None;
            state.used_backends.clear();
        }
        self.transition(CoordinatorStatus::Deploying).await;

        let mut execution = DeploymentExecution::new(execution_id, session_id.clone(), plan.clone());
        for (idx, kind) in plan.ordered_backends().into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if idx > 0 {
                warn!(backend = %kind, position = idx, "Falling back to next backend");
                telemetry
                    .log_event(
                        &session_id,
                        EventType::FallbackTriggered,
                        EventLevel::Warning,
                        format!("falling back to {}", kind),
                        json!({ "backend": kind, "position": idx }),
                    )
                    .await;
            }
            self.inner.state.write().await.used_backends.insert(kind);
            if self
                .attempt_backend(config, kind, configs, &mut execution, cancel)
                .await
            {
                break;
            }
        }

        telemetry
            .record_metric(
                &session_id,
                metric_names::DEPLOYMENT_DURATION,
                clock.elapsed().as_secs_f64(),
                "s",
            )
            .await;

        let message = match (execution.success, execution.current_backend) {
            (true, Some(kind)) => {
                self.inner.state.write().await.activate(kind);
                self.transition(CoordinatorStatus::Running).await;
                let mode = mode_label(execution.mode());
                info!(backend = %kind, mode, "Deployment succeeded");
                format!("deployed on {} ({})", kind, mode)
            }
            _ => {
                let message = if cancel.is_cancelled() {
                    "deployment cancelled".to_string()
                } else {
                    format!("all backends failed: {}", summarize_errors(&execution.errors))
                };
                error!(error = %message, "Deployment failed");
                self.inner.state.write().await.last_error = Some(message.clone());
                self.transition(CoordinatorStatus::Failed).await;
                message
            }
        };

        let level = if execution.success {
            EventLevel::Info
        } else {
            EventLevel::Error
        };
        telemetry
            .log_event(
                &session_id,
                EventType::Custom,
                level,
                &message,
                json!({ "backend": execution.current_backend, "attempts": execution.attempt_log.len() }),
            )
            .await;
        telemetry.end_session(&session_id).await;

        let outcome = DeploymentOutcome::from_execution(&execution, strategy, message);
        let final_status = self.status().await;
        self.inner
            .history
            .record(outcome_entry(action, &outcome, final_status, started_at))
            .await;
        outcome
    }

    /// 探测环境并生成计划
    async fn analyze(
        &self,
        config: &OrchestratorConfig,
        strategy: DeploymentStrategy,
        configs: &BackendConfigs,
        session_id: &str,
    ) -> DeployResult<DeploymentPlan> {
        let profile = self.inner.detector.system_profile().await?;
        let checks = self.inner.detector.detect_all(false).await;
        self.inner
            .telemetry
            .log_event(
                session_id,
                EventType::EnvironmentAnalyzed,
                EventLevel::Info,
                format!("environment analyzed on {}", profile.hostname),
                json!({ "system": &profile, "checks": &checks }),
            )
            .await;

        let stats = self.inner.state.read().await.backend_stats.clone();
        let input = ScoringInput {
            config,
            strategy,
            profile: &profile,
            checks: &checks,
            stats: &stats,
        };
        let plan = build_plan(&input, &self.configured_kinds(configs))?;

        info!(
            primary = %plan.primary,
            fallbacks = ?plan.fallbacks,
            confidence = plan.confidence,
            "Deployment plan created"
        );
        self.inner
            .telemetry
            .log_event(
                session_id,
                EventType::PlanCreated,
                EventLevel::Info,
                format!("primary {} with {} fallback(s)", plan.primary, plan.fallbacks.len()),
                json!(&plan),
            )
            .await;
        Ok(plan)
    }

    /// 在单个后端上按次数上限尝试部署，成功返回 true
    async fn attempt_backend(
        &self,
        config: &OrchestratorConfig,
        kind: BackendKind,
        configs: &BackendConfigs,
        execution: &mut DeploymentExecution,
        cancel: &CancellationToken,
    ) -> bool {
        let telemetry = &self.inner.telemetry;
        let session_id = execution.session_id.clone();

        let (Some(backend), Some(backend_config)) =
            (self.inner.backends.get(&kind).cloned(), configs.get(kind))
        else {
            warn!(backend = %kind, "Backend not registered or not configured");
            execution.errors.push(BackendErrorEntry {
                backend: Some(kind),
                attempt: 0,
                kind: FailureKind::Configuration,
                message: format!("{} backend is not available", kind),
            });
            return false;
        };

        let max_attempts = config.max_attempts_per_backend.max(1);
        for attempt in 1..=max_attempts {
            info!(backend = %kind, attempt, max_attempts, "Deploying backend");
            telemetry
                .log_event(
                    &session_id,
                    EventType::StepStarted,
                    EventLevel::Info,
                    format!("{} attempt {}/{}", kind, attempt, max_attempts),
                    json!({ "backend": kind, "attempt": attempt }),
                )
                .await;

            let attempt_started = Utc::now();
            let clock = Instant::now();
            let result = backend.deploy(&backend_config, cancel).await;
            let elapsed = clock.elapsed().as_secs_f64();
            telemetry
                .record_metric(&session_id, metric_names::BACKEND_ATTEMPT_DURATION, elapsed, "s")
                .await;

            let success = result.success;
            let retryable = result.is_retryable();
            let failure = result.error.clone();
            let warnings = result.warnings.clone();
            self.inner.state.write().await.record_result(kind, success);
            execution.record_attempt(result, attempt_started);

            if success {
                telemetry
                    .log_event(
                        &session_id,
                        EventType::StepCompleted,
                        EventLevel::Info,
                        format!("{} deployed", kind),
                        json!({ "backend": kind, "attempt": attempt, "duration_secs": elapsed, "warnings": warnings }),
                    )
                    .await;
                return true;
            }

            let message = failure
                .as_ref()
                .map_or_else(|| "unknown failure".to_string(), |f| f.message.clone());
            warn!(backend = %kind, attempt, retryable, error = %message, "Backend attempt failed");
            telemetry
                .log_event(
                    &session_id,
                    EventType::StepFailed,
                    EventLevel::Error,
                    format!("{} attempt {} failed: {}", kind, attempt, message),
                    json!({ "backend": kind, "attempt": attempt, "failure": failure }),
                )
                .await;

            if !retryable || attempt == max_attempts || cancel.is_cancelled() {
                break;
            }
            info!(backend = %kind, delay_secs = config.retry_delay.as_secs(), "Retrying backend");
            tokio::select! {
                _ = sleep(config.retry_delay) => {}
                _ = cancel.cancelled() => break,
            }
        }

        // 释放失败部署残留的资源
        if let Err(e) = backend.stop(true).await {
            warn!(backend = %kind, error = %e, "Failed to clean up after backend failure");
        }
        false
    }

    /// 降级后的恢复：同后端重启 → 未使用的备选后端 → Failed
    async fn recover(
        &self,
        config: &OrchestratorConfig,
        kind: BackendKind,
        failures: u32,
        cancel: &CancellationToken,
    ) {
        let started_at = Utc::now();
        let restart_attempt = {
            let mut state = self.inner.state.write().await;
            if state.restart_attempts < config.max_restart_attempts {
                state.restart_attempts += 1;
                Some(state.restart_attempts)
            } else {
                None
            }
        };

        if let Some(attempt) = restart_attempt {
            let Some(backend) = self.inner.backends.get(&kind).cloned() else {
                return;
            };
            info!(backend = %kind, attempt, max = config.max_restart_attempts, "Restarting backend for recovery");
            self.log_recovery(
                EventLevel::Warning,
                &format!("restart {}/{} on {}", attempt, config.max_restart_attempts, kind),
                kind,
            )
            .await;

            let result = backend.restart(false, cancel).await;
            self.inner.state.write().await.record_result(kind, result.success);
            if result.success {
                self.inner.state.write().await.reset_failures();
                self.transition(CoordinatorStatus::Running).await;
                let message = format!("recovered by restarting {}", kind);
                info!(backend = %kind, "Recovery restart succeeded");
                self.log_recovery(EventLevel::Info, &message, kind).await;
                self.inner
                    .history
                    .record(HistoryEntry {
                        backend: Some(kind),
                        ..simple_entry(
                            HistoryAction::Recovery,
                            true,
                            CoordinatorStatus::Running,
                            &message,
                            started_at,
                        )
                    })
                    .await;
                return;
            }

            let reason = result
                .error
                .map_or_else(|| "unknown failure".to_string(), |f| f.message);
            warn!(backend = %kind, attempt, error = %reason, "Recovery restart failed");
            self.log_recovery(
                EventLevel::Error,
                &format!("restart {} on {} failed: {}", attempt, kind, reason),
                kind,
            )
            .await;
            if attempt < config.max_restart_attempts {
                return;
            }
        }

        let configs = self.backend_configs().await;
        let fallback = self
            .inner
            .state
            .read()
            .await
            .unused_fallback(&self.configured_kinds(&configs));
        if let Some(fallback) = fallback {
            self.recover_with_fallback(config, kind, fallback, &configs, cancel, started_at)
                .await;
            return;
        }

        if failures >= config.failure_threshold {
            let message = format!(
                "{} unhealthy for {} consecutive checks; restarts exhausted and no fallback left",
                kind, failures
            );
            error!(backend = %kind, failures, "Recovery exhausted");
            self.inner.state.write().await.last_error = Some(message.clone());
            self.transition(CoordinatorStatus::Failed).await;
            self.log_recovery(EventLevel::Critical, &message, kind).await;
            self.inner
                .history
                .record(HistoryEntry {
                    backend: Some(kind),
                    ..simple_entry(
                        HistoryAction::Recovery,
                        false,
                        CoordinatorStatus::Failed,
                        &message,
                        started_at,
                    )
                })
                .await;
        }
    }

    /// 停止当前后端并在备选后端上重新部署
    async fn recover_with_fallback(
        &self,
        config: &OrchestratorConfig,
        current: BackendKind,
        fallback: BackendKind,
        configs: &BackendConfigs,
        cancel: &CancellationToken,
        started_at: DateTime<Utc>,
    ) {
        let (plan, session_id, strategy) = {
            let state = self.inner.state.read().await;
            (
                state.plan.clone(),
                state.session_id.clone(),
                state.strategy.unwrap_or(config.strategy),
            )
        };
        let Some(plan) = plan else {
            return;
        };
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        warn!(from = %current, to = %fallback, "Recovering on fallback backend");
        self.inner
            .telemetry
            .log_event(
                &session_id,
                EventType::FallbackTriggered,
                EventLevel::Warning,
                format!("recovery moving from {} to {}", current, fallback),
                json!({ "from": current, "to": fallback }),
            )
            .await;

        if let Some(backend) = self.inner.backends.get(&current) {
            if let Err(e) = backend.stop(false).await {
                warn!(backend = %current, error = %e, "Failed to stop degraded backend");
            }
        }
        self.transition(CoordinatorStatus::Deploying).await;
        self.inner.state.write().await.used_backends.insert(fallback);

        let mut execution = DeploymentExecution::new(Uuid::new_v4().to_string(), session_id, plan);
        let success = self
            .attempt_backend(config, fallback, configs, &mut execution, cancel)
            .await;

        let message = if success {
            self.inner.state.write().await.activate(fallback);
            self.transition(CoordinatorStatus::Running).await;
            format!("recovered on fallback {}", fallback)
        } else {
            let message = format!(
                "fallback {} failed: {}",
                fallback,
                summarize_errors(&execution.errors)
            );
            let mut state = self.inner.state.write().await;
            state.current_backend = None;
            state.last_error = Some(message.clone());
            drop(state);
            self.transition(CoordinatorStatus::Failed).await;
            message
        };
        let level = if success {
            EventLevel::Info
        } else {
            EventLevel::Critical
        };
        self.log_recovery(level, &message, fallback).await;

        let outcome = DeploymentOutcome::from_execution(&execution, strategy, message);
        let final_status = self.status().await;
        self.inner
            .history
            .record(outcome_entry(HistoryAction::Recovery, &outcome, final_status, started_at))
            .await;
    }

    /// 状态迁移并写入遥测
    async fn transition(&self, next: CoordinatorStatus) -> bool {
        let (prev, changed, session_id) = {
            let mut state = self.inner.state.write().await;
            let prev = state.status;
            let changed = state.transition(next);
            (prev, changed, state.session_id.clone())
        };
        if changed && prev != next {
            if let Some(sid) = session_id {
                self.inner
                    .telemetry
                    .log_event(
                        &sid,
                        EventType::StateChanged,
                        EventLevel::Info,
                        format!("{} -> {}", prev, next),
                        json!({ "from": prev, "to": next }),
                    )
                    .await;
            }
        }
        changed
    }

    async fn log_recovery(&self, level: EventLevel, message: &str, kind: BackendKind) {
        let session_id = self.inner.state.read().await.session_id.clone();
        if let Some(sid) = session_id {
            self.inner
                .telemetry
                .log_event(&sid, EventType::Recovery, level, message, json!({ "backend": kind }))
                .await;
        }
    }

    /// 为新的前台操作创建取消令牌
    async fn begin_operation(&self) -> CancellationToken {
        let token = self.inner.shutdown.child_token();
        *self.inner.op_cancel.lock().await = token.clone();
        token
    }

    /// 取消进行中的操作并等待独占
    async fn acquire_exclusive(&self, config: &OrchestratorConfig) -> DeployResult<MutexGuard<'_, ()>> {
        self.inner.op_cancel.lock().await.cancel();
        timeout(config.stop_timeout + LOCK_GRACE, self.inner.op_lock.lock())
            .await
            .map_err(|_| {
                DeployError::Busy("timed out waiting for the in-flight operation".to_string())
            })
    }

    fn backend(&self, kind: BackendKind) -> DeployResult<Arc<dyn DeploymentBackend>> {
        self.inner
            .backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| DeployError::Config(format!("{} backend is not registered", kind)))
    }

    /// 已注册且已配置的后端
    fn configured_kinds(&self, configs: &BackendConfigs) -> Vec<BackendKind> {
        configs
            .kinds()
            .into_iter()
            .filter(|k| self.inner.backends.contains_key(k))
            .collect()
    }
}

fn mode_label(mode: Option<DeploymentMode>) -> &'static str {
    match mode {
        Some(DeploymentMode::Primary) => "primary",
        Some(DeploymentMode::Fallback) => "fallback",
        None => "none",
    }
}

fn summarize_errors(errors: &[BackendErrorEntry]) -> String {
    if errors.is_empty() {
        return "no backend attempted".to_string();
    }
    errors
        .iter()
        .map(format_error)
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_error(entry: &BackendErrorEntry) -> String {
    match entry.backend {
        Some(kind) => format!("{}#{}: {}", kind, entry.attempt, entry.message),
        None => entry.message.clone(),
    }
}

fn simple_entry(
    action: HistoryAction,
    success: bool,
    final_status: CoordinatorStatus,
    message: &str,
    started_at: DateTime<Utc>,
) -> HistoryEntry {
    HistoryEntry {
        id: Uuid::new_v4().to_string(),
        action,
        session_id: None,
        strategy: None,
        backend: None,
        deployment_mode: None,
        success,
        final_status,
        message: message.to_string(),
        errors: Vec::new(),
        started_at,
        finished_at: Utc::now(),
    }
}

fn outcome_entry(
    action: HistoryAction,
    outcome: &DeploymentOutcome,
    final_status: CoordinatorStatus,
    started_at: DateTime<Utc>,
) -> HistoryEntry {
    HistoryEntry {
        session_id: Some(outcome.session_id.clone()),
        strategy: Some(outcome.strategy),
        backend: outcome.backend,
        deployment_mode: outcome.deployment_mode,
        errors: outcome.errors.iter().map(format_error).collect(),
        ..simple_entry(action, outcome.success, final_status, &outcome.message, started_at)
    }
}
