//! 环境探测
//!
//! 检测各后端运行前提（命令、版本、守护进程、配套工具），给出 0-100 评分，
//! 结果按 TTL 缓存；缺失时可按平台执行安装。

mod install;

pub use install::{install_plan, InstallPlan, InstallResult};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::env::ProbeConfig;
use crate::domain::backend::{BackendCheckResult, BackendKind, CheckStatus};
use crate::domain::system::{OsFamily, PackageManager, SystemProfile};
use crate::error::{DeployError, DeployResult};
use crate::infra::command::{CommandExecutor, CommandOutput, CommandSpec};

/// 评分构成
mod weights {
    pub const PRESENCE: i32 = 30;
    pub const VERSION_RECOMMENDED: i32 = 25;
    pub const VERSION_MINIMUM: i32 = 15;
    pub const RUNTIME: i32 = 25;
    pub const COMPANION: i32 = 15;
}

/// 环境探测接口（协调器依赖此 trait，测试中替换为固定结果）
#[async_trait]
pub trait EnvironmentDetector: Send + Sync {
    /// 系统画像（带缓存）
    async fn system_profile(&self) -> DeployResult<SystemProfile>;

    /// 检测所有后端；`force_refresh` 为 false 时优先使用未过期缓存
    async fn detect_all(&self, force_refresh: bool) -> BTreeMap<BackendKind, BackendCheckResult>;

    /// 重新检测单个后端并更新缓存
    async fn detect_one(&self, kind: BackendKind) -> BackendCheckResult;

    /// 安装后端运行时并重新校验
    async fn auto_install(&self, kind: BackendKind, force: bool) -> DeployResult<InstallResult>;

    /// 清空缓存
    async fn invalidate(&self);
}

/// 语义化版本（只比较 major.minor.patch）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// 从命令输出中提取第一个 `x.y[.z]` 版本号
    pub fn parse_from(text: &str) -> Option<Self> {
        text.split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .filter(|token| token.contains('.'))
            .find_map(|token| {
                let mut parts = token.split('.').filter(|p| !p.is_empty());
                let major = parts.next()?.parse().ok()?;
                let minor = parts.next()?.parse().ok()?;
                let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
                Some(Self::new(major, minor, patch))
            })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// 单个后端的运行前提描述
struct Requirement {
    /// 候选可执行文件，按顺序查找
    binaries: &'static [&'static str],
    version_args: &'static [&'static str],
    minimum: Version,
    recommended: Version,
    /// 运行时可用性检查（守护进程 / venv 模块）
    runtime_args: &'static [&'static str],
    runtime_label: &'static str,
    /// 配套工具检查参数（以主命令执行），以及独立的备用命令
    companion_args: &'static [&'static str],
    companion_binary: Option<&'static str>,
    companion_label: &'static str,
}

const CONTAINER_REQUIREMENT: Requirement = Requirement {
    binaries: &["docker"],
    version_args: &["--version"],
    minimum: Version::new(20, 10, 0),
    recommended: Version::new(24, 0, 0),
    runtime_args: &["info", "--format", "{{.ServerVersion}}"],
    runtime_label: "docker daemon",
    companion_args: &["compose", "version"],
    companion_binary: Some("docker-compose"),
    companion_label: "compose plugin",
};

const PROCESS_REQUIREMENT: Requirement = Requirement {
    binaries: &["python3", "python"],
    version_args: &["--version"],
    minimum: Version::new(3, 8, 0),
    recommended: Version::new(3, 10, 0),
    runtime_args: &["-c", "import venv"],
    runtime_label: "venv module",
    companion_args: &["-m", "pip", "--version"],
    companion_binary: None,
    companion_label: "pip",
};

fn requirement(kind: BackendKind) -> &'static Requirement {
    match kind {
        BackendKind::Container => &CONTAINER_REQUIREMENT,
        BackendKind::Process => &PROCESS_REQUIREMENT,
    }
}

/// 平台加减分
fn platform_adjustment(kind: BackendKind, os: OsFamily) -> i32 {
    match (kind, os) {
        (BackendKind::Container, OsFamily::Linux) => 5,
        // Docker Desktop 运行在虚拟机中
        (BackendKind::Container, OsFamily::MacOs | OsFamily::Windows) => -5,
        (BackendKind::Process, OsFamily::Linux | OsFamily::MacOs) => 5,
        _ => 0,
    }
}

struct Cached<T> {
    value: T,
    at: Instant,
}

/// 环境探测器
pub struct EnvironmentProbe {
    executor: Arc<dyn CommandExecutor>,
    config: ProbeConfig,
    os_family: OsFamily,
    results: RwLock<Option<Cached<BTreeMap<BackendKind, BackendCheckResult>>>>,
    profile: RwLock<Option<Cached<SystemProfile>>>,
}

impl EnvironmentProbe {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: ProbeConfig) -> Self {
        Self::for_platform(executor, config, OsFamily::current())
    }

    pub fn for_platform(
        executor: Arc<dyn CommandExecutor>,
        config: ProbeConfig,
        os_family: OsFamily,
    ) -> Self {
        Self {
            executor,
            config,
            os_family,
            results: RwLock::new(None),
            profile: RwLock::new(None),
        }
    }

    fn is_fresh(&self, at: Instant) -> bool {
        at.elapsed() < self.config.cache_ttl
    }

    async fn run_quiet(&self, program: &str, args: &[&str]) -> Option<CommandOutput> {
        let spec = CommandSpec::new(program, args.iter().copied()).timeout(self.config.command_timeout);
        match self.executor.run(&spec, &CancellationToken::new()).await {
            Ok(output) => Some(output),
            Err(e) => {
                debug!(command = %spec.display(), error = %e, "Probe command failed");
                None
            }
        }
    }

    /// 检测单个后端（不读写缓存）
    async fn check(&self, kind: BackendKind) -> BackendCheckResult {
        let req = requirement(kind);

        let mut found = None;
        for binary in req.binaries {
            if let Some(path) = self.executor.which(binary).await {
                found = Some((*binary, path));
                break;
            }
        }
        let Some((binary, path)) = found else {
            let mut result = BackendCheckResult::unavailable(
                kind,
                CheckStatus::NotFound,
                format!("{} not found in PATH", req.binaries.join(" / ")),
            );
            result
                .recommendations
                .push(format!("Install {} or enable auto-install", req.binaries[0]));
            return result;
        };

        let mut score = weights::PRESENCE;
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();
        let mut unusable = CheckStatus::Unknown;

        // 版本
        let version = match self.run_quiet(binary, req.version_args).await {
            Some(out) if out.success() => {
                // python2 把版本输出到 stderr
                Version::parse_from(&out.stdout).or_else(|| Version::parse_from(&out.stderr))
            }
            _ => {
                unusable = CheckStatus::Corrupted;
                issues.push(format!("{} did not report a version", binary));
                None
            }
        };
        match version {
            Some(v) if v >= req.recommended => score += weights::VERSION_RECOMMENDED,
            Some(v) if v >= req.minimum => {
                score += weights::VERSION_MINIMUM;
                recommendations.push(format!("Upgrade {} to {} or newer", binary, req.recommended));
            }
            Some(v) => {
                issues.push(format!("{} {} is older than required {}", binary, v, req.minimum));
                recommendations.push(format!("Upgrade {} to at least {}", binary, req.minimum));
            }
            None => {}
        }

        // 运行时
        match self.run_quiet(binary, req.runtime_args).await {
            Some(out) if out.success() => score += weights::RUNTIME,
            Some(out) => {
                let summary = out.error_summary();
                if summary.to_lowercase().contains("permission denied") {
                    unusable = CheckStatus::PermissionDenied;
                    recommendations.push(format!(
                        "Grant the current user access to the {}",
                        req.runtime_label
                    ));
                }
                issues.push(format!("{} unavailable: {}", req.runtime_label, summary));
            }
            None => issues.push(format!("{} check did not complete", req.runtime_label)),
        }

        // 配套工具
        let companion_ok = match self.run_quiet(binary, req.companion_args).await {
            Some(out) if out.success() => true,
            _ => match req.companion_binary {
                Some(alt) => self.executor.which(alt).await.is_some(),
                None => false,
            },
        };
        if companion_ok {
            score += weights::COMPANION;
        } else {
            issues.push(format!("{} not available", req.companion_label));
            recommendations.push(format!("Install the {}", req.companion_label));
        }

        score += platform_adjustment(kind, self.os_family);

        let mut result = BackendCheckResult::scored(
            kind,
            score,
            self.config.available_threshold,
            self.config.outdated_threshold,
            unusable,
        );
        result.version = version.map(|v| v.to_string());
        result.path = Some(path);
        result.issues = issues;
        result.recommendations = recommendations;

        debug!(
            backend = %kind,
            score = result.health_score,
            status = result.status.as_str(),
            "Backend environment checked"
        );
        result
    }

    async fn collect_profile(&self) -> DeployResult<SystemProfile> {
        let snapshot = tokio::task::spawn_blocking(|| {
            let mut sys = System::new_with_specifics(
                RefreshKind::new()
                    .with_cpu(CpuRefreshKind::everything())
                    .with_memory(MemoryRefreshKind::everything()),
            );
            sys.refresh_cpu_all();
            let disks = Disks::new_with_refreshed_list();
            let available_disk = disks
                .list()
                .iter()
                .map(|d| d.available_space())
                .max()
                .unwrap_or(0);
            let gb = |bytes: u64| bytes as f64 / 1024.0 / 1024.0 / 1024.0;
            (
                hostname::get()
                    .map(|h| h.to_string_lossy().to_string())
                    .unwrap_or_else(|_| "unknown".to_string()),
                System::os_version().unwrap_or_else(|| "unknown".to_string()),
                sys.cpus().len().max(1),
                gb(sys.total_memory()),
                gb(sys.available_memory()),
                gb(available_disk),
            )
        })
        .await
        .map_err(|e| DeployError::environment(format!("system profile collection failed: {}", e)))?;

        let (hostname, os_version, cpu_cores, total_memory_gb, available_memory_gb, available_disk_gb) =
            snapshot;

        let is_admin = self.detect_admin().await;
        let mut package_managers = Vec::new();
        for pm in PackageManager::ALL {
            if self.executor.which(pm.binary()).await.is_some() {
                package_managers.push(pm);
            }
        }

        Ok(SystemProfile {
            hostname,
            os_family: self.os_family,
            os_version,
            arch: std::env::consts::ARCH.to_string(),
            cpu_cores,
            total_memory_gb,
            available_memory_gb,
            available_disk_gb,
            is_admin,
            package_managers,
            collected_at: Utc::now(),
        })
    }

    async fn detect_admin(&self) -> bool {
        match self.os_family {
            OsFamily::Windows => self
                .run_quiet("net", &["session"])
                .await
                .is_some_and(|o| o.success()),
            _ => self
                .run_quiet("id", &["-u"])
                .await
                .is_some_and(|o| o.success() && o.stdout.trim() == "0"),
        }
    }

    async fn store(&self, kind: BackendKind, result: BackendCheckResult) {
        // 没有整体缓存时不单独建立，detect_all 只读取完整结果
        if let Some(cached) = self.results.write().await.as_mut() {
            cached.value.insert(kind, result);
        }
    }
}

#[async_trait]
impl EnvironmentDetector for EnvironmentProbe {
    async fn system_profile(&self) -> DeployResult<SystemProfile> {
        if let Some(cached) = self.profile.read().await.as_ref() {
            if self.is_fresh(cached.at) {
                return Ok(cached.value.clone());
            }
        }

        let profile = self.collect_profile().await?;
        info!(
            os = profile.os_family.as_str(),
            cores = profile.cpu_cores,
            memory_gb = %format!("{:.1}", profile.available_memory_gb),
            admin = profile.is_admin,
            "System profile collected"
        );
        *self.profile.write().await = Some(Cached {
            value: profile.clone(),
            at: Instant::now(),
        });
        Ok(profile)
    }

    async fn detect_all(&self, force_refresh: bool) -> BTreeMap<BackendKind, BackendCheckResult> {
        if !force_refresh {
            if let Some(cached) = self.results.read().await.as_ref() {
                if self.is_fresh(cached.at) {
                    return cached.value.clone();
                }
            }
        }

        let mut results = BTreeMap::new();
        for kind in BackendKind::ALL {
            results.insert(kind, self.check(kind).await);
        }

        // 并发刷新时后写者覆盖，结果由同一环境推导
        *self.results.write().await = Some(Cached {
            value: results.clone(),
            at: Instant::now(),
        });
        results
    }

    async fn detect_one(&self, kind: BackendKind) -> BackendCheckResult {
        let result = self.check(kind).await;
        self.store(kind, result.clone()).await;
        result
    }

    async fn auto_install(&self, kind: BackendKind, force: bool) -> DeployResult<InstallResult> {
        let started = Instant::now();
        let name = requirement(kind).binaries[0];

        if !force {
            let current = self.detect_one(kind).await;
            if current.is_usable() {
                return Ok(InstallResult::already_present(kind, &current));
            }
        }

        let profile = self.system_profile().await?;
        let plan = install_plan(kind, &profile)
            .ok_or_else(|| DeployError::install(name, "none", "no supported package manager found"))?;

        info!(backend = %kind, method = %plan.method, steps = plan.steps.len(), "Installing runtime");

        let cancel = CancellationToken::new();
        for step in &plan.steps {
            let spec = step.clone().timeout(self.config.install_timeout);
            let output = self
                .executor
                .run(&spec, &cancel)
                .await
                .map_err(|e| DeployError::install(name, plan.method.clone(), format!("{}: {}", spec.display(), e)))?;
            if !output.success() {
                warn!(backend = %kind, command = %spec.display(), "Install step failed");
                return Err(DeployError::install(
                    name,
                    plan.method.clone(),
                    format!("{}: {}", spec.display(), output.error_summary()),
                ));
            }
        }

        let verified = self.check(kind).await;
        self.store(kind, verified.clone()).await;
        if !verified.is_usable() {
            return Err(DeployError::install(
                name,
                plan.method,
                format!(
                    "verification failed after install: {}",
                    verified.issues.join("; ")
                ),
            ));
        }

        info!(backend = %kind, version = ?verified.version, "Runtime installed");
        Ok(InstallResult {
            kind,
            method: plan.method,
            steps_run: plan.steps.iter().map(CommandSpec::display).collect(),
            version: verified.version,
            already_installed: false,
            duration_ms: started.elapsed().as_millis() as i64,
        })
    }

    async fn invalidate(&self) {
        *self.results.write().await = None;
        *self.profile.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExecutor;

    fn healthy_host() -> FakeExecutor {
        FakeExecutor::new()
            .with_program("docker")
            .with_program("python3")
            .respond("docker --version", CommandOutput::ok("Docker version 24.0.7, build afdd53b"))
            .respond("docker info", CommandOutput::ok("24.0.7"))
            .respond("docker compose version", CommandOutput::ok("Docker Compose version v2.21.0"))
            .respond("python3 --version", CommandOutput::ok("Python 3.11.4"))
            .respond("python3 -c import venv", CommandOutput::ok(""))
            .respond("python3 -m pip --version", CommandOutput::ok("pip 23.2"))
    }

    fn probe(executor: Arc<FakeExecutor>) -> EnvironmentProbe {
        EnvironmentProbe::for_platform(executor, ProbeConfig::default(), OsFamily::Linux)
    }

    #[test]
    fn test_version_parse() {
        assert_eq!(
            Version::parse_from("Docker version 24.0.7, build afdd53b"),
            Some(Version::new(24, 0, 7))
        );
        assert_eq!(Version::parse_from("Python 3.9"), Some(Version::new(3, 9, 0)));
        assert_eq!(Version::parse_from("no digits"), None);
        assert!(Version::new(20, 10, 0) > Version::new(20, 9, 9));
    }

    #[tokio::test]
    async fn test_healthy_host_scores_available() {
        let executor = Arc::new(healthy_host());
        let results = probe(executor).detect_all(false).await;

        for result in results.values() {
            assert_eq!(result.status, CheckStatus::Available);
            assert_eq!(result.health_score, 100);
            assert!(result.issues.is_empty());
        }
        assert_eq!(results[&BackendKind::Container].version.as_deref(), Some("24.0.7"));
    }

    #[tokio::test]
    async fn test_missing_runtime_is_not_found() {
        let executor = Arc::new(FakeExecutor::new());
        let result = probe(executor).detect_one(BackendKind::Container).await;

        assert_eq!(result.status, CheckStatus::NotFound);
        assert_eq!(result.health_score, 0);
        assert!(!result.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_daemon_permission_denied() {
        let executor = Arc::new(
            healthy_host().respond(
                "docker info",
                CommandOutput::failed(1, "Got permission denied while trying to connect"),
            ),
        );
        let result = probe(executor).detect_one(BackendKind::Container).await;

        // 30 + 25 + 15 + 5
        assert_eq!(result.health_score, 75);
        assert_eq!(result.status, CheckStatus::Available);
        assert!(result.issues.iter().any(|i| i.contains("docker daemon")));
    }

    #[tokio::test]
    async fn test_old_version_without_runtime_is_unusable() {
        let executor = Arc::new(
            FakeExecutor::new()
                .with_program("docker")
                .respond("docker --version", CommandOutput::ok("Docker version 19.03.1"))
                .respond("docker info", CommandOutput::failed(1, "permission denied")),
        );
        let result = probe(executor).detect_one(BackendKind::Container).await;

        // 30 + 0 + 0 + 0 + 5
        assert_eq!(result.health_score, 35);
        assert_eq!(result.status, CheckStatus::PermissionDenied);
        assert!(result.health_score <= 100);
    }

    #[tokio::test]
    async fn test_detect_all_uses_cache_within_ttl() {
        let executor = Arc::new(healthy_host());
        let probe = probe(executor.clone());

        let first = probe.detect_all(false).await;
        let calls_after_first = executor.call_count();
        assert!(calls_after_first > 0);

        let second = probe.detect_all(false).await;
        assert_eq!(first, second);
        assert_eq!(executor.call_count(), calls_after_first);

        probe.detect_all(true).await;
        assert!(executor.call_count() > calls_after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let executor = Arc::new(healthy_host());
        let probe = probe(executor.clone());

        probe.detect_all(false).await;
        let calls = executor.call_count();

        tokio::time::advance(ProbeConfig::default().cache_ttl + std::time::Duration::from_secs(1))
            .await;
        probe.detect_all(false).await;
        assert!(executor.call_count() > calls);
    }

    #[tokio::test]
    async fn test_auto_install_skips_when_present() {
        let executor = Arc::new(healthy_host());
        let result = probe(executor.clone())
            .auto_install(BackendKind::Process, false)
            .await
            .unwrap();
        assert!(result.already_installed);
        assert_eq!(executor.calls_matching("apt-get"), 0);
    }

    #[tokio::test]
    async fn test_auto_install_step_failure_is_typed() {
        let executor = Arc::new(
            FakeExecutor::new()
                .with_program("apt-get")
                .respond("id -u", CommandOutput::ok("0"))
                .respond("apt-get update", CommandOutput::ok(""))
                .respond("apt-get install", CommandOutput::failed(100, "E: Unable to locate package")),
        );
        let err = probe(executor)
            .auto_install(BackendKind::Process, false)
            .await
            .unwrap_err();

        match err {
            DeployError::DependencyInstall { name, method, reason } => {
                assert_eq!(name, "python3");
                assert_eq!(method, "apt-get");
                assert!(reason.contains("Unable to locate package"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auto_install_fails_verification() {
        // 安装命令成功但仍找不到解释器
        let executor = Arc::new(
            FakeExecutor::new()
                .with_program("apt-get")
                .respond("id -u", CommandOutput::ok("0"))
                .respond("apt-get", CommandOutput::ok("")),
        );
        let err = probe(executor)
            .auto_install(BackendKind::Process, true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("verification failed"));
    }
}
