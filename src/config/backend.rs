//! 后端部署配置
//!
//! 可从环境变量加载，也可通过 HTTP deploy 请求以 JSON 传入

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::env::{parse_bool_env, parse_env};
use crate::domain::backend::BackendKind;
use crate::error::{DeployError, DeploymentErrorKind, DeployResult};

/// 冒烟检查（依赖服务可达性）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SmokeCheck {
    pub name: String,
    pub url: String,
    /// 期望的 HTTP 状态码；为空时任意 2xx 均视为通过
    #[serde(default)]
    pub expected_status: Option<u16>,
    /// 必需检查失败时整体部署失败，否则仅记为警告
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default = "default_smoke_timeout")]
    pub timeout_secs: u64,
}

impl SmokeCheck {
    /// 解析 `name=url` 或纯 url，`?` 前缀表示可选检查
    pub fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return None;
        }
        let (required, entry) = match entry.strip_prefix('?') {
            Some(rest) => (false, rest),
            None => (true, entry),
        };
        let (name, url) = match entry.split_once('=') {
            Some((name, url)) => (name.trim().to_string(), url.trim().to_string()),
            None => (entry.to_string(), entry.to_string()),
        };
        Some(Self {
            name,
            url,
            expected_status: None,
            required,
            timeout_secs: default_smoke_timeout(),
        })
    }
}

/// 容器后端配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContainerBackendConfig {
    /// compose 文件路径（相对路径基于 work_dir）
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub env_file: Option<PathBuf>,
    /// 仅部署指定服务；为空表示全部
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub force_rebuild: bool,
    #[serde(default = "default_true")]
    pub pull_images: bool,
    #[serde(default = "default_container_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    /// 连续不健康次数达到该值触发一次自动重启
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_max_auto_restarts")]
    pub max_auto_restarts: u32,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(default)]
    pub smoke_checks: Vec<SmokeCheck>,
}

impl ContainerBackendConfig {
    pub fn new(compose_file: impl Into<PathBuf>) -> Self {
        Self {
            compose_file: compose_file.into(),
            project_name: None,
            work_dir: None,
            env_file: None,
            services: Vec::new(),
            force_rebuild: false,
            pull_images: true,
            startup_timeout_secs: default_container_startup_timeout(),
            poll_interval_secs: default_poll_interval(),
            health_interval_secs: default_health_interval(),
            unhealthy_threshold: default_unhealthy_threshold(),
            max_auto_restarts: default_max_auto_restarts(),
            stop_timeout_secs: default_stop_timeout(),
            smoke_checks: Vec::new(),
        }
    }

    /// 从环境变量加载；未设置 COMPOSE_FILE 时返回 None
    pub fn from_env() -> Option<Self> {
        let compose_file = env::var("COMPOSE_FILE").ok().filter(|s| !s.is_empty())?;
        let mut config = Self::new(compose_file);

        config.project_name = env::var("COMPOSE_PROJECT").ok().filter(|s| !s.is_empty());
        config.work_dir = env::var("COMPOSE_WORK_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        config.env_file = env::var("COMPOSE_ENV_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        config.services = split_list(&env::var("COMPOSE_SERVICES").unwrap_or_default());
        config.force_rebuild = parse_bool_env("COMPOSE_FORCE_REBUILD", false);
        config.pull_images = parse_bool_env("COMPOSE_PULL", true);
        config.startup_timeout_secs =
            parse_env("COMPOSE_STARTUP_TIMEOUT_SECS", config.startup_timeout_secs);
        config.health_interval_secs =
            parse_env("COMPOSE_HEALTH_INTERVAL_SECS", config.health_interval_secs);
        config.smoke_checks = env::var("COMPOSE_SMOKE_CHECKS")
            .unwrap_or_default()
            .split(',')
            .filter_map(SmokeCheck::parse)
            .collect();

        Some(config)
    }

    /// compose 文件的绝对/实际路径
    pub fn resolved_compose_file(&self) -> PathBuf {
        match &self.work_dir {
            Some(dir) if self.compose_file.is_relative() => dir.join(&self.compose_file),
            _ => self.compose_file.clone(),
        }
    }

    /// 执行 compose 命令的工作目录
    pub fn effective_work_dir(&self) -> Option<PathBuf> {
        self.work_dir.clone().or_else(|| {
            self.compose_file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
        })
    }

    pub fn validate(&self) -> DeployResult<()> {
        if self.compose_file.as_os_str().is_empty() {
            return Err(validation(BackendKind::Container, "compose file path is empty"));
        }
        if self.startup_timeout_secs == 0 {
            return Err(validation(
                BackendKind::Container,
                "startup timeout must be greater than zero",
            ));
        }
        if let Some(check) = self.smoke_checks.iter().find(|c| !is_http_url(&c.url)) {
            return Err(validation(
                BackendKind::Container,
                format!("smoke check '{}' has invalid url '{}'", check.name, check.url),
            ));
        }
        Ok(())
    }
}

/// 进程存活判定方式
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LivenessProbe {
    /// HTTP GET 返回 2xx
    Http { url: String },
    /// TCP 端口可连接
    Tcp { host: String, port: u16 },
    /// 日志中出现指定文本
    LogPattern { pattern: String },
    /// 进程持续运行指定秒数
    Uptime { secs: u64 },
}

impl LivenessProbe {
    /// 解析 `http:URL` / `tcp:HOST:PORT` / `log:TEXT` / `uptime:SECS`
    pub fn parse(s: &str) -> DeployResult<Self> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| DeployError::Config(format!("invalid liveness probe '{}'", s)))?;
        match kind.trim().to_lowercase().as_str() {
            "http" | "https" => {
                // 完整 URL 或 `http:<url>` 前缀形式
                let url = if value.starts_with("//") {
                    s.to_string()
                } else {
                    value.to_string()
                };
                Ok(LivenessProbe::Http { url })
            }
            "tcp" => {
                let (host, port) = value.rsplit_once(':').unwrap_or(("127.0.0.1", value));
                let port = port
                    .parse()
                    .map_err(|_| DeployError::Config(format!("invalid tcp port in '{}'", s)))?;
                Ok(LivenessProbe::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "log" => Ok(LivenessProbe::LogPattern {
                pattern: value.to_string(),
            }),
            "uptime" => {
                let secs = value
                    .parse()
                    .map_err(|_| DeployError::Config(format!("invalid uptime in '{}'", s)))?;
                Ok(LivenessProbe::Uptime { secs })
            }
            other => Err(DeployError::Config(format!("unknown liveness probe '{}'", other))),
        }
    }
}

impl Default for LivenessProbe {
    fn default() -> Self {
        LivenessProbe::Uptime { secs: 5 }
    }
}

/// 进程后端配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessBackendConfig {
    pub work_dir: PathBuf,
    /// 启动命令（argv）；首项为 `python` 时使用隔离环境内的解释器
    pub command: Vec<String>,
    /// 解释器
    #[serde(default = "default_python")]
    pub python: String,
    /// 隔离运行环境目录，默认 `<work_dir>/.venv`
    #[serde(default)]
    pub runtime_dir: Option<PathBuf>,
    #[serde(default)]
    pub requirements_file: Option<PathBuf>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// 启用内嵌轻量替代服务（SQLite / 内存缓存 / 内存消息队列）
    #[serde(default)]
    pub embedded_services: bool,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub liveness: LivenessProbe,
    #[serde(default = "default_process_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// 线性退避基数（第 n 次重启等待 n * backoff）
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_secs: u64,
    #[serde(default = "default_process_stop_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
}

impl ProcessBackendConfig {
    pub fn new(work_dir: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            command,
            python: default_python(),
            runtime_dir: None,
            requirements_file: None,
            packages: Vec::new(),
            env: BTreeMap::new(),
            embedded_services: false,
            data_dir: None,
            liveness: LivenessProbe::default(),
            startup_timeout_secs: default_process_startup_timeout(),
            health_interval_secs: default_health_interval(),
            max_restarts: default_max_restarts(),
            restart_backoff_secs: default_restart_backoff(),
            stop_timeout_secs: default_process_stop_timeout(),
            log_file: None,
            pid_file: None,
            install_timeout_secs: default_install_timeout(),
        }
    }

    /// 从环境变量加载；未设置 PROCESS_COMMAND 时返回 None
    pub fn from_env() -> DeployResult<Option<Self>> {
        let command = match env::var("PROCESS_COMMAND").ok().filter(|s| !s.trim().is_empty()) {
            Some(cmd) => cmd.split_whitespace().map(str::to_string).collect(),
            None => return Ok(None),
        };
        let work_dir = env::var("PROCESS_WORK_DIR").unwrap_or_else(|_| ".".to_string());
        let mut config = Self::new(work_dir, command);

        if let Ok(python) = env::var("PROCESS_PYTHON") {
            config.python = python;
        }
        config.runtime_dir = env::var("PROCESS_RUNTIME_DIR").ok().map(PathBuf::from);
        config.requirements_file = env::var("PROCESS_REQUIREMENTS")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        config.packages = split_list(&env::var("PROCESS_PACKAGES").unwrap_or_default());
        config.embedded_services = parse_bool_env("PROCESS_EMBEDDED_SERVICES", false);
        config.data_dir = env::var("PROCESS_DATA_DIR").ok().map(PathBuf::from);
        if let Ok(liveness) = env::var("PROCESS_LIVENESS") {
            config.liveness = LivenessProbe::parse(&liveness)?;
        }
        config.startup_timeout_secs =
            parse_env("PROCESS_STARTUP_TIMEOUT_SECS", config.startup_timeout_secs);
        config.health_interval_secs =
            parse_env("PROCESS_HEALTH_INTERVAL_SECS", config.health_interval_secs);
        config.max_restarts = parse_env("PROCESS_MAX_RESTARTS", config.max_restarts);
        config.restart_backoff_secs =
            parse_env("PROCESS_RESTART_BACKOFF_SECS", config.restart_backoff_secs);
        config.stop_timeout_secs = parse_env("PROCESS_STOP_TIMEOUT_SECS", config.stop_timeout_secs);
        config.log_file = env::var("PROCESS_LOG_FILE").ok().map(PathBuf::from);
        config.pid_file = env::var("PROCESS_PID_FILE").ok().map(PathBuf::from);

        // PROCESS_ENV_* 透传给目标进程
        for (key, value) in env::vars() {
            if let Some(name) = key.strip_prefix("PROCESS_ENV_") {
                config.env.insert(name.to_string(), value);
            }
        }

        Ok(Some(config))
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join(".venv"))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join(".data"))
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.work_dir.join("service.log"))
    }

    pub fn pid_file(&self) -> PathBuf {
        self.pid_file
            .clone()
            .unwrap_or_else(|| self.work_dir.join("service.pid"))
    }

    pub fn validate(&self) -> DeployResult<()> {
        if self.command.is_empty() {
            return Err(validation(BackendKind::Process, "process command is empty"));
        }
        if self.startup_timeout_secs == 0 {
            return Err(validation(
                BackendKind::Process,
                "startup timeout must be greater than zero",
            ));
        }
        if let LivenessProbe::Http { url } = &self.liveness {
            if !is_http_url(url) {
                return Err(validation(
                    BackendKind::Process,
                    format!("liveness url '{}' is not http(s)", url),
                ));
            }
        }
        Ok(())
    }
}

/// 单个后端的配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendConfig {
    Container(ContainerBackendConfig),
    Process(ProcessBackendConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Container(_) => BackendKind::Container,
            BackendConfig::Process(_) => BackendKind::Process,
        }
    }
}

/// 所有后端的配置集合
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfigs {
    #[serde(default)]
    pub container: Option<ContainerBackendConfig>,
    #[serde(default)]
    pub process: Option<ProcessBackendConfig>,
}

impl BackendConfigs {
    pub fn from_env() -> DeployResult<Self> {
        Ok(Self {
            container: ContainerBackendConfig::from_env(),
            process: ProcessBackendConfig::from_env()?,
        })
    }

    pub fn get(&self, kind: BackendKind) -> Option<BackendConfig> {
        match kind {
            BackendKind::Container => self.container.clone().map(BackendConfig::Container),
            BackendKind::Process => self.process.clone().map(BackendConfig::Process),
        }
    }

    /// 已配置的后端
    pub fn kinds(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|k| self.get(*k).is_some())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.container.is_none() && self.process.is_none()
    }

    /// 以 `other` 中已设置的后端覆盖当前值
    pub fn merged_with(&self, other: &BackendConfigs) -> Self {
        Self {
            container: other.container.clone().or_else(|| self.container.clone()),
            process: other.process.clone().or_else(|| self.process.clone()),
        }
    }
}

fn validation(kind: BackendKind, message: impl Into<String>) -> DeployError {
    DeployError::deployment(kind, DeploymentErrorKind::Validation, message)
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

fn default_smoke_timeout() -> u64 {
    10
}

fn default_container_startup_timeout() -> u64 {
    300
}

fn default_process_startup_timeout() -> u64 {
    120
}

fn default_poll_interval() -> u64 {
    5
}

fn default_health_interval() -> u64 {
    30
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_max_auto_restarts() -> u32 {
    1
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_process_stop_timeout() -> u64 {
    10
}

fn default_python() -> String {
    if cfg!(windows) {
        "python".to_string()
    } else {
        "python3".to_string()
    }
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_backoff() -> u64 {
    5
}

fn default_install_timeout() -> u64 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_config_from_json_defaults() {
        let config: ContainerBackendConfig =
            serde_json::from_str(r#"{"compose_file":"deploy/compose.yml"}"#).unwrap();
        assert!(config.pull_images);
        assert_eq!(config.unhealthy_threshold, 3);
        assert_eq!(config.effective_work_dir(), Some(PathBuf::from("deploy")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolved_compose_file_uses_work_dir() {
        let mut config = ContainerBackendConfig::new("compose.yml");
        config.work_dir = Some(PathBuf::from("/srv/app"));
        assert_eq!(
            config.resolved_compose_file(),
            PathBuf::from("/srv/app/compose.yml")
        );
    }

    #[test]
    fn test_smoke_check_parse() {
        let check = SmokeCheck::parse("?api=http://localhost:8000/health").unwrap();
        assert_eq!(check.name, "api");
        assert!(!check.required);
        assert!(SmokeCheck::parse("  ").is_none());

        let mut config = ContainerBackendConfig::new("compose.yml");
        config.smoke_checks = vec![SmokeCheck::parse("db=tcp://x").unwrap()];
        let err = config.validate().unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_liveness_probe_parse() {
        assert_eq!(
            LivenessProbe::parse("http://127.0.0.1:8000/health").unwrap(),
            LivenessProbe::Http {
                url: "http://127.0.0.1:8000/health".to_string()
            }
        );
        assert_eq!(
            LivenessProbe::parse("tcp:localhost:8000").unwrap(),
            LivenessProbe::Tcp {
                host: "localhost".to_string(),
                port: 8000
            }
        );
        assert_eq!(
            LivenessProbe::parse("uptime:3").unwrap(),
            LivenessProbe::Uptime { secs: 3 }
        );
        assert!(LivenessProbe::parse("tcp:nope").is_err());
        assert!(LivenessProbe::parse("smoke:1").is_err());
    }

    #[test]
    fn test_process_config_paths_and_validation() {
        let config = ProcessBackendConfig::new("/srv/app", vec!["python".into(), "app.py".into()]);
        assert_eq!(config.runtime_dir(), PathBuf::from("/srv/app/.venv"));
        assert_eq!(config.log_file(), PathBuf::from("/srv/app/service.log"));
        assert!(config.validate().is_ok());

        let empty = ProcessBackendConfig::new("/srv/app", Vec::new());
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_backend_configs_kinds_and_merge() {
        let base = BackendConfigs {
            container: Some(ContainerBackendConfig::new("a.yml")),
            process: None,
        };
        assert_eq!(base.kinds(), vec![BackendKind::Container]);

        let overlay = BackendConfigs {
            container: None,
            process: Some(ProcessBackendConfig::new("/app", vec!["run".into()])),
        };
        let merged = base.merged_with(&overlay);
        assert_eq!(merged.kinds(), BackendKind::ALL.to_vec());
        assert!(matches!(
            merged.get(BackendKind::Process),
            Some(BackendConfig::Process(_))
        ));
    }
}
