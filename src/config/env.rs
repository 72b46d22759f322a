//! 环境变量配置加载

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::domain::backend::BackendKind;
use crate::domain::deploy::DeploymentStrategy;
use crate::domain::telemetry::MetricThreshold;
use crate::error::{DeployError, DeployResult};

/// 编排器配置（不可变快照，setter 返回新值）
#[derive(Clone, Debug, Serialize)]
pub struct OrchestratorConfig {
    /// API 密钥
    #[serde(skip_serializing)]
    pub api_key: String,
    /// 服务监听端口
    pub port: u16,
    /// 遥测数据目录；为空时仅内存
    pub data_dir: Option<PathBuf>,
    pub strategy: DeploymentStrategy,
    /// Manual 策略下的后端顺序
    pub manual_order: Vec<BackendKind>,
    pub max_attempts_per_backend: u32,
    /// 主后端之外最多尝试的备选后端数
    pub max_fallback_attempts: u32,
    pub retry_delay: Duration,
    pub health_check_interval: Duration,
    pub auto_recovery: bool,
    /// 关闭自动恢复时，连续失败达到该值判定 Failed
    pub failure_threshold: u32,
    /// 同后端重启次数上限
    pub max_restart_attempts: u32,
    /// 备选后端最低分
    pub viability_floor: f64,
    /// 运行时缺失时允许自动安装
    pub auto_install: bool,
    pub stop_timeout: Duration,
    pub weights: ScoreWeights,
    pub probe: ProbeConfig,
    pub telemetry: TelemetryConfig,
}

/// 后端评分权重
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoreWeights {
    pub availability: f64,
    pub health: f64,
    pub resources: f64,
    pub history: f64,
    pub preference: f64,
    /// 平台调整项的倍数
    pub platform: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            availability: 0.30,
            health: 0.25,
            resources: 0.15,
            history: 0.15,
            preference: 0.15,
            platform: 1.0,
        }
    }
}

impl ScoreWeights {
    /// 从命名权重表构造，未出现的键保留默认值
    pub fn from_map(map: &BTreeMap<String, f64>) -> DeployResult<Self> {
        let mut weights = Self::default();
        for (name, value) in map {
            if !value.is_finite() || *value < 0.0 {
                return Err(DeployError::Config(format!(
                    "score weight '{}' must be a non-negative number",
                    name
                )));
            }
            match name.as_str() {
                "availability" => weights.availability = *value,
                "health" => weights.health = *value,
                "resources" => weights.resources = *value,
                "history" => weights.history = *value,
                "preference" => weights.preference = *value,
                "platform" => weights.platform = *value,
                other => {
                    return Err(DeployError::Config(format!("unknown score weight '{}'", other)))
                }
            }
        }
        Ok(weights)
    }

    /// 解析 `availability=0.3,health=0.25` 格式
    pub fn parse(s: &str) -> DeployResult<Self> {
        let mut map = BTreeMap::new();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| DeployError::Config(format!("invalid weight entry '{}'", pair)))?;
            let value: f64 = value.trim().parse().map_err(|_| {
                DeployError::Config(format!("invalid weight value in '{}'", pair))
            })?;
            map.insert(name.trim().to_string(), value);
        }
        Self::from_map(&map)
    }

    /// 加权项之和（不含平台倍数）
    pub fn total(&self) -> f64 {
        self.availability + self.health + self.resources + self.history + self.preference
    }
}

/// 环境探测配置
#[derive(Clone, Debug, Serialize)]
pub struct ProbeConfig {
    pub available_threshold: u8,
    pub outdated_threshold: u8,
    pub cache_ttl: Duration,
    pub command_timeout: Duration,
    pub install_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            available_threshold: constants::PROBE_AVAILABLE_THRESHOLD,
            outdated_threshold: constants::PROBE_OUTDATED_THRESHOLD,
            cache_ttl: Duration::from_secs(constants::PROBE_CACHE_TTL_SECS),
            command_timeout: Duration::from_secs(15),
            install_timeout: Duration::from_secs(constants::INSTALL_TIMEOUT_SECS),
        }
    }
}

/// 遥测配置
#[derive(Clone, Debug, Serialize)]
pub struct TelemetryConfig {
    pub event_buffer_size: usize,
    pub metric_buffer_size: usize,
    pub flush_interval: Duration,
    pub stream_capacity: usize,
    /// 每个会话在内存中保留的事件 / 指标上限（超出时丢弃最早的记录）
    pub retained_events: usize,
    pub retained_metrics: usize,
    /// 指标名 → 阈值
    pub thresholds: BTreeMap<String, MetricThreshold>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let mut thresholds = BTreeMap::new();
        thresholds.insert(
            metric_names::DEPLOYMENT_DURATION.to_string(),
            MetricThreshold::new(300.0, 900.0),
        );
        thresholds.insert(metric_names::CPU_USAGE.to_string(), MetricThreshold::new(80.0, 95.0));
        thresholds.insert(
            metric_names::MEMORY_USAGE.to_string(),
            MetricThreshold::new(80.0, 95.0),
        );
        thresholds.insert(
            metric_names::HEALTH_LATENCY.to_string(),
            MetricThreshold::new(2000.0, 10000.0),
        );

        Self {
            event_buffer_size: constants::EVENT_BUFFER_SIZE,
            metric_buffer_size: constants::METRIC_BUFFER_SIZE,
            flush_interval: Duration::from_secs(constants::TELEMETRY_FLUSH_SECS),
            stream_capacity: 256,
            retained_events: constants::RETAINED_EVENTS_PER_SESSION,
            retained_metrics: constants::RETAINED_METRICS_PER_SESSION,
            thresholds,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            api_key: "change-me-in-production".to_string(),
            port: 9876,
            data_dir: None,
            strategy: DeploymentStrategy::AutoDetect,
            manual_order: BackendKind::ALL.to_vec(),
            max_attempts_per_backend: 2,
            max_fallback_attempts: 2,
            retry_delay: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            auto_recovery: true,
            failure_threshold: 3,
            max_restart_attempts: 2,
            viability_floor: 40.0,
            auto_install: false,
            stop_timeout: Duration::from_secs(30),
            weights: ScoreWeights::default(),
            probe: ProbeConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> DeployResult<Self> {
        let defaults = Self::default();

        // API Key - 支持旧名称兼容
        let api_key = load_with_fallback("DEPLOY_AGENT_API_KEY", "API_KEY")
            .unwrap_or(defaults.api_key);
        if env::var("API_KEY").is_ok() {
            warn!("Deprecated environment variable API_KEY detected. Please use DEPLOY_AGENT_API_KEY");
        }

        let strategy = match env::var("DEPLOY_STRATEGY") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.strategy,
        };

        let manual_order = match env::var("DEPLOY_MANUAL_ORDER") {
            Ok(v) => parse_backend_order(&v)?,
            Err(_) => defaults.manual_order,
        };

        let weights = match env::var("DEPLOY_SCORE_WEIGHTS") {
            Ok(v) => ScoreWeights::parse(&v)?,
            Err(_) => defaults.weights,
        };

        let data_dir = env::var("DEPLOY_DATA_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            api_key,
            port: parse_env("PORT", defaults.port),
            data_dir,
            strategy,
            manual_order,
            max_attempts_per_backend: parse_env(
                "DEPLOY_MAX_ATTEMPTS_PER_BACKEND",
                defaults.max_attempts_per_backend,
            )
            .max(1),
            max_fallback_attempts: parse_env(
                "DEPLOY_MAX_FALLBACK_ATTEMPTS",
                defaults.max_fallback_attempts,
            ),
            retry_delay: Duration::from_secs(parse_env(
                "DEPLOY_RETRY_DELAY_SECS",
                defaults.retry_delay.as_secs(),
            )),
            health_check_interval: Duration::from_secs(
                parse_env(
                    "DEPLOY_HEALTH_INTERVAL_SECS",
                    defaults.health_check_interval.as_secs(),
                )
                .max(1),
            ),
            auto_recovery: parse_bool_env("DEPLOY_AUTO_RECOVERY", defaults.auto_recovery),
            failure_threshold: parse_env("DEPLOY_FAILURE_THRESHOLD", defaults.failure_threshold)
                .max(1),
            max_restart_attempts: parse_env(
                "DEPLOY_MAX_RESTART_ATTEMPTS",
                defaults.max_restart_attempts,
            ),
            viability_floor: parse_env("DEPLOY_VIABILITY_FLOOR", defaults.viability_floor)
                .clamp(0.0, 100.0),
            auto_install: parse_bool_env("DEPLOY_AUTO_INSTALL", defaults.auto_install),
            stop_timeout: Duration::from_secs(parse_env(
                "DEPLOY_STOP_TIMEOUT_SECS",
                defaults.stop_timeout.as_secs(),
            )),
            weights,
            probe: defaults.probe,
            telemetry: defaults.telemetry,
        })
    }

    /// 返回替换策略后的新配置
    pub fn with_strategy(&self, strategy: DeploymentStrategy) -> Self {
        Self {
            strategy,
            ..self.clone()
        }
    }

    /// 返回替换自动恢复开关后的新配置
    pub fn with_auto_recovery(&self, enabled: bool) -> Self {
        Self {
            auto_recovery: enabled,
            ..self.clone()
        }
    }

    /// 返回替换评分权重后的新配置
    pub fn with_weights(&self, weights: ScoreWeights) -> Self {
        Self {
            weights,
            ..self.clone()
        }
    }
}

/// 解析 `container,process` 格式的后端顺序（去重）
pub fn parse_backend_order(s: &str) -> DeployResult<Vec<BackendKind>> {
    let mut order = Vec::new();
    for item in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let kind = BackendKind::from_str(item)?;
        if !order.contains(&kind) {
            order.push(kind);
        }
    }
    if order.is_empty() {
        return Err(DeployError::Config("manual order is empty".to_string()));
    }
    Ok(order)
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

/// 解析数值型环境变量，非法值时回退默认值并告警
pub(crate) fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => match v.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(key, value = %v, "Invalid value in environment, using default");
                default
            }
        },
        Err(_) => default,
    }
}

pub(crate) fn parse_bool_env(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
        .unwrap_or(default)
}

/// 指标名称
pub mod metric_names {
    pub const DEPLOYMENT_DURATION: &str = "deployment_duration_secs";
    pub const CPU_USAGE: &str = "cpu_usage_percent";
    pub const MEMORY_USAGE: &str = "memory_usage_percent";
    pub const HEALTH_LATENCY: &str = "health_check_latency_ms";
    pub const BACKEND_ATTEMPT_DURATION: &str = "backend_attempt_duration_ms";
}

/// 常量
pub mod constants {
    /// 探测结果 Available 的最低分
    pub const PROBE_AVAILABLE_THRESHOLD: u8 = 70;

    /// 探测结果 Outdated 的最低分
    pub const PROBE_OUTDATED_THRESHOLD: u8 = 40;

    /// 探测缓存有效期（秒）
    pub const PROBE_CACHE_TTL_SECS: u64 = 300;

    /// 安装命令超时（秒）
    pub const INSTALL_TIMEOUT_SECS: u64 = 900; // 15 分钟

    pub const EVENT_BUFFER_SIZE: usize = 100;
    pub const METRIC_BUFFER_SIZE: usize = 50;

    /// 遥测刷新间隔（秒）
    pub const TELEMETRY_FLUSH_SECS: u64 = 30;

    /// 每个会话内存中保留的事件数
    pub const RETAINED_EVENTS_PER_SESSION: usize = 1000;

    /// 每个会话内存中保留的指标数
    pub const RETAINED_METRICS_PER_SESSION: usize = 1000;

    /// 部署历史最大保存数量
    pub const MAX_HISTORY: usize = 100;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_with_fallback() {
        env::set_var("TEST_ORCH_PRIMARY", "primary_value");
        env::set_var("TEST_ORCH_FALLBACK", "fallback_value");

        assert_eq!(
            load_with_fallback("TEST_ORCH_PRIMARY", "TEST_ORCH_FALLBACK"),
            Some("primary_value".to_string())
        );

        env::remove_var("TEST_ORCH_PRIMARY");
        assert_eq!(
            load_with_fallback("TEST_ORCH_PRIMARY", "TEST_ORCH_FALLBACK"),
            Some("fallback_value".to_string())
        );

        env::remove_var("TEST_ORCH_FALLBACK");
        assert_eq!(load_with_fallback("TEST_ORCH_PRIMARY", "TEST_ORCH_FALLBACK"), None);
    }

    #[test]
    fn test_parse_env_falls_back_on_garbage() {
        env::set_var("TEST_ORCH_NUMBER", "not-a-number");
        assert_eq!(parse_env("TEST_ORCH_NUMBER", 7u32), 7);
        env::set_var("TEST_ORCH_NUMBER", " 12 ");
        assert_eq!(parse_env("TEST_ORCH_NUMBER", 7u32), 12);
        env::remove_var("TEST_ORCH_NUMBER");
    }

    #[test]
    fn test_score_weights_parse() {
        let w = ScoreWeights::parse("availability=0.5, history=0.1").unwrap();
        assert_eq!(w.availability, 0.5);
        assert_eq!(w.history, 0.1);
        assert_eq!(w.health, ScoreWeights::default().health);

        assert!(ScoreWeights::parse("speed=1").is_err());
        assert!(ScoreWeights::parse("health").is_err());
        assert!(ScoreWeights::parse("health=-1").is_err());
    }

    #[test]
    fn test_parse_backend_order_dedups() {
        let order = parse_backend_order("process, docker, python").unwrap();
        assert_eq!(order, vec![BackendKind::Process, BackendKind::Container]);
        assert!(parse_backend_order(" , ").is_err());
    }

    #[test]
    fn test_setters_return_new_snapshot() {
        let base = OrchestratorConfig::default();
        let next = base.with_strategy(DeploymentStrategy::ProcessOnly);
        assert_eq!(base.strategy, DeploymentStrategy::AutoDetect);
        assert_eq!(next.strategy, DeploymentStrategy::ProcessOnly);

        let next = next.with_auto_recovery(false);
        assert!(!next.auto_recovery);
        assert!(base.auto_recovery);
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        assert!((ScoreWeights::default().total() - 1.0).abs() < 1e-9);
    }
}
