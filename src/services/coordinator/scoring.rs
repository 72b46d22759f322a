//! 后端评分与部署计划
//!
//! 分数 = 各项加权平均（0-100）+ 平台调整，裁剪到 [0, 100]。
//! 主后端取最高分，备选后端须高于最低可用线；同分按后端声明顺序排序。

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;

use crate::config::env::OrchestratorConfig;
use crate::domain::backend::{BackendCheckResult, BackendKind, CheckStatus};
use crate::domain::deploy::{
    BackendScore, DeploymentPlan, DeploymentStrategy, ScoreBreakdown,
};
use crate::domain::system::{OsFamily, SystemProfile};
use crate::error::{DeployError, DeployResult};

/// 无历史数据时的成功率
const DEFAULT_SUCCESS_RATE: f64 = 0.5;

/// 后端资源需求
struct ResourceNeeds {
    memory_gb: f64,
    disk_gb: f64,
    cores: usize,
    estimated_secs: u64,
}

fn resource_needs(kind: BackendKind) -> ResourceNeeds {
    match kind {
        BackendKind::Container => ResourceNeeds {
            memory_gb: 2.0,
            disk_gb: 10.0,
            cores: 2,
            estimated_secs: 180,
        },
        BackendKind::Process => ResourceNeeds {
            memory_gb: 0.5,
            disk_gb: 2.0,
            cores: 1,
            estimated_secs: 120,
        },
    }
}

/// 单个后端的历史统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct BackendStats {
    pub successes: u32,
    pub failures: u32,
}

impl BackendStats {
    pub fn record(&mut self, success: bool) {
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            DEFAULT_SUCCESS_RATE
        } else {
            f64::from(self.successes) / f64::from(total)
        }
    }
}

/// 评分输入
pub struct ScoringInput<'a> {
    pub config: &'a OrchestratorConfig,
    pub strategy: DeploymentStrategy,
    pub profile: &'a SystemProfile,
    pub checks: &'a BTreeMap<BackendKind, BackendCheckResult>,
    pub stats: &'a BTreeMap<BackendKind, BackendStats>,
}

impl ScoringInput<'_> {
    fn check(&self, kind: BackendKind) -> Option<&BackendCheckResult> {
        self.checks.get(&kind)
    }

    fn runtime_usable(&self, kind: BackendKind) -> bool {
        self.check(kind).is_some_and(BackendCheckResult::is_usable)
    }

    /// 计算单个后端的分数
    pub fn score(&self, kind: BackendKind) -> BackendScore {
        let weights = &self.config.weights;
        let check = self.check(kind);

        let breakdown = ScoreBreakdown {
            availability: match check.map(|c| c.status) {
                Some(CheckStatus::Available) => 100.0,
                Some(CheckStatus::Outdated) => 60.0,
                _ => 0.0,
            },
            health: check.map_or(0.0, |c| f64::from(c.health_score)),
            resources: resource_fit(kind, self.profile),
            history: self
                .stats
                .get(&kind)
                .copied()
                .unwrap_or_default()
                .success_rate()
                * 100.0,
            preference: self.preference(kind),
            platform_adjustment: platform_adjustment(kind, self.profile),
        };

        let total = weights.total();
        let weighted = if total > 0.0 {
            (weights.availability * breakdown.availability
                + weights.health * breakdown.health
                + weights.resources * breakdown.resources
                + weights.history * breakdown.history
                + weights.preference * breakdown.preference)
                / total
        } else {
            0.0
        };
        let score = (weighted + weights.platform * breakdown.platform_adjustment).clamp(0.0, 100.0);

        // 运行时不可用且不允许自动安装时，分数再高也无法部署
        let installable = self.config.auto_install || self.runtime_usable(kind);
        BackendScore {
            kind,
            score,
            viable: installable && score >= self.config.viability_floor,
            breakdown,
        }
    }

    fn preference(&self, kind: BackendKind) -> f64 {
        if self.strategy != DeploymentStrategy::Manual {
            return self.strategy.preference(kind);
        }
        match self.config.manual_order.iter().position(|k| *k == kind) {
            Some(idx) => (100.0 - 40.0 * idx as f64).max(0.0),
            None => 0.0,
        }
    }
}

/// 资源匹配度：内存 / 磁盘 / CPU 满足比例的平均值
fn resource_fit(kind: BackendKind, profile: &SystemProfile) -> f64 {
    let needs = resource_needs(kind);
    let ratio = |have: f64, need: f64| (have / need).clamp(0.0, 1.0);
    let fit = (ratio(profile.available_memory_gb, needs.memory_gb)
        + ratio(profile.available_disk_gb, needs.disk_gb)
        + ratio(profile.cpu_cores as f64, needs.cores as f64))
        / 3.0;
    fit * 100.0
}

/// 平台相关的加减分
fn platform_adjustment(kind: BackendKind, profile: &SystemProfile) -> f64 {
    let mut adjustment = 0.0;
    match kind {
        BackendKind::Container => {
            if profile.total_memory_gb < 4.0 {
                adjustment -= 10.0;
            }
            if profile.os_family == OsFamily::Linux && !profile.is_admin {
                adjustment -= 5.0;
            }
        }
        BackendKind::Process => {
            if profile.os_family == OsFamily::Windows {
                adjustment -= 5.0;
            }
        }
    }
    adjustment
}

/// 按分数降序、同分按声明顺序排序
fn rank(scores: &mut [BackendScore]) {
    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.kind.priority().cmp(&b.kind.priority()))
    });
}

/// 生成部署计划
///
/// `candidates` 为已提供部署配置的后端；策略不允许的后端不参与评分。
pub fn build_plan(input: &ScoringInput<'_>, candidates: &[BackendKind]) -> DeployResult<DeploymentPlan> {
    let mut scores: Vec<BackendScore> = candidates
        .iter()
        .copied()
        .filter(|k| input.strategy.allows(*k))
        .map(|k| input.score(k))
        .collect();
    if scores.is_empty() {
        return Err(DeployError::Config(format!(
            "strategy {} has no configured backend",
            input.strategy
        )));
    }
    rank(&mut scores);

    let mut risk_factors = Vec::new();
    let primary = match scores.iter().find(|s| s.viable) {
        Some(s) => s.kind,
        None if input.config.auto_install => {
            let top = &scores[0];
            risk_factors.push(format!(
                "{} scored {:.1}, below viability floor {:.1}; relying on auto-install",
                top.kind, top.score, input.config.viability_floor
            ));
            top.kind
        }
        None => {
            let detail = scores
                .iter()
                .map(|s| format!("{}={:.1}", s.kind, s.score))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(DeployError::environment(format!(
                "no viable backend (floor {:.1})",
                input.config.viability_floor
            ))
            .with_details(detail));
        }
    };

    let fallbacks: Vec<BackendKind> = scores
        .iter()
        .filter(|s| s.viable && s.kind != primary)
        .map(|s| s.kind)
        .take(input.config.max_fallback_attempts as usize)
        .collect();

    if let Some(check) = input.check(primary) {
        risk_factors.extend(check.issues.iter().cloned());
        if check.status == CheckStatus::Outdated {
            risk_factors.push(format!("{} runtime is outdated", primary));
        }
    }
    if fallbacks.is_empty() {
        risk_factors.push("no fallback backend available".to_string());
    }
    let needs = resource_needs(primary);
    if input.profile.available_memory_gb < needs.memory_gb {
        risk_factors.push(format!(
            "low memory: {:.1} GB available, {:.1} GB recommended",
            input.profile.available_memory_gb, needs.memory_gb
        ));
    }
    if input.profile.available_disk_gb < needs.disk_gb {
        risk_factors.push(format!(
            "low disk: {:.1} GB available, {:.1} GB recommended",
            input.profile.available_disk_gb, needs.disk_gb
        ));
    }

    let primary_score = scores
        .iter()
        .find(|s| s.kind == primary)
        .map_or(0.0, |s| s.score);
    let mut confidence = primary_score / 100.0;
    if fallbacks.is_empty() {
        confidence *= 0.9;
    }

    let mut estimated_duration_secs = needs.estimated_secs;
    if !input.runtime_usable(primary) {
        estimated_duration_secs += input.config.probe.install_timeout.as_secs() / 3;
    }

    Ok(DeploymentPlan {
        strategy: input.strategy,
        primary,
        fallbacks,
        scores,
        confidence: confidence.clamp(0.0, 1.0),
        risk_factors,
        estimated_duration_secs,
        created_at: Utc::now(),
    })
}

/// 单个后端的部署建议
#[derive(Clone, Debug, Serialize)]
pub struct BackendRecommendation {
    pub kind: BackendKind,
    pub score: f64,
    pub viable: bool,
    pub status: CheckStatus,
    pub version: Option<String>,
    pub configured: bool,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

/// 部署建议汇总
#[derive(Clone, Debug, Serialize)]
pub struct Recommendations {
    pub strategy: DeploymentStrategy,
    /// 建议的主后端（无可行后端时为空）
    pub recommended: Option<BackendKind>,
    pub backends: Vec<BackendRecommendation>,
    pub system: SystemProfile,
    pub notes: Vec<String>,
}

/// 基于探测结果生成部署建议（不要求已提供部署配置）
pub fn recommendations(input: &ScoringInput<'_>, configured: &[BackendKind]) -> Recommendations {
    let mut scores: Vec<BackendScore> = BackendKind::ALL
        .into_iter()
        .filter(|k| input.strategy.allows(*k))
        .map(|k| input.score(k))
        .collect();
    rank(&mut scores);

    let backends: Vec<BackendRecommendation> = scores
        .iter()
        .map(|s| {
            let check = input.check(s.kind);
            BackendRecommendation {
                kind: s.kind,
                score: s.score,
                viable: s.viable,
                status: check.map_or(CheckStatus::Unknown, |c| c.status),
                version: check.and_then(|c| c.version.clone()),
                configured: configured.contains(&s.kind),
                issues: check.map(|c| c.issues.clone()).unwrap_or_default(),
                recommendations: check.map(|c| c.recommendations.clone()).unwrap_or_default(),
            }
        })
        .collect();

    let recommended = backends
        .iter()
        .find(|b| b.viable && b.configured)
        .or_else(|| backends.iter().find(|b| b.viable))
        .map(|b| b.kind);

    let mut notes = Vec::new();
    if !input.profile.is_admin {
        notes.push("not running with administrator privileges; installs use sudo -n".to_string());
    }
    if input.profile.package_managers.is_empty() {
        notes.push("no supported package manager found; auto-install unavailable".to_string());
    }
    if recommended.is_none() {
        notes.push(format!(
            "no backend reaches the viability floor {:.1}",
            input.config.viability_floor
        ));
    }

    Recommendations {
        strategy: input.strategy,
        recommended,
        backends,
        system: input.profile.clone(),
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backend::CheckStatus;
    use crate::testing::{check, linux_profile};

    fn checks(container: i32, process: i32) -> BTreeMap<BackendKind, BackendCheckResult> {
        let mut map = BTreeMap::new();
        map.insert(BackendKind::Container, check(BackendKind::Container, container));
        map.insert(BackendKind::Process, check(BackendKind::Process, process));
        map
    }

    fn plan(
        config: &OrchestratorConfig,
        checks: &BTreeMap<BackendKind, BackendCheckResult>,
    ) -> DeployResult<DeploymentPlan> {
        let stats = BTreeMap::new();
        let profile = linux_profile();
        let input = ScoringInput {
            config,
            strategy: config.strategy,
            profile: &profile,
            checks,
            stats: &stats,
        };
        build_plan(&input, &BackendKind::ALL)
    }

    #[test]
    fn test_unavailable_container_falls_to_process() {
        let config = OrchestratorConfig::default();
        let mut checks = checks(0, 95);
        checks.insert(
            BackendKind::Container,
            BackendCheckResult::unavailable(BackendKind::Container, CheckStatus::NotFound, "docker missing"),
        );

        let plan = plan(&config, &checks).unwrap();

        assert_eq!(plan.primary, BackendKind::Process);
        assert!(plan.fallbacks.is_empty());
        assert!(!plan.scores.iter().find(|s| s.kind == BackendKind::Container).unwrap().viable);
        assert!(plan.risk_factors.iter().any(|r| r.contains("no fallback")));
    }

    #[test]
    fn test_plan_invariants() {
        for strategy in [
            DeploymentStrategy::AutoDetect,
            DeploymentStrategy::ContainerPreferred,
            DeploymentStrategy::ProcessPreferred,
            DeploymentStrategy::Manual,
        ] {
            for (c, p) in [(100, 100), (90, 60), (60, 90), (75, 75)] {
                let config = OrchestratorConfig::default().with_strategy(strategy);
                let plan = plan(&config, &checks(c, p)).unwrap();
                assert!(!plan.fallbacks.contains(&plan.primary));
                let ordered: Vec<f64> = plan
                    .ordered_backends()
                    .iter()
                    .map(|k| plan.score_of(*k).unwrap())
                    .collect();
                assert!(ordered.windows(2).all(|w| w[0] >= w[1]), "{:?}", ordered);
            }
        }
    }

    #[test]
    fn test_tie_breaks_by_declared_priority() {
        let config = OrchestratorConfig::default();
        let plan = plan(&config, &checks(80, 80)).unwrap();
        assert_eq!(plan.primary, BackendKind::Container);
        assert_eq!(plan.fallbacks, vec![BackendKind::Process]);
    }

    #[test]
    fn test_preference_shifts_primary() {
        let config = OrchestratorConfig::default().with_strategy(DeploymentStrategy::ProcessPreferred);
        let plan = plan(&config, &checks(85, 80)).unwrap();
        assert_eq!(plan.primary, BackendKind::Process);
    }

    #[test]
    fn test_only_strategy_excludes_other_backend() {
        let config = OrchestratorConfig::default().with_strategy(DeploymentStrategy::ContainerOnly);
        let plan = plan(&config, &checks(90, 100)).unwrap();
        assert_eq!(plan.primary, BackendKind::Container);
        assert!(plan.fallbacks.is_empty());
        assert_eq!(plan.scores.len(), 1);
    }

    #[test]
    fn test_no_viable_backend_is_environment_error() {
        let config = OrchestratorConfig::default();
        let checks: BTreeMap<_, _> = BackendKind::ALL
            .into_iter()
            .map(|k| (k, BackendCheckResult::unavailable(k, CheckStatus::NotFound, "missing")))
            .collect();
        let err = plan(&config, &checks).unwrap_err();
        assert!(matches!(err, DeployError::Environment { .. }));

        let config = OrchestratorConfig {
            auto_install: true,
            ..OrchestratorConfig::default()
        };
        let plan = plan(&config, &checks).unwrap();
        assert!(plan.risk_factors[0].contains("auto-install"));
    }

    #[test]
    fn test_history_affects_score() {
        let config = OrchestratorConfig::default();
        let profile = linux_profile();
        let checks = checks(80, 80);
        let mut stats = BTreeMap::new();
        stats.insert(
            BackendKind::Container,
            BackendStats {
                successes: 0,
                failures: 4,
            },
        );
        let input = ScoringInput {
            config: &config,
            strategy: config.strategy,
            profile: &profile,
            checks: &checks,
            stats: &stats,
        };
        assert!(input.score(BackendKind::Container).score < input.score(BackendKind::Process).score);
        let plan = build_plan(&input, &BackendKind::ALL).unwrap();
        assert_eq!(plan.primary, BackendKind::Process);
    }

    #[test]
    fn test_platform_adjustment_penalizes_small_hosts() {
        let mut profile = linux_profile();
        profile.total_memory_gb = 2.0;
        profile.is_admin = false;
        assert_eq!(platform_adjustment(BackendKind::Container, &profile), -15.0);
        assert_eq!(platform_adjustment(BackendKind::Process, &profile), 0.0);
    }

    #[test]
    fn test_recommendations_prefer_configured() {
        let config = OrchestratorConfig::default();
        let profile = linux_profile();
        let checks = checks(100, 90);
        let stats = BTreeMap::new();
        let input = ScoringInput {
            config: &config,
            strategy: config.strategy,
            profile: &profile,
            checks: &checks,
            stats: &stats,
        };
        let recs = recommendations(&input, &[BackendKind::Process]);
        assert_eq!(recs.recommended, Some(BackendKind::Process));
        assert_eq!(recs.backends.len(), 2);
        assert_eq!(recs.backends[0].kind, BackendKind::Container);
    }
}
