//! 协调器运行时状态

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::scoring::BackendStats;
use crate::domain::backend::BackendKind;
use crate::domain::deploy::{CoordinatorStatus, DeploymentPlan, DeploymentStrategy};

/// 协调器状态（进程生命周期内存在）
#[derive(Clone, Debug, Serialize)]
pub struct CoordinatorState {
    pub status: CoordinatorStatus,
    pub current_backend: Option<BackendKind>,
    /// 连续健康检查失败次数
    pub consecutive_failures: u32,
    /// 本轮降级中已执行的同后端重启次数
    pub restart_attempts: u32,
    pub backend_stats: BTreeMap<BackendKind, BackendStats>,
    /// 当前部署的计划与遥测会话
    pub plan: Option<DeploymentPlan>,
    pub strategy: Option<DeploymentStrategy>,
    pub session_id: Option<String>,
    /// 当前部署已使用过的后端（恢复时不再作为备选）
    pub used_backends: BTreeSet<BackendKind>,
    pub last_error: Option<String>,
    pub last_transition_at: DateTime<Utc>,
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self {
            status: CoordinatorStatus::Idle,
            current_backend: None,
            consecutive_failures: 0,
            restart_attempts: 0,
            backend_stats: BTreeMap::new(),
            plan: None,
            strategy: None,
            session_id: None,
            used_backends: BTreeSet::new(),
            last_error: None,
            last_transition_at: Utc::now(),
        }
    }
}

impl CoordinatorState {
    /// 状态迁移；不在迁移表内的迁移被拒绝并返回 false
    pub fn transition(&mut self, next: CoordinatorStatus) -> bool {
        let prev = self.status;
        if prev == next {
            return true;
        }
        if !prev.can_transition_to(next) {
            warn!(from = %prev, to = %next, "Rejected coordinator state transition");
            return false;
        }
        self.status = next;
        self.last_transition_at = Utc::now();
        info!(from = %prev, to = %next, "Coordinator state changed");
        true
    }

    pub fn record_result(&mut self, kind: BackendKind, success: bool) {
        self.backend_stats.entry(kind).or_default().record(success);
    }

    /// 部署成功后切换到新的活动部署
    pub fn activate(&mut self, kind: BackendKind) {
        self.current_backend = Some(kind);
        self.consecutive_failures = 0;
        self.restart_attempts = 0;
        self.used_backends.insert(kind);
        self.last_error = None;
    }

    /// 恢复成功后清零计数
    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
        self.restart_attempts = 0;
    }

    /// 停止后清空活动部署（保留历史统计与计划）
    pub fn clear_deployment(&mut self) {
        self.current_backend = None;
        self.consecutive_failures = 0;
        self.restart_attempts = 0;
        self.used_backends.clear();
    }

    /// 计划中尚未使用且有配置的备选后端
    pub fn unused_fallback(&self, configured: &[BackendKind]) -> Option<BackendKind> {
        self.plan.as_ref().and_then(|plan| {
            plan.fallbacks
                .iter()
                .copied()
                .find(|k| !self.used_backends.contains(k) && configured.contains(k))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_respects_table() {
        let mut state = CoordinatorState::default();
        assert!(!state.transition(CoordinatorStatus::Running));
        assert_eq!(state.status, CoordinatorStatus::Idle);

        assert!(state.transition(CoordinatorStatus::Analyzing));
        assert!(state.transition(CoordinatorStatus::Deploying));
        assert!(state.transition(CoordinatorStatus::Running));
        assert!(!state.transition(CoordinatorStatus::Failed));
        assert!(state.transition(CoordinatorStatus::Degrading));
        assert!(state.transition(CoordinatorStatus::Failed));
    }

    #[test]
    fn test_unused_fallback_skips_used_backends() {
        let mut state = CoordinatorState {
            plan: Some(DeploymentPlan {
                strategy: DeploymentStrategy::AutoDetect,
                primary: BackendKind::Container,
                fallbacks: vec![BackendKind::Process],
                scores: Vec::new(),
                confidence: 0.9,
                risk_factors: Vec::new(),
                estimated_duration_secs: 60,
                created_at: Utc::now(),
            }),
            ..CoordinatorState::default()
        };
        state.activate(BackendKind::Container);
        assert_eq!(
            state.unused_fallback(&BackendKind::ALL),
            Some(BackendKind::Process)
        );
        assert_eq!(state.unused_fallback(&[BackendKind::Container]), None);

        state.activate(BackendKind::Process);
        assert_eq!(state.unused_fallback(&BackendKind::ALL), None);
    }
}
