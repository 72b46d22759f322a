//! 容器相关领域模型

use serde::{Deserialize, Serialize};

/// 编排栈中单个容器单元的信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub name: String,
    pub service: String,
    pub image: String,
    /// running / exited / restarting ...
    pub state: String,
    /// healthy / unhealthy / starting；无 healthcheck 时为 None
    pub health: Option<String>,
    pub status: String,
    pub restart_count: u32,
    pub cpu_percent: Option<f64>,
    pub memory_usage: Option<String>,
    pub memory_percent: Option<f64>,
}

impl UnitInfo {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }

    /// 运行中且（无 healthcheck 或 healthcheck 通过）
    pub fn is_healthy(&self) -> bool {
        self.is_running()
            && self
                .health
                .as_deref()
                .map_or(true, |h| h.eq_ignore_ascii_case("healthy"))
    }

    /// 仍在启动中（healthcheck 尚未给出结论）
    pub fn is_starting(&self) -> bool {
        self.state.eq_ignore_ascii_case("restarting")
            || self.state.eq_ignore_ascii_case("created")
            || self
                .health
                .as_deref()
                .is_some_and(|h| h.eq_ignore_ascii_case("starting"))
    }

    /// 已终止，不会自行恢复
    pub fn is_dead(&self) -> bool {
        self.state.eq_ignore_ascii_case("exited") || self.state.eq_ignore_ascii_case("dead")
    }
}

/// `compose ps --format json` 的单条记录
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ComposePsEntry {
    name: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    health: String,
    #[serde(default)]
    status: String,
}

impl From<ComposePsEntry> for UnitInfo {
    fn from(entry: ComposePsEntry) -> Self {
        Self {
            name: entry.name,
            service: entry.service,
            image: entry.image,
            state: entry.state,
            health: Some(entry.health).filter(|h| !h.is_empty()),
            status: entry.status,
            restart_count: 0,
            cpu_percent: None,
            memory_usage: None,
            memory_percent: None,
        }
    }
}

/// 解析 `compose ps --format json` 输出
///
/// 旧版本输出 JSON 数组，新版本每行一个 JSON 对象，两种都支持
pub fn parse_compose_ps(output: &str) -> Result<Vec<UnitInfo>, serde_json::Error> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        let entries: Vec<ComposePsEntry> = serde_json::from_str(trimmed)?;
        return Ok(entries.into_iter().map(UnitInfo::from).collect());
    }

    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<ComposePsEntry>(line).map(UnitInfo::from))
        .collect()
}

/// 单个容器的资源占用（`docker stats --no-stream` 一行）
#[derive(Debug, Clone, PartialEq)]
pub struct UnitStats {
    pub name: String,
    pub cpu_percent: Option<f64>,
    pub memory_usage: String,
    pub memory_percent: Option<f64>,
}

/// 解析 `docker stats --format '{{.Name}}|{{.CPUPerc}}|{{.MemUsage}}|{{.MemPerc}}'`
pub fn parse_stats_line(line: &str) -> Option<UnitStats> {
    let parts: Vec<&str> = line.split('|').map(str::trim).collect();
    if parts.len() < 4 || parts[0].is_empty() {
        return None;
    }
    Some(UnitStats {
        name: parts[0].to_string(),
        cpu_percent: parse_percent(parts[1]),
        memory_usage: parts[2].to_string(),
        memory_percent: parse_percent(parts[3]),
    })
}

fn parse_percent(s: &str) -> Option<f64> {
    s.trim_end_matches('%').trim().parse().ok()
}
