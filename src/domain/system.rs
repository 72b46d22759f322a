//! 系统信息领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 操作系统族
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl OsFamily {
    /// 当前编译目标的操作系统族
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Self {
        match os {
            "linux" => OsFamily::Linux,
            "macos" => OsFamily::MacOs,
            "windows" => OsFamily::Windows,
            _ => OsFamily::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Linux => "linux",
            OsFamily::MacOs => "macos",
            OsFamily::Windows => "windows",
            OsFamily::Other => "other",
        }
    }
}

/// 包管理器
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageManager {
    AptGet,
    Dnf,
    Yum,
    Apk,
    Pacman,
    Brew,
    Winget,
    Choco,
}

impl PackageManager {
    /// 探测顺序
    pub const ALL: [PackageManager; 8] = [
        PackageManager::AptGet,
        PackageManager::Dnf,
        PackageManager::Yum,
        PackageManager::Apk,
        PackageManager::Pacman,
        PackageManager::Brew,
        PackageManager::Winget,
        PackageManager::Choco,
    ];

    pub fn binary(&self) -> &'static str {
        match self {
            PackageManager::AptGet => "apt-get",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Apk => "apk",
            PackageManager::Pacman => "pacman",
            PackageManager::Brew => "brew",
            PackageManager::Winget => "winget",
            PackageManager::Choco => "choco",
        }
    }

    /// 是否需要管理员权限
    pub fn needs_root(&self) -> bool {
        !matches!(self, PackageManager::Brew | PackageManager::Winget)
    }
}

/// 系统画像（计算一次后缓存，不可变快照）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemProfile {
    pub hostname: String,
    pub os_family: OsFamily,
    pub os_version: String,
    pub arch: String,
    pub cpu_cores: usize,
    pub total_memory_gb: f64,
    pub available_memory_gb: f64,
    pub available_disk_gb: f64,
    pub is_admin: bool,
    pub package_managers: Vec<PackageManager>,
    pub collected_at: DateTime<Utc>,
}

impl SystemProfile {
    pub fn has_package_manager(&self, pm: PackageManager) -> bool {
        self.package_managers.contains(&pm)
    }

    /// 首选包管理器（按探测顺序）
    pub fn preferred_package_manager(&self) -> Option<PackageManager> {
        PackageManager::ALL
            .into_iter()
            .find(|pm| self.has_package_manager(*pm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_family_from_os() {
        assert_eq!(OsFamily::from_os("linux"), OsFamily::Linux);
        assert_eq!(OsFamily::from_os("macos"), OsFamily::MacOs);
        assert_eq!(OsFamily::from_os("freebsd"), OsFamily::Other);
    }

    #[test]
    fn test_preferred_package_manager_follows_probe_order() {
        let profile = SystemProfile {
            hostname: "h".into(),
            os_family: OsFamily::Linux,
            os_version: "12".into(),
            arch: "x86_64".into(),
            cpu_cores: 4,
            total_memory_gb: 8.0,
            available_memory_gb: 4.0,
            available_disk_gb: 50.0,
            is_admin: false,
            package_managers: vec![PackageManager::Brew, PackageManager::Dnf],
            collected_at: Utc::now(),
        };
        assert_eq!(profile.preferred_package_manager(), Some(PackageManager::Dnf));
        assert!(PackageManager::Dnf.needs_root());
        assert!(!PackageManager::Brew.needs_root());
    }
}
