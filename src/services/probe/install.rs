//! 运行时安装计划

use serde::Serialize;

use crate::domain::backend::{BackendCheckResult, BackendKind};
use crate::domain::system::{OsFamily, PackageManager, SystemProfile};
use crate::infra::command::CommandSpec;

/// 安装方式名称（无可用包管理器时的容器运行时安装脚本）
const CONVENIENCE_SCRIPT: &str = "convenience-script";

/// 按顺序执行的安装命令
#[derive(Clone, Debug)]
pub struct InstallPlan {
    pub kind: BackendKind,
    /// 包管理器名或 `convenience-script`
    pub method: String,
    pub steps: Vec<CommandSpec>,
}

/// 安装结果
#[derive(Clone, Debug, Serialize)]
pub struct InstallResult {
    pub kind: BackendKind,
    pub method: String,
    pub steps_run: Vec<String>,
    pub version: Option<String>,
    pub already_installed: bool,
    pub duration_ms: i64,
}

impl InstallResult {
    pub fn already_present(kind: BackendKind, check: &BackendCheckResult) -> Self {
        Self {
            kind,
            method: "none".to_string(),
            steps_run: Vec::new(),
            version: check.version.clone(),
            already_installed: true,
            duration_ms: 0,
        }
    }
}

/// 生成当前系统上的安装计划
///
/// 优先使用探测到的包管理器；Linux 上没有包管理器时容器运行时退回官方安装脚本。
pub fn install_plan(kind: BackendKind, profile: &SystemProfile) -> Option<InstallPlan> {
    let Some(pm) = profile.preferred_package_manager() else {
        if kind == BackendKind::Container && profile.os_family == OsFamily::Linux {
            let script = CommandSpec::new("sh", ["-c", "curl -fsSL https://get.docker.com | sh"]);
            return Some(InstallPlan {
                kind,
                method: CONVENIENCE_SCRIPT.to_string(),
                steps: vec![elevate(script, profile, true)],
            });
        }
        return None;
    };

    let raw: Vec<Vec<&str>> = match (kind, pm) {
        (BackendKind::Container, PackageManager::AptGet) => vec![
            vec!["apt-get", "update"],
            vec!["apt-get", "install", "-y", "docker.io", "docker-compose-v2"],
            vec!["systemctl", "enable", "--now", "docker"],
        ],
        (BackendKind::Container, PackageManager::Dnf) => vec![
            vec!["dnf", "install", "-y", "moby-engine", "docker-compose"],
            vec!["systemctl", "enable", "--now", "docker"],
        ],
        (BackendKind::Container, PackageManager::Yum) => vec![
            vec!["yum", "install", "-y", "docker"],
            vec!["systemctl", "enable", "--now", "docker"],
        ],
        (BackendKind::Container, PackageManager::Apk) => vec![
            vec!["apk", "add", "docker", "docker-cli-compose"],
            vec!["rc-update", "add", "docker", "boot"],
            vec!["service", "docker", "start"],
        ],
        (BackendKind::Container, PackageManager::Pacman) => vec![
            vec!["pacman", "-S", "--noconfirm", "docker", "docker-compose"],
            vec!["systemctl", "enable", "--now", "docker"],
        ],
        (BackendKind::Container, PackageManager::Brew) => {
            vec![vec!["brew", "install", "--cask", "docker"]]
        }
        (BackendKind::Container, PackageManager::Winget) => vec![vec![
            "winget",
            "install",
            "-e",
            "--id",
            "Docker.DockerDesktop",
            "--accept-source-agreements",
            "--accept-package-agreements",
        ]],
        (BackendKind::Container, PackageManager::Choco) => {
            vec![vec!["choco", "install", "-y", "docker-desktop"]]
        }
        (BackendKind::Process, PackageManager::AptGet) => vec![
            vec!["apt-get", "update"],
            vec!["apt-get", "install", "-y", "python3", "python3-venv", "python3-pip"],
        ],
        (BackendKind::Process, PackageManager::Dnf) => {
            vec![vec!["dnf", "install", "-y", "python3", "python3-pip"]]
        }
        (BackendKind::Process, PackageManager::Yum) => {
            vec![vec!["yum", "install", "-y", "python3", "python3-pip"]]
        }
        (BackendKind::Process, PackageManager::Apk) => {
            vec![vec!["apk", "add", "python3", "py3-pip"]]
        }
        (BackendKind::Process, PackageManager::Pacman) => {
            vec![vec!["pacman", "-S", "--noconfirm", "python", "python-pip"]]
        }
        (BackendKind::Process, PackageManager::Brew) => vec![vec!["brew", "install", "python"]],
        (BackendKind::Process, PackageManager::Winget) => vec![vec![
            "winget",
            "install",
            "-e",
            "--id",
            "Python.Python.3.11",
            "--accept-source-agreements",
            "--accept-package-agreements",
        ]],
        (BackendKind::Process, PackageManager::Choco) => {
            vec![vec!["choco", "install", "-y", "python"]]
        }
    };

    let steps = raw
        .into_iter()
        .filter_map(|argv| {
            let (program, args) = argv.split_first()?;
            let spec = CommandSpec::new(*program, args.iter().copied());
            Some(elevate(spec, profile, pm.needs_root()))
        })
        .collect();

    Some(InstallPlan {
        kind,
        method: pm.binary().to_string(),
        steps,
    })
}

/// 非管理员的 Unix 系统上以 `sudo -n` 执行（不交互，缺少权限时直接失败）
fn elevate(spec: CommandSpec, profile: &SystemProfile, needs_root: bool) -> CommandSpec {
    if !needs_root || profile.is_admin || profile.os_family == OsFamily::Windows {
        return spec;
    }
    let mut args = vec!["-n".to_string(), spec.program.clone()];
    args.extend(spec.args.iter().cloned());
    CommandSpec {
        program: "sudo".to_string(),
        args,
        ..spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::linux_profile;

    #[test]
    fn test_apt_plan_for_admin() {
        let plan = install_plan(BackendKind::Process, &linux_profile()).unwrap();
        assert_eq!(plan.method, "apt-get");
        assert_eq!(plan.steps[0].display(), "apt-get update");
        assert!(plan.steps[1].args.contains(&"python3-venv".to_string()));
    }

    #[test]
    fn test_non_admin_uses_sudo() {
        let mut profile = linux_profile();
        profile.is_admin = false;
        let plan = install_plan(BackendKind::Container, &profile).unwrap();
        assert!(plan.steps.iter().all(|s| s.program == "sudo"));
        assert_eq!(plan.steps[0].display(), "sudo -n apt-get update");
    }

    #[test]
    fn test_brew_never_uses_sudo() {
        let mut profile = linux_profile();
        profile.os_family = OsFamily::MacOs;
        profile.is_admin = false;
        profile.package_managers = vec![PackageManager::Brew];
        let plan = install_plan(BackendKind::Process, &profile).unwrap();
        assert_eq!(plan.steps[0].display(), "brew install python");
    }

    #[test]
    fn test_convenience_script_without_package_manager() {
        let mut profile = linux_profile();
        profile.package_managers.clear();
        let plan = install_plan(BackendKind::Container, &profile).unwrap();
        assert_eq!(plan.method, "convenience-script");
        assert!(install_plan(BackendKind::Process, &profile).is_none());
    }
}
