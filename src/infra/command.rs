//! 命令执行器
//!
//! 提供统一的命令执行接口，支持：
//! - argv / env / cwd 描述
//! - 超时控制
//! - 取消支持
//! - stdout/stderr 分离捕获
//!
//! 编排核心只依赖 `CommandExecutor` trait，测试中替换为脚本化实现。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 默认命令超时
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// 命令执行错误
#[derive(Debug)]
pub enum CommandError {
    /// 命令启动失败
    SpawnFailed(std::io::Error),
    /// 命令超时
    Timeout,
    /// 命令被取消
    Cancelled,
    /// 等待命令完成失败
    WaitFailed(std::io::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::SpawnFailed(e) => write!(f, "Failed to spawn command: {}", e),
            CommandError::Timeout => write!(f, "Command timed out"),
            CommandError::Cancelled => write!(f, "Command was cancelled"),
            CommandError::WaitFailed(e) => write!(f, "Failed to wait for command: {}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::SpawnFailed(e) | CommandError::WaitFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// 命令描述
#[derive(Clone, Debug)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            cwd: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 用于日志的命令行文本
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// 命令执行结果
#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    /// 退出码（被信号终止时为 None）
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// 构造成功输出（测试与脚本化执行器使用）
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    /// stderr 优先的简短错误描述
    pub fn error_summary(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let mut summary: String = text.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
        if summary.is_empty() {
            summary = format!("exit code {:?}", self.code);
        }
        summary
    }
}

/// 命令执行抽象
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// 执行命令并捕获输出
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError>;

    /// 查找可执行文件
    async fn which(&self, program: &str) -> Option<PathBuf>;
}

/// 基于 tokio::process 的命令执行器
#[derive(Clone, Debug, Default)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for CommandRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        let started = Instant::now();
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = spec.cwd {
            cmd.current_dir(dir);
        }

        debug!(command = %spec.display(), timeout = ?spec.timeout, "Running command");

        let child = cmd.spawn().map_err(CommandError::SpawnFailed)?;

        // child 在 future 被丢弃时由 kill_on_drop 终止
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(command = %spec.display(), "Command cancelled, killing process");
                Err(CommandError::Cancelled)
            }
            _ = tokio::time::sleep(spec.timeout) => {
                warn!(command = %spec.display(), "Command timed out after {:?}", spec.timeout);
                Err(CommandError::Timeout)
            }
            output = child.wait_with_output() => {
                let output = output.map_err(CommandError::WaitFailed)?;
                Ok(CommandOutput {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    duration: started.elapsed(),
                })
            }
        }
    }

    async fn which(&self, program: &str) -> Option<PathBuf> {
        let finder = if cfg!(windows) { "where" } else { "which" };
        let spec = CommandSpec::new(finder, [program]).timeout(Duration::from_secs(5));
        let output = self.run(&spec, &CancellationToken::new()).await.ok()?;
        if !output.success() {
            return None;
        }
        output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_success() {
        let runner = CommandRunner::new();
        let spec = CommandSpec::new("echo", ["hello"]).current_dir("/tmp");
        let output = runner.run(&spec, &CancellationToken::new()).await.unwrap();

        assert!(output.success());
        assert!(output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_run_not_found() {
        let runner = CommandRunner::new();
        let spec = CommandSpec::new("nonexistent_command_12345", Vec::<String>::new());
        let result = runner.run(&spec, &CancellationToken::new()).await;

        assert!(matches!(result, Err(CommandError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let runner = CommandRunner::new();
        let spec = CommandSpec::new("sleep", ["5"]).timeout(Duration::from_millis(100));
        let result = runner.run(&spec, &CancellationToken::new()).await;

        assert!(matches!(result, Err(CommandError::Timeout)));
    }

    #[tokio::test]
    async fn test_run_cancelled() {
        let runner = CommandRunner::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let spec = CommandSpec::new("sleep", ["5"]);
        let result = runner.run(&spec, &cancel).await;

        assert!(matches!(result, Err(CommandError::Cancelled)));
    }

    #[test]
    fn test_error_summary_prefers_stderr() {
        let out = CommandOutput {
            code: Some(1),
            stdout: "noise".into(),
            stderr: "line1\nfatal: boom".into(),
            ..Default::default()
        };
        assert!(out.error_summary().starts_with("fatal: boom"));
        assert_eq!(CommandOutput::failed(2, "").error_summary(), "exit code Some(2)");
    }
}
