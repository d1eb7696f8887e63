//! 外部命令执行
//!
//! 所有对 pymobiledevice3 的调用都经过这里：统一的搜索路径、超时和错误文本。

use crate::config::{LinkConfig, ToolConfig};
use crate::error::LinkError;
use crate::process::{ManagedProcess, ProcessEvent};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 继承的 PATH 后追加额外目录
pub fn augmented_path(extra: &[PathBuf]) -> OsString {
    let mut dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default();
    for dir in extra {
        if !dirs.contains(dir) {
            dirs.push(dir.clone());
        }
    }
    std::env::join_paths(dirs).unwrap_or_else(|e| {
        warn!("[CommandRunner] Could not join search path: {}", e);
        std::env::var_os("PATH").unwrap_or_default()
    })
}

/// 在搜索路径中查找可执行文件；带路径分隔符的名字原样返回
pub fn resolve_program(program: &str, search_path: &OsString) -> PathBuf {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return PathBuf::from(program);
    }
    std::env::split_paths(search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .unwrap_or_else(|| PathBuf::from(program))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// 命令执行器
#[derive(Clone)]
pub struct CommandRunner {
    config: Arc<LinkConfig>,
    search_path: OsString,
}

impl CommandRunner {
    pub fn new(config: Arc<LinkConfig>) -> Self {
        let search_path = augmented_path(&config.tool.extra_paths);
        Self {
            config,
            search_path,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    fn tool(&self) -> &ToolConfig {
        &self.config.tool
    }

    /// 命令行的可读形式（日志和错误信息用）
    pub fn describe(&self, args: &[String]) -> String {
        let mut parts = vec![self.tool().program.clone()];
        parts.extend(self.tool().prefix_args.iter().cloned());
        parts.extend(args.iter().cloned());
        parts.join(" ")
    }

    /// 构造工具命令
    pub fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.tool().program);
        cmd.args(&self.tool().prefix_args)
            .args(args)
            .env("PATH", &self.search_path);
        cmd
    }

    /// 构造提权的工具命令
    ///
    /// 提权程序会重置 PATH，所以工具先解析成绝对路径。
    pub fn elevated_command(&self, args: &[String]) -> Command {
        let elevation = &self.config.elevation;
        let program = resolve_program(&self.tool().program, &self.search_path);
        let mut cmd = Command::new(&elevation.program);
        cmd.args(&elevation.start_args)
            .arg(program)
            .args(&self.tool().prefix_args)
            .args(args)
            .env("PATH", &self.search_path);
        cmd
    }

    /// 以默认超时执行，返回 trim 后的 stdout
    pub async fn run(&self, args: &[String]) -> Result<String, LinkError> {
        self.run_with_timeout(args, self.config.timeouts.command).await
    }

    /// 执行并在超时后杀掉进程
    pub async fn run_with_timeout(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> Result<String, LinkError> {
        let described = self.describe(args);
        debug!("[CommandRunner] Running: {}", described);

        let mut cmd = self.command(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!("[CommandRunner] Timed out after {:?}: {}", timeout, described);
                return Err(LinkError::CommandTimedOut {
                    command: described,
                    secs: timeout.as_secs(),
                });
            }
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("{} exited with {}", described, output.status)
            } else {
                stderr
            };
            Err(LinkError::CommandFailed(message))
        }
    }

    fn spawn_error(&self, e: std::io::Error) -> LinkError {
        if e.kind() == std::io::ErrorKind::NotFound {
            LinkError::ToolNotInstalled {
                tool: self.tool().program.clone(),
            }
        } else {
            LinkError::Spawn(e)
        }
    }

    /// 以受管进程方式启动（长驻命令用）
    pub async fn spawn(
        &self,
        args: &[String],
    ) -> Result<(ManagedProcess, mpsc::UnboundedReceiver<ProcessEvent>), LinkError> {
        let described = self.describe(args);
        debug!("[CommandRunner] Spawning: {}", described);
        ManagedProcess::spawn(self.command(args), &described, None)
            .await
            .map_err(|e| match e {
                LinkError::Spawn(io) => self.spawn_error(io),
                other => other,
            })
    }

    /// 同步探测工具是否安装（忽略输出）
    pub fn probe_installed(&self) -> Result<(), LinkError> {
        let missing = || LinkError::ToolNotInstalled {
            tool: self.tool().program.clone(),
        };

        let mut child = std::process::Command::new(&self.tool().program)
            .args(&self.tool().prefix_args)
            .arg("--help")
            .env("PATH", &self.search_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|_| missing())?;

        let deadline = Instant::now() + self.config.timeouts.capability_probe;
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(_)) => return Err(missing()),
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Ok(None) | Err(_) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(missing());
                }
            }
        }
    }
}
