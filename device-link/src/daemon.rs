//! tunneld 守护进程控制
//!
//! 通过 sudo 启动 `remote tunneld`，密码只经 stdin 传一次。
//! 就绪判断依赖本地 HTTP 端口，密码错误通过 stderr 关键字尽早识别。

use crate::error::LinkError;
use crate::process::{ManagedProcess, ProcessEvent};
use crate::runner::CommandRunner;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const REJECTION_PHRASES: &[&str] = &["incorrect password", "try again"];

/// stderr 是否表明密码被拒绝
pub fn is_credential_rejection(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    REJECTION_PHRASES.iter().any(|p| lower.contains(p))
}

/// 启动结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonStart {
    pub already_running: bool,
}

/// 自己启动的 daemon
struct DaemonHandle {
    process: ManagedProcess,
    started_at: DateTime<Utc>,
}

/// daemon 控制器
pub struct DaemonController {
    runner: CommandRunner,
    http: reqwest::Client,
    url: String,
    handle: Mutex<Option<DaemonHandle>>,
}

impl DaemonController {
    pub fn new(runner: CommandRunner, http: reqwest::Client) -> Self {
        let url = runner.config().daemon_url();
        Self {
            runner,
            http,
            url,
            handle: Mutex::new(None),
        }
    }

    /// 健康检查：任何 HTTP 响应都算在运行
    pub async fn is_running(&self) -> bool {
        let probe = self
            .http
            .get(&self.url)
            .timeout(self.runner.config().timeouts.health_probe)
            .send()
            .await;
        match probe {
            Ok(resp) => {
                debug!("[DaemonController] Probe answered with {}", resp.status());
                true
            }
            Err(e) => {
                debug!("[DaemonController] Probe failed: {}", e);
                false
            }
        }
    }

    /// 当前 daemon 是否由我们启动且仍在运行
    pub async fn owns_daemon(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .map(|h| h.process.is_alive())
            .unwrap_or(false)
    }

    /// 用密码启动 daemon
    pub async fn start_with_credential(&self, secret: &str) -> Result<DaemonStart, LinkError> {
        if self.is_running().await {
            info!("[DaemonController] Tunnel daemon already running");
            return Ok(DaemonStart {
                already_running: true,
            });
        }

        let timeouts = &self.runner.config().timeouts;
        let args = vec!["remote".to_string(), "tunneld".to_string()];
        let command = self.runner.elevated_command(&args);
        info!("[DaemonController] Starting tunnel daemon with elevation...");
        let (mut process, mut events) =
            ManagedProcess::spawn(command, "tunneld", Some(secret)).await?;

        let deadline = tokio::time::sleep(timeouts.daemon_start);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(timeouts.daemon_poll);
        poll.tick().await;

        let mut stderr = String::new();
        let mut events_open = true;
        let outcome = loop {
            tokio::select! {
                biased;
                ev = events.recv(), if events_open => match ev {
                    Some(ProcessEvent::Stderr(chunk)) => {
                        stderr.push_str(&chunk);
                        if is_credential_rejection(&stderr) {
                            break Err(LinkError::CredentialRejected);
                        }
                    }
                    Some(ProcessEvent::Stdout(_)) => {}
                    Some(ProcessEvent::Exited(code)) => {
                        let detail = stderr.trim();
                        let message = if detail.is_empty() {
                            format!("exited with {:?}", code)
                        } else {
                            detail.to_string()
                        };
                        break Err(LinkError::DaemonExited(message));
                    }
                    None => events_open = false,
                },
                _ = &mut deadline => {
                    break Err(LinkError::DaemonStartTimeout(timeouts.daemon_start.as_secs()));
                }
                _ = poll.tick() => {
                    if self.is_running().await {
                        break Ok(());
                    }
                }
            }
        };

        match outcome {
            Ok(()) => {
                info!("[DaemonController] Tunnel daemon is ready");
                *self.handle.lock().await = Some(DaemonHandle {
                    process,
                    started_at: Utc::now(),
                });
                Ok(DaemonStart {
                    already_running: false,
                })
            }
            Err(e) => {
                warn!("[DaemonController] Tunnel daemon start failed: {}", e);
                process.terminate(timeouts.terminate_grace).await;
                Err(e)
            }
        }
    }

    /// 关闭自己启动的 daemon（先尝试提权终止）
    pub async fn shutdown(&self) {
        let Some(mut handle) = self.handle.lock().await.take() else {
            return;
        };
        info!(
            "[DaemonController] Stopping tunnel daemon started at {}",
            handle.started_at.to_rfc3339()
        );

        let elevation = &self.runner.config().elevation;
        if let (Some(pid), false) = (handle.process.pid(), elevation.kill_args.is_empty()) {
            let mut kill = tokio::process::Command::new(&elevation.program);
            kill.args(&elevation.kill_args)
                .arg(pid.to_string())
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true);
            match tokio::time::timeout(Duration::from_secs(5), kill.status()).await {
                Ok(Ok(status)) if status.success() => {
                    debug!("[DaemonController] Elevated kill sent to {}", pid)
                }
                Ok(Ok(status)) => warn!("[DaemonController] Elevated kill exited with {}", status),
                Ok(Err(e)) => warn!("[DaemonController] Elevated kill failed: {}", e),
                Err(_) => warn!("[DaemonController] Elevated kill timed out"),
            }
        }

        handle
            .process
            .terminate(self.runner.config().timeouts.terminate_grace)
            .await;
    }
}
