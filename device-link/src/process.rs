//! 受管子进程
//!
//! 把子进程的 stdout/stderr 分块和退出事件转成 channel 事件，
//! 由上层的状态机消费。消费者放弃 channel 后输出仍会被持续读空，
//! 避免长驻进程因管道写满而阻塞。句柄被 drop 时子进程会被终止。

use crate::error::LinkError;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// 子进程事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// 标准输出分块
    Stdout(String),
    /// 标准错误分块
    Stderr(String),
    /// 进程退出（被信号杀死时没有退出码）
    Exited(Option<i32>),
}

/// 退出状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

/// 受管子进程句柄
#[derive(Debug)]
pub struct ManagedProcess {
    pid: Option<u32>,
    label: String,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ManagedProcess {
    /// 启动子进程
    ///
    /// `input` 不为空时，通过 stdin 写入一次后立即关闭。
    /// 绝不通过参数或环境变量传递敏感内容。
    pub async fn spawn(
        mut command: Command,
        label: &str,
        input: Option<&str>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProcessEvent>), LinkError> {
        command
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id();
        debug!("[Process] Spawned {} (pid {:?})", label, pid);

        if let Some(secret) = input {
            if let Some(mut stdin) = child.stdin.take() {
                // 写一次，立即关闭
                let written = async {
                    stdin.write_all(secret.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                drop(stdin);
                if let Err(e) = written {
                    warn!("[Process] Failed to write stdin of {}: {}", label, e);
                }
            }
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(pump(out, event_tx.clone(), ProcessEvent::Stdout)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(pump(err, event_tx.clone(), ProcessEvent::Stderr)));

        let task_label = label.to_string();
        tokio::spawn(async move {
            // kill_tx 被 drop 时 kill_rx 也会返回，等同于终止请求
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        debug!("[Process] Kill {} failed: {}", task_label, e);
                    }
                    child.wait().await.ok()
                }
            };

            // 让剩余输出先于退出事件送达；孤儿孙进程可能一直占着管道，所以有上限
            for task in [stdout_task, stderr_task].into_iter().flatten() {
                let _ = tokio::time::timeout(Duration::from_millis(200), task).await;
            }

            let code = status.and_then(|s| s.code());
            debug!("[Process] {} exited with {:?}", task_label, code);
            // 先更新退出状态，收到 Exited 事件时 is_alive() 必然为 false
            exit_tx.send_replace(Some(ProcessExit { code }));
            let _ = event_tx.send(ProcessEvent::Exited(code));
        });

        Ok((
            Self {
                pid,
                label: label.to_string(),
                kill_tx: Some(kill_tx),
                exit_rx,
            },
            event_rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// 进程是否仍在运行
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// 退出状态（运行中为 None）
    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// 订阅退出通知
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    /// 发送终止信号并等待退出（最多 `grace`）
    pub async fn terminate(&mut self, grace: Duration) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        let mut exit_rx = self.exit_rx.clone();
        let timed_out = tokio::time::timeout(grace, exit_rx.wait_for(|e| e.is_some()))
            .await
            .is_err();
        if timed_out {
            warn!(
                "[Process] {} (pid {:?}) did not exit within {:?}",
                self.label, self.pid, grace
            );
        }
    }
}

/// 持续读取管道；接收方关闭后继续读空
async fn pump<R, F>(mut reader: R, tx: mpsc::UnboundedSender<ProcessEvent>, wrap: F)
where
    R: AsyncRead + Unpin,
    F: Fn(String) -> ProcessEvent,
{
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                let _ = tx.send(wrap(chunk));
            }
            Err(e) => {
                debug!("[Process] Pipe read error: {}", e);
                break;
            }
        }
    }
}
