//! Spoof 会话
//!
//! 位置命令作为长驻进程运行，进程存活即位置生效。
//! 启动后观察一个稳定窗口：窗口内存活且 stderr 无错误即视为成功。

use crate::strategy::{AttemptSource, CommandStrategy};
use chrono::{DateTime, Utc};
use device_link::{ManagedProcess, ProcessEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const ERROR_PATTERNS: &[&str] = &["error", "traceback", "exception", "no device", "failed"];

/// stderr 中是否出现错误特征
pub fn has_error_pattern(text: &str) -> bool {
    let lower = text.to_lowercase();
    ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

/// 稳定窗口事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleEvent {
    Stdout(String),
    Stderr(String),
    Exited(Option<i32>),
    SettleElapsed,
}

impl From<ProcessEvent> for SettleEvent {
    fn from(ev: ProcessEvent) -> Self {
        match ev {
            ProcessEvent::Stdout(s) => SettleEvent::Stdout(s),
            ProcessEvent::Stderr(s) => SettleEvent::Stderr(s),
            ProcessEvent::Exited(code) => SettleEvent::Exited(code),
        }
    }
}

/// 判定结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleVerdict {
    Pending,
    Confirmed,
    Failed(String),
}

/// 稳定窗口状态机
#[derive(Debug)]
pub struct SettleCheck {
    clean_exit_is_success: bool,
    stderr: String,
}

impl SettleCheck {
    pub fn new(clean_exit_is_success: bool) -> Self {
        Self {
            clean_exit_is_success,
            stderr: String::new(),
        }
    }

    pub fn on_event(&mut self, event: SettleEvent) -> SettleVerdict {
        match event {
            SettleEvent::Stdout(_) => SettleVerdict::Pending,
            SettleEvent::Stderr(chunk) => {
                self.stderr.push_str(&chunk);
                if has_error_pattern(&self.stderr) {
                    SettleVerdict::Failed(self.detail())
                } else {
                    SettleVerdict::Pending
                }
            }
            SettleEvent::Exited(Some(0)) if self.clean_exit_is_success => SettleVerdict::Confirmed,
            SettleEvent::Exited(code) => {
                let detail = self.detail();
                if detail.is_empty() {
                    SettleVerdict::Failed(format!("exited with {:?}", code))
                } else {
                    SettleVerdict::Failed(detail)
                }
            }
            SettleEvent::SettleElapsed => SettleVerdict::Confirmed,
        }
    }

    fn detail(&self) -> String {
        self.stderr.trim().to_string()
    }
}

/// 在稳定窗口内驱动状态机
pub async fn await_settle(
    events: &mut mpsc::UnboundedReceiver<ProcessEvent>,
    mut check: SettleCheck,
    window: Duration,
) -> SettleVerdict {
    let timer = tokio::time::sleep(window);
    tokio::pin!(timer);

    loop {
        let event = tokio::select! {
            ev = events.recv() => match ev {
                Some(ev) => SettleEvent::from(ev),
                None => SettleEvent::Exited(None),
            },
            _ = &mut timer => SettleEvent::SettleElapsed,
        };
        match check.on_event(event) {
            SettleVerdict::Pending => continue,
            verdict => return verdict,
        }
    }
}

/// 当前生效的 spoof 会话
#[derive(Debug)]
pub struct SpoofSession {
    pub id: Uuid,
    pub process: ManagedProcess,
    pub strategy: CommandStrategy,
    pub source: AttemptSource,
    pub started_at: DateTime<Utc>,
}

impl SpoofSession {
    pub fn new(process: ManagedProcess, strategy: CommandStrategy, source: AttemptSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            process,
            strategy,
            source,
            started_at: Utc::now(),
        }
    }
}
