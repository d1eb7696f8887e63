//! 位置命令调度
//!
//! 按固定顺序尝试各种调用方式，第一个通过稳定窗口的进程成为当前 spoof 会话。
//! 顺序：缓存隧道 → 发现的隧道 → UDID 定向 → 新建隧道 → 不带隧道的旧方式。

use crate::session::{await_settle, SettleCheck, SettleVerdict, SpoofSession};
use crate::strategy::{AttemptSource, CommandStrategy, LocationAction};
use chrono::{DateTime, Utc};
use device_link::{LinkContext, LinkError, TunnelEndpoint};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 单次尝试的失败记录
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub source: AttemptSource,
    pub detail: String,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("{}", exhausted_message(.failures, .recovery))]
    Exhausted {
        failures: Vec<AttemptFailure>,
        /// 手动启动 tunneld 的完整命令
        recovery: String,
    },
}

fn exhausted_message(failures: &[AttemptFailure], recovery: &str) -> String {
    let tried = failures
        .iter()
        .map(|f| format!("{}: {}", f.source, first_line(&f.detail)))
        .collect::<Vec<_>>()
        .join("; ");
    format!(
        "Could not reach the device's location service ({}). \
         Make sure the device is unlocked and trusted with Developer Mode on. \
         On iOS 17+ a tunnel is required: start the tunnel daemon \
         ({}) and try again.",
        tried, recovery
    )
}

fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or(text).trim()
}

/// 当前会话摘要
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: Uuid,
    pub source: AttemptSource,
    pub pid: Option<u32>,
    pub alive: bool,
    pub started_at: DateTime<Utc>,
}

enum Attempt {
    Succeeded,
    Failed(String),
}

/// 位置命令调度器
pub struct LocationDispatcher {
    link: Arc<LinkContext>,
    session: Mutex<Option<SpoofSession>>,
}

impl LocationDispatcher {
    pub fn new(link: Arc<LinkContext>) -> Self {
        Self {
            link,
            session: Mutex::new(None),
        }
    }

    /// 设置位置，返回成功的调用来源
    pub async fn set_location(&self, lat: f64, lng: f64) -> Result<AttemptSource, DispatchError> {
        let action = LocationAction::Set { lat, lng };
        let mut failures = Vec::new();
        let mut tried: Vec<TunnelEndpoint> = Vec::new();
        info!("[Dispatcher] Setting location to {}, {}", lat, lng);

        // 1. 缓存的隧道
        if let Some(endpoint) = self.link.tunnels.current().await {
            tried.push(endpoint.clone());
            let strategy = CommandStrategy::Rsd(endpoint.clone());
            match self.launch(AttemptSource::CachedTunnel, strategy, action).await? {
                Attempt::Succeeded => return Ok(AttemptSource::CachedTunnel),
                Attempt::Failed(detail) => {
                    failures.push(AttemptFailure {
                        source: AttemptSource::CachedTunnel,
                        detail,
                    });
                    self.link.tunnels.invalidate(&endpoint).await;
                }
            }
        }

        // 2. tunneld 中已有的隧道
        if let Some(endpoint) = self.link.discovery.discover().await {
            if !tried.contains(&endpoint) {
                tried.push(endpoint.clone());
                let strategy = CommandStrategy::Rsd(endpoint.clone());
                match self.launch(AttemptSource::DiscoveredTunnel, strategy, action).await? {
                    Attempt::Succeeded => {
                        self.link.tunnels.adopt(endpoint).await;
                        return Ok(AttemptSource::DiscoveredTunnel);
                    }
                    Attempt::Failed(detail) => failures.push(AttemptFailure {
                        source: AttemptSource::DiscoveredTunnel,
                        detail,
                    }),
                }
            }
        }

        // 3. 按 UDID 定向
        if let Some(id) = self.link.devices.cached_identifier().await {
            let strategy = CommandStrategy::Targeted(id);
            match self.launch(AttemptSource::DeviceTunnel, strategy, action).await? {
                Attempt::Succeeded => return Ok(AttemptSource::DeviceTunnel),
                Attempt::Failed(detail) => failures.push(AttemptFailure {
                    source: AttemptSource::DeviceTunnel,
                    detail,
                }),
            }
        }

        // 4. 自己建立隧道
        match self.link.tunnels.start().await {
            // 新进程的端点即使与前面试过的相同也要重试
            Ok(endpoint) => {
                let strategy = CommandStrategy::Rsd(endpoint);
                match self.launch(AttemptSource::NewTunnel, strategy, action).await? {
                    Attempt::Succeeded => return Ok(AttemptSource::NewTunnel),
                    Attempt::Failed(detail) => failures.push(AttemptFailure {
                        source: AttemptSource::NewTunnel,
                        detail,
                    }),
                }
            }
            Err(e) if e.is_tool_missing() => return Err(e.into()),
            Err(e) => failures.push(AttemptFailure {
                source: AttemptSource::NewTunnel,
                detail: e.to_string(),
            }),
        }

        // 5. 不需要隧道的旧系统
        for strategy in [CommandStrategy::Plain, CommandStrategy::LegacyService] {
            match self.launch(AttemptSource::Legacy, strategy, action).await? {
                Attempt::Succeeded => return Ok(AttemptSource::Legacy),
                Attempt::Failed(detail) => failures.push(AttemptFailure {
                    source: AttemptSource::Legacy,
                    detail,
                }),
            }
        }

        warn!("[Dispatcher] All {} location attempts failed", failures.len());
        Err(self.exhausted(failures))
    }

    /// 恢复真实位置
    ///
    /// 终止隧道会话的存活进程即可恢复；之后仍尝试显式 clear，此时 clear 失败可以容忍。
    /// 旧方式的进程退出后位置仍保留在设备上，必须 clear 成功。
    pub async fn reset_location(&self) -> Result<(), DispatchError> {
        let restored = self.end_session().await;
        let mut failures = Vec::new();

        let cleared = self.clear_in_order(&mut failures).await;
        match cleared {
            Ok(true) => Ok(()),
            Ok(false) if restored => {
                debug!("[Dispatcher] Clear failed but tunnel session was ended");
                Ok(())
            }
            Ok(false) => Err(self.exhausted(failures)),
            Err(_) if restored => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn exhausted(&self, failures: Vec<AttemptFailure>) -> DispatchError {
        let args = ["remote".to_string(), "tunneld".to_string()];
        DispatchError::Exhausted {
            failures,
            recovery: format!("sudo {}", self.link.runner.describe(&args)),
        }
    }

    async fn clear_in_order(&self, failures: &mut Vec<AttemptFailure>) -> Result<bool, DispatchError> {
        let mut tried: Vec<TunnelEndpoint> = Vec::new();

        if let Some(endpoint) = self.link.tunnels.current().await {
            tried.push(endpoint.clone());
            if self
                .clear(AttemptSource::CachedTunnel, CommandStrategy::Rsd(endpoint), failures)
                .await?
            {
                return Ok(true);
            }
        }

        if let Some(endpoint) = self.link.discovery.discover().await {
            if !tried.contains(&endpoint) {
                if self
                    .clear(AttemptSource::DiscoveredTunnel, CommandStrategy::Rsd(endpoint), failures)
                    .await?
                {
                    return Ok(true);
                }
            }
        }

        if let Some(id) = self.link.devices.cached_identifier().await {
            if self
                .clear(AttemptSource::DeviceTunnel, CommandStrategy::Targeted(id), failures)
                .await?
            {
                return Ok(true);
            }
        }

        for strategy in [CommandStrategy::Plain, CommandStrategy::LegacyService] {
            if self.clear(AttemptSource::Legacy, strategy, failures).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn clear(
        &self,
        source: AttemptSource,
        strategy: CommandStrategy,
        failures: &mut Vec<AttemptFailure>,
    ) -> Result<bool, DispatchError> {
        let timeouts = &self.link.config().timeouts;
        let timeout = match strategy {
            CommandStrategy::Targeted(_) => timeouts.targeted_command,
            _ => timeouts.command,
        };
        let args = strategy.args(LocationAction::Clear);
        match self.link.runner.run_with_timeout(&args, timeout).await {
            Ok(_) => {
                info!("[Dispatcher] Location cleared via {}", source);
                Ok(true)
            }
            Err(e) if e.is_tool_missing() => Err(e.into()),
            Err(e) => {
                debug!("[Dispatcher] Clear via {} failed: {}", source, e);
                failures.push(AttemptFailure {
                    source,
                    detail: e.to_string(),
                });
                Ok(false)
            }
        }
    }

    /// 启动一种调用方式并等待稳定窗口
    async fn launch(
        &self,
        source: AttemptSource,
        strategy: CommandStrategy,
        action: LocationAction,
    ) -> Result<Attempt, DispatchError> {
        // 同一时刻只保留一个会话
        self.end_session().await;

        let timeouts = &self.link.config().timeouts;
        let args = strategy.args(action);
        debug!("[Dispatcher] Trying {}", source);

        let (mut process, mut events) = match self.link.runner.spawn(&args).await {
            Ok(spawned) => spawned,
            Err(e) if e.is_tool_missing() => return Err(e.into()),
            Err(e) => return Ok(Attempt::Failed(e.to_string())),
        };

        let check = SettleCheck::new(strategy.clean_exit_is_success());
        match await_settle(&mut events, check, timeouts.settle).await {
            SettleVerdict::Confirmed => {
                let session = SpoofSession::new(process, strategy, source);
                info!(
                    "[Dispatcher] Location active via {} (session {})",
                    source, session.id
                );
                let previous = self.session.lock().await.replace(session);
                // 并发调用时另一个请求可能刚建立了会话
                if let Some(mut previous) = previous {
                    previous.process.terminate(timeouts.terminate_grace).await;
                }
                Ok(Attempt::Succeeded)
            }
            SettleVerdict::Failed(detail) => {
                debug!("[Dispatcher] {} failed: {}", source, detail);
                process.terminate(timeouts.terminate_grace).await;
                Ok(Attempt::Failed(detail))
            }
            SettleVerdict::Pending => {
                process.terminate(timeouts.terminate_grace).await;
                Ok(Attempt::Failed("settle check ended without a verdict".to_string()))
            }
        }
    }

    /// 结束当前会话
    ///
    /// 返回是否终止了一个仍在运行的隧道会话进程（即位置已随之恢复）。
    pub async fn end_session(&self) -> bool {
        let previous = self.session.lock().await.take();
        match previous {
            Some(mut session) => {
                let restored =
                    session.process.is_alive() && !session.strategy.clean_exit_is_success();
                info!(
                    "[Dispatcher] Ending session {} ({})",
                    session.id, session.source
                );
                session
                    .process
                    .terminate(self.link.config().timeouts.terminate_grace)
                    .await;
                restored
            }
            None => false,
        }
    }

    /// 当前会话
    pub async fn session(&self) -> Option<SessionSummary> {
        self.session.lock().await.as_ref().map(|s| SessionSummary {
            id: s.id,
            source: s.source,
            pid: s.process.pid(),
            alive: s.process.is_alive(),
            started_at: s.started_at,
        })
    }
}
