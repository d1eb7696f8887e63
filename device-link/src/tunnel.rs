//! 隧道管理
//!
//! 自己启动 `start-tunnel` 进程，从 stdout 中解析 RSD 地址和端口。
//! 优先 lockdown 协议，超时或提前退出时换 remote 协议，再失败则报错并给出手动命令。

use crate::error::LinkError;
use crate::process::{ManagedProcess, ProcessEvent};
use crate::runner::CommandRunner;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 隧道端点（RSD host + port）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TunnelEndpoint {
    pub host: String,
    pub port: u16,
}

impl TunnelEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for TunnelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.host, self.port)
    }
}

fn address_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"RSD Address:\s*([0-9A-Za-z:.%\-]+)").expect("valid regex"))
}

fn port_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"RSD Port:\s*(\d+)").expect("valid regex"))
}

fn rsd_hint_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--rsd\s+([0-9A-Za-z:.%\-]+)\s+(\d+)").expect("valid regex"))
}

/// 从累计输出中解析 RSD 端点
pub fn decode_rsd_endpoint(text: &str) -> Option<TunnelEndpoint> {
    let address = address_pattern()
        .captures(text)
        .map(|c| c[1].to_string());
    let port = port_pattern()
        .captures(text)
        .and_then(|c| c[1].parse::<u16>().ok());
    if let (Some(host), Some(port)) = (address, port) {
        return Some(TunnelEndpoint { host, port });
    }

    let hint = rsd_hint_pattern().captures(text)?;
    let port = hint[2].parse::<u16>().ok()?;
    Some(TunnelEndpoint::new(&hint[1], port))
}

/// 隧道协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelVariant {
    /// `lockdown start-tunnel`（首选，无需提权）
    Lockdown,
    /// `remote start-tunnel`（依赖提权）
    Remote,
}

impl TunnelVariant {
    pub fn args(self) -> Vec<String> {
        let sub = match self {
            TunnelVariant::Lockdown => "lockdown",
            TunnelVariant::Remote => "remote",
        };
        vec![sub.to_string(), "start-tunnel".to_string()]
    }

    pub fn next(self) -> Option<TunnelVariant> {
        match self {
            TunnelVariant::Lockdown => Some(TunnelVariant::Remote),
            TunnelVariant::Remote => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            TunnelVariant::Lockdown => "lockdown",
            TunnelVariant::Remote => "remote",
        }
    }
}

/// 隧道协商事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Stdout(String),
    Stderr(String),
    Exited(Option<i32>),
    TimerFired,
}

impl From<ProcessEvent> for TunnelEvent {
    fn from(ev: ProcessEvent) -> Self {
        match ev {
            ProcessEvent::Stdout(s) => TunnelEvent::Stdout(s),
            ProcessEvent::Stderr(s) => TunnelEvent::Stderr(s),
            ProcessEvent::Exited(code) => TunnelEvent::Exited(code),
        }
    }
}

/// 协商结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStep {
    /// 继续等待
    Pending,
    /// 已解析到端点
    Established(TunnelEndpoint),
    /// 当前协议失败，换下一个
    Fallback(TunnelVariant),
    /// 全部协议失败
    Failed(String),
}

/// 单个协议的协商状态机
#[derive(Debug)]
pub struct TunnelNegotiation {
    variant: TunnelVariant,
    /// 全部失败时建议手动执行的命令
    recovery: String,
    stdout: String,
    stderr: String,
}

impl TunnelNegotiation {
    pub fn new(variant: TunnelVariant, recovery: impl Into<String>) -> Self {
        Self {
            variant,
            recovery: recovery.into(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn variant(&self) -> TunnelVariant {
        self.variant
    }

    pub fn on_event(&mut self, event: TunnelEvent) -> TunnelStep {
        match event {
            TunnelEvent::Stdout(chunk) => {
                self.stdout.push_str(&chunk);
                match decode_rsd_endpoint(&self.stdout) {
                    Some(endpoint) => TunnelStep::Established(endpoint),
                    None => TunnelStep::Pending,
                }
            }
            TunnelEvent::Stderr(chunk) => {
                self.stderr.push_str(&chunk);
                TunnelStep::Pending
            }
            TunnelEvent::Exited(code) => {
                debug!(
                    "[TunnelSupervisor] {} tunnel exited early with {:?}",
                    self.variant.name(),
                    code
                );
                self.give_up()
            }
            TunnelEvent::TimerFired => {
                debug!("[TunnelSupervisor] {} tunnel timed out", self.variant.name());
                self.give_up()
            }
        }
    }

    fn give_up(&self) -> TunnelStep {
        match self.variant.next() {
            Some(next) => TunnelStep::Fallback(next),
            None => TunnelStep::Failed(self.failure_message()),
        }
    }

    fn failure_message(&self) -> String {
        let detail = self.stderr.trim();
        let mut message = format!(
            "Could not start a tunnel to the device. Run manually in a terminal: {}",
            self.recovery
        );
        if !detail.is_empty() {
            let tail: String = detail
                .lines()
                .rev()
                .take(3)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join(" | ");
            message.push_str(&format!(" (last output: {})", tail));
        }
        message
    }
}

/// 当前隧道的来源
#[derive(Debug)]
enum TunnelOrigin {
    /// 自己启动，持有进程
    SelfStarted {
        process: ManagedProcess,
        generation: u64,
    },
    /// 从 tunneld 发现，不持有进程
    Discovered,
}

#[derive(Debug)]
struct CurrentTunnel {
    endpoint: TunnelEndpoint,
    origin: TunnelOrigin,
}

#[derive(Debug, Default)]
struct TunnelState {
    current: Option<CurrentTunnel>,
    generation: u64,
}

/// 隧道管理器
pub struct TunnelSupervisor {
    runner: CommandRunner,
    state: Arc<Mutex<TunnelState>>,
    /// 串行化 start()
    start_lock: Mutex<()>,
}

impl TunnelSupervisor {
    pub fn new(runner: CommandRunner) -> Self {
        Self {
            runner,
            state: Arc::new(Mutex::new(TunnelState::default())),
            start_lock: Mutex::new(()),
        }
    }

    /// 当前端点
    pub async fn current(&self) -> Option<TunnelEndpoint> {
        self.state
            .lock()
            .await
            .current
            .as_ref()
            .map(|c| c.endpoint.clone())
    }

    /// 当前端点是否由自己启动的进程维持
    pub async fn owns_current(&self) -> bool {
        matches!(
            self.state.lock().await.current,
            Some(CurrentTunnel {
                origin: TunnelOrigin::SelfStarted { .. },
                ..
            })
        )
    }

    /// 建立隧道；已建立时直接返回现有端点
    pub async fn start(&self) -> Result<TunnelEndpoint, LinkError> {
        let _guard = self.start_lock.lock().await;

        if let Some(endpoint) = self.current().await {
            debug!("[TunnelSupervisor] Reusing tunnel {}", endpoint);
            return Ok(endpoint);
        }

        let mut variant = TunnelVariant::Lockdown;
        loop {
            info!("[TunnelSupervisor] Starting {} tunnel...", variant.name());
            let (mut process, mut events) = self.runner.spawn(&variant.args()).await?;
            let mut negotiation = TunnelNegotiation::new(variant, self.recovery_command());

            let timer = tokio::time::sleep(self.runner.config().timeouts.tunnel_variant);
            tokio::pin!(timer);

            let step = loop {
                let event = tokio::select! {
                    ev = events.recv() => match ev {
                        Some(ev) => TunnelEvent::from(ev),
                        None => TunnelEvent::Exited(None),
                    },
                    _ = &mut timer => TunnelEvent::TimerFired,
                };
                match negotiation.on_event(event) {
                    TunnelStep::Pending => continue,
                    step => break step,
                }
            };

            match step {
                TunnelStep::Established(endpoint) => {
                    info!("[TunnelSupervisor] Tunnel established: {}", endpoint);
                    self.install(endpoint.clone(), process).await;
                    return Ok(endpoint);
                }
                TunnelStep::Fallback(next) => {
                    warn!(
                        "[TunnelSupervisor] {} tunnel failed, trying {}",
                        variant.name(),
                        next.name()
                    );
                    process.terminate(self.grace()).await;
                    variant = next;
                }
                TunnelStep::Failed(message) => {
                    warn!("[TunnelSupervisor] All tunnel variants failed");
                    process.terminate(self.grace()).await;
                    return Err(LinkError::TunnelEstablishFailed(message));
                }
                TunnelStep::Pending => unreachable!("pending steps are consumed by the loop"),
            }
        }
    }

    /// 采用外部发现的端点（替换当前端点）
    pub async fn adopt(&self, endpoint: TunnelEndpoint) {
        let previous = {
            let mut state = self.state.lock().await;
            state.current.replace(CurrentTunnel {
                endpoint: endpoint.clone(),
                origin: TunnelOrigin::Discovered,
            })
        };
        info!("[TunnelSupervisor] Adopted discovered tunnel {}", endpoint);
        if let Some(previous) = previous {
            self.release(previous).await;
        }
    }

    /// 端点失效时清除（仅当它仍是当前端点）
    pub async fn invalidate(&self, endpoint: &TunnelEndpoint) {
        let previous = {
            let mut state = self.state.lock().await;
            match &state.current {
                Some(current) if &current.endpoint == endpoint => state.current.take(),
                _ => None,
            }
        };
        if let Some(previous) = previous {
            info!("[TunnelSupervisor] Invalidated tunnel {}", previous.endpoint);
            self.release(previous).await;
        }
    }

    /// 关闭：终止自己持有的隧道进程
    pub async fn shutdown(&self) {
        let previous = self.state.lock().await.current.take();
        if let Some(previous) = previous {
            self.release(previous).await;
        }
    }

    async fn install(&self, endpoint: TunnelEndpoint, process: ManagedProcess) {
        let mut exit_rx = process.exit_watch();
        let previous = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            let generation = state.generation;

            // 进程退出时，如果它仍是当前端点则清除缓存
            let watched = Arc::clone(&self.state);
            let watched_endpoint = endpoint.clone();
            tokio::spawn(async move {
                if exit_rx.wait_for(|e| e.is_some()).await.is_err() {
                    return;
                }
                let mut state = watched.lock().await;
                let is_ours = matches!(
                    &state.current,
                    Some(CurrentTunnel {
                        origin: TunnelOrigin::SelfStarted { generation: g, .. },
                        ..
                    }) if *g == generation
                );
                if is_ours {
                    warn!(
                        "[TunnelSupervisor] Tunnel process for {} exited, clearing endpoint",
                        watched_endpoint
                    );
                    state.current = None;
                }
            });

            state.current.replace(CurrentTunnel {
                endpoint,
                origin: TunnelOrigin::SelfStarted {
                    process,
                    generation,
                },
            })
        };
        if let Some(previous) = previous {
            self.release(previous).await;
        }
    }

    fn recovery_command(&self) -> String {
        let args = ["remote".to_string(), "tunneld".to_string()];
        format!("sudo {}", self.runner.describe(&args))
    }

    async fn release(&self, tunnel: CurrentTunnel) {
        if let TunnelOrigin::SelfStarted { mut process, .. } = tunnel.origin {
            debug!("[TunnelSupervisor] Terminating tunnel process {:?}", process.pid());
            process.terminate(self.grace()).await;
        }
    }

    fn grace(&self) -> std::time::Duration {
        self.runner.config().timeouts.terminate_grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LinkConfig, Timeouts};
    use crate::test_support::fake_tool;
    use std::time::Duration;
    use tempfile::TempDir;

    const RECOVERY: &str = "sudo pymobiledevice3 remote tunneld";

    const SAMPLE_OUTPUT: &str = "Interface: utun4\n\
        Protocol: TunnelProtocol.TCP\n\
        RSD Address: fd7b:e5b:6f53::1\n\
        RSD Port: 64337\n\
        Use the follow connection option:\n\
        --rsd fd7b:e5b:6f53::1 64337\n";

    #[test]
    fn test_decode_full_output() {
        assert_eq!(
            decode_rsd_endpoint(SAMPLE_OUTPUT),
            Some(TunnelEndpoint::new("fd7b:e5b:6f53::1", 64337))
        );
    }

    #[test]
    fn test_decode_hint_line_only() {
        assert_eq!(
            decode_rsd_endpoint("connect with --rsd fdaa::1 50000\n"),
            Some(TunnelEndpoint::new("fdaa::1", 50000))
        );
    }

    #[test]
    fn test_decode_partial_output() {
        assert_eq!(decode_rsd_endpoint("RSD Address: fd7b::1\n"), None);
        assert_eq!(decode_rsd_endpoint("RSD Port: 1234\n"), None);
        assert_eq!(decode_rsd_endpoint(""), None);
    }

    #[test]
    fn test_negotiation_matches_across_chunks() {
        let mut n = TunnelNegotiation::new(TunnelVariant::Lockdown, RECOVERY);
        assert_eq!(
            n.on_event(TunnelEvent::Stdout("RSD Address: fd00::1\n".into())),
            TunnelStep::Pending
        );
        assert_eq!(
            n.on_event(TunnelEvent::Stderr("INFO tunnel created\n".into())),
            TunnelStep::Pending
        );
        assert_eq!(
            n.on_event(TunnelEvent::Stdout("RSD Po".into())),
            TunnelStep::Pending
        );
        assert_eq!(
            n.on_event(TunnelEvent::Stdout("rt: 4242\n".into())),
            TunnelStep::Established(TunnelEndpoint::new("fd00::1", 4242))
        );
    }

    #[test]
    fn test_negotiation_timeout_falls_back_then_fails() {
        let mut n = TunnelNegotiation::new(TunnelVariant::Lockdown, RECOVERY);
        assert_eq!(
            n.on_event(TunnelEvent::TimerFired),
            TunnelStep::Fallback(TunnelVariant::Remote)
        );

        let mut n = TunnelNegotiation::new(TunnelVariant::Remote, RECOVERY);
        n.on_event(TunnelEvent::Stderr("Permission denied\n".into()));
        match n.on_event(TunnelEvent::TimerFired) {
            TunnelStep::Failed(msg) => {
                assert!(msg.contains("sudo pymobiledevice3 remote tunneld"));
                assert!(msg.contains("Permission denied"));
            }
            other => panic!("unexpected step: {:?}", other),
        }
    }

    #[test]
    fn test_negotiation_early_exit_is_like_timeout() {
        let mut n = TunnelNegotiation::new(TunnelVariant::Lockdown, RECOVERY);
        assert_eq!(
            n.on_event(TunnelEvent::Exited(Some(1))),
            TunnelStep::Fallback(TunnelVariant::Remote)
        );
        let mut n = TunnelNegotiation::new(TunnelVariant::Remote, RECOVERY);
        assert!(matches!(
            n.on_event(TunnelEvent::Exited(Some(0))),
            TunnelStep::Failed(_)
        ));
    }

    fn supervisor(dir: &std::path::Path, script: &str, variant_timeout: Duration) -> TunnelSupervisor {
        let config = LinkConfig {
            tool: fake_tool(dir, script),
            timeouts: Timeouts {
                tunnel_variant: variant_timeout,
                ..Default::default()
            },
            ..Default::default()
        };
        TunnelSupervisor::new(CommandRunner::new(Arc::new(config)))
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("spawns");
        let script = format!(
            "echo x >> '{}'\necho 'RSD Address: fd00::2'\necho 'RSD Port: 5555'\nexec sleep 30\n",
            counter.display()
        );
        let sup = supervisor(dir.path(), &script, Duration::from_secs(5));

        let first = sup.start().await.unwrap();
        let second = sup.start().await.unwrap();
        assert_eq!(first, TunnelEndpoint::new("fd00::2", 5555));
        assert_eq!(first, second);
        assert!(sup.owns_current().await);

        let spawns = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(spawns.lines().count(), 1);

        sup.shutdown().await;
        assert_eq!(sup.current().await, None);
    }

    #[tokio::test]
    async fn test_start_falls_back_to_remote() {
        let dir = TempDir::new().unwrap();
        let script = r#"case "$1" in
  lockdown) echo 'InvalidServiceError' >&2; exit 1;;
  remote) echo 'RSD Address: fd00::3'; echo 'RSD Port: 6000'; exec sleep 30;;
esac
"#;
        let sup = supervisor(dir.path(), script, Duration::from_secs(5));

        let endpoint = sup.start().await.unwrap();
        assert_eq!(endpoint, TunnelEndpoint::new("fd00::3", 6000));
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_fails_after_both_variants_time_out() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(dir.path(), "exec sleep 30\n", Duration::from_millis(200));

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, LinkError::TunnelEstablishFailed(_)));
        // 建议的命令来自配置的工具
        let expected = format!(
            "sudo /bin/sh {} remote tunneld",
            dir.path().join("fake-tool.sh").display()
        );
        assert!(err.to_string().contains(&expected), "{}", err);
        assert_eq!(sup.current().await, None);
    }

    #[tokio::test]
    async fn test_endpoint_cleared_when_process_exits() {
        let dir = TempDir::new().unwrap();
        let script = "echo 'RSD Address: fd00::4'\necho 'RSD Port: 7000'\nsleep 0.3\nexit 0\n";
        let sup = supervisor(dir.path(), script, Duration::from_secs(5));

        sup.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sup.current().await, None);
    }

    #[tokio::test]
    async fn test_adopt_and_invalidate() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(dir.path(), "exit 1\n", Duration::from_millis(200));
        let discovered = TunnelEndpoint::new("fd00::9", 9000);

        sup.adopt(discovered.clone()).await;
        assert_eq!(sup.current().await, Some(discovered.clone()));
        assert!(!sup.owns_current().await);

        sup.invalidate(&TunnelEndpoint::new("fd00::1", 1)).await;
        assert_eq!(sup.current().await, Some(discovered.clone()));

        sup.invalidate(&discovered).await;
        assert_eq!(sup.current().await, None);
    }
}
