//! 设备链路层
//!
//! 封装对 pymobiledevice3 的调用：设备查询、隧道建立、tunneld 守护进程和隧道发现。

mod config;
mod daemon;
mod device;
mod discovery;
mod error;
mod process;
mod runner;
mod tunnel;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use config::{
    default_extra_paths, ElevationConfig, LinkConfig, Timeouts, ToolConfig, DEFAULT_DAEMON_PORT,
};
pub use daemon::{is_credential_rejection, DaemonController, DaemonStart};
pub use device::{parse_device_listing, DeviceIdentity, DeviceLocator};
pub use discovery::{
    looks_like_non_phone, normalize_tunnels, select_candidate, TunnelCandidate, TunnelDiscovery,
};
pub use error::LinkError;
pub use process::{ManagedProcess, ProcessEvent, ProcessExit};
pub use runner::{augmented_path, resolve_program, CommandRunner};
pub use tunnel::{
    decode_rsd_endpoint, TunnelEndpoint, TunnelEvent, TunnelNegotiation, TunnelStep,
    TunnelSupervisor, TunnelVariant,
};

use std::sync::Arc;
use tracing::info;

/// 进程级共享状态
///
/// UDID 缓存、当前隧道、daemon 句柄都挂在这里，显式创建、显式关闭。
pub struct LinkContext {
    pub runner: CommandRunner,
    pub devices: Arc<DeviceLocator>,
    pub tunnels: Arc<TunnelSupervisor>,
    pub daemon: Arc<DaemonController>,
    pub discovery: Arc<TunnelDiscovery>,
}

impl LinkContext {
    pub fn new(config: LinkConfig) -> Result<Self, LinkError> {
        let config = Arc::new(config);
        let runner = CommandRunner::new(Arc::clone(&config));
        // 只访问 127.0.0.1，不走系统代理
        let http = reqwest::Client::builder().no_proxy().build()?;

        let devices = Arc::new(DeviceLocator::new(runner.clone()));
        let tunnels = Arc::new(TunnelSupervisor::new(runner.clone()));
        let daemon = Arc::new(DaemonController::new(runner.clone(), http.clone()));
        let discovery = Arc::new(TunnelDiscovery::new(
            http,
            config.daemon_url(),
            config.timeouts.health_probe,
            Arc::clone(&devices),
        ));

        Ok(Self {
            runner,
            devices,
            tunnels,
            daemon,
            discovery,
        })
    }

    pub fn config(&self) -> &LinkConfig {
        self.runner.config()
    }

    /// 终止自己持有的隧道进程和 daemon
    pub async fn shutdown(&self) {
        info!("[LinkContext] Shutting down...");
        self.tunnels.shutdown().await;
        self.daemon.shutdown().await;
    }
}
